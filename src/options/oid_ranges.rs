//! Parsing and membership tests for the `binary_oid_ranges` option.
//!
//! The value is a comma-separated list of OIDs (`N`) and inclusive OID ranges
//! (`N-M`). A field whose type OID falls inside one of the ranges is sent in
//! binary by the output plugin; all other fields are sent as text.

use std::fmt;
use std::str::FromStr;

use crate::error::OidRangeError;

/// Largest valid OID.
pub const OID_MAX: u64 = u32::MAX as u64;

/// An inclusive range of type OIDs, `1 <= low <= high <= OID_MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OidRange {
    pub low: u32,
    pub high: u32,
}

impl OidRange {
    pub fn contains(&self, oid: u32) -> bool {
        self.low <= oid && oid <= self.high
    }

    fn overlaps(&self, other: &OidRange) -> bool {
        self.low <= other.high && other.low <= self.high
    }
}

impl fmt::Display for OidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "{}-{}", self.low, self.high)
        }
    }
}

/// A validated, sorted, non-overlapping set of [`OidRange`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryOidRanges {
    ranges: Vec<OidRange>,
}

impl BinaryOidRanges {
    /// Parse a `binary_oid_ranges` value.
    ///
    /// Leading whitespace is ignored, and an all-blank value yields an empty
    /// set. Overlap between any two ranges is rejected no matter which one
    /// comes first in the input.
    pub fn parse(input: &str) -> Result<Self, OidRangeError> {
        let trimmed = input.trim_start();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }

        let mut ranges = Vec::new();
        for token in trimmed.split(',') {
            let token = token.trim_start();
            if token.is_empty() {
                return Err(OidRangeError::InvalidListSyntax {
                    input: input.to_string(),
                });
            }
            ranges.push(parse_range(token)?);
        }

        ranges.sort();
        for pair in ranges.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(OidRangeError::OverlappingRange {
                    first: pair[0].to_string(),
                    second: pair[1].to_string(),
                });
            }
        }

        Ok(Self { ranges })
    }

    pub fn contains(&self, oid: u32) -> bool {
        // sorted and disjoint, so at most one candidate
        let idx = self.ranges.partition_point(|r| r.high < oid);
        self.ranges.get(idx).is_some_and(|r| r.contains(oid))
    }

    pub fn ranges(&self) -> &[OidRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl FromStr for BinaryOidRanges {
    type Err = OidRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BinaryOidRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", range)?;
        }
        Ok(())
    }
}

fn parse_range(token: &str) -> Result<OidRange, OidRangeError> {
    let (low, high) = match token.split_once('-') {
        Some((low, high)) => (parse_oid(low, token)?, parse_oid(high, token)?),
        None => {
            let oid = parse_oid(token, token)?;
            (oid, oid)
        }
    };

    if high < low {
        return Err(OidRangeError::InvertedRange {
            token: token.to_string(),
        });
    }

    Ok(OidRange { low, high })
}

fn parse_oid(value: &str, token: &str) -> Result<u32, OidRangeError> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(OidRangeError::InvalidIntegerSyntax {
            token: token.to_string(),
        });
    }

    let out_of_range = || OidRangeError::OidOutOfRange {
        token: token.to_string(),
    };
    // digits only, so the only possible failure is overflow
    let parsed: u64 = value.parse().map_err(|_| out_of_range())?;
    if parsed == 0 {
        return Err(OidRangeError::InvalidOidZero {
            token: token.to_string(),
        });
    }
    if parsed > OID_MAX {
        return Err(out_of_range());
    }

    Ok(parsed as u32)
}
