//! Output plugin options.
//!
//! [`PluginOptions`] mirrors every option pg_pb3_ld accepts. It is parsed from
//! the same `name = value` pairs the plugin receives, rendered back into the
//! option list of `START_REPLICATION`, and consumed by the expectation
//! builder so both sides of a comparison see identical settings.

pub mod oid_ranges;

use std::fmt;
use std::str::FromStr;

use crate::error::{OidRangeError, OptionError};
use crate::postgres::types::SqlType;
use crate::Error;

pub use oid_ranges::{BinaryOidRanges, OidRange};

pub const ENABLE_BEGIN_MESSAGES: &str = "enable_begin_messages";
pub const ENABLE_COMMIT_MESSAGES: &str = "enable_commit_messages";
pub const ENABLE_TABLE_OIDS: &str = "enable_table_oids";
pub const TYPE_OIDS_MODE: &str = "type_oids_mode";
pub const FORMATS_MODE: &str = "formats_mode";
pub const BINARY_OID_RANGES: &str = "binary_oid_ranges";

/// Candidate `binary_oid_ranges` values for the option matrix.
///
/// Every entry keeps float4 and float8 binary, since floats have no
/// canonical text form to predict.
pub const MATRIX_OID_RANGES: &[&str] = &["1-200000", "17-4000", "20-23,700-701", "700-701"];

/// How `FieldSetDescription.type_oids` is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TypeOidsMode {
    #[default]
    Disabled,
    OmitNulls,
    Full,
}

impl TypeOidsMode {
    pub const ALL: [TypeOidsMode; 3] = [
        TypeOidsMode::Disabled,
        TypeOidsMode::OmitNulls,
        TypeOidsMode::Full,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeOidsMode::Disabled => "disabled",
            TypeOidsMode::OmitNulls => "omit_nulls",
            TypeOidsMode::Full => "full",
        }
    }
}

impl FromStr for TypeOidsMode {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(TypeOidsMode::Disabled),
            "omit_nulls" => Ok(TypeOidsMode::OmitNulls),
            "full" => Ok(TypeOidsMode::Full),
            _ => Err(OptionError::InvalidMode {
                name: TYPE_OIDS_MODE.to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// How `FieldSetDescription.formats` is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FormatsMode {
    #[default]
    Disabled,
    /// Like `Full`, but omitted entirely when every field is text.
    Libpq,
    Full,
    OmitNulls,
}

impl FormatsMode {
    pub const ALL: [FormatsMode; 4] = [
        FormatsMode::Disabled,
        FormatsMode::Libpq,
        FormatsMode::Full,
        FormatsMode::OmitNulls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FormatsMode::Disabled => "disabled",
            FormatsMode::Libpq => "libpq",
            FormatsMode::Full => "full",
            FormatsMode::OmitNulls => "omit_nulls",
        }
    }
}

impl FromStr for FormatsMode {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(FormatsMode::Disabled),
            "libpq" => Ok(FormatsMode::Libpq),
            "full" => Ok(FormatsMode::Full),
            "omit_nulls" => Ok(FormatsMode::OmitNulls),
            _ => Err(OptionError::InvalidMode {
                name: FORMATS_MODE.to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Complete option set of one replication session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOptions {
    pub enable_begin_messages: bool,
    pub enable_commit_messages: bool,
    pub enable_table_oids: bool,
    pub type_oids_mode: TypeOidsMode,
    pub formats_mode: FormatsMode,
    pub binary_oid_ranges: BinaryOidRanges,
}

impl Default for PluginOptions {
    /// The plugin's own defaults: commit messages only, everything as text.
    fn default() -> Self {
        Self {
            enable_begin_messages: false,
            enable_commit_messages: true,
            enable_table_oids: false,
            type_oids_mode: TypeOidsMode::Disabled,
            formats_mode: FormatsMode::Disabled,
            binary_oid_ranges: BinaryOidRanges::default(),
        }
    }
}

impl PluginOptions {
    /// Apply `name = value` pairs on top of the plugin defaults.
    ///
    /// A boolean option without a value means `true`; mode and range
    /// options require one.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, OptionError>
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (name, value) in pairs {
            options.set(name.as_ref(), value.as_ref().map(|v| v.as_ref()))?;
        }
        Ok(options)
    }

    /// Set a single option by name.
    pub fn set(&mut self, name: &str, value: Option<&str>) -> Result<(), OptionError> {
        match name {
            ENABLE_BEGIN_MESSAGES => self.enable_begin_messages = bool_option(name, value)?,
            ENABLE_COMMIT_MESSAGES => self.enable_commit_messages = bool_option(name, value)?,
            ENABLE_TABLE_OIDS => self.enable_table_oids = bool_option(name, value)?,
            TYPE_OIDS_MODE => self.type_oids_mode = required(name, value)?.parse()?,
            FORMATS_MODE => self.formats_mode = required(name, value)?.parse()?,
            BINARY_OID_RANGES => {
                self.binary_oid_ranges = BinaryOidRanges::parse(required(name, value)?)?
            }
            _ => {
                return Err(OptionError::UnknownOption {
                    name: name.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Whether a field of type `type_oid` is sent in binary.
    pub fn is_binary(&self, type_oid: u32) -> bool {
        self.binary_oid_ranges.contains(type_oid)
    }

    /// Fails with [`Error::Config`] unless float4 and float8 are sent in
    /// binary. Randomized tables have float columns, and their text output
    /// cannot be predicted.
    pub fn check_fuzzable(&self) -> crate::Result<()> {
        let text_floats: Vec<&str> = [SqlType::Float4, SqlType::Float8]
            .iter()
            .filter(|ty| !self.is_binary(ty.oid()))
            .map(|ty| ty.sql_name())
            .collect();
        if text_floats.is_empty() {
            return Ok(());
        }
        Err(Error::Config(format!(
            "binary_oid_ranges {:?} sends {} as text; include oids 700 and 701",
            self.binary_oid_ranges.to_string(),
            text_floats.join(" and ")
        )))
    }

    /// Every option as `(name, value)`, in a fixed order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENABLE_BEGIN_MESSAGES, on_off(self.enable_begin_messages)),
            (ENABLE_COMMIT_MESSAGES, on_off(self.enable_commit_messages)),
            (ENABLE_TABLE_OIDS, on_off(self.enable_table_oids)),
            (TYPE_OIDS_MODE, self.type_oids_mode.as_str().to_string()),
            (FORMATS_MODE, self.formats_mode.as_str().to_string()),
            (BINARY_OID_RANGES, self.binary_oid_ranges.to_string()),
        ]
    }

    /// Options in `START_REPLICATION` syntax: `name 'value'`.
    ///
    /// An empty `binary_oid_ranges` is left out, which the plugin treats the
    /// same as no ranges at all.
    pub fn to_replication_args(&self) -> Vec<String> {
        self.pairs()
            .into_iter()
            .filter(|(name, value)| !(*name == BINARY_OID_RANGES && value.is_empty()))
            .map(|(name, value)| format!("{} '{}'", name, value.replace('\'', "''")))
            .collect()
    }

    /// Cartesian product of every option dimension, with
    /// `binary_oid_ranges` drawn from [`MATRIX_OID_RANGES`].
    pub fn matrix() -> Result<Vec<PluginOptions>, OidRangeError> {
        let ranges = MATRIX_OID_RANGES
            .iter()
            .map(|r| BinaryOidRanges::parse(r))
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        for begin in [false, true] {
            for commit in [false, true] {
                for table_oids in [false, true] {
                    for type_oids_mode in TypeOidsMode::ALL {
                        for formats_mode in FormatsMode::ALL {
                            for binary_oid_ranges in &ranges {
                                out.push(PluginOptions {
                                    enable_begin_messages: begin,
                                    enable_commit_messages: commit,
                                    enable_table_oids: table_oids,
                                    type_oids_mode,
                                    formats_mode,
                                    binary_oid_ranges: binary_oid_ranges.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for PluginOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_replication_args().join(", "))
    }
}

fn on_off(value: bool) -> String {
    let s = if value { "on" } else { "off" };
    s.to_string()
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str, OptionError> {
    value.ok_or_else(|| OptionError::MissingArgument {
        name: name.to_string(),
    })
}

fn bool_option(name: &str, value: Option<&str>) -> Result<bool, OptionError> {
    match value {
        None => Ok(true),
        Some(v) => parse_bool(v).ok_or_else(|| OptionError::InvalidBool {
            name: name.to_string(),
            value: v.to_string(),
        }),
    }
}

/// Parse a PostgreSQL boolean spelling.
///
/// Accepts `true`/`false`, `yes`/`no`, `on`/`off`, `1`/`0` and any unique
/// prefix of them, case-insensitively. `o` alone is ambiguous.
pub fn parse_bool(value: &str) -> Option<bool> {
    let lower = value.to_ascii_lowercase();
    let v = lower.as_str();
    if v.is_empty() {
        return None;
    }

    let prefix_of = |word: &str, min: usize| v.len() >= min && word.starts_with(v);

    if prefix_of("true", 1) || prefix_of("yes", 1) || prefix_of("on", 2) || v == "1" {
        Some(true)
    } else if prefix_of("false", 1) || prefix_of("no", 1) || prefix_of("off", 2) || v == "0" {
        Some(false)
    } else {
        None
    }
}
