//! Error types and result handling for pg-pb3-fuzzer.
//!
//! This module defines the main error type [`Error`], the typed error kinds
//! for configuration ([`OidRangeError`], [`OptionError`]) and wire decoding
//! ([`DecodeError`]), and a convenience [`Result`] type alias used throughout
//! the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_pb3_fuzzer::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-pb3-fuzzer operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid config file or
    /// environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid `binary_oid_ranges` value.
    #[error("Invalid binary_oid_ranges: {0}")]
    OidRange(#[from] OidRangeError),

    /// Invalid output plugin option.
    #[error("Invalid plugin option: {0}")]
    Option(#[from] OptionError),

    /// PostgreSQL client error on the regular (non-replication) connection.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Error reported by the server on the replication connection.
    #[error("Server error: {severity} {code}: {message}")]
    Server {
        /// Severity as reported by the server (ERROR, FATAL, ...)
        severity: String,
        /// SQLSTATE code
        code: String,
        /// Primary human-readable message
        message: String,
    },

    /// JSON serialization error when writing failure reports.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from the replication socket or report files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure on the replication connection.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Protocol-level error in the replication stream.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A wire message produced by the output plugin could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// The expected message stream could not be computed for an operation.
    #[error("Expectation error: {message}")]
    Expectation {
        /// Description of what could not be derived
        message: String,
    },

    /// A received message differs from the expected one.
    #[error("message does not match:\n    {received}\n\n  is not equal to\n\n    {expected}")]
    Mismatch { expected: String, received: String },

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// The background receive loop saw no traffic within its read deadline
    /// while no shutdown was requested. Fatal to the process.
    #[error("Replication stream stalled: no data for {seconds}s")]
    Stall {
        /// Read deadline that elapsed
        seconds: u64,
    },

    /// Broken internal invariant, such as a receive loop that neither
    /// delivers its shutdown sentinel nor closes its queue.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error must stop the whole process instead of only the
    /// current run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Stall { .. } | Error::Internal(_) | Error::Config(_)
        )
    }
}

/// Failure kinds for parsing a `binary_oid_ranges` value.
///
/// Every variant carries the token that caused it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OidRangeError {
    /// Empty element in the comma-separated list (e.g. `"1,"`).
    #[error("invalid input syntax for binary_oid_ranges: {input:?}")]
    InvalidListSyntax { input: String },

    /// A bound is not an unsigned integer.
    #[error("invalid input syntax for integer: {token:?}")]
    InvalidIntegerSyntax { token: String },

    /// A bound is 0, which is reserved as the invalid OID.
    #[error("oid can't be InvalidOid (0) in {token:?}")]
    InvalidOidZero { token: String },

    /// A bound is larger than OID_MAX.
    #[error("oids can't be larger than OID_MAX (4294967295): {token:?}")]
    OidOutOfRange { token: String },

    /// `high < low` within one range.
    #[error("the upper bound of a range can't be lower than its lower bound: {token:?}")]
    InvertedRange { token: String },

    /// Two ranges share at least one OID.
    #[error("range {first} overlaps with range {second}")]
    OverlappingRange { first: String, second: String },
}

/// Failure kinds for output plugin options.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("option {name:?} is not supported")]
    UnknownOption { name: String },

    #[error("could not parse value {value:?} for parameter {name:?}")]
    InvalidBool { name: String, value: String },

    #[error("{value:?} is not a valid value for parameter {name:?}")]
    InvalidMode { name: String, value: String },

    #[error("{name} requires an argument")]
    MissingArgument { name: String },

    #[error("binary_oid_ranges: {0}")]
    Ranges(#[from] OidRangeError),
}

/// Failure kinds for decoding a wire message.
///
/// Decode errors are fatal to the replication session that produced them;
/// each variant keeps enough context (offsets, lengths, raw bytes) to
/// diagnose the encoder that emitted the buffer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// No terminating byte within the first 6 bytes, or the buffer ended
    /// inside the length prefix.
    #[error("malformed header length prefix {prefix:02x?}")]
    MalformedLengthPrefix { prefix: Vec<u8> },

    /// The raw buffer is too short to hold any wire message.
    #[error("truncated wire message of {len} bytes")]
    TruncatedMessage { len: usize },

    /// The header could not be deserialized or is inconsistent.
    #[error("could not decode wire message header at offset {offset} (header_len {header_len}): {reason}")]
    HeaderDecodeError {
        offset: usize,
        header_len: u64,
        reason: String,
    },

    /// An offset points outside the payload or before its predecessor.
    #[error("offset {offset} of message {index} is out of bounds (payload length {payload_len})")]
    OffsetOutOfBounds {
        index: usize,
        offset: u32,
        payload_len: usize,
    },

    /// The header declares a message type outside the closed set.
    #[error("unknown wire message type {value} at index {index}")]
    UnknownMessageType { index: usize, value: i32 },

    /// A sub-message slice is not a valid entity of its declared type.
    #[error("could not decode {message_type} at index {index} ({len} bytes): {reason}")]
    PayloadDecodeError {
        index: usize,
        message_type: &'static str,
        len: usize,
        reason: String,
    },
}

/// A convenient Result type alias for pg-pb3-fuzzer operations.
///
/// This is equivalent to `std::result::Result<T, pg_pb3_fuzzer::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
