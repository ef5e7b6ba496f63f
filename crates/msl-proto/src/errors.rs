//! Wire decoding and encoding errors.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from encoding or decoding wire structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Input buffer was empty
    #[error("empty input")]
    Empty,

    /// CBOR serialization failed
    #[error("CBOR encoding failed: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decoding failed: {0}")]
    CborDecode(String),

    /// JSON serialization failed
    #[error("JSON encoding failed: {0}")]
    JsonEncode(String),

    /// JSON deserialization failed
    #[error("JSON decoding failed: {0}")]
    JsonDecode(String),

    /// Integer field outside the 53-bit counter space
    #[error("{field} out of range: {value}")]
    OutOfRange {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u64,
    },

    /// Field violates a structural constraint
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// Numeric response code not defined by the protocol
    #[error("unknown response code: {0}")]
    UnknownResponseCode(u16),
}
