//! Protocol error types for unit parsing and key decoding.

use thiserror::Error;

/// Errors that can occur when parsing the wire format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input buffer doesn't contain a complete unit yet.
    /// The caller should read more data and try again.
    #[error("incomplete unit: need more data")]
    Incomplete,

    /// A unit declared a payload longer than the protocol allows.
    #[error("unit payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// A packed integer key had an invalid encoded length (0 or > 8).
    #[error("invalid integer key length: {0}")]
    BadIntegerLength(usize),

    /// A string, binary, or float key was missing its trailing NUL.
    #[error("key value missing trailing NUL terminator")]
    MissingNul,

    /// A float key failed to parse as a number.
    #[error("invalid float key encoding")]
    BadFloat,
}
