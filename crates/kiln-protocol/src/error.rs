//! Protocol error types for RESP2 parsing.

use thiserror::Error;

/// Errors that can occur when parsing the RESP2 wire format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input buffer doesn't contain a complete frame yet.
    /// The caller should read more data and try again.
    #[error("incomplete frame: need more data")]
    Incomplete,

    /// The first byte of a frame didn't match any known RESP2 type prefix.
    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// Failed to parse an integer value from the frame content.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// A bulk string or array declared an invalid length.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i64),

    /// A bulk string declared a length above the 512 MB limit.
    #[error("bulk string too large: {0} bytes")]
    BulkStringTooLarge(usize),

    /// An array declared more elements than we allow.
    #[error("too many array elements: {0}")]
    TooManyElements(usize),

    /// Nested arrays exceeded the depth limit.
    #[error("nesting exceeds maximum depth of {0}")]
    NestingTooDeep(usize),

    /// A frame that should carry a command didn't have the expected shape.
    #[error("invalid command frame: {0}")]
    InvalidCommandFrame(String),
}
