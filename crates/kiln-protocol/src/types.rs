//! RESP2 frame types.
//!
//! The [`Frame`] enum represents a single parsed RESP2 value. Bulk
//! strings use `Bytes` for reference-counted storage that avoids
//! copies when data moves through the pipeline.

use bytes::Bytes;

use crate::error::ProtocolError;

/// A single RESP2 protocol frame.
///
/// Client commands are always top-level arrays of bulk strings; replies
/// may be any variant. RESP2 has two distinct null encodings — the null
/// bulk string (`$-1\r\n`) and the null array (`*-1\r\n`) — modeled as
/// separate variants so replies round-trip exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string response, e.g. `+OK\r\n`.
    Simple(String),

    /// Error response, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Ordered array of frames, e.g. `*2\r\n+a\r\n+b\r\n`.
    Array(Vec<Frame>),

    /// Null bulk string, `$-1\r\n`.
    Null,

    /// Null array, `*-1\r\n`.
    NullArray,
}

impl Frame {
    /// Returns `true` if this frame is one of the two null encodings.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::NullArray)
    }

    /// Builds a bulk frame from anything that converts to `Bytes`.
    pub fn bulk(data: impl Into<Bytes>) -> Frame {
        Frame::Bulk(data.into())
    }

    /// Decomposes a command frame into its bulk-string tokens.
    ///
    /// Client commands are arrays of bulk strings; simple strings are
    /// accepted for inline-style tooling. Anything else is rejected.
    pub fn into_tokens(self) -> Result<Vec<Bytes>, ProtocolError> {
        let items = match self {
            Frame::Array(items) => items,
            _ => {
                return Err(ProtocolError::InvalidCommandFrame(
                    "expected array frame".into(),
                ))
            }
        };
        if items.is_empty() {
            return Err(ProtocolError::InvalidCommandFrame(
                "empty command array".into(),
            ));
        }
        items
            .into_iter()
            .map(|item| match item {
                Frame::Bulk(data) => Ok(data),
                Frame::Simple(s) => Ok(Bytes::from(s)),
                other => Err(ProtocolError::InvalidCommandFrame(format!(
                    "expected bulk string in command array, got {other:?}"
                ))),
            })
            .collect()
    }
}
