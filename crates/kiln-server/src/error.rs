//! The command-level error taxonomy.
//!
//! Every handler returns a typed error; the dispatcher maps it to a
//! RESP error reply. `Fatal` is reserved for unrecoverable conditions
//! (corrupt AOF during replay, snapshot swap failure) and terminates
//! the process after logging rather than reaching a client.

use thiserror::Error;

use kiln_core::KeyspaceError;
use kiln_protocol::Frame;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR no such key")]
    NotFound,

    #[error("ERR operation cancelled")]
    Cancelled,

    #[error("ERR operation timed out while waiting for key locks")]
    Timeout,

    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,

    #[error("OOM eviction exhausted, unable to free memory")]
    EvictionExhausted,

    #[error("NOAUTH {0}")]
    Unauthorized(String),

    #[error("NOTLEADER cannot process write commands on a follower")]
    NotLeader,

    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    #[error("ERR io error: {0}")]
    Io(String),

    /// Command-specific argument/value errors, already phrased for the
    /// client (e.g. "value is not an integer or out of range").
    #[error("ERR {0}")]
    Value(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),
}

impl CommandError {
    /// The RESP error reply for this error.
    pub fn to_frame(&self) -> Frame {
        Frame::Error(self.to_string())
    }

    pub fn value(msg: impl Into<String>) -> Self {
        CommandError::Value(msg.into())
    }
}

impl From<KeyspaceError> for CommandError {
    fn from(e: KeyspaceError) -> Self {
        match e {
            KeyspaceError::NotFound => CommandError::NotFound,
            KeyspaceError::Cancelled => CommandError::Cancelled,
            KeyspaceError::Timeout => CommandError::Timeout,
            KeyspaceError::OutOfMemory => CommandError::OutOfMemory,
            KeyspaceError::EvictionExhausted => CommandError::EvictionExhausted,
            KeyspaceError::WrongType => CommandError::WrongType,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_conventional_prefixes() {
        assert_eq!(
            CommandError::WrongType.to_frame(),
            Frame::Error(
                "WRONGTYPE Operation against a key holding the wrong kind of value".into()
            )
        );
        assert_eq!(
            CommandError::WrongArity("get").to_frame(),
            Frame::Error("ERR wrong number of arguments for 'get' command".into())
        );
        assert!(matches!(
            CommandError::OutOfMemory.to_frame(),
            Frame::Error(msg) if msg.starts_with("OOM")
        ));
        assert!(matches!(
            CommandError::Unauthorized("Authentication required.".into()).to_frame(),
            Frame::Error(msg) if msg.starts_with("NOAUTH")
        ));
    }

    #[test]
    fn keyspace_errors_convert() {
        assert_eq!(
            CommandError::from(KeyspaceError::WrongType),
            CommandError::WrongType
        );
        assert_eq!(
            CommandError::from(KeyspaceError::Timeout),
            CommandError::Timeout
        );
        assert_eq!(
            CommandError::from(KeyspaceError::OutOfMemory),
            CommandError::OutOfMemory
        );
    }
}
