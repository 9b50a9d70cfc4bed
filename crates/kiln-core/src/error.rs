//! Error types for the keyspace engine.

use thiserror::Error;

/// Errors returned by keyspace operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyspaceError {
    /// The key does not exist (or expired before the lock was taken).
    #[error("key not found")]
    NotFound,

    /// The request was cancelled before the lock could be acquired.
    #[error("operation cancelled")]
    Cancelled,

    /// The request's deadline passed before the lock could be acquired.
    #[error("operation timed out")]
    Timeout,

    /// Memory limit reached and the eviction policy is noeviction.
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,

    /// Eviction ran out of candidates before freeing enough memory.
    #[error("OOM eviction exhausted, unable to free memory")]
    EvictionExhausted,

    /// The operation was attempted on a key holding a value of the
    /// wrong type. For example, running a list command against a
    /// string key.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
}
