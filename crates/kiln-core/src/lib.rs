//! kiln-core: the storage engine.
//!
//! Owns the value types, the concurrently-accessed keyspace with
//! per-key reader/writer locks, TTL bookkeeping, memory accounting,
//! and the eviction subsystem. Connection handlers share one
//! [`Keyspace`] and coordinate exclusively through its capability
//! surface: lock / rlock / create_and_lock, guard-based reads and
//! mutation, delete, expiry management, and deep state copies.

pub mod cache;
pub mod error;
pub mod keyspace;
pub mod memory;
pub mod sweeper;
pub mod time;
pub mod types;

pub use cache::EvictionCache;
pub use error::KeyspaceError;
pub use keyspace::{
    EvictionPolicy, Keyspace, KeyspaceStats, OpContext, ReadGuard, StateEntry, StoreConfig,
    WriteGuard,
};
pub use types::{Scalar, SortedSet, Value};
