//! kiln-persistence: durability for the keyspace.
//!
//! Two cooperating engines. The AOF engine appends every mutating
//! command to a log as verbatim RESP arrays and replays them through
//! the command pipeline on restart. The snapshot engine serializes a
//! deep copy of the store to timestamp-named files and restores the
//! newest one. A server typically restores the snapshot first, then
//! replays the AOF on top.

pub mod aof;
pub mod format;
pub mod snapshot;

pub use aof::{AofEngine, AofLogReader, SyncPolicy};
pub use format::FormatError;
pub use snapshot::{SnapshotEngine, SnapshotSettings};
