//! Memory tracking for the keyspace.
//!
//! Provides byte-level accounting of the memory used by entries,
//! updated on every mutation so the engine can enforce `max_memory`
//! and report stats without scanning the whole store. Rust offers no
//! cheap equivalent of a runtime heap-in-use probe, so the eviction
//! subsystem compares this running estimate against the limit.
//!
//! # Platform notes
//!
//! Overhead constants are empirical estimates for 64-bit platforms.
//! On 32-bit systems they would be smaller; the effect is that we
//! overestimate usage, which triggers eviction earlier than necessary
//! but doesn't cause correctness issues.
//!
//! # Safety margin
//!
//! Because overhead constants are estimates and allocator
//! fragmentation is unpredictable, the effective limit is
//! [`MEMORY_SAFETY_MARGIN_PERCENT`]% of the configured max, reserving
//! headroom so the process doesn't OOM before eviction kicks in.

use crate::types::Value;

/// Percentage of the configured `max_memory` used as the effective
/// write limit. The remaining headroom absorbs allocator overhead,
/// internal fragmentation, and estimation error.
pub const MEMORY_SAFETY_MARGIN_PERCENT: usize = 90;

/// Computes the effective memory limit after applying the safety margin.
pub fn effective_limit(max_bytes: usize) -> usize {
    // u128 intermediate avoids overflow on large configured limits
    ((max_bytes as u128) * (MEMORY_SAFETY_MARGIN_PERCENT as u128) / 100) as usize
}

/// Estimated overhead per entry: the key String, the slot's lock and
/// Arc bookkeeping, the expiry word, and hash-table slot waste. The
/// exact value varies by compiler version; precision isn't critical —
/// this drives eviction triggers and reporting, not correctness.
pub(crate) const ENTRY_OVERHEAD: usize = 160;

/// Per-element overhead inside a VecDeque of Bytes.
const LIST_ELEM_OVERHEAD: usize = 32;

/// Per-member overhead inside a hash or plain set.
const MAP_ENTRY_OVERHEAD: usize = 56;

/// Tracks memory usage for the keyspace.
///
/// All updates are explicit — callers must call `add` / `remove` /
/// `adjust` on every mutation. This keeps reads O(1).
#[derive(Debug, Default)]
pub struct MemoryTracker {
    used_bytes: usize,
    key_count: usize,
}

impl MemoryTracker {
    /// Creates a tracker with zero usage.
    pub fn new() -> Self {
        Self {
            used_bytes: 0,
            key_count: 0,
        }
    }

    /// Resets tracking to zero.
    pub fn reset(&mut self) {
        self.used_bytes = 0;
        self.key_count = 0;
    }

    /// Returns the current estimated memory usage in bytes.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Returns the number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    /// Records the addition of a new entry.
    pub fn add(&mut self, key: &str, value: &Value) {
        self.used_bytes += entry_size(key, value);
        self.key_count += 1;
    }

    /// Records the removal of an entry.
    pub fn remove(&mut self, key: &str, value: &Value) {
        let size = entry_size(key, value);
        self.used_bytes = self.used_bytes.saturating_sub(size);
        self.key_count = self.key_count.saturating_sub(1);
    }

    /// Adjusts used bytes for an in-place mutation without changing
    /// the key count. Arguments are full entry sizes before and after.
    pub fn adjust(&mut self, old_entry_size: usize, new_entry_size: usize) {
        self.used_bytes = self
            .used_bytes
            .saturating_sub(old_entry_size)
            .saturating_add(new_entry_size);
    }
}

/// Estimates the full memory cost of one entry: key, value, and
/// fixed per-entry overhead.
pub fn entry_size(key: &str, value: &Value) -> usize {
    ENTRY_OVERHEAD + key.len() + value_size(value)
}

/// Estimates the heap cost of a value alone.
pub fn value_size(value: &Value) -> usize {
    match value {
        Value::String(data) => data.len(),
        Value::Int(_) | Value::Float(_) => 8,
        Value::Hash(map) => map
            .iter()
            .map(|(field, scalar)| MAP_ENTRY_OVERHEAD + field.len() + scalar.heap_size())
            .sum(),
        Value::Set(set) => set
            .iter()
            .map(|member| MAP_ENTRY_OVERHEAD + member.len())
            .sum(),
        Value::SortedSet(zset) => zset.memory_usage(),
        Value::List(list) => list
            .iter()
            .map(|elem| LIST_ELEM_OVERHEAD + elem.len())
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::{AHashMap, AHashSet};
    use bytes::Bytes;
    use std::collections::VecDeque;

    #[test]
    fn add_and_remove_balance() {
        let mut tracker = MemoryTracker::new();
        let value = Value::String(Bytes::from("hello"));
        tracker.add("key", &value);
        assert!(tracker.used_bytes() > 0);
        assert_eq!(tracker.key_count(), 1);

        tracker.remove("key", &value);
        assert_eq!(tracker.used_bytes(), 0);
        assert_eq!(tracker.key_count(), 0);
    }

    #[test]
    fn adjust_tracks_growth() {
        let mut tracker = MemoryTracker::new();
        let small = Value::String(Bytes::from("a"));
        let large = Value::String(Bytes::from("a much longer value"));
        tracker.add("key", &small);
        let before = tracker.used_bytes();
        tracker.adjust(entry_size("key", &small), entry_size("key", &large));
        assert!(tracker.used_bytes() > before);
        assert_eq!(tracker.key_count(), 1);
    }

    #[test]
    fn remove_never_underflows() {
        let mut tracker = MemoryTracker::new();
        tracker.remove("ghost", &Value::String(Bytes::from("x")));
        assert_eq!(tracker.used_bytes(), 0);
        assert_eq!(tracker.key_count(), 0);
    }

    #[test]
    fn effective_limit_below_raw() {
        assert_eq!(effective_limit(100), 90);
        assert_eq!(effective_limit(1000), 900);
        assert!(effective_limit(usize::MAX) < usize::MAX);
    }

    #[test]
    fn value_sizes_scale_with_content() {
        let short = Value::String(Bytes::from("a"));
        let long = Value::String(Bytes::from("aaaaaaaaaa"));
        assert!(value_size(&long) > value_size(&short));

        let mut hash = AHashMap::new();
        hash.insert("f".to_string(), crate::types::Scalar::Int(1));
        let one_field = Value::Hash(hash.clone());
        hash.insert("g".to_string(), crate::types::Scalar::Int(2));
        let two_fields = Value::Hash(hash);
        assert!(value_size(&two_fields) > value_size(&one_field));

        let mut set = AHashSet::new();
        set.insert("m".to_string());
        assert!(value_size(&Value::Set(set)) > 0);

        let list: VecDeque<Bytes> = vec![Bytes::from("x")].into();
        assert!(value_size(&Value::List(list)) > 0);
    }

    #[test]
    fn scalar_values_cost_a_word() {
        assert_eq!(value_size(&Value::Int(7)), 8);
        assert_eq!(value_size(&Value::Float(7.5)), 8);
    }
}
