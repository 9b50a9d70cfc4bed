//! Eviction caches: access-ordered views over the keyspace.
//!
//! Two representations, selected by eviction policy. The LFU cache
//! orders keys by `(access_count, last_access_ms)` so the least
//! frequently used key pops first, with ties broken by earliest
//! access. The LRU cache orders keys by a monotonic access sequence so
//! the least recently touched key pops first.
//!
//! Both structures pair an ordered index with a key→position map for
//! `O(log n)` update and pop. The cache has its own mutex in the
//! keyspace — it is never touched while a per-key lock is held, which
//! keeps the global lock order intact.

use std::collections::{BTreeMap, BTreeSet};

use ahash::AHashMap;

use crate::time;

/// LFU cache: keys ordered by (access count, last access time).
#[derive(Debug, Default)]
pub struct LfuCache {
    /// (access_count, last_access_ms, key) in eviction order.
    ordered: BTreeSet<(u64, u64, String)>,
    /// key → (access_count, last_access_ms) for O(log n) reposition.
    index: AHashMap<String, (u64, u64)>,
}

impl LfuCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Touches a key: bumps its access count and timestamp.
    /// Inserts the key if it isn't tracked yet.
    pub fn update(&mut self, key: &str) {
        let now = time::now_ms();
        match self.index.get_mut(key) {
            Some(pos) => {
                let old = (pos.0, pos.1, key.to_owned());
                self.ordered.remove(&old);
                pos.0 += 1;
                pos.1 = now;
                self.ordered.insert((pos.0, pos.1, key.to_owned()));
            }
            None => {
                self.index.insert(key.to_owned(), (1, now));
                self.ordered.insert((1, now, key.to_owned()));
            }
        }
    }

    /// Removes a key from the cache.
    pub fn delete(&mut self, key: &str) {
        if let Some((count, at)) = self.index.remove(key) {
            self.ordered.remove(&(count, at, key.to_owned()));
        }
    }

    /// Removes and returns the least-frequently-used key (earliest
    /// last-access breaks ties).
    pub fn pop(&mut self) -> Option<String> {
        let first = self.ordered.iter().next().cloned()?;
        self.ordered.remove(&first);
        self.index.remove(&first.2);
        Some(first.2)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// LRU cache: keys ordered by a monotonic access sequence. The lowest
/// sequence number is the least recently used.
#[derive(Debug, Default)]
pub struct LruCache {
    /// sequence → key in access order.
    ordered: BTreeMap<u64, String>,
    /// key → sequence for O(log n) reposition.
    index: AHashMap<String, u64>,
    next_seq: u64,
}

impl LruCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Touches a key: moves it to the most-recently-used position.
    /// Inserts the key if it isn't tracked yet.
    pub fn update(&mut self, key: &str) {
        if let Some(old_seq) = self.index.get(key).copied() {
            self.ordered.remove(&old_seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ordered.insert(seq, key.to_owned());
        self.index.insert(key.to_owned(), seq);
    }

    /// Removes a key from the cache.
    pub fn delete(&mut self, key: &str) {
        if let Some(seq) = self.index.remove(key) {
            self.ordered.remove(&seq);
        }
    }

    /// Removes and returns the least-recently-used key.
    pub fn pop(&mut self) -> Option<String> {
        let (seq, key) = self.ordered.iter().next().map(|(s, k)| (*s, k.clone()))?;
        self.ordered.remove(&seq);
        self.index.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// The policy-selected eviction cache.
#[derive(Debug)]
pub enum EvictionCache {
    Lfu(LfuCache),
    Lru(LruCache),
}

impl EvictionCache {
    pub fn lfu() -> Self {
        EvictionCache::Lfu(LfuCache::new())
    }

    pub fn lru() -> Self {
        EvictionCache::Lru(LruCache::new())
    }

    /// Touch on any access.
    pub fn update(&mut self, key: &str) {
        match self {
            EvictionCache::Lfu(c) => c.update(key),
            EvictionCache::Lru(c) => c.update(key),
        }
    }

    pub fn delete(&mut self, key: &str) {
        match self {
            EvictionCache::Lfu(c) => c.delete(key),
            EvictionCache::Lru(c) => c.delete(key),
        }
    }

    /// Returns and removes the next eviction victim.
    pub fn pop(&mut self) -> Option<String> {
        match self {
            EvictionCache::Lfu(c) => c.pop(),
            EvictionCache::Lru(c) => c.pop(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EvictionCache::Lfu(c) => c.len(),
            EvictionCache::Lru(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_pops_least_recent() {
        let mut cache = LruCache::new();
        cache.update("a");
        cache.update("b");
        cache.update("c");

        assert_eq!(cache.pop(), Some("a".into()));
        assert_eq!(cache.pop(), Some("b".into()));
        assert_eq!(cache.pop(), Some("c".into()));
        assert_eq!(cache.pop(), None);
    }

    #[test]
    fn lru_touch_moves_to_front() {
        let mut cache = LruCache::new();
        cache.update("a");
        cache.update("b");
        cache.update("a"); // a is now most recent

        assert_eq!(cache.pop(), Some("b".into()));
        assert_eq!(cache.pop(), Some("a".into()));
    }

    #[test]
    fn lru_delete_removes() {
        let mut cache = LruCache::new();
        cache.update("a");
        cache.update("b");
        cache.delete("a");

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.pop(), Some("b".into()));
    }

    #[test]
    fn lfu_pops_least_frequent() {
        let mut cache = LfuCache::new();
        cache.update("hot");
        cache.update("hot");
        cache.update("hot");
        cache.update("warm");
        cache.update("warm");
        cache.update("cold");

        assert_eq!(cache.pop(), Some("cold".into()));
        assert_eq!(cache.pop(), Some("warm".into()));
        assert_eq!(cache.pop(), Some("hot".into()));
    }

    #[test]
    fn lfu_tie_broken_by_earliest_access() {
        let mut cache = LfuCache::new();
        // both keys accessed once; "first" was touched earlier
        cache.update("first");
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.update("second");

        assert_eq!(cache.pop(), Some("first".into()));
        assert_eq!(cache.pop(), Some("second".into()));
    }

    #[test]
    fn lfu_delete_removes() {
        let mut cache = LfuCache::new();
        cache.update("a");
        cache.update("b");
        cache.delete("b");

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.pop(), Some("a".into()));
        assert_eq!(cache.pop(), None);
    }

    #[test]
    fn enum_dispatches() {
        let mut cache = EvictionCache::lru();
        cache.update("x");
        cache.update("y");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.pop(), Some("x".into()));

        let mut cache = EvictionCache::lfu();
        cache.update("x");
        assert!(!cache.is_empty());
        cache.delete("x");
        assert!(cache.is_empty());
    }

    #[test]
    fn update_is_idempotent_on_count() {
        let mut cache = LruCache::new();
        cache.update("a");
        cache.update("a");
        cache.update("a");
        assert_eq!(cache.len(), 1);
    }
}
