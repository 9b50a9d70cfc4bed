//! The keyspace: a shared store with per-key reader/writer locks.
//!
//! Every key maps to a slot behind its own async `RwLock`. The registry
//! that holds the slots is guarded by a creation mutex used only while
//! inserting a new slot; once a slot exists, its per-key lock is the
//! sole synchronization for reads and writes of that key's value.
//!
//! Handlers acquire locks through attempt-loops that poll the lock and
//! yield between attempts, honoring a per-request [`OpContext`] for
//! cancellation and deadlines. A cancelled attempt never leaves the
//! lock held.
//!
//! Global lock order: eviction-cache mutex < creation lock < per-key
//! lock. The cache mutex is only ever taken after a per-key lock has
//! been released (guard drop updates cache position), never while one
//! is held.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock as StdRwLock};
use rand::seq::IteratorRandom;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::EvictionCache;
use crate::error::KeyspaceError;
use crate::memory::{self, MemoryTracker};
use crate::time;
use crate::types::Value;

/// How the keyspace handles writes when the memory limit is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Return an error on writes when memory is full.
    #[default]
    NoEviction,
    /// Evict the least-recently-used key.
    AllKeysLru,
    /// Evict the least-frequently-used key.
    AllKeysLfu,
    /// Evict a uniformly random key.
    AllKeysRandom,
    /// Evict the least-recently-used key among keys with a TTL.
    VolatileLru,
    /// Evict the least-frequently-used key among keys with a TTL.
    VolatileLfu,
    /// Evict a uniformly random key among keys with a TTL.
    VolatileRandom,
    /// Evict the soonest-expiring key among keys with a TTL.
    VolatileTtl,
}

impl EvictionPolicy {
    /// Returns `true` when the policy only considers TTL-bearing keys.
    pub fn is_volatile(&self) -> bool {
        matches!(
            self,
            EvictionPolicy::VolatileLru
                | EvictionPolicy::VolatileLfu
                | EvictionPolicy::VolatileRandom
                | EvictionPolicy::VolatileTtl
        )
    }

    /// Builds the access-ordered cache this policy needs, if any.
    /// Random and TTL-ordered policies sample their victims directly.
    fn build_cache(&self) -> Option<EvictionCache> {
        match self {
            EvictionPolicy::AllKeysLfu | EvictionPolicy::VolatileLfu => {
                Some(EvictionCache::lfu())
            }
            EvictionPolicy::AllKeysLru | EvictionPolicy::VolatileLru => {
                Some(EvictionCache::lru())
            }
            _ => None,
        }
    }
}

/// Configuration for the keyspace.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum estimated memory in bytes. 0 means unlimited.
    pub max_memory: usize,
    /// What to do when memory is full.
    pub eviction_policy: EvictionPolicy,
    /// How many TTL-index keys the sweeper samples per tick.
    pub eviction_sample: usize,
    /// How often the TTL sweeper fires.
    pub eviction_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_memory: 0,
            eviction_policy: EvictionPolicy::NoEviction,
            eviction_sample: 20,
            eviction_interval: Duration::from_millis(100),
        }
    }
}

/// Per-request context for lock acquisition: a cancellation token
/// (derived from the connection lifecycle) plus an optional deadline
/// (e.g. a multi-key command's lock-acquisition budget).
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context cancelled when `token` fires.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            deadline: None,
        }
    }

    /// Returns a copy of this context with a deadline `budget` from now.
    pub fn with_budget(&self, budget: Duration) -> Self {
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(Instant::now() + budget),
        }
    }

    /// Fails with `Cancelled` or `Timeout` when the request should stop
    /// waiting for locks.
    pub fn check(&self) -> Result<(), KeyspaceError> {
        if self.cancel.is_cancelled() {
            return Err(KeyspaceError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(KeyspaceError::Timeout);
            }
        }
        Ok(())
    }
}

/// The value slot behind each per-key lock.
#[derive(Debug)]
struct Slot {
    value: Value,
    /// Absolute expiry in unix ms. 0 = never expires.
    expires_at_ms: u64,
}

/// One record of a deep state copy.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    /// Absolute expiry in unix ms. 0 = never expires.
    pub expires_at_ms: u64,
}

/// Aggregated statistics for the keyspace. All fields are tracked
/// incrementally — this is O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceStats {
    pub key_count: usize,
    pub used_bytes: usize,
    pub keys_with_expiry: usize,
    pub keys_expired: u64,
    pub keys_evicted: u64,
}

struct Inner {
    config: StoreConfig,
    /// Serializes insertion of new slots (and slot removal).
    creation: Mutex<()>,
    /// key → slot registry. The outer lock is held only for map
    /// lookups and inserts, never across an await.
    entries: StdRwLock<AHashMap<String, Arc<AsyncRwLock<Slot>>>>,
    /// Secondary index: key → absolute expiry ms. Domain is the subset
    /// of the keyspace that carries a TTL.
    ttl_index: Mutex<AHashMap<String, u64>>,
    /// Access-ordered cache for LFU/LRU policies. `None` otherwise.
    cache: Mutex<Option<EvictionCache>>,
    memory: Mutex<MemoryTracker>,
    /// Set while a deep state copy is being taken. Writers yield while
    /// this is set.
    copy_in_progress: AtomicBool,
    /// Number of write guards currently held.
    writers: AtomicUsize,
    /// Mutation counter since the last snapshot.
    dirty: AtomicU64,
    expired_total: AtomicU64,
    evicted_total: AtomicU64,
}

impl Inner {
    /// Records an access for cache-position purposes. Called after the
    /// key's lock has been released. Volatile policies only track keys
    /// that currently carry a TTL.
    fn touch_key(&self, key: &str) {
        if self.config.max_memory == 0 {
            return;
        }
        if self.config.eviction_policy.is_volatile() && !self.ttl_index.lock().contains_key(key) {
            return;
        }
        if let Some(cache) = self.cache.lock().as_mut() {
            cache.update(key);
        }
    }

    /// Drops a key from the volatile cache domain when its TTL is removed.
    fn note_expiry_removed(&self, key: &str) {
        if self.config.eviction_policy.is_volatile() {
            if let Some(cache) = self.cache.lock().as_mut() {
                cache.delete(key);
            }
        }
    }
}

/// Guard drop bookkeeping shared by read guards: updates the key's
/// cache position once the lock is released. Field order in the guard
/// structs releases the lock first, then runs this.
struct AccessTouch {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for AccessTouch {
    fn drop(&mut self) {
        self.inner.touch_key(&self.key);
    }
}

/// A held read lock on one key.
pub struct ReadGuard {
    // dropped first: releases the per-key lock
    guard: OwnedRwLockReadGuard<Slot>,
    // dropped second: cache-position update
    touch: AccessTouch,
}

impl std::fmt::Debug for ReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadGuard").field("key", &self.key()).finish()
    }
}

impl ReadGuard {
    pub fn key(&self) -> &str {
        &self.touch.key
    }

    pub fn value(&self) -> &Value {
        &self.guard.value
    }

    /// Absolute expiry in unix ms, or `None` when the key never expires.
    pub fn expiry_ms(&self) -> Option<u64> {
        match self.guard.expires_at_ms {
            time::NO_EXPIRY => None,
            at => Some(at),
        }
    }
}

/// Write-side drop bookkeeping: releases the writer count, adjusts
/// memory tracking for any size change, and updates cache position.
/// Runs after the per-key lock has been released.
struct WriteRelease {
    inner: Arc<Inner>,
    key: String,
    size_before: usize,
    size_after: std::cell::Cell<usize>,
    /// Set by `Keyspace::delete` so the drop path skips bookkeeping
    /// for a key that no longer exists.
    deleted: std::cell::Cell<bool>,
}

impl Drop for WriteRelease {
    fn drop(&mut self) {
        self.inner.writers.fetch_sub(1, Ordering::AcqRel);
        if self.deleted.get() {
            return;
        }
        let before = self.size_before;
        let after = self.size_after.get();
        if before != after {
            self.inner.memory.lock().adjust(before, after);
            self.inner.dirty.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.touch_key(&self.key);
    }
}

/// A held write lock on one key.
pub struct WriteGuard {
    // dropped first: releases the per-key lock
    guard: OwnedRwLockWriteGuard<Slot>,
    // dropped second: memory + cache bookkeeping
    release: WriteRelease,
}

impl std::fmt::Debug for WriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteGuard").field("key", &self.release.key).finish()
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        // capture the post-mutation entry size while the slot is still
        // visible; WriteRelease uses it after the lock is released
        self.release.size_after.set(memory::entry_size(
            &self.release.key,
            &self.guard.value,
        ));
    }
}

impl WriteGuard {
    pub fn key(&self) -> &str {
        &self.release.key
    }

    pub fn value(&self) -> &Value {
        &self.guard.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.guard.value
    }

    /// Replaces the stored value.
    pub fn set(&mut self, value: Value) {
        self.guard.value = value;
    }

    /// Absolute expiry in unix ms, or `None` when the key never expires.
    pub fn expiry_ms(&self) -> Option<u64> {
        match self.guard.expires_at_ms {
            time::NO_EXPIRY => None,
            at => Some(at),
        }
    }

    /// Sets an absolute expiry on this key and records it in the TTL
    /// index. When `touch` is false the cache position is left alone
    /// (the access-count bump is suppressed for background callers).
    pub fn set_expiry(&mut self, at_ms: u64, touch: bool) {
        self.guard.expires_at_ms = at_ms;
        self.release
            .inner
            .ttl_index
            .lock()
            .insert(self.release.key.clone(), at_ms);
        if touch {
            // the guard's own drop will touch as well; an extra update
            // here keeps volatile caches current even if the caller
            // holds the guard for a while
            self.release.inner.touch_key(&self.release.key);
        }
    }

    /// Clears the expiry and removes the key from the TTL index (and
    /// from the volatile cache domain).
    pub fn remove_expiry(&mut self) {
        self.guard.expires_at_ms = time::NO_EXPIRY;
        self.release.inner.ttl_index.lock().remove(&self.release.key);
        self.release.inner.note_expiry_removed(&self.release.key);
    }
}

/// The shared keyspace handle. Cheap to clone.
#[derive(Clone)]
pub struct Keyspace {
    inner: Arc<Inner>,
}

impl Keyspace {
    /// Creates an empty keyspace with default config (no memory limit).
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates an empty keyspace with the given config.
    pub fn with_config(config: StoreConfig) -> Self {
        let cache = config.eviction_policy.build_cache();
        Self {
            inner: Arc::new(Inner {
                config,
                creation: Mutex::new(()),
                entries: StdRwLock::new(AHashMap::new()),
                ttl_index: Mutex::new(AHashMap::new()),
                cache: Mutex::new(cache),
                memory: Mutex::new(MemoryTracker::new()),
                copy_in_progress: AtomicBool::new(false),
                writers: AtomicUsize::new(0),
                dirty: AtomicU64::new(0),
                expired_total: AtomicU64::new(0),
                evicted_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Returns `true` if the key has a slot in the registry. Expiry is
    /// not consulted — callers that need live-key semantics go through
    /// the lock paths, which remove expired keys on access.
    pub fn exists(&self, key: &str) -> bool {
        self.inner.entries.read().contains_key(key)
    }

    /// Number of keys in the registry (including not-yet-swept expired
    /// keys).
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    fn slot(&self, key: &str) -> Option<Arc<AsyncRwLock<Slot>>> {
        self.inner.entries.read().get(key).cloned()
    }

    /// Acquires the read lock for `key`, yielding between attempts.
    ///
    /// Fails with `NotFound` if the key is absent at the moment of an
    /// attempt, or if it turned out to be expired (the expired key is
    /// deleted on the way out). Fails with `Cancelled`/`Timeout` per
    /// the context.
    pub async fn rlock(&self, key: &str, ctx: &OpContext) -> Result<ReadGuard, KeyspaceError> {
        loop {
            ctx.check()?;
            let slot = self.slot(key).ok_or(KeyspaceError::NotFound)?;
            match slot.try_read_owned() {
                Ok(guard) => {
                    if !self.exists(key) {
                        // deleted between registry lookup and acquisition
                        return Err(KeyspaceError::NotFound);
                    }
                    if time::is_expired(guard.expires_at_ms) {
                        drop(guard);
                        self.remove_expired(key, ctx).await;
                        return Err(KeyspaceError::NotFound);
                    }
                    return Ok(ReadGuard {
                        guard,
                        touch: AccessTouch {
                            inner: Arc::clone(&self.inner),
                            key: key.to_owned(),
                        },
                    });
                }
                Err(_) => tokio::task::yield_now().await,
            }
        }
    }

    /// Acquires the write lock for `key`. Expired keys are deleted and
    /// reported as `NotFound`, matching expire-on-access semantics.
    pub async fn lock(&self, key: &str, ctx: &OpContext) -> Result<WriteGuard, KeyspaceError> {
        let guard = self.lock_raw(key, ctx).await?;
        if time::is_expired(guard.guard.expires_at_ms) {
            self.inner.expired_total.fetch_add(1, Ordering::Relaxed);
            self.delete(guard);
            return Err(KeyspaceError::NotFound);
        }
        Ok(guard)
    }

    /// Write-lock acquisition without the expiry check. Used by the
    /// public `lock`, the sweeper, and the eviction path (which must
    /// be able to lock an already-expired key in order to remove it).
    async fn lock_raw(&self, key: &str, ctx: &OpContext) -> Result<WriteGuard, KeyspaceError> {
        loop {
            ctx.check()?;
            // writers yield while a deep state copy is in progress
            if self.inner.copy_in_progress.load(Ordering::Acquire) {
                tokio::task::yield_now().await;
                continue;
            }
            let slot = self.slot(key).ok_or(KeyspaceError::NotFound)?;
            match slot.try_write_owned() {
                Ok(guard) => {
                    if !self.exists(key) {
                        return Err(KeyspaceError::NotFound);
                    }
                    self.inner.writers.fetch_add(1, Ordering::AcqRel);
                    let size_before = memory::entry_size(key, &guard.value);
                    return Ok(WriteGuard {
                        guard,
                        release: WriteRelease {
                            inner: Arc::clone(&self.inner),
                            key: key.to_owned(),
                            size_before,
                            size_after: std::cell::Cell::new(size_before),
                            deleted: std::cell::Cell::new(false),
                        },
                    });
                }
                Err(_) => tokio::task::yield_now().await,
            }
        }
    }

    /// Creates the key if absent and leaves it write-locked either way.
    ///
    /// Checks memory policy first: with a limit configured, usage above
    /// the effective limit, and `noeviction`, the creation fails with
    /// `OutOfMemory`. The creation lock is held only for the registry
    /// insert of the new slot.
    ///
    /// Returns the guard and whether the key was newly created.
    pub async fn create_and_lock(
        &self,
        key: &str,
        ctx: &OpContext,
    ) -> Result<(WriteGuard, bool), KeyspaceError> {
        if self.inner.config.max_memory > 0
            && self.inner.config.eviction_policy == EvictionPolicy::NoEviction
        {
            let used = self.inner.memory.lock().used_bytes();
            if used >= memory::effective_limit(self.inner.config.max_memory) {
                return Err(KeyspaceError::OutOfMemory);
            }
        }

        loop {
            ctx.check()?;
            if self.inner.copy_in_progress.load(Ordering::Acquire) {
                tokio::task::yield_now().await;
                continue;
            }

            {
                let creation = self.inner.creation.lock();
                let mut entries = self.inner.entries.write();
                if !entries.contains_key(key) {
                    let slot = Arc::new(AsyncRwLock::new(Slot {
                        value: Value::String(Bytes::new()),
                        expires_at_ms: time::NO_EXPIRY,
                    }));
                    let guard = Arc::clone(&slot)
                        .try_write_owned()
                        .expect("freshly created lock has no other holders");
                    entries.insert(key.to_owned(), slot);
                    // the creation lock covers only the registry insert
                    drop(entries);
                    drop(creation);

                    self.inner
                        .memory
                        .lock()
                        .add(key, &Value::String(Bytes::new()));
                    self.inner.writers.fetch_add(1, Ordering::AcqRel);
                    self.inner.dirty.fetch_add(1, Ordering::Relaxed);
                    let size_before = memory::entry_size(key, &guard.value);
                    return Ok((
                        WriteGuard {
                            guard,
                            release: WriteRelease {
                                inner: Arc::clone(&self.inner),
                                key: key.to_owned(),
                                size_before,
                                size_after: std::cell::Cell::new(size_before),
                                deleted: std::cell::Cell::new(false),
                            },
                        },
                        true,
                    ));
                }
            }

            // the key exists — fall back to a plain write lock; retry
            // creation if it vanishes before we get it
            match self.lock(key, ctx).await {
                Ok(guard) => return Ok((guard, false)),
                Err(KeyspaceError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Deletes a key the caller holds write-locked. Removes the slot,
    /// the TTL entry, the cache entry, and the memory accounting
    /// atomically under the creation lock. Returns `false` if the key
    /// was already gone from the registry.
    pub fn delete(&self, guard: WriteGuard) -> bool {
        let key = guard.release.key.clone();
        let removed = {
            let _creation = self.inner.creation.lock();
            self.inner.entries.write().remove(&key)
        };
        if removed.is_none() {
            return false;
        }
        self.inner.ttl_index.lock().remove(&key);
        if let Some(cache) = self.inner.cache.lock().as_mut() {
            cache.delete(&key);
        }
        self.inner.memory.lock().remove(&key, &guard.guard.value);
        self.inner.dirty.fetch_add(1, Ordering::Relaxed);
        guard.release.deleted.set(true);
        // dropping the guard releases the lock on the now-orphaned slot
        true
    }

    /// Locks and removes a key observed to be expired. Best-effort:
    /// a concurrent deletion is fine.
    async fn remove_expired(&self, key: &str, ctx: &OpContext) {
        if let Ok(guard) = self.lock_raw(key, ctx).await {
            if time::is_expired(guard.guard.expires_at_ms) {
                self.inner.expired_total.fetch_add(1, Ordering::Relaxed);
                self.delete(guard);
            }
        }
    }

    /// Produces a deep copy of the store.
    ///
    /// Waits until no other copy is in progress and no write guard is
    /// held, sets the copy-in-progress flag (new writers yield while it
    /// is set), copies every slot, and clears the flag. Expired entries
    /// are included; persistence callers filter them.
    pub async fn get_state(&self) -> Vec<StateEntry> {
        loop {
            if !self.inner.copy_in_progress.load(Ordering::Acquire)
                && self.inner.writers.load(Ordering::Acquire) == 0
                && self
                    .inner
                    .copy_in_progress
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                break;
            }
            tokio::task::yield_now().await;
        }

        let slots: Vec<(String, Arc<AsyncRwLock<Slot>>)> = self
            .inner
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut out = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            let guard = slot.read().await;
            out.push(StateEntry {
                key,
                value: guard.value.clone(),
                expires_at_ms: guard.expires_at_ms,
            });
        }

        self.inner.copy_in_progress.store(false, Ordering::Release);
        out
    }

    /// Restores an entry during snapshot recovery through the normal
    /// create/set path. Entries whose expiry has already passed are
    /// skipped.
    pub async fn restore(&self, key: String, value: Value, expires_at_ms: u64) {
        if time::is_expired(expires_at_ms) {
            return;
        }
        let ctx = OpContext::new();
        if let Ok((mut guard, _created)) = self.create_and_lock(&key, &ctx).await {
            guard.set(value);
            if expires_at_ms != time::NO_EXPIRY {
                guard.set_expiry(expires_at_ms, false);
            }
        }
    }

    /// Checks memory pressure and evicts until usage is back under the
    /// effective limit.
    ///
    /// With no limit configured this is a no-op, as it is under
    /// `noeviction` (pressure there is reported by mutators instead).
    /// Victims are chosen per policy; each is write-locked and deleted
    /// atomically. Fails with `EvictionExhausted` when the candidate
    /// pool runs dry before memory is back under the limit.
    pub async fn adjust_memory_usage(&self, ctx: &OpContext) -> Result<(), KeyspaceError> {
        let max = self.inner.config.max_memory;
        if max == 0 {
            return Ok(());
        }
        let limit = memory::effective_limit(max);

        loop {
            if self.inner.memory.lock().used_bytes() < limit {
                return Ok(());
            }

            let victim = match self.inner.config.eviction_policy {
                EvictionPolicy::NoEviction => return Ok(()),
                EvictionPolicy::AllKeysLru
                | EvictionPolicy::AllKeysLfu
                | EvictionPolicy::VolatileLru
                | EvictionPolicy::VolatileLfu => {
                    self.inner.cache.lock().as_mut().and_then(|c| c.pop())
                }
                EvictionPolicy::AllKeysRandom => {
                    let entries = self.inner.entries.read();
                    let mut rng = rand::rng();
                    entries.keys().choose(&mut rng).cloned()
                }
                EvictionPolicy::VolatileRandom => {
                    let ttl = self.inner.ttl_index.lock();
                    let mut rng = rand::rng();
                    ttl.keys().choose(&mut rng).cloned()
                }
                EvictionPolicy::VolatileTtl => {
                    let ttl = self.inner.ttl_index.lock();
                    ttl.iter()
                        .min_by_key(|(_, at)| **at)
                        .map(|(k, _)| k.clone())
                }
            };

            let Some(victim) = victim else {
                return Err(KeyspaceError::EvictionExhausted);
            };

            match self.lock_raw(&victim, ctx).await {
                Ok(guard) => {
                    debug!(key = %victim, "evicting under memory pressure");
                    self.delete(guard);
                    self.inner.evicted_total.fetch_add(1, Ordering::Relaxed);
                }
                // already deleted by someone else — pick another victim
                Err(KeyspaceError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Samples up to `count` keys from the TTL index and deletes any
    /// whose expiry has passed. Returns the number removed. Used by the
    /// background sweeper; never holds the creation lock across samples.
    pub async fn expire_sample(&self, count: usize, ctx: &OpContext) -> usize {
        let candidates: Vec<String> = {
            let ttl = self.inner.ttl_index.lock();
            let mut rng = rand::rng();
            ttl.keys().choose_multiple(&mut rng, count).into_iter().cloned().collect()
        };

        let now = time::now_ms();
        let mut removed = 0;
        for key in candidates {
            let expired = self
                .inner
                .ttl_index
                .lock()
                .get(&key)
                .map(|at| *at != time::NO_EXPIRY && now >= *at)
                .unwrap_or(false);
            if !expired {
                continue;
            }
            if let Ok(guard) = self.lock_raw(&key, ctx).await {
                if time::is_expired(guard.guard.expires_at_ms) {
                    self.inner.expired_total.fetch_add(1, Ordering::Relaxed);
                    if self.delete(guard) {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    /// Removes every key and resets all bookkeeping. Used when a
    /// replication snapshot replaces the whole state. Callers must
    /// ensure no handler holds guards (the replication layer quiesces
    /// before installing a snapshot).
    pub fn clear(&self) {
        let _creation = self.inner.creation.lock();
        self.inner.entries.write().clear();
        self.inner.ttl_index.lock().clear();
        if let Some(cache) = self.inner.cache.lock().as_mut() {
            while cache.pop().is_some() {}
        }
        self.inner.memory.lock().reset();
    }

    /// Returns aggregated stats for this keyspace.
    pub fn stats(&self) -> KeyspaceStats {
        let memory = self.inner.memory.lock();
        KeyspaceStats {
            key_count: memory.key_count(),
            used_bytes: memory.used_bytes(),
            keys_with_expiry: self.inner.ttl_index.lock().len(),
            keys_expired: self.inner.expired_total.load(Ordering::Relaxed),
            keys_evicted: self.inner.evicted_total.load(Ordering::Relaxed),
        }
    }

    /// Mutation count since the last `reset_dirty`. Drives the
    /// automatic snapshot trigger.
    pub fn dirty(&self) -> u64 {
        self.inner.dirty.load(Ordering::Relaxed)
    }

    pub fn reset_dirty(&self) {
        self.inner.dirty.store(0, Ordering::Relaxed);
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scalar;

    fn ctx() -> OpContext {
        OpContext::new()
    }

    async fn set_string(ks: &Keyspace, key: &str, val: &str) {
        let (mut guard, _) = ks.create_and_lock(key, &ctx()).await.unwrap();
        guard.set(Value::String(Bytes::from(val.to_owned())));
    }

    #[tokio::test]
    async fn create_set_get() {
        let ks = Keyspace::new();
        set_string(&ks, "key", "value").await;

        let guard = ks.rlock("key", &ctx()).await.unwrap();
        assert_eq!(guard.value(), &Value::String(Bytes::from("value")));
    }

    #[tokio::test]
    async fn rlock_missing_key_not_found() {
        let ks = Keyspace::new();
        assert_eq!(
            ks.rlock("missing", &ctx()).await.unwrap_err(),
            KeyspaceError::NotFound
        );
    }

    #[tokio::test]
    async fn lock_missing_key_not_found() {
        let ks = Keyspace::new();
        assert_eq!(
            ks.lock("missing", &ctx()).await.unwrap_err(),
            KeyspaceError::NotFound
        );
    }

    #[tokio::test]
    async fn create_twice_reports_existing() {
        let ks = Keyspace::new();
        {
            let (_, created) = ks.create_and_lock("key", &ctx()).await.unwrap();
            assert!(created);
        }
        {
            let (_, created) = ks.create_and_lock("key", &ctx()).await.unwrap();
            assert!(!created);
        }
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let ks = Keyspace::new();
        set_string(&ks, "key", "value").await;
        assert!(ks.exists("key"));

        let guard = ks.lock("key", &ctx()).await.unwrap();
        assert!(ks.delete(guard));

        assert!(!ks.exists("key"));
        assert_eq!(ks.stats().key_count, 0);
        assert_eq!(ks.stats().used_bytes, 0);
    }

    #[tokio::test]
    async fn cancelled_context_fails_lock() {
        let ks = Keyspace::new();
        set_string(&ks, "key", "value").await;

        let token = CancellationToken::new();
        token.cancel();
        let cancelled = OpContext::with_token(token);
        assert_eq!(
            ks.lock("key", &cancelled).await.unwrap_err(),
            KeyspaceError::Cancelled
        );
    }

    #[tokio::test]
    async fn deadline_fails_contended_lock() {
        let ks = Keyspace::new();
        set_string(&ks, "key", "value").await;

        // hold a write guard so a second writer must wait
        let _held = ks.lock("key", &ctx()).await.unwrap();

        let budget = ctx().with_budget(Duration::from_millis(20));
        let err = ks.lock("key", &budget).await.unwrap_err();
        assert_eq!(err, KeyspaceError::Timeout);
    }

    #[tokio::test]
    async fn expired_key_removed_on_access() {
        let ks = Keyspace::new();
        {
            let (mut guard, _) = ks.create_and_lock("temp", &ctx()).await.unwrap();
            guard.set(Value::String(Bytes::from("v")));
            guard.set_expiry(time::now_ms().saturating_sub(1000).max(1), false);
        }
        assert_eq!(
            ks.rlock("temp", &ctx()).await.unwrap_err(),
            KeyspaceError::NotFound
        );
        assert!(!ks.exists("temp"));
        assert_eq!(ks.stats().keys_expired, 1);
    }

    #[tokio::test]
    async fn expiry_index_tracks_set_and_remove() {
        let ks = Keyspace::new();
        {
            let (mut guard, _) = ks.create_and_lock("key", &ctx()).await.unwrap();
            guard.set(Value::String(Bytes::from("v")));
            guard.set_expiry(time::now_ms() + 60_000, true);
        }
        assert_eq!(ks.stats().keys_with_expiry, 1);

        {
            let mut guard = ks.lock("key", &ctx()).await.unwrap();
            guard.remove_expiry();
        }
        assert_eq!(ks.stats().keys_with_expiry, 0);
    }

    #[tokio::test]
    async fn get_state_deep_copies() {
        let ks = Keyspace::new();
        set_string(&ks, "a", "1").await;
        set_string(&ks, "b", "2").await;

        let mut state = ks.get_state().await;
        state.sort_by(|x, y| x.key.cmp(&y.key));
        assert_eq!(state.len(), 2);
        assert_eq!(state[0].key, "a");
        assert_eq!(state[0].value, Value::String(Bytes::from("1")));
        assert_eq!(state[0].expires_at_ms, time::NO_EXPIRY);

        // mutating the store afterwards doesn't affect the copy
        let guard = ks.lock("a", &ctx()).await.unwrap();
        ks.delete(guard);
        assert_eq!(state.len(), 2);
    }

    #[tokio::test]
    async fn memory_tracking_follows_mutations() {
        let ks = Keyspace::new();
        assert_eq!(ks.stats().used_bytes, 0);

        set_string(&ks, "key", "value").await;
        let after_set = ks.stats().used_bytes;
        assert!(after_set > 0);
        assert_eq!(ks.stats().key_count, 1);

        {
            let mut guard = ks.lock("key", &ctx()).await.unwrap();
            guard.set(Value::String(Bytes::from("a much longer value than before")));
        }
        assert!(ks.stats().used_bytes > after_set);
    }

    #[tokio::test]
    async fn noeviction_rejects_creation_over_limit() {
        let config = StoreConfig {
            max_memory: 150,
            eviction_policy: EvictionPolicy::NoEviction,
            ..StoreConfig::default()
        };
        let ks = Keyspace::with_config(config);

        set_string(&ks, "a", "val").await;
        // first key pushed usage past the 90% effective limit of 150
        let err = ks.create_and_lock("b", &ctx()).await.unwrap_err();
        assert_eq!(err, KeyspaceError::OutOfMemory);
        assert!(ks.exists("a"));
    }

    #[tokio::test]
    async fn lru_eviction_frees_memory() {
        let config = StoreConfig {
            max_memory: 600,
            eviction_policy: EvictionPolicy::AllKeysLru,
            ..StoreConfig::default()
        };
        let ks = Keyspace::with_config(config);

        // three entries of ~260 bytes each push usage past the
        // effective limit of 540
        let filler = "x".repeat(100);
        set_string(&ks, "old", &filler).await;
        set_string(&ks, "newer", &filler).await;
        set_string(&ks, "newest", &filler).await;

        ks.adjust_memory_usage(&ctx()).await.unwrap();

        // the earliest-accessed key goes first
        assert!(!ks.exists("old"));
        assert!(ks.stats().keys_evicted >= 1);
        assert!(ks.exists("newest"));
    }

    #[tokio::test]
    async fn lru_victim_is_least_recently_accessed() {
        let config = StoreConfig {
            max_memory: 10_000,
            eviction_policy: EvictionPolicy::AllKeysLru,
            ..StoreConfig::default()
        };
        let ks = Keyspace::with_config(config);

        set_string(&ks, "a", "1").await;
        set_string(&ks, "b", "2").await;
        // touch "a" so "b" becomes the LRU victim
        drop(ks.rlock("a", &ctx()).await.unwrap());

        let victim = ks.inner.cache.lock().as_mut().and_then(|c| c.pop());
        assert_eq!(victim, Some("b".to_string()));
    }

    #[tokio::test]
    async fn volatile_ttl_evicts_soonest_expiring() {
        let config = StoreConfig {
            max_memory: 1, // force pressure immediately
            eviction_policy: EvictionPolicy::VolatileTtl,
            ..StoreConfig::default()
        };
        let ks = Keyspace::with_config(config);

        let far = time::now_ms() + 100_000;
        let near = time::now_ms() + 50_000;
        {
            let (mut g, _) = ks.create_and_lock("far", &ctx()).await.unwrap();
            g.set(Value::String(Bytes::from("v")));
            g.set_expiry(far, false);
        }
        {
            let (mut g, _) = ks.create_and_lock("near", &ctx()).await.unwrap();
            g.set(Value::String(Bytes::from("v")));
            g.set_expiry(near, false);
        }

        // pressure is unrecoverable at max_memory=1, so the loop drains
        // the TTL domain: "near" must be the first victim
        let err = ks.adjust_memory_usage(&ctx()).await.unwrap_err();
        assert_eq!(err, KeyspaceError::EvictionExhausted);
        assert!(!ks.exists("near"));
        assert!(!ks.exists("far"));
    }

    #[tokio::test]
    async fn eviction_exhausted_when_no_candidates() {
        let config = StoreConfig {
            max_memory: 1,
            eviction_policy: EvictionPolicy::VolatileRandom,
            ..StoreConfig::default()
        };
        let ks = Keyspace::with_config(config);
        // one key without TTL — not in the volatile domain
        set_string(&ks, "stay", "v").await;

        let err = ks.adjust_memory_usage(&ctx()).await.unwrap_err();
        assert_eq!(err, KeyspaceError::EvictionExhausted);
        assert!(ks.exists("stay"));
    }

    #[tokio::test]
    async fn expire_sample_removes_expired() {
        let ks = Keyspace::new();
        for i in 0..5 {
            let key = format!("dead:{i}");
            let (mut g, _) = ks.create_and_lock(&key, &ctx()).await.unwrap();
            g.set(Value::String(Bytes::from("x")));
            g.set_expiry(1, false); // long past
        }
        set_string(&ks, "alive", "x").await;

        let removed = ks.expire_sample(64, &ctx()).await;
        assert_eq!(removed, 5);
        assert!(ks.exists("alive"));
        assert_eq!(ks.stats().keys_with_expiry, 0);
    }

    #[tokio::test]
    async fn restore_skips_expired_entries() {
        let ks = Keyspace::new();
        ks.restore("gone".into(), Value::Int(1), 1).await;
        ks.restore("kept".into(), Value::Int(2), time::NO_EXPIRY).await;

        assert!(!ks.exists("gone"));
        assert!(ks.exists("kept"));
    }

    #[tokio::test]
    async fn restore_populates_configured_store() {
        let config = StoreConfig {
            max_memory: 10_000,
            eviction_policy: EvictionPolicy::NoEviction,
            ..StoreConfig::default()
        };
        let ks = Keyspace::with_config(config);
        ks.restore(
            "big".into(),
            Value::String(Bytes::from("x".repeat(64))),
            time::NO_EXPIRY,
        )
        .await;
        assert!(ks.exists("big"));
        assert!(ks.stats().used_bytes > 0);
    }

    #[tokio::test]
    async fn concurrent_writers_serialize_per_key() {
        let ks = Keyspace::new();
        {
            let (mut g, _) = ks.create_and_lock("counter", &ctx()).await.unwrap();
            g.set(Value::Int(0));
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let ks = ks.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let mut guard = ks.lock("counter", &OpContext::new()).await.unwrap();
                    if let Value::Int(n) = guard.value() {
                        let next = n + 1;
                        guard.set(Value::Int(next));
                    }
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let guard = ks.rlock("counter", &ctx()).await.unwrap();
        assert_eq!(guard.value(), &Value::Int(400));
    }

    #[tokio::test]
    async fn hash_values_round_trip() {
        let ks = Keyspace::new();
        {
            let (mut g, _) = ks.create_and_lock("h", &ctx()).await.unwrap();
            let mut map = AHashMap::new();
            map.insert("f1".to_string(), Scalar::Str(Bytes::from("v1")));
            map.insert("n".to_string(), Scalar::Int(7));
            g.set(Value::Hash(map));
        }
        let guard = ks.rlock("h", &ctx()).await.unwrap();
        match guard.value() {
            Value::Hash(map) => {
                assert_eq!(map.get("f1"), Some(&Scalar::Str(Bytes::from("v1"))));
                assert_eq!(map.get("n"), Some(&Scalar::Int(7)));
            }
            other => panic!("expected hash, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dirty_counter_tracks_writes() {
        let ks = Keyspace::new();
        assert_eq!(ks.dirty(), 0);
        set_string(&ks, "a", "1").await;
        assert!(ks.dirty() > 0);
        ks.reset_dirty();
        assert_eq!(ks.dirty(), 0);
    }
}
