//! Pub/sub broker: channel and pattern subscription maps with
//! publish fan-out.
//!
//! Subscriptions hand the caller a broadcast receiver; publishing
//! walks the exact-channel entry plus every pattern entry whose glob
//! matches. DashMap keeps all operations lock-free across connection
//! handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::glob::glob_match;

/// Maximum allowed byte length for a subscription pattern. Longer
/// patterns provide no real-world value and let clients force repeated
/// glob-match work on every PUBLISH.
const MAX_PATTERN_LEN: usize = 512;

/// Buffered messages per subscription before a slow consumer starts
/// missing messages. Per-channel, so one busy channel doesn't starve a
/// subscriber's other subscriptions.
const CHANNEL_CAPACITY: usize = 256;

/// A message delivered to a subscriber.
///
/// `channel` and `pattern` are `Arc<str>` so every subscriber of one
/// publish shares a single allocation.
#[derive(Debug, Clone)]
pub struct PubMessage {
    /// The channel the message was published to.
    pub channel: Arc<str>,
    /// The raw message data.
    pub data: Bytes,
    /// For pattern subscriptions, the pattern that matched.
    pub pattern: Option<Arc<str>>,
}

/// Channel/pattern subscription maps and the publish fan-out.
/// Shared across connection handlers via `Arc`.
pub struct PubSubManager {
    channels: DashMap<String, broadcast::Sender<PubMessage>>,
    patterns: DashMap<String, broadcast::Sender<PubMessage>>,
    subscription_count: AtomicUsize,
}

impl Default for PubSubManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubManager {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            patterns: DashMap::new(),
            subscription_count: AtomicUsize::new(0),
        }
    }

    /// Subscribes to an exact channel.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<PubMessage> {
        self.subscribe_to(&self.channels, channel)
    }

    /// Unsubscribes from an exact channel. Returns `true` if the
    /// channel existed. The caller drops its receiver; this cleans up
    /// empty channels and adjusts the count.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.unsubscribe_from(&self.channels, channel)
    }

    /// Subscribes to a glob pattern. Returns `None` if the pattern
    /// exceeds the length limit.
    pub fn psubscribe(&self, pattern: &str) -> Option<broadcast::Receiver<PubMessage>> {
        if pattern.len() > MAX_PATTERN_LEN {
            return None;
        }
        Some(self.subscribe_to(&self.patterns, pattern))
    }

    /// Unsubscribes from a pattern. Returns `true` if it existed.
    pub fn punsubscribe(&self, pattern: &str) -> bool {
        self.unsubscribe_from(&self.patterns, pattern)
    }

    fn subscribe_to(
        &self,
        map: &DashMap<String, broadcast::Sender<PubMessage>>,
        key: &str,
    ) -> broadcast::Receiver<PubMessage> {
        let entry = map.entry(key.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
            tx
        });
        self.subscription_count.fetch_add(1, Ordering::Relaxed);
        entry.subscribe()
    }

    fn unsubscribe_from(
        &self,
        map: &DashMap<String, broadcast::Sender<PubMessage>>,
        key: &str,
    ) -> bool {
        if let Some(entry) = map.get(key) {
            self.subscription_count.fetch_sub(1, Ordering::Relaxed);
            if entry.receiver_count() <= 1 {
                drop(entry);
                map.remove(key);
            }
            true
        } else {
            false
        }
    }

    /// Publishes to a channel. Returns the total number of subscribers
    /// that received the message (exact + pattern).
    pub fn publish(&self, channel: &str, data: Bytes) -> usize {
        let mut count = 0;

        let channel_arc: Arc<str> = Arc::from(channel);

        if let Some(tx) = self.channels.get(channel) {
            let msg = PubMessage {
                channel: Arc::clone(&channel_arc),
                data: data.clone(),
                pattern: None,
            };
            count += tx.send(msg).unwrap_or(0);
        }

        for entry in self.patterns.iter() {
            let pattern = entry.key();
            if glob_match(pattern, channel) {
                let pattern_arc: Arc<str> = Arc::from(pattern.as_str());
                let msg = PubMessage {
                    channel: Arc::clone(&channel_arc),
                    data: data.clone(),
                    pattern: Some(pattern_arc),
                };
                count += entry.value().send(msg).unwrap_or(0);
            }
        }

        count
    }

    /// Total number of active subscriptions.
    pub fn total_subscriptions(&self) -> usize {
        self.subscription_count.load(Ordering::Relaxed)
    }

    /// Number of active pattern entries.
    pub fn active_patterns(&self) -> usize {
        self.patterns.len()
    }
}
