//! Background TTL sweeper.
//!
//! Fires on a fixed interval, samples keys from the TTL index, and
//! deletes any whose expiry has passed. Lazy expiration on access
//! catches hot keys; the sweeper catches keys nobody is reading.
//! Errors are logged and never propagate to clients.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::keyspace::{Keyspace, OpContext};

/// Spawns the sweeper task. It runs until `shutdown` fires.
pub fn spawn(keyspace: Keyspace, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = keyspace.config().eviction_interval;
        let sample = keyspace.config().eviction_sample;
        let mut ticker = tokio::time::interval(interval);
        // a sweep that overruns its interval shouldn't cause a burst
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = keyspace.expire_sample(sample, &OpContext::new()).await;
                    if removed > 0 {
                        debug!(removed, "ttl sweep removed expired keys");
                    }
                }
            }
        }
    })
}
