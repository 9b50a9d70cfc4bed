//! Wall-clock expiry timestamps.
//!
//! Keys store their expiry as absolute unix milliseconds so EXPIREAT
//! and EXPIRETIME work across restarts, with 0 as the "never expires"
//! sentinel.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sentinel value meaning "no expiry".
pub const NO_EXPIRY: u64 = 0;

/// Returns the current wall-clock time in unix milliseconds.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns true if the given expiry timestamp has passed.
#[inline]
pub fn is_expired(expires_at_ms: u64) -> bool {
    expires_at_ms != NO_EXPIRY && now_ms() >= expires_at_ms
}

/// Converts an optional TTL duration to an absolute expiry timestamp.
#[inline]
pub fn expiry_from_duration(ttl: Option<Duration>) -> u64 {
    ttl.map(|d| now_ms().saturating_add(d.as_millis() as u64))
        .unwrap_or(NO_EXPIRY)
}

/// Returns remaining TTL in seconds, or None if no expiry.
#[inline]
pub fn remaining_secs(expires_at_ms: u64) -> Option<u64> {
    remaining_ms(expires_at_ms).map(|ms| ms / 1000)
}

/// Returns remaining TTL in milliseconds, or None if no expiry.
#[inline]
pub fn remaining_ms(expires_at_ms: u64) -> Option<u64> {
    if expires_at_ms == NO_EXPIRY {
        None
    } else {
        Some(expires_at_ms.saturating_sub(now_ms()))
    }
}
