//! Lifetimes and tuning knobs for the key lifecycle engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::UnixTime;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Key lifetime policy.
///
/// All comparisons are against Merkle root time. The relationship that keeps
/// content readable is `min_key_lifetime >= max_content_lifetime +
/// keygen_interval`: a key rotated on schedule outlives every message
/// encrypted with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyLifetimes {
    /// Longest time exploding content may live
    pub max_content_lifetime: Duration,
    /// Age after which a key is rotated
    pub keygen_interval: Duration,
    /// Minimum retention of a key after creation
    pub min_key_lifetime: Duration,
    /// Age after which a key is stale and no longer used for new boxes
    pub max_key_staleness: Duration,
    /// How long before `keygen_interval` a successor may be published in the
    /// background while the current key is still handed out
    pub background_keygen_window: Duration,
}

impl Default for KeyLifetimes {
    fn default() -> Self {
        Self {
            max_content_lifetime: 7 * DAY,
            keygen_interval: DAY,
            min_key_lifetime: 8 * DAY,
            max_key_staleness: 38 * DAY,
            background_keygen_window: HOUR,
        }
    }
}

impl KeyLifetimes {
    /// A key created at `key_ctime` must be rotated at `now`.
    pub fn keygen_needed(&self, key_ctime: UnixTime, now: UnixTime) -> bool {
        now.since(key_ctime) >= self.keygen_interval
    }

    /// A key created at `key_ctime` is close enough to rotation that a
    /// successor may be published in the background, but still usable.
    pub fn background_keygen_possible(&self, key_ctime: UnixTime, now: UnixTime) -> bool {
        let age = now.since(key_ctime);
        let window_start = self.keygen_interval.saturating_sub(self.background_keygen_window);
        age >= window_start && !self.keygen_needed(key_ctime, now)
    }

    /// A key created at `key_ctime` is too old to box new content to: its age
    /// exceeds the staleness limit.
    pub fn is_stale(&self, key_ctime: UnixTime, now: UnixTime) -> bool {
        now.since(key_ctime) > self.max_key_staleness
    }

    /// Content created at `content_ctime` has outlived the content lifetime.
    pub fn content_expired(&self, content_ctime: UnixTime, now: UnixTime) -> bool {
        now.since(content_ctime) >= self.max_content_lifetime
    }
}

/// Configuration for [`EkLib`](crate::EkLib) and its storages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EkConfig {
    /// Key lifetime policy
    pub lifetimes: KeyLifetimes,
    /// Capacity of the latest-generation LRU for teams and teambots
    pub generation_cache_capacity: usize,
    /// How long a latest-generation LRU entry is trusted
    pub generation_cache_ttl: Duration,
    /// Attempts per publish, including the first one
    pub max_publish_retries: u32,
    /// Sleep between publish attempts
    pub retry_backoff: Duration,
    /// Minimum time between background keygen runs
    pub background_interval: Duration,
    /// Upper bound of the randomized delay after the app becomes
    /// background-active
    pub app_state_jitter: Duration,
}

impl Default for EkConfig {
    fn default() -> Self {
        Self {
            lifetimes: KeyLifetimes::default(),
            generation_cache_capacity: 200,
            generation_cache_ttl: Duration::from_secs(5 * 60),
            max_publish_retries: 5,
            retry_backoff: Duration::from_millis(200),
            background_interval: HOUR,
            app_state_jitter: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_days(days: u64) -> UnixTime {
        UnixTime(days * DAY.as_secs())
    }

    #[test]
    fn defaults_keep_content_readable() {
        let lifetimes = KeyLifetimes::default();
        assert!(
            lifetimes.min_key_lifetime >= lifetimes.max_content_lifetime + lifetimes.keygen_interval
        );
    }

    #[test]
    fn keygen_needed_at_interval() {
        let lifetimes = KeyLifetimes::default();
        let created = at_days(10);

        assert!(!lifetimes.keygen_needed(created, created + Duration::from_secs(DAY.as_secs() - 1)));
        assert!(lifetimes.keygen_needed(created, at_days(11)));
    }

    #[test]
    fn background_window_precedes_keygen() {
        let lifetimes = KeyLifetimes::default();
        let created = at_days(0);

        assert!(!lifetimes.background_keygen_possible(created, UnixTime(DAY.as_secs() - 2 * 3600)));
        assert!(lifetimes.background_keygen_possible(created, UnixTime(DAY.as_secs() - 1800)));
        assert!(!lifetimes.background_keygen_possible(created, at_days(1)));
    }

    #[test]
    fn staleness_and_content_expiry() {
        let lifetimes = KeyLifetimes::default();

        assert!(!lifetimes.is_stale(at_days(0), at_days(37)));
        assert!(!lifetimes.is_stale(at_days(0), at_days(38)));
        assert!(lifetimes.is_stale(at_days(0), at_days(38) + Duration::from_secs(1)));
        assert!(!lifetimes.content_expired(at_days(0), at_days(6)));
        assert!(lifetimes.content_expired(at_days(0), at_days(7)));
    }

    #[test]
    fn clock_skew_never_triggers_rotation() {
        let lifetimes = KeyLifetimes::default();
        assert!(!lifetimes.keygen_needed(at_days(5), at_days(4)));
    }

    #[test]
    fn config_defaults() {
        let config = EkConfig::default();
        assert_eq!(config.generation_cache_capacity, 200);
        assert_eq!(config.max_publish_retries, 5);
        assert_eq!(config.retry_backoff, Duration::from_millis(200));
    }
}
