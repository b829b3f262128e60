//! Cache Configuration
//!
//! Tuning knobs for the ingestion pipeline. The three durations drive the
//! whole skip/recover state machine:
//!
//! - **pending_seq_max_wait**: how long the head of the pending buffer may
//!   age before the sequence it is waiting on is declared skipped
//!   (default: 5s)
//! - **pending_seq_max_num**: how large the pending buffer may grow before
//!   draining is forced regardless of age (default: 10,000)
//! - **skipped_seq_max_wait**: how long a skipped sequence may stay
//!   missing before the reconciler abandons it (default: 30 min)
//!
//! The pending tick and the reconciler each run at half their governing
//! wait so a sequence is never overdue by more than half a window.
//!
//! Every field defaults, so a partial configuration deserializes into a
//! usable whole.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the change cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Max age of the pending head before its missing predecessor is
    /// declared skipped.
    #[serde(default = "default_pending_seq_max_wait")]
    pub pending_seq_max_wait: Duration,

    /// Max size of the pending buffer before forced draining.
    #[serde(default = "default_pending_seq_max_num")]
    pub pending_seq_max_num: usize,

    /// Max age of a skipped sequence before abandonment.
    #[serde(default = "default_skipped_seq_max_wait")]
    pub skipped_seq_max_wait: Duration,

    /// Cap on concurrently processing documents; the intake queue holds
    /// three times this many.
    #[serde(default = "default_max_concurrent_docs")]
    pub max_concurrent_docs: usize,

    /// Mirror every non-placeholder entry into the `"*"` channel.
    /// Fixed at init, never reassigned at runtime.
    #[serde(default = "default_enable_star_channel")]
    pub enable_star_channel: bool,

    /// How often per-channel caches are pruned.
    #[serde(default = "default_channel_cache_prune_interval")]
    pub channel_cache_prune_interval: Duration,

    /// Per-channel cache bounds.
    #[serde(default)]
    pub channel_cache: ChannelCacheOptions,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            pending_seq_max_wait: default_pending_seq_max_wait(),
            pending_seq_max_num: default_pending_seq_max_num(),
            skipped_seq_max_wait: default_skipped_seq_max_wait(),
            max_concurrent_docs: default_max_concurrent_docs(),
            enable_star_channel: default_enable_star_channel(),
            channel_cache_prune_interval: default_channel_cache_prune_interval(),
            channel_cache: ChannelCacheOptions::default(),
        }
    }
}

fn default_pending_seq_max_wait() -> Duration {
    Duration::from_secs(5)
}

fn default_pending_seq_max_num() -> usize {
    10_000
}

fn default_skipped_seq_max_wait() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_concurrent_docs() -> usize {
    50_000
}

fn default_enable_star_channel() -> bool {
    true
}

fn default_channel_cache_prune_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Bounds for a single channel's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelCacheOptions {
    /// Maximum entries kept per channel; the oldest are evicted first.
    #[serde(default = "default_channel_max_entries")]
    pub max_entries: usize,

    /// Entries older than this are dropped by the prune pass.
    #[serde(default = "default_channel_max_age")]
    pub max_age: Duration,
}

impl Default for ChannelCacheOptions {
    fn default() -> Self {
        Self {
            max_entries: default_channel_max_entries(),
            max_age: default_channel_max_age(),
        }
    }
}

fn default_channel_max_entries() -> usize {
    500
}

fn default_channel_max_age() -> Duration {
    Duration::from_secs(60 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_options_defaults() {
        let options = CacheOptions::default();
        assert_eq!(options.pending_seq_max_wait, Duration::from_secs(5));
        assert_eq!(options.pending_seq_max_num, 10_000);
        assert_eq!(options.skipped_seq_max_wait, Duration::from_secs(1800));
        assert_eq!(options.max_concurrent_docs, 50_000);
        assert!(options.enable_star_channel);
        assert_eq!(
            options.channel_cache_prune_interval,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_channel_cache_defaults() {
        let options = ChannelCacheOptions::default();
        assert_eq!(options.max_entries, 500);
        assert_eq!(options.max_age, Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let options: CacheOptions =
            serde_json::from_str(r#"{"pending_seq_max_num": 25}"#).expect("deserialize");
        assert_eq!(options.pending_seq_max_num, 25);
        assert_eq!(options.pending_seq_max_wait, Duration::from_secs(5));
        assert_eq!(options.channel_cache.max_entries, 500);
    }

    #[test]
    fn test_config_round_trips() {
        let options = CacheOptions {
            pending_seq_max_num: 99,
            enable_star_channel: false,
            ..CacheOptions::default()
        };
        let json = serde_json::to_string(&options).expect("serialize");
        let parsed: CacheOptions = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.pending_seq_max_num, 99);
        assert!(!parsed.enable_star_channel);
        assert_eq!(parsed.skipped_seq_max_wait, Duration::from_secs(1800));
    }
}
