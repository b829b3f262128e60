//! Per-Channel Bounded Log
//!
//! Each channel keeps a bounded in-memory log of the entries fanned out to
//! it. The log is bounded two ways:
//!
//! - **capacity**: when full, the oldest entry is evicted and `valid_from`
//!   advances past it, recording that the cache no longer covers that range
//! - **age**: the periodic prune pass drops entries older than `max_age`
//!
//! ## Locking contract
//!
//! `add` is called by the ingestion core *while it holds the cache lock*,
//! so it must never block: the log is guarded by its own `std::sync::Mutex`
//! and every critical section is a short, allocation-light list operation.
//! Lock order is strictly cache lock -> channel lock, never the reverse.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use changehouse_core::ChangeEntry;

use crate::config::ChannelCacheOptions;
use crate::view::ChangesOptions;

/// An entry as stored in a channel's log.
#[derive(Debug, Clone)]
pub struct CachedChange {
    pub entry: Arc<ChangeEntry>,
    /// True when the document left this channel at this sequence.
    pub removal: bool,
    added_at: Instant,
}

#[derive(Debug)]
struct ChannelLog {
    /// Sequences below this are not covered by the cache.
    valid_from: u64,
    entries: VecDeque<CachedChange>,
}

/// Bounded log of changes for a single channel.
#[derive(Debug)]
pub struct ChannelCache {
    name: String,
    options: ChannelCacheOptions,
    log: Mutex<ChannelLog>,
}

impl ChannelCache {
    pub fn new(name: &str, valid_from: u64, options: ChannelCacheOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            log: Mutex::new(ChannelLog {
                valid_from,
                entries: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an entry to the log, evicting the oldest entry if the
    /// channel is at capacity. Non-blocking; see the module contract.
    pub fn add(&self, entry: Arc<ChangeEntry>, removal: bool) {
        let mut log = self.lock();
        if log.entries.len() >= self.options.max_entries {
            if let Some(evicted) = log.entries.pop_front() {
                log.valid_from = evicted.entry.sequence + 1;
            }
        }
        log.entries.push_back(CachedChange {
            entry,
            removal,
            added_at: Instant::now(),
        });
    }

    /// Drop entries older than the configured max age. Returns the number
    /// of entries pruned.
    pub fn prune(&self) -> usize {
        let mut log = self.lock();
        let mut pruned = 0;
        while let Some(oldest) = log.entries.front() {
            if oldest.added_at.elapsed() <= self.options.max_age {
                break;
            }
            let sequence = oldest.entry.sequence;
            log.entries.pop_front();
            log.valid_from = log.valid_from.max(sequence + 1);
            pruned += 1;
        }
        if pruned > 0 {
            tracing::debug!(channel = %self.name, pruned, "pruned channel cache");
        }
        pruned
    }

    /// Entries with sequence above `options.since`, in insertion order,
    /// truncated to `options.limit`.
    pub fn changes_since(&self, options: &ChangesOptions) -> Vec<CachedChange> {
        let log = self.lock();
        let iter = log
            .entries
            .iter()
            .filter(|c| c.entry.sequence > options.since)
            .cloned();
        match options.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    /// Lowest sequence the cache still covers for this channel.
    pub fn valid_from(&self) -> u64 {
        self.lock().valid_from
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
