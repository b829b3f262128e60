//! Cache Counters
//!
//! Per-instance counters for the ingestion pipeline, snapshotted on
//! demand. Counters are plain relaxed atomics - they are monotone event
//! counts with no cross-counter consistency requirement, and keeping them
//! on the instance (rather than in a process-global registry) lets tests
//! assert them in isolation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a [`crate::ChangeCache`].
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Entries dropped because their sequence was already received.
    pub duplicates: AtomicU64,
    /// Late arrivals that matched an outstanding skipped sequence.
    pub late_found: AtomicU64,
    /// Late arrivals with no skip record (unexpected out-of-order).
    pub late_unexpected: AtomicU64,
    /// Sequences declared skipped by the drain policy.
    pub skipped_added: AtomicU64,
    /// Skipped sequences permanently given up on.
    pub abandoned: AtomicU64,
    /// Reconciler view queries that recovered an entry.
    pub view_hits: AtomicU64,
    /// Reconciler view queries that found nothing (or failed).
    pub view_misses: AtomicU64,
    /// Pending entries found below the watermark (invariant violations).
    pub pending_errors: AtomicU64,
    /// Times the pending buffer exceeded its size bound.
    pub pending_overflow: AtomicU64,
    /// High-water mark of the pending buffer.
    pub max_pending: AtomicU64,
}

impl CacheStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Raise the pending high-water mark if `len` exceeds it.
    pub fn note_pending(&self, len: u64) {
        self.max_pending.fetch_max(len, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            duplicates: self.duplicates.load(Ordering::Relaxed),
            late_found: self.late_found.load(Ordering::Relaxed),
            late_unexpected: self.late_unexpected.load(Ordering::Relaxed),
            skipped_added: self.skipped_added.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            view_hits: self.view_hits.load(Ordering::Relaxed),
            view_misses: self.view_misses.load(Ordering::Relaxed),
            pending_errors: self.pending_errors.load(Ordering::Relaxed),
            pending_overflow: self.pending_overflow.load(Ordering::Relaxed),
            max_pending: self.max_pending.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub duplicates: u64,
    pub late_found: u64,
    pub late_unexpected: u64,
    pub skipped_added: u64,
    pub abandoned: u64,
    pub view_hits: u64,
    pub view_misses: u64,
    pub pending_errors: u64,
    pub pending_overflow: u64,
    pub max_pending: u64,
}
