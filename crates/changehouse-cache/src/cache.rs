//! Change Cache - Ingestion Core
//!
//! This module implements the ingestion pipeline that turns the
//! out-of-order mutation feed into gap-free per-channel logs.
//!
//! ## Classification
//!
//! Every entry lands in exactly one of four outcomes, decided under the
//! cache lock:
//!
//! ```text
//!                 +--> duplicate: already received, dropped
//! processEntry ---+--> next:      sequence == watermark, fan out now,
//!                 |               then drain any newly-contiguous pending
//!                 +--> pending:   ahead of the watermark, buffered
//!                 +--> late:      behind the watermark, folded back in
//!                                 (marked skipped when it had a skip record)
//! ```
//!
//! ## Skip policy
//!
//! The head of the pending buffer is the rate limiter: when it is too far
//! ahead in count or in age, the sequence the watermark is waiting on is
//! declared skipped and the watermark advances. Skipped sequences are
//! reconciled against the durable view and eventually abandoned.
//!
//! ## Locking
//!
//! - the cache lock (`RwLock<CacheState>`) protects the watermark, the
//!   dedup set, the pending buffer and the channel map; it is held across
//!   classification and fan-out but never across collaborator I/O or the
//!   `on_change` callback
//! - the skipped queue has its own short-section mutex; lock order is
//!   strictly cache -> skipped

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};

use changehouse_core::{
    ChangeEntry, ChannelMap, PendingQueue, ReceivedSequences, SkippedSequenceQueue, STAR_CHANNEL,
};

use crate::auth::{Authenticator, ROLE_KEY_PREFIX, USER_KEY_PREFIX};
use crate::channel::{CachedChange, ChannelCache};
use crate::config::CacheOptions;
use crate::doc;
use crate::error::{Error, Result};
use crate::intake::{self, IncomingDoc};
use crate::stats::{CacheStats, StatsSnapshot};
use crate::view::{ChangesOptions, DatabaseView};

/// Callback notified with the set of channels an ingested entry changed.
/// Always invoked outside the cache lock.
pub type ChangeNotifier = Arc<dyn Fn(HashSet<String>) + Send + Sync>;

/// Fields protected by the cache lock.
struct CacheState {
    /// If true, incoming changes are ignored.
    logs_disabled: bool,
    stopped: bool,
    /// Next contiguous sequence expected; everything below is resolved.
    next_sequence: u64,
    /// Durable sequence at startup; entries at or below it are ignored.
    initial_sequence: u64,
    received: ReceivedSequences,
    pending: PendingQueue,
    channels: HashMap<String, Arc<ChannelCache>>,
    /// Scheduling marker for moving pending sequences to skipped.
    last_pending_check: Instant,
}

/// In-order cache of the recent change history of all channels.
pub struct ChangeCache {
    state: RwLock<CacheState>,
    /// Skipped sequences still expected from the feed. Own lock; never
    /// acquired before the cache lock is wanted again.
    skipped: StdMutex<SkippedSequenceQueue>,
    options: CacheOptions,
    stats: CacheStats,
    view: Arc<dyn DatabaseView>,
    auth: Arc<dyn Authenticator>,
    on_change: Option<ChangeNotifier>,
    intake_tx: mpsc::Sender<IncomingDoc>,
    shutdown_tx: watch::Sender<bool>,
}

impl ChangeCache {
    /// Build the cache and start its intake and housekeeping tasks.
    ///
    /// `last_sequence` is the current durable sequence: the cache expects
    /// `last_sequence + 1` next and ignores anything at or below
    /// `last_sequence`. `on_change` is notified with the changed channel
    /// set after each ingested document.
    pub fn init(
        view: Arc<dyn DatabaseView>,
        auth: Arc<dyn Authenticator>,
        last_sequence: u64,
        on_change: Option<ChangeNotifier>,
        options: CacheOptions,
    ) -> Arc<Self> {
        let (intake_tx, intake_rx) = mpsc::channel(3 * options.max_concurrent_docs.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        tracing::info!(
            initial_sequence = last_sequence,
            pending_max_wait_ms = options.pending_seq_max_wait.as_millis() as u64,
            pending_max_num = options.pending_seq_max_num,
            skipped_max_wait_ms = options.skipped_seq_max_wait.as_millis() as u64,
            "initializing change cache"
        );

        let cache = Arc::new(Self {
            state: RwLock::new(CacheState {
                logs_disabled: false,
                stopped: false,
                next_sequence: last_sequence + 1,
                initial_sequence: last_sequence,
                received: ReceivedSequences::new(last_sequence),
                pending: PendingQueue::new(),
                channels: HashMap::new(),
                last_pending_check: Instant::now(),
            }),
            skipped: StdMutex::new(SkippedSequenceQueue::new()),
            options,
            stats: CacheStats::default(),
            view,
            auth,
            on_change,
            intake_tx,
            shutdown_tx,
        });

        intake::spawn_dispatcher(Arc::clone(&cache), intake_rx);
        Arc::clone(&cache).spawn_pending_tick();
        Arc::clone(&cache).spawn_channel_prune();
        Arc::clone(&cache).spawn_skipped_reconciler();

        cache
    }

    /// Stop the cache: reads fail, writes become no-ops, and every
    /// background task exits. In-flight workers drain naturally.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            state.stopped = true;
            state.logs_disabled = true;
        }
        let _ = self.shutdown_tx.send(true);
        tracing::info!("change cache stopped");
    }

    /// Forget all cached changes for all channels and restart coverage
    /// from the current durable sequence.
    pub async fn clear_logs(&self) -> Result<()> {
        let last_sequence = self.view.last_sequence().await?;
        let mut state = self.state.write().await;
        state.initial_sequence = last_sequence;
        state.channels = HashMap::new();
        state.pending.clear();
        Ok(())
    }

    /// When disabled, incoming changes are dropped without side effects.
    pub async fn enable_channel_logs(&self, enable: bool) {
        self.state.write().await.logs_disabled = !enable;
    }

    /// Hand a raw document from the feed to the cache. Suspends only when
    /// the intake queue is full (backpressure).
    pub async fn doc_changed(&self, doc_id: impl Into<String>, body: Bytes) {
        let doc = IncomingDoc {
            id: doc_id.into(),
            body,
        };
        if self.intake_tx.send(doc).await.is_err() {
            tracing::warn!("intake queue closed, dropping document");
        }
    }

    /// Changes cached for `channel` after `options.since`.
    ///
    /// Fails with [`Error::ServiceUnavailable`] once the cache is stopped.
    pub async fn changes_in_channel(
        &self,
        channel: &str,
        options: &ChangesOptions,
    ) -> Result<Vec<CachedChange>> {
        if self.state.read().await.stopped {
            return Err(Error::ServiceUnavailable);
        }
        Ok(self.channel_cache(channel).await.changes_since(options))
    }

    /// The sequence the cache is up to date with.
    pub async fn last_sequence(&self) -> u64 {
        self.state.read().await.next_sequence - 1
    }

    /// Oldest sequence currently declared skipped, if any.
    pub fn oldest_skipped_sequence(&self) -> Option<u64> {
        self.skipped_lock().front().map(|s| s.seq)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // ---------------------------------------------------------------------
    // Ingestion
    // ---------------------------------------------------------------------

    /// Parse a raw feed document and run it through the ingestion core.
    pub(crate) async fn process_doc(&self, doc_id: &str, raw: &[u8]) {
        if doc_id.starts_with(USER_KEY_PREFIX) {
            self.process_principal_doc(doc_id, raw, true).await;
            return;
        }
        if doc_id.starts_with(ROLE_KEY_PREFIX) {
            self.process_principal_doc(doc_id, raw, false).await;
            return;
        }

        let meta = match doc::unmarshal_sync_metadata(raw) {
            Ok(meta) if meta.has_valid_sync_data() => meta,
            Ok(_) => {
                tracing::warn!(doc_id = %doc_id, "document missing usable sync metadata, dropping");
                return;
            }
            Err(e) => {
                tracing::warn!(doc_id = %doc_id, error = %e, "failed to parse document, dropping");
                return;
            }
        };

        if meta.sequence <= self.state.read().await.initial_sequence {
            // Feed replay from before startup.
            return;
        }

        // Sequences wasted by conflicting writes still occupy their slots.
        for seq in &meta.unused_sequences {
            tracing::debug!(sequence = seq, doc_id = %doc_id, "received unused sequence");
            self.process_entry(ChangeEntry::placeholder(*seq)).await;
        }

        let entry = ChangeEntry::new(
            meta.sequence,
            doc_id.to_string(),
            meta.current_rev,
            meta.flags,
            meta.channels,
            meta.time_saved_ms,
        );
        tracing::debug!(sequence = entry.sequence, doc_id = %doc_id, rev_id = %entry.rev_id, "received change");

        let changed = self.process_entry(entry).await;
        self.notify(changed);
    }

    /// User and role docs carry no channels, but they consume sequence
    /// numbers; without an entry for them the watermark would stall on
    /// the slot they occupy.
    async fn process_principal_doc(&self, doc_id: &str, raw: &[u8], is_user: bool) {
        let principal = match self.auth.unmarshal_principal(raw, is_user) {
            Ok(principal) => principal,
            Err(e) => {
                tracing::warn!(doc_id = %doc_id, error = %e, "failed to parse principal doc, dropping");
                return;
            }
        };
        if principal.sequence <= self.state.read().await.initial_sequence {
            return;
        }

        let synthetic_id = if is_user {
            format!("_user/{}", principal.name)
        } else {
            format!("_role/{}", principal.name)
        };
        tracing::debug!(sequence = principal.sequence, doc_id = %synthetic_id, "received principal change");

        let entry = ChangeEntry::new(
            principal.sequence,
            synthetic_id,
            String::new(),
            0,
            ChannelMap::new(),
            0,
        );
        self.process_entry(entry).await;
    }

    /// Route a newly-arrived entry to one of the four outcomes.
    pub(crate) async fn process_entry(&self, entry: ChangeEntry) -> HashSet<String> {
        let mut state = self.state.write().await;
        self.process_entry_locked(&mut state, entry)
    }

    fn process_entry_locked(
        &self,
        state: &mut CacheState,
        mut entry: ChangeEntry,
    ) -> HashSet<String> {
        if state.logs_disabled {
            return HashSet::new();
        }

        let sequence = entry.sequence;
        if state.received.contains(sequence) {
            CacheStats::incr(&self.stats.duplicates);
            tracing::debug!(sequence, "ignoring duplicate");
            return HashSet::new();
        }
        state.received.insert(sequence);

        if sequence == state.next_sequence {
            // The expected next sequence: cache it, then pull in any
            // pending entries that just became contiguous.
            let mut changed = self.add_to_cache_locked(state, entry);
            changed.extend(self.drain_pending_locked(state));
            changed
        } else if sequence > state.next_sequence {
            // A gap ahead of the watermark: buffer until it fills.
            state.pending.push(entry);
            let num_pending = state.pending.len();
            self.stats.note_pending(num_pending as u64);
            tracing::debug!(
                sequence,
                num_pending,
                waiting_for = state.next_sequence,
                "deferring out-of-order sequence"
            );
            if num_pending > self.options.pending_seq_max_num {
                CacheStats::incr(&self.stats.pending_overflow);
                self.drain_pending_locked(state)
            } else if state.last_pending_check.elapsed() > self.options.pending_seq_max_wait {
                self.drain_pending_locked(state)
            } else {
                HashSet::new()
            }
        } else if sequence > state.initial_sequence {
            // Behind the watermark: a late arrival for a sequence we gave
            // up on, or an unexpected out-of-order delivery.
            match self.remove_skipped(sequence) {
                Ok(()) => {
                    CacheStats::incr(&self.stats.late_found);
                    tracing::debug!(
                        sequence,
                        next_sequence = state.next_sequence,
                        doc_id = %entry.doc_id,
                        "recovered previously skipped sequence"
                    );
                    entry.skipped = true;
                }
                Err(_) => {
                    CacheStats::incr(&self.stats.late_unexpected);
                    tracing::warn!(
                        sequence,
                        next_sequence = state.next_sequence,
                        doc_id = %entry.doc_id,
                        "unexpected out-of-order change, caching anyway"
                    );
                }
            }
            self.add_to_cache_locked(state, entry)
        } else {
            // Replay from before startup.
            HashSet::new()
        }
    }

    /// Fan an entry out to its channels, advancing the watermark.
    /// Returns the set of channels the entry was added to.
    fn add_to_cache_locked(&self, state: &mut CacheState, mut entry: ChangeEntry) -> HashSet<String> {
        if entry.sequence >= state.next_sequence {
            state.next_sequence = entry.sequence + 1;
        }
        if entry.is_placeholder() {
            return HashSet::new();
        }

        // The channel map is not needed after fan-out; release it.
        let channels = std::mem::take(&mut entry.channels);
        let entry = Arc::new(entry);

        let mut added = HashSet::new();
        for (name, removal) in channels {
            // A removal recorded against an earlier sequence was already
            // surfaced at that sequence; skip it here.
            let is_removal = match &removal {
                None => false,
                Some(r) if r.seq == entry.sequence => true,
                Some(_) => continue,
            };
            self.channel_cache_locked(state, &name)
                .add(Arc::clone(&entry), is_removal);
            added.insert(name);
        }

        if self.options.enable_star_channel {
            self.channel_cache_locked(state, STAR_CHANNEL)
                .add(Arc::clone(&entry), false);
            added.insert(STAR_CHANNEL.to_string());
        }

        added
    }

    /// Promote contiguous pending entries; move overdue gaps to skipped.
    ///
    /// The pending head rate-limits the watermark: while it is the next
    /// sequence it is promoted, and while it is too old or the buffer too
    /// large, the missing sequence in front of it is abandoned to the
    /// skipped queue instead of stalling the feed.
    fn drain_pending_locked(&self, state: &mut CacheState) -> HashSet<String> {
        state.last_pending_check = Instant::now();
        let mut changed = HashSet::new();
        loop {
            let (head_sequence, head_received) = match state.pending.peek() {
                Some(head) => (head.sequence, head.time_received),
                None => break,
            };

            if head_sequence == state.next_sequence {
                if let Some(head) = state.pending.pop() {
                    changed.extend(self.add_to_cache_locked(state, head));
                }
            } else if head_sequence < state.next_sequence {
                // Already superseded; should not happen.
                CacheStats::incr(&self.stats.pending_errors);
                tracing::warn!(
                    sequence = head_sequence,
                    next_sequence = state.next_sequence,
                    "pending entry below watermark, discarding"
                );
                state.pending.pop();
            } else if state.pending.len() > self.options.pending_seq_max_num
                || head_received.elapsed() >= self.options.pending_seq_max_wait
            {
                let missing = state.next_sequence;
                tracing::debug!(sequence = missing, "moving missing sequence to skipped queue");
                self.push_skipped(missing);
                state.next_sequence += 1;
            } else {
                break;
            }
        }
        self.prune_received_locked(state);
        changed
    }

    /// Advance the dedup floor as far as the resolved prefix allows: up to
    /// the watermark, but never past an outstanding skipped sequence.
    fn prune_received_locked(&self, state: &mut CacheState) {
        let resolved = state.next_sequence - 1;
        let floor = match self.oldest_skipped_sequence() {
            Some(oldest) => resolved.min(oldest - 1),
            None => resolved,
        };
        state.received.prune_to(floor);
    }

    fn channel_cache_locked(&self, state: &mut CacheState, name: &str) -> Arc<ChannelCache> {
        if let Some(cache) = state.channels.get(name) {
            return Arc::clone(cache);
        }
        let cache = Arc::new(ChannelCache::new(
            name,
            state.initial_sequence + 1,
            self.options.channel_cache.clone(),
        ));
        state.channels.insert(name.to_string(), Arc::clone(&cache));
        cache
    }

    /// Channel lookup for readers: fast path under the read lock, lazy
    /// init double-checked under the write lock.
    async fn channel_cache(&self, name: &str) -> Arc<ChannelCache> {
        {
            let state = self.state.read().await;
            if let Some(cache) = state.channels.get(name) {
                return Arc::clone(cache);
            }
        }
        let mut state = self.state.write().await;
        self.channel_cache_locked(&mut state, name)
    }

    fn notify(&self, changed: HashSet<String>) {
        if changed.is_empty() {
            return;
        }
        if let Some(on_change) = &self.on_change {
            on_change(changed);
        }
    }

    // ---------------------------------------------------------------------
    // Skipped queue
    // ---------------------------------------------------------------------

    fn push_skipped(&self, sequence: u64) {
        match self.skipped_lock().push(sequence) {
            Ok(()) => CacheStats::incr(&self.stats.skipped_added),
            Err(e) => {
                // Ordering violation; the queue stays consistent.
                CacheStats::incr(&self.stats.pending_errors);
                tracing::warn!(sequence, error = %e, "failed to record skipped sequence");
            }
        }
    }

    fn remove_skipped(&self, sequence: u64) -> changehouse_core::Result<()> {
        self.skipped_lock().remove(sequence)
    }

    fn skipped_lock(&self) -> MutexGuard<'_, SkippedSequenceQueue> {
        self.skipped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reconcile skipped sequences that have exceeded their wait window:
    /// recover them from the durable view where possible, abandon them
    /// otherwise. Candidates are snapshotted under the skipped lock and
    /// the view is queried with the lock released.
    pub(crate) async fn clean_skipped(&self) {
        if self.state.read().await.stopped {
            return;
        }
        let max_wait = self.options.skipped_seq_max_wait;
        let expired: Vec<u64> = {
            let queue = self.skipped_lock();
            // Time-ordered, so stop at the first entry inside the window.
            queue
                .iter()
                .take_while(|s| s.time_added.elapsed() > max_wait)
                .map(|s| s.seq)
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        let mut found = Vec::new();
        let mut abandoned = Vec::new();
        for sequence in expired {
            let options = ChangesOptions {
                since: sequence,
                limit: None,
            };
            match self
                .view
                .changes_in_channel(STAR_CHANNEL, sequence, &options)
                .await
            {
                Ok(entries) => {
                    match entries.into_iter().find(|e| e.sequence == sequence) {
                        Some(entry) => {
                            CacheStats::incr(&self.stats.view_hits);
                            found.push(entry);
                        }
                        None => {
                            CacheStats::incr(&self.stats.view_misses);
                            tracing::warn!(
                                sequence,
                                "skipped sequence not in star channel view, will be abandoned"
                            );
                            abandoned.push(sequence);
                        }
                    }
                }
                Err(e) => {
                    // A failing view is indistinguishable from a missing
                    // sequence; abandon rather than wait forever.
                    CacheStats::incr(&self.stats.view_misses);
                    tracing::warn!(sequence, error = %e, "view query failed, treating skipped sequence as missing");
                    abandoned.push(sequence);
                }
            }
        }

        // Recovered entries re-enter through the normal late-arrival path,
        // which also removes them from the skipped queue.
        for entry in found {
            let changed = self.process_entry(entry).await;
            self.notify(changed);
        }

        for sequence in abandoned {
            match self.remove_skipped(sequence) {
                Ok(()) => CacheStats::incr(&self.stats.abandoned),
                Err(e) => {
                    tracing::warn!(sequence, error = %e, "failed to purge skipped sequence")
                }
            }
        }

        let mut state = self.state.write().await;
        self.prune_received_locked(&mut state);
    }

    // ---------------------------------------------------------------------
    // Housekeeping tasks
    // ---------------------------------------------------------------------

    /// If the feed has gone quiet, run the drain policy so pending
    /// sequences still age out into the skipped queue.
    pub(crate) async fn check_pending(&self) -> HashSet<String> {
        let mut state = self.state.write().await;
        if state.stopped {
            return HashSet::new();
        }
        if state.last_pending_check.elapsed() > self.options.pending_seq_max_wait {
            self.drain_pending_locked(&mut state)
        } else {
            HashSet::new()
        }
    }

    fn spawn_pending_tick(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(self.options.pending_seq_max_wait / 2);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut shutdown = self.shutdown_signal();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let changed = self.check_pending().await;
                        self.notify(changed);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("pending check task stopped");
        });
    }

    fn spawn_channel_prune(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(self.options.channel_cache_prune_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut shutdown = self.shutdown_signal();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let channels: Vec<Arc<ChannelCache>> = {
                            let state = self.state.read().await;
                            if state.stopped {
                                break;
                            }
                            state.channels.values().cloned().collect()
                        };
                        // Each channel cache locks itself during prune.
                        for channel in channels {
                            channel.prune();
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("channel prune task stopped");
        });
    }

    fn spawn_skipped_reconciler(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(self.options.skipped_seq_max_wait / 2);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut shutdown = self.shutdown_signal();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.clean_skipped().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("skipped reconciler task stopped");
        });
    }

    // ---------------------------------------------------------------------
    // Test support
    // ---------------------------------------------------------------------

    /// Block until the watermark has passed `sequence`.
    ///
    /// Intended for tests; panics when the sequence never shows up, which
    /// is a programming error in the test, not a data-path condition.
    pub async fn wait_for_sequence(&self, sequence: u64) {
        for _ in 0..200 {
            if self.last_sequence().await >= sequence {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("change cache: sequence {sequence} never showed up");
    }

    /// Like [`Self::wait_for_sequence`], but also requires `sequence` to
    /// be absent from the skipped queue (i.e. genuinely cached).
    pub async fn wait_for_sequence_with_missing(&self, sequence: u64) {
        for _ in 0..200 {
            if self.last_sequence().await >= sequence && !self.skipped_lock().contains(sequence) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("change cache: sequence {sequence} never showed up");
    }
}
