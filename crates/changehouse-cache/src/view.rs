//! Durable View Collaborator
//!
//! The cache is purely in-memory; the durable side of the database appears
//! only through this trait. It is consulted twice:
//!
//! - at startup / `clear_logs`, for the current durable sequence;
//! - by the skipped-sequence reconciler, as the fallback lookup for
//!   sequences that never arrived on the feed.
//!
//! Query failures are surfaced as errors but the reconciler deliberately
//! treats them as "not found" - a flaky view must not keep a skipped
//! sequence alive forever.

use async_trait::async_trait;

use changehouse_core::ChangeEntry;

use crate::error::Result;

/// Options for a channel changes query.
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    /// Last sequence already seen by the reader; results start after it.
    pub since: u64,
    /// Cap on the number of entries returned.
    pub limit: Option<usize>,
}

/// Durable lookup interface consumed by the cache.
#[async_trait]
pub trait DatabaseView: Send + Sync {
    /// The current durable sequence.
    async fn last_sequence(&self) -> Result<u64>;

    /// Changes recorded in `channel` with sequence `>= start_sequence`,
    /// in ascending sequence order.
    async fn changes_in_channel(
        &self,
        channel: &str,
        start_sequence: u64,
        options: &ChangesOptions,
    ) -> Result<Vec<ChangeEntry>>;
}
