//! Document Sync Metadata Parsing
//!
//! Raw documents arrive from the feed with their bookkeeping embedded in a
//! `_sync` envelope. Only the envelope is deserialized - the document body
//! itself is irrelevant to the cache and is never materialized.
//!
//! A document without the envelope, or whose envelope lacks a sequence and
//! current revision, has no place on the feed and is dropped by the caller
//! with a warning. The sequence of a dropped document is deliberately not
//! recorded, so a corrected re-send of the same sequence is still accepted.

use serde::Deserialize;

use changehouse_core::ChannelMap;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(rename = "_sync")]
    sync: Option<SyncMetadata>,
}

/// The cache-relevant subset of a document's sync metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncMetadata {
    #[serde(default)]
    pub sequence: u64,
    #[serde(default, rename = "rev")]
    pub current_rev: String,
    #[serde(default)]
    pub flags: u8,
    #[serde(default)]
    pub channels: ChannelMap,
    /// Sequences burned by conflicting writes without producing a revision.
    #[serde(default, rename = "unused_sequences")]
    pub unused_sequences: Vec<u64>,
    /// When the writer saved the document, milliseconds since epoch.
    #[serde(default, rename = "time_saved")]
    pub time_saved_ms: u64,
}

impl SyncMetadata {
    /// A usable envelope names both a sequence and a current revision.
    pub fn has_valid_sync_data(&self) -> bool {
        self.sequence > 0 && !self.current_rev.is_empty()
    }
}

/// Extract the sync metadata envelope from a raw document body.
pub fn unmarshal_sync_metadata(raw: &[u8]) -> Result<SyncMetadata> {
    let doc: RawDocument = serde_json::from_slice(raw)?;
    doc.sync.ok_or(Error::MissingSyncMetadata)
}
