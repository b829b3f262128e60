//! Change Entry Data Structure
//!
//! This module defines `ChangeEntry` - the unit of data flowing through the
//! change cache.
//!
//! ## What is a ChangeEntry?
//! Each document mutation observed on the upstream feed becomes one entry:
//! - **sequence**: the monotone global id assigned to the mutation at write time
//! - **doc_id / rev_id**: which document, which revision
//! - **channels**: the channels the document belongs to after the mutation,
//!   or the removal record for channels it just left
//! - **time_received / time_saved_ms**: when the feed handed it to us, and
//!   when the writer persisted it
//! - **skipped**: set when the entry was recovered after its sequence had
//!   already been declared missing, so readers can tell in-order deliveries
//!   from out-of-order ones
//!
//! ## Placeholders
//! An entry with an empty `doc_id` is a placeholder for a wasted sequence
//! (e.g. a conflicting write that burned a sequence number without producing
//! a revision). Placeholders occupy their sequence slot so the watermark can
//! advance, but are never fanned out to any channel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Synthetic channel that receives every non-placeholder entry when enabled.
pub const STAR_CHANNEL: &str = "*";

/// Flag bits carried on a change entry.
pub mod flag {
    /// The revision is a deletion (tombstone).
    pub const DELETED: u8 = 1;
    /// The document was removed from the channel at this sequence.
    pub const REMOVED: u8 = 2;
    /// The revision is shadowed by a conflicting revision.
    pub const HIDDEN: u8 = 4;
    /// The document is in conflict.
    pub const CONFLICT: u8 = 8;
    /// The revision created a new branch in the revision tree.
    pub const BRANCHED: u8 = 16;
}

/// Record that a document left a channel at a particular sequence.
///
/// A `None` value in a [`ChannelMap`] means "present in the channel"; a
/// `Some(ChannelRemoval)` means the document was removed at `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRemoval {
    /// Sequence at which the document left the channel.
    pub seq: u64,
}

/// Channel membership after a mutation: name -> present (`None`) or removed.
pub type ChannelMap = HashMap<String, Option<ChannelRemoval>>;

/// A single change event flowing through the cache.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    /// Global sequence number of the mutation.
    pub sequence: u64,
    /// Document id. Empty for placeholder entries.
    pub doc_id: String,
    /// Current revision id at this sequence.
    pub rev_id: String,
    /// Flag bits, see [`flag`].
    pub flags: u8,
    /// Channel membership; cleared after fan-out to release memory.
    pub channels: ChannelMap,
    /// When the entry entered the cache (monotonic clock).
    pub time_received: Instant,
    /// When the writer saved the document, milliseconds since epoch.
    pub time_saved_ms: u64,
    /// True when the entry arrived after its sequence was declared skipped.
    pub skipped: bool,
}

impl ChangeEntry {
    pub fn new(
        sequence: u64,
        doc_id: String,
        rev_id: String,
        flags: u8,
        channels: ChannelMap,
        time_saved_ms: u64,
    ) -> Self {
        Self {
            sequence,
            doc_id,
            rev_id,
            flags,
            channels,
            time_received: Instant::now(),
            time_saved_ms,
            skipped: false,
        }
    }

    /// Build a placeholder occupying `sequence` without surfacing a document.
    pub fn placeholder(sequence: u64) -> Self {
        Self::new(sequence, String::new(), String::new(), 0, ChannelMap::new(), 0)
    }

    /// True when this entry only reserves its sequence slot.
    pub fn is_placeholder(&self) -> bool {
        self.doc_id.is_empty()
    }

    /// True when any of the bits in `mask` are set on this entry.
    pub fn has_flag(&self, mask: u8) -> bool {
        self.flags & mask != 0
    }
}
