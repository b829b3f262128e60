//! Changehouse Change Cache
//!
//! An in-memory, in-order cache of document-change events consumed from an
//! upstream mutation feed and made available, grouped by channel, to
//! downstream changes-feed readers.
//!
//! The feed delivers `(sequence, doc, channels)` tuples out of order, with
//! gaps, and with duplicates. The cache turns that into gap-free,
//! per-channel ordered logs with bounded latency and bounded memory:
//!
//! - in-order arrivals are fanned out to channel caches immediately and
//!   advance the watermark;
//! - out-of-order arrivals wait in a pending reorder buffer bounded by
//!   count and age;
//! - when the buffer overflows either bound, the missing sequence is
//!   declared **skipped** and the watermark moves on;
//! - a skipped sequence that shows up later is folded back in, marked as a
//!   late delivery;
//! - skipped sequences that stay missing are reconciled against a durable
//!   view and, failing that, abandoned.

pub mod auth;
pub mod cache;
pub mod channel;
pub mod config;
pub mod doc;
pub mod error;
mod intake;
pub mod stats;
pub mod view;

pub use auth::{Authenticator, JsonAuthenticator, Principal};
pub use cache::{ChangeCache, ChangeNotifier};
pub use channel::{CachedChange, ChannelCache};
pub use config::{CacheOptions, ChannelCacheOptions};
pub use error::{Error, Result};
pub use stats::StatsSnapshot;
pub use view::{ChangesOptions, DatabaseView};
