//! Error Types for the Change Cache Engine
//!
//! ## Error Categories
//!
//! ### Availability
//! - `ServiceUnavailable`: the cache has been stopped; reads should be
//!   retried against a fresh cache
//!
//! ### Parse errors
//! - `Json`: the raw document body is not valid JSON
//! - `MissingSyncMetadata`: the document parses but carries no sync
//!   metadata envelope
//! - `InvalidPrincipal`: a user/role doc is missing its name
//!
//! ### Collaborator errors
//! - `ViewQuery`: the durable view query failed; the reconciler treats
//!   this the same as "sequence not found"
//!
//! ### Container errors
//! - `Sequence`: ordering violations from the core containers
//!
//! All data-path errors are logged and counted rather than propagated, so
//! one malformed event can never wedge the feed.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("change cache is stopped")]
    ServiceUnavailable,

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document has no sync metadata")]
    MissingSyncMetadata,

    #[error("invalid principal document: {0}")]
    InvalidPrincipal(String),

    #[error("view query failed: {0}")]
    ViewQuery(String),

    #[error(transparent)]
    Sequence(#[from] changehouse_core::Error),
}
