//! Error Types for Changehouse Core Containers
//!
//! Container mutations that violate ordering invariants surface here.
//! The ingestion engine treats both variants as data-path conditions:
//! they are counted and logged, never propagated as panics.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("sequence {0} not found in skipped queue")]
    SequenceNotFound(u64),

    #[error("sequence {0} is not above the skipped queue maximum")]
    NonMonotonicPush(u64),
}
