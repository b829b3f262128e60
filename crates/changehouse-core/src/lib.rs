pub mod entry;
pub mod error;
pub mod pending;
pub mod received;
pub mod skipped;

pub use entry::{ChangeEntry, ChannelMap, ChannelRemoval, STAR_CHANNEL};
pub use error::{Error, Result};
pub use pending::PendingQueue;
pub use received::ReceivedSequences;
pub use skipped::{SkippedSequence, SkippedSequenceQueue};
