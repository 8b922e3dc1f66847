//! Conversation data model and the thread-safe Conversation Store.
//!
//! The store is append-only: rounds are 1-indexed, contiguous, and never
//! removed. Mutations are serialized behind a single lock; reads return
//! point-in-time snapshots.

mod attachment;
mod conversation;
mod memory;
mod post;
mod round;
mod shared;

pub use attachment::{Attachment, AttachmentKind};
pub use conversation::Conversation;
pub use memory::{CompactionProvider, Memory, MemoryError, RoundAddedCallback};
pub use post::Post;
pub use round::{Round, RoundState};
pub use shared::{EntryScope, SharedMemoryEntry};

use serde::{Deserialize, Serialize};

/// A single summarization artifact covering rounds `start_index..=end_index`.
///
/// At most one exists per (session, role); updates replace the prior value
/// and `end_index` never decreases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactedMessage {
    pub start_index: usize,
    pub end_index: usize,
    pub summary: String,
}

impl CompactedMessage {
    /// Render the summary as a system message for prompt assembly.
    pub fn to_system_message(&self) -> String {
        format!(
            "[Conversation History Summary (Rounds {}-{})]\n{}",
            self.start_index, self.end_index, self.summary
        )
    }
}
