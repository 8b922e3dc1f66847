use serde::{Deserialize, Serialize};

/// Visibility scope of a shared memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryScope {
    /// Discarded when the round finishes.
    Round,
    /// Visible for the remainder of the conversation.
    Conversation,
}

/// Cross-role scratch data carried inside `shared_memory_entry` attachments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMemoryEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub scope: EntryScope,
    pub content: String,
}

impl SharedMemoryEntry {
    pub fn new(entry_type: impl Into<String>, scope: EntryScope, content: impl Into<String>) -> Self {
        Self {
            entry_type: entry_type.into(),
            scope,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_serializes_type_field() {
        let entry = SharedMemoryEntry::new("experience", EntryScope::Conversation, "notes");
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(
            value,
            json!({"type": "experience", "scope": "conversation", "content": "notes"})
        );
    }
}
