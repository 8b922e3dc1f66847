use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of attachment kinds understood by the core.
///
/// Kinds outside this set deserialize to [`AttachmentKind::Unknown`];
/// loaders strip such attachments so that newer producers remain readable
/// by older consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Plan,
    CurrentPlanStep,
    PlanReasoning,
    Stop,
    Thought,
    ReplyType,
    ReplyContent,
    Verification,
    CodeError,
    ExecutionStatus,
    ExecutionResult,
    ArtifactPaths,
    ReviseMessage,
    Function,
    SessionVariables,
    SharedMemoryEntry,
    InvalidResponse,
    Text,
    ImageUrl,
    #[serde(other)]
    Unknown,
}

impl AttachmentKind {
    pub fn is_known(&self) -> bool {
        !matches!(self, AttachmentKind::Unknown)
    }
}

/// A typed payload attached to a [`crate::Post`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub kind: AttachmentKind,
    pub content: String,
    /// Opaque per-kind payload, e.g. a serialized shared memory entry.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, content: impl Into<String>) -> Self {
        Self {
            id: format!("atta-{}", uuid::Uuid::new_v4()),
            kind,
            content: content.into(),
            extra: Value::Null,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_known_kind_round_trips() {
        let att = Attachment::new(AttachmentKind::ExecutionResult, "42");
        let value = serde_json::to_value(&att).expect("serialize");
        let back: Attachment = serde_json::from_value(value).expect("deserialize");
        assert_eq!(att, back);
    }

    #[test]
    fn test_unknown_kind_deserializes_to_unknown() {
        let raw = json!({
            "id": "atta-1",
            "kind": "holographic_projection",
            "content": "??"
        });
        let att: Attachment = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(att.kind, AttachmentKind::Unknown);
        assert!(!att.kind.is_known());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let value = serde_json::to_value(AttachmentKind::CurrentPlanStep).expect("serialize");
        assert_eq!(value, json!("current_plan_step"));
    }
}
