use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Attachment, AttachmentKind};

/// A single directed message within a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub send_from: String,
    pub send_to: String,
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Post {
    /// Create an empty post from the given role; `send_to` starts as
    /// "Unknown" until the role decides a recipient.
    pub fn new(send_from: impl Into<String>) -> Self {
        Self {
            id: format!("post-{}", uuid::Uuid::new_v4()),
            send_from: send_from.into(),
            send_to: "Unknown".to_string(),
            message: String::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_send_to(mut self, send_to: impl Into<String>) -> Self {
        self.send_to = send_to.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn add_attachment(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    /// First attachment of the given kind, if any.
    pub fn attachment(&self, kind: AttachmentKind) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.kind == kind)
    }

    pub fn has_attachment(&self, kind: AttachmentKind) -> bool {
        self.attachment(kind).is_some()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Load a post from its serialized form, silently dropping attachments
    /// whose kind is not in the closed set.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut post: Post = serde_json::from_value(value)?;
        post.attachments.retain(|a| a.kind.is_known());
        Ok(post)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_post_round_trip_preserves_known_attachments() {
        let mut post = Post::new("Planner")
            .with_send_to("CodeInterpreter")
            .with_message("compute the mean");
        post.add_attachment(Attachment::new(AttachmentKind::Thought, "need code"));

        let back = Post::from_value(post.to_value()).expect("load");
        assert_eq!(post, back);
    }

    #[test]
    fn test_post_load_drops_unknown_attachments() {
        let raw = json!({
            "id": "post-1",
            "send_from": "Planner",
            "send_to": "User",
            "message": "done",
            "attachments": [
                {"id": "a1", "kind": "thought", "content": "t"},
                {"id": "a2", "kind": "quantum_flux", "content": "x"}
            ]
        });
        let post = Post::from_value(raw).expect("load");
        assert_eq!(post.attachments.len(), 1);
        assert_eq!(post.attachments[0].kind, AttachmentKind::Thought);
    }

    #[test]
    fn test_new_post_defaults_send_to_unknown() {
        let post = Post::new("CodeInterpreter");
        assert_eq!(post.send_to, "Unknown");
        assert!(post.id.starts_with("post-"));
    }
}
