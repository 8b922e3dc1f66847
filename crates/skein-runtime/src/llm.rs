use crate::RoleError;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Seam to the LLM provider binding (an external collaborator). The
/// provider may retry internally; the orchestrator does not.
pub trait LanguageModel: Send + Sync {
    fn complete(&self, messages: &[ChatMessage]) -> Result<String, RoleError>;

    /// Streaming completion: deltas are delivered in order, and the full
    /// text is returned once the stream ends. The default delivers the
    /// whole completion as a single delta.
    fn complete_stream(
        &self,
        messages: &[ChatMessage],
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<String, RoleError> {
        let text = self.complete(messages)?;
        on_delta(&text);
        Ok(text)
    }
}
