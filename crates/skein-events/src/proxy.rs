use std::sync::Arc;

use serde_json::{json, Value};

use skein_memory::{Attachment, AttachmentKind, Post};

use crate::bus::{PostEventType, SessionEvent, SessionEventEmitter};
use crate::EventError;

/// Event-bus handle bound to a single post under construction.
///
/// The proxy is the only writer to its post: deltas are applied in call
/// order and mirrored onto the bus. [`PostProxy::end`] consumes the proxy
/// and freezes the post, so nothing can be emitted for it afterwards.
pub struct PostProxy {
    emitter: Arc<SessionEventEmitter>,
    round_id: String,
    post: Post,
    open_attachment: Option<(String, AttachmentKind, String)>,
}

impl PostProxy {
    pub(crate) fn open(emitter: Arc<SessionEventEmitter>, round_id: String, role: &str) -> Self {
        let post = Post::new(role);
        let _ = emitter.emit(SessionEvent::Post {
            t: PostEventType::PostStart,
            post_id: post.id.clone(),
            round_id: round_id.clone(),
            msg: String::new(),
            extra: json!({ "role": role }),
        });
        Self {
            emitter,
            round_id,
            post,
            open_attachment: None,
        }
    }

    pub fn post_id(&self) -> &str {
        &self.post.id
    }

    pub fn round_id(&self) -> &str {
        &self.round_id
    }

    fn emit(&self, t: PostEventType, msg: String, extra: Value) -> Result<(), EventError> {
        self.emitter.emit(SessionEvent::Post {
            t,
            post_id: self.post.id.clone(),
            round_id: self.round_id.clone(),
            msg,
            extra,
        })
    }

    /// Append a message delta; `is_end` marks the final chunk of the stream.
    pub fn update_message(&mut self, text: &str, is_end: bool) -> Result<(), EventError> {
        self.post.message.push_str(text);
        self.emit(
            PostEventType::PostMessageUpdate,
            text.to_string(),
            json!({ "is_end": is_end }),
        )
    }

    /// Open a streaming attachment; returns its id.
    pub fn start_attachment(&mut self, kind: AttachmentKind) -> Result<String, EventError> {
        // Flush any attachment left open by a sloppy producer.
        if self.open_attachment.is_some() {
            self.update_attachment("", true)?;
        }
        let id = format!("atta-{}", uuid::Uuid::new_v4());
        self.open_attachment = Some((id.clone(), kind, String::new()));
        self.emit(
            PostEventType::PostAttachmentUpdate,
            String::new(),
            json!({ "id": id, "kind": kind, "is_end": false, "is_start": true }),
        )?;
        Ok(id)
    }

    /// Append content to the open attachment; on `is_end` the attachment is
    /// sealed onto the post.
    pub fn update_attachment(&mut self, content: &str, is_end: bool) -> Result<(), EventError> {
        let Some((id, kind, buffer)) = self.open_attachment.as_mut() else {
            return Err(EventError::NoOpenAttachment(self.post.id.clone()));
        };
        buffer.push_str(content);
        let id = id.clone();
        let kind = *kind;
        self.emit(
            PostEventType::PostAttachmentUpdate,
            content.to_string(),
            json!({ "id": id, "kind": kind, "is_end": is_end }),
        )?;
        if is_end {
            let (id, kind, buffer) = self.open_attachment.take().expect("attachment open");
            self.post.attachments.push(Attachment {
                id,
                kind,
                content: buffer,
                extra: Value::Null,
            });
        }
        Ok(())
    }

    /// Attach a complete value in one step.
    pub fn attach(&mut self, kind: AttachmentKind, content: &str) -> Result<(), EventError> {
        self.start_attachment(kind)?;
        self.update_attachment(content, true)
    }

    /// Attach a complete value carrying a structured `extra` payload.
    pub fn attach_with_extra(
        &mut self,
        kind: AttachmentKind,
        content: &str,
        extra: Value,
    ) -> Result<(), EventError> {
        self.start_attachment(kind)?;
        self.update_attachment(content, true)?;
        if let Some(attachment) = self.post.attachments.last_mut() {
            attachment.extra = extra;
        }
        Ok(())
    }

    pub fn update_send_to(&mut self, send_to: &str) -> Result<(), EventError> {
        self.post.send_to = send_to.to_string();
        self.emit(
            PostEventType::PostSendToUpdate,
            send_to.to_string(),
            json!({ "role": send_to }),
        )
    }

    /// Publish a transient status line (thinking, executing, ...).
    pub fn update_status(&mut self, status: &str) -> Result<(), EventError> {
        self.emit(PostEventType::PostStatusUpdate, status.to_string(), Value::Null)
    }

    /// Forward one chunk of kernel output. Chunks are delivered exactly as
    /// produced; coalescing is the consumer's concern.
    pub fn execution_output(&mut self, stream: &str, text: &str) -> Result<(), EventError> {
        self.emit(
            PostEventType::PostExecutionOutput,
            text.to_string(),
            json!({ "stream": stream, "text": text }),
        )
    }

    /// Ask the user to approve code execution, blocking until the decision.
    pub fn request_confirmation(
        &mut self,
        code: &str,
        timeout: Option<std::time::Duration>,
    ) -> Result<bool, EventError> {
        self.emitter
            .request_code_confirmation(&self.post.id, code, timeout)
    }

    /// Close the post and return its frozen value. An error marks the post
    /// as terminated abnormally.
    pub fn end(mut self, error: Option<&str>) -> Result<Post, EventError> {
        if self.open_attachment.is_some() {
            self.update_attachment("", true)?;
        }
        let extra = match error {
            Some(message) => json!({ "error": message }),
            None => Value::Null,
        };
        self.emit(
            PostEventType::PostEnd,
            error.unwrap_or_default().to_string(),
            extra,
        )?;
        Ok(self.post)
    }
}
