use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use crate::confirm::{ConfirmationGate, PendingConfirmation};
use crate::proxy::PostProxy;
use crate::EventError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventType {
    SessionStart,
    SessionEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundEventType {
    RoundStart,
    RoundEnd,
    RoundError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostEventType {
    PostStart,
    PostEnd,
    PostMessageUpdate,
    PostAttachmentUpdate,
    PostSendToUpdate,
    PostStatusUpdate,
    PostExecutionOutput,
    PostConfirmationRequest,
    PostConfirmationResponse,
}

/// One event on the bus. Identity is (scope, type, target id); `extra`
/// carries per-type fields (`is_end`, `role`, `stream`, ...).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Session {
        t: SessionEventType,
        msg: String,
        extra: Value,
    },
    Round {
        t: RoundEventType,
        round_id: String,
        msg: String,
        extra: Value,
    },
    Post {
        t: PostEventType,
        post_id: String,
        round_id: String,
        msg: String,
        extra: Value,
    },
}

impl SessionEvent {
    pub fn post_id(&self) -> Option<&str> {
        match self {
            SessionEvent::Post { post_id, .. } => Some(post_id),
            _ => None,
        }
    }

    pub fn round_id(&self) -> Option<&str> {
        match self {
            SessionEvent::Round { round_id, .. } => Some(round_id),
            SessionEvent::Post { round_id, .. } => Some(round_id),
            SessionEvent::Session { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct EventHandlerError(pub String);

/// Subscriber interface. Handlers run on the emitting thread and must not
/// block; a failing handler does not prevent delivery to the others.
pub trait SessionEventHandler: Send + Sync {
    fn handle(&self, event: &SessionEvent) -> Result<(), EventHandlerError>;
}

/// Session-scoped emitter: fan-out to registered handlers plus the
/// confirmation gate for blocking approval handshakes.
pub struct SessionEventEmitter {
    handlers: Mutex<Vec<(u64, Arc<dyn SessionEventHandler>)>>,
    next_handler_id: AtomicU64,
    current_round: Mutex<Option<String>>,
    closed_posts: Mutex<HashSet<String>>,
    gate: ConfirmationGate,
}

impl Default for SessionEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEventEmitter {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            current_round: Mutex::new(None),
            closed_posts: Mutex::new(HashSet::new()),
            gate: ConfirmationGate::new(),
        }
    }

    /// Register a handler; returns a token for [`Self::unregister`].
    pub fn register(&self, handler: Arc<dyn SessionEventHandler>) -> u64 {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().expect("handlers lock").push((id, handler));
        id
    }

    pub fn unregister(&self, token: u64) {
        self.handlers
            .lock()
            .expect("handlers lock")
            .retain(|(id, _)| *id != token);
    }

    /// Emit an event to every handler.
    ///
    /// The handler list is copied out of the lock before dispatch so user
    /// code never runs under an emitter lock. Events for a post that has
    /// already seen `post_end` are rejected.
    pub fn emit(&self, event: SessionEvent) -> Result<(), EventError> {
        if let SessionEvent::Post { t, post_id, .. } = &event {
            let mut closed = self.closed_posts.lock().expect("closed posts lock");
            if closed.contains(post_id) {
                return Err(EventError::PostClosed(post_id.clone()));
            }
            if *t == PostEventType::PostEnd {
                closed.insert(post_id.clone());
            }
        }

        let handlers: Vec<Arc<dyn SessionEventHandler>> = self
            .handlers
            .lock()
            .expect("handlers lock")
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            if let Err(err) = handler.handle(&event) {
                tracing::warn!(error = %err, "event handler failed; continuing delivery");
            }
        }
        Ok(())
    }

    /// Announce a session-scoped lifecycle event.
    pub fn emit_session_event(&self, t: SessionEventType, msg: &str) {
        let _ = self.emit(SessionEvent::Session {
            t,
            msg: msg.to_string(),
            extra: Value::Null,
        });
    }

    /// Mark a round as current and announce it.
    pub fn start_round(&self, round_id: &str) {
        *self.current_round.lock().expect("round lock") = Some(round_id.to_string());
        let _ = self.emit(SessionEvent::Round {
            t: RoundEventType::RoundStart,
            round_id: round_id.to_string(),
            msg: String::new(),
            extra: Value::Null,
        });
    }

    pub fn end_round(&self, round_id: &str) {
        let _ = self.emit(SessionEvent::Round {
            t: RoundEventType::RoundEnd,
            round_id: round_id.to_string(),
            msg: String::new(),
            extra: Value::Null,
        });
        *self.current_round.lock().expect("round lock") = None;
    }

    pub fn fail_round(&self, round_id: &str, message: &str) {
        let _ = self.emit(SessionEvent::Round {
            t: RoundEventType::RoundError,
            round_id: round_id.to_string(),
            msg: message.to_string(),
            extra: Value::Null,
        });
    }

    pub fn current_round_id(&self) -> Option<String> {
        self.current_round.lock().expect("round lock").clone()
    }

    /// Open a streaming proxy for a new post authored by `role`. Takes a
    /// handle clone so the proxy can keep emitting for its whole lifetime.
    pub fn create_post_proxy(self: Arc<Self>, role: &str) -> PostProxy {
        let round_id = self.current_round_id().unwrap_or_default();
        PostProxy::open(self, round_id, role)
    }

    /// Block until the user approves or rejects `code`.
    ///
    /// Emits `post_confirmation_request`, waits on the gate, then emits
    /// `post_confirmation_response` with the decision. Cancellation
    /// resolves to a denied decision and surfaces
    /// [`EventError::ConfirmationCancelled`].
    pub fn request_code_confirmation(
        &self,
        post_id: &str,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<bool, EventError> {
        let round_id = self.current_round_id().unwrap_or_default();
        self.gate.begin(&round_id, post_id, code)?;
        let _ = self.emit(SessionEvent::Post {
            t: PostEventType::PostConfirmationRequest,
            post_id: post_id.to_string(),
            round_id: round_id.clone(),
            msg: code.to_string(),
            extra: json!({ "code": code }),
        });

        let outcome = self.gate.wait(timeout);
        let approved = matches!(outcome, Ok(true));
        let _ = self.emit(SessionEvent::Post {
            t: PostEventType::PostConfirmationResponse,
            post_id: post_id.to_string(),
            round_id,
            msg: if approved { "approved" } else { "denied" }.to_string(),
            extra: json!({ "approved": approved }),
        });
        outcome
    }

    /// Resolve the outstanding confirmation from the UI thread.
    pub fn provide_confirmation(&self, approved: bool) {
        self.gate.provide(approved);
    }

    pub fn confirmation_pending(&self) -> Option<PendingConfirmation> {
        self.gate.pending()
    }

    /// Tear down the emitter: cancels any outstanding confirmation.
    pub fn teardown(&self) {
        self.gate.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Capture {
        events: Mutex<Vec<SessionEvent>>,
    }

    impl SessionEventHandler for Capture {
        fn handle(&self, event: &SessionEvent) -> Result<(), EventHandlerError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    impl SessionEventHandler for Failing {
        fn handle(&self, _event: &SessionEvent) -> Result<(), EventHandlerError> {
            Err(EventHandlerError("boom".to_string()))
        }
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let emitter = Arc::new(SessionEventEmitter::new());
        let capture = Arc::new(Capture::default());
        emitter.register(Arc::new(Failing));
        emitter.register(capture.clone());

        emitter.start_round("round-1");
        assert_eq!(capture.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_emission_after_post_end_is_rejected() {
        let emitter = Arc::new(SessionEventEmitter::new());
        emitter.start_round("round-1");
        let end = SessionEvent::Post {
            t: PostEventType::PostEnd,
            post_id: "post-1".to_string(),
            round_id: "round-1".to_string(),
            msg: String::new(),
            extra: Value::Null,
        };
        emitter.emit(end).unwrap();

        let late = SessionEvent::Post {
            t: PostEventType::PostMessageUpdate,
            post_id: "post-1".to_string(),
            round_id: "round-1".to_string(),
            msg: "late".to_string(),
            extra: Value::Null,
        };
        assert!(matches!(
            emitter.emit(late),
            Err(EventError::PostClosed(_))
        ));
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let emitter = Arc::new(SessionEventEmitter::new());
        let capture = Arc::new(Capture::default());
        let token = emitter.register(capture.clone());
        emitter.start_round("round-1");
        emitter.unregister(token);
        emitter.end_round("round-1");
        assert_eq!(capture.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_per_post_events_observed_in_emission_order() {
        let emitter = Arc::new(SessionEventEmitter::new());
        let capture = Arc::new(Capture::default());
        emitter.register(capture.clone());
        emitter.start_round("round-1");

        let mut proxy = emitter.clone().create_post_proxy("Planner");
        proxy.update_message("hel", false).unwrap();
        proxy.update_message("lo", true).unwrap();
        proxy.update_send_to("User").unwrap();
        let post = proxy.end(None).unwrap();
        assert_eq!(post.message, "hello");

        let events = capture.events.lock().unwrap();
        let kinds: Vec<PostEventType> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Post { t, post_id, .. } if post_id == &post.id => Some(*t),
                _ => None,
            })
            .collect();
        assert_eq!(kinds.first(), Some(&PostEventType::PostStart));
        assert_eq!(kinds.last(), Some(&PostEventType::PostEnd));
        assert_eq!(
            kinds,
            vec![
                PostEventType::PostStart,
                PostEventType::PostMessageUpdate,
                PostEventType::PostMessageUpdate,
                PostEventType::PostSendToUpdate,
                PostEventType::PostEnd,
            ]
        );
    }
}
