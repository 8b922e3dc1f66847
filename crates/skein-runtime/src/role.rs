use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use skein_events::SessionEventEmitter;
use skein_memory::{Memory, Post};

use crate::RoleError;

/// Per-round context handed to a role for one reply.
pub struct RoleContext {
    pub emitter: Arc<SessionEventEmitter>,
    pub round_id: String,
    /// Conversation-scoped variables forwarded into the execution session.
    pub session_vars: Arc<Mutex<HashMap<String, String>>>,
    /// Recoverable-failure retries already consumed in this round.
    pub retries_used: Arc<AtomicUsize>,
}

/// A participant in the conversation. Implementations stream their post
/// through a proxy obtained from the context's emitter and return the
/// frozen post.
pub trait Role: Send + Sync {
    fn alias(&self) -> &str;

    fn reply(&self, memory: &Memory, ctx: &RoleContext) -> Result<Post, RoleError>;

    /// Offer an uploaded file to the role; returns true when the role
    /// handled it (e.g. by forwarding to its execution session).
    fn stage_file(&self, _name: &str, _content: &[u8]) -> Result<bool, RoleError> {
        Ok(false)
    }

    /// Working directory of the role's execution session, if it has one.
    fn execution_cwd(&self) -> Option<PathBuf> {
        None
    }

    /// Release any resources the role holds (kernel sessions, ...).
    fn shutdown(&self) {}
}
