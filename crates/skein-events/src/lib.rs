//! Typed event pipeline for a session.
//!
//! Roles publish incremental updates (tokens, attachments, status,
//! confirmation requests) through post proxies; consumers (terminal UI, web
//! gateway) subscribe with handlers. Dispatch is synchronous on the
//! emitting thread: handlers must be non-blocking or queue internally.

mod bus;
mod confirm;
mod pause;
mod proxy;

pub use bus::{
    EventHandlerError, PostEventType, RoundEventType, SessionEvent, SessionEventEmitter,
    SessionEventHandler, SessionEventType,
};
pub use confirm::{ConfirmationGate, PendingConfirmation};
pub use pause::PauseHandshake;
pub use proxy::PostProxy;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    /// Emission attempted after `post_end` for the same post.
    #[error("post {0} is closed; no further events may be emitted")]
    PostClosed(String),
    /// A second confirmation request arrived before the first resolved.
    #[error("a confirmation request is already outstanding")]
    ConfirmationBusy,
    /// The session was torn down while a confirmation was outstanding.
    #[error("confirmation cancelled by session teardown")]
    ConfirmationCancelled,
    #[error("timed out waiting for confirmation")]
    ConfirmationTimeout,
    #[error("no attachment is open on post {0}")]
    NoOpenAttachment(String),
}
