//! Isolated interactive kernel sessions.
//!
//! A kernel is a subprocess speaking an IPython-style message protocol
//! (stream/status/result messages tagged with the originating execution id)
//! reduced to newline-delimited JSON. The core makes no assumption about
//! the language the kernel executes.

mod result;
mod session;
mod transport;

pub use result::{ExecutionArtifact, ExecutionResult};
pub use session::{KernelLaunchSpec, KernelSession, KernelSessionInfo};
pub use transport::{
    KernelReply, KernelRequest, KernelState, KernelTransport, ProcessTransport, StreamName,
    VariableInfo,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel failed to start: {0}")]
    StartFailed(String),
    #[error("plugin load failed: {0}")]
    PluginLoadFailed(String),
    #[error("kernel transport error: {0}")]
    Transport(String),
    #[error("kernel protocol error: {0}")]
    Protocol(String),
    #[error("kernel operation timed out")]
    Timeout,
    #[error("path escapes session working directory: {0}")]
    PathTraversal(String),
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
