use thiserror::Error;

use skein_client::ClientError;
use skein_events::EventError;
use skein_memory::MemoryError;

#[derive(Debug, Error)]
pub enum RoleError {
    #[error("language model error: {0}")]
    LanguageModel(String),
    /// Recoverable: the generated code violates the verification policy.
    #[error("code verification failed:\n{}", .0.join("\n"))]
    CodeVerificationFailed(Vec<String>),
    /// Recoverable: the kernel reported a failing execution.
    #[error("code execution failed: {0}")]
    ExecutionFailed(String),
    #[error("user rejected code execution")]
    ConfirmationDenied,
    #[error(transparent)]
    Event(#[from] EventError),
    /// Fatal to the current turn (server unreachable, auth failure, ...).
    #[error("execution transport error: {0}")]
    Transport(#[from] ClientError),
    #[error("{0}")]
    Other(String),
}

impl RoleError {
    /// Whether the worker's retry loop may consume this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RoleError::CodeVerificationFailed(_) | RoleError::ExecutionFailed(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("role {role} failed: {source}")]
    RoleFailed {
        role: String,
        #[source]
        source: RoleError,
    },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("round aborted after {0} internal hops")]
    HopLimitExceeded(usize),
    #[error("session bootstrap failed: {0}")]
    Bootstrap(String),
}
