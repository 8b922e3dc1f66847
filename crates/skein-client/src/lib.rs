//! Client-side binding to the execution service.
//!
//! [`ExecutionClient`] exposes the same interface shape as a local kernel
//! session, forwarding over HTTP and SSE. [`ServerLauncher`] spawns a local
//! server (subprocess or container) when the configured URL answers no
//! health probe. Everything here is blocking: the client is driven from
//! orchestrator worker threads, never from inside an async runtime.

mod client;
mod launcher;
mod sse;

pub use client::{ExecutionClient, ExecutionClientConfig, HealthInfo};
pub use launcher::{ServerLauncher, ServerLauncherConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server did not answer at all (connect error, timeout).
    #[error("cannot reach execution server: {0}")]
    ServerUnreachable(String),
    /// The server answered with a non-2xx status; `detail` is its message.
    #[error("server error ({status}): {detail}")]
    Api { status: u16, detail: String },
    /// An auto-started server never became healthy before the deadline.
    #[error("execution server failed to start: {0}")]
    ServerStartFailed(String),
    #[error("malformed server response: {0}")]
    Decode(String),
    #[error("execution stream ended without a result")]
    StreamTruncated,
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_auth(&self) -> bool {
        self.status() == Some(401)
    }
}
