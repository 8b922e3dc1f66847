use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::{ExecutionArtifact, KernelError};

/// Requests the core sends to the kernel, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KernelRequest {
    Execute {
        exec_id: String,
        code: String,
    },
    Interrupt,
    RegisterPlugin {
        name: String,
        source: String,
        config: Value,
    },
    UpdateVariables {
        variables: HashMap<String, String>,
    },
    Introspect {
        exec_id: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    Busy,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }
}

/// One namespace binding reported by the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub repr: String,
    /// "value", "module", "function", or "plugin".
    #[serde(default)]
    pub kind: String,
}

/// Replies the kernel sends back, each tagged with the originating
/// execution id in `parent` where applicable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelReply {
    Ready,
    Status {
        parent: String,
        state: KernelState,
    },
    Stream {
        parent: String,
        name: StreamName,
        text: String,
    },
    ExecuteResult {
        parent: String,
        data: Vec<(String, String)>,
    },
    DisplayData {
        parent: String,
        data: Vec<(String, String)>,
    },
    Log {
        parent: String,
        level: String,
        tag: String,
        message: String,
    },
    Artifact {
        parent: String,
        artifact: ExecutionArtifact,
    },
    Variables {
        parent: String,
        variables: Vec<VariableInfo>,
    },
    Error {
        parent: String,
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    PluginLoaded {
        name: String,
    },
    PluginError {
        name: String,
        message: String,
    },
    VariablesUpdated,
}

/// Message channel to one kernel. The production implementation wraps a
/// subprocess; tests drive a scripted in-memory kernel.
#[async_trait]
pub trait KernelTransport: Send + Sync {
    async fn send(&self, request: &KernelRequest) -> Result<(), KernelError>;
    /// Next reply from the kernel; fails once the kernel is gone.
    async fn recv(&self) -> Result<KernelReply, KernelError>;
    /// Graceful shutdown: wait up to `grace` for exit, then force-kill.
    async fn shutdown(&self, grace: Duration) -> Result<(), KernelError>;
}

/// Transport over a spawned kernel subprocess. stdin carries requests,
/// stdout carries replies; stderr is forwarded to the log.
pub struct ProcessTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
}

impl ProcessTransport {
    pub fn spawn(
        program: &str,
        args: &[String],
        cwd: &Path,
        kernel_dir: &Path,
    ) -> Result<Self, KernelError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .env("SKEIN_KERNEL_DIR", kernel_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KernelError::StartFailed(format!("spawn {}: {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| KernelError::StartFailed("kernel stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KernelError::StartFailed("kernel stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "skein_kernel::stderr", "{}", line);
                }
            });
        }

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
        })
    }
}

#[async_trait]
impl KernelTransport for ProcessTransport {
    async fn send(&self, request: &KernelRequest) -> Result<(), KernelError> {
        let mut line =
            serde_json::to_string(request).map_err(|e| KernelError::Protocol(e.to_string()))?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| KernelError::Transport(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| KernelError::Transport(e.to_string()))
    }

    async fn recv(&self) -> Result<KernelReply, KernelError> {
        let mut stdout = self.stdout.lock().await;
        loop {
            let mut line = String::new();
            let n = stdout
                .read_line(&mut line)
                .await
                .map_err(|e| KernelError::Transport(e.to_string()))?;
            if n == 0 {
                return Err(KernelError::Transport("kernel closed its stdout".to_string()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<KernelReply>(trimmed) {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    // Kernels occasionally print non-protocol noise at startup.
                    tracing::debug!(error = %err, line = trimmed, "skipping non-protocol kernel line");
                }
            }
        }
    }

    async fn shutdown(&self, grace: Duration) -> Result<(), KernelError> {
        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "kernel exited");
                Ok(())
            }
            Ok(Err(e)) => Err(KernelError::Transport(e.to_string())),
            Err(_) => {
                tracing::warn!("kernel did not exit within grace period; killing");
                child
                    .start_kill()
                    .map_err(|e| KernelError::Transport(e.to_string()))?;
                let _ = child.wait().await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request = KernelRequest::Execute {
            exec_id: "e1".to_string(),
            code: "print(1)".to_string(),
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            value,
            json!({"op": "execute", "exec_id": "e1", "code": "print(1)"})
        );
    }

    #[test]
    fn test_reply_wire_format() {
        let raw = json!({"type": "stream", "parent": "e1", "name": "stdout", "text": "hi\n"});
        let reply: KernelReply = serde_json::from_value(raw).expect("deserialize");
        match reply {
            KernelReply::Stream { parent, name, text } => {
                assert_eq!(parent, "e1");
                assert_eq!(name, StreamName::Stdout);
                assert_eq!(text, "hi\n");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_status_idle_wire_format() {
        let raw = json!({"type": "status", "parent": "e1", "state": "idle"});
        let reply: KernelReply = serde_json::from_value(raw).expect("deserialize");
        assert!(matches!(
            reply,
            KernelReply::Status {
                state: KernelState::Idle,
                ..
            }
        ));
    }
}
