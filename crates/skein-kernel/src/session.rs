use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::transport::{
    KernelReply, KernelRequest, KernelState, KernelTransport, ProcessTransport, VariableInfo,
};
use crate::{ExecutionResult, KernelError};

const REPR_LIMIT: usize = 500;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const INTROSPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Namespace entries never surfaced to callers: REPL conveniences and
/// common library aliases.
const IGNORED_NAMES: [&str; 8] = ["pd", "np", "plt", "In", "Out", "exit", "quit", "get_ipython"];
const IGNORED_KINDS: [&str; 3] = ["module", "function", "plugin"];

/// How to launch the kernel subprocess.
#[derive(Debug, Clone)]
pub struct KernelLaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub ready_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for KernelLaunchSpec {
    fn default() -> Self {
        Self {
            program: "skein-kernel".to_string(),
            args: Vec::new(),
            ready_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Metadata snapshot of a session, as exposed over the API.
#[derive(Debug, Clone, Serialize)]
pub struct KernelSessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub loaded_plugins: Vec<String>,
    pub execution_count: usize,
    pub cwd: PathBuf,
}

/// One stateful interactive kernel bound to an isolated working directory.
///
/// The working directory is created fresh under the server work root and
/// every file operation is confined to it.
pub struct KernelSession {
    session_id: String,
    cwd: PathBuf,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    loaded_plugins: Mutex<Vec<String>>,
    plugin_configs: Mutex<HashMap<String, Value>>,
    execution_count: AtomicUsize,
    transport: Box<dyn KernelTransport>,
    // Serializes request/reply cycles; replies are routed by parent id but
    // one conversation runs at a time.
    io_lock: tokio::sync::Mutex<()>,
    shutdown_grace: Duration,
    stopped: AtomicBool,
}

impl std::fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSession")
            .field("session_id", &self.session_id)
            .field("cwd", &self.cwd)
            .field("created_at", &self.created_at)
            .field("execution_count", &self.execution_count)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl KernelSession {
    /// Spawn the kernel subprocess and wait until it reports ready.
    pub async fn start(
        spec: &KernelLaunchSpec,
        session_id: &str,
        session_dir: &Path,
        cwd: &Path,
    ) -> Result<Self, KernelError> {
        let kernel_dir = session_dir.join("kernel");
        tokio::fs::create_dir_all(&kernel_dir).await?;
        tokio::fs::create_dir_all(cwd).await?;

        let transport = ProcessTransport::spawn(&spec.program, &spec.args, cwd, &kernel_dir)?;
        Self::start_with_transport(Box::new(transport), spec, session_id, cwd).await
    }

    /// Bring up a session over an existing transport (tests use a scripted
    /// kernel here).
    pub async fn start_with_transport(
        transport: Box<dyn KernelTransport>,
        spec: &KernelLaunchSpec,
        session_id: &str,
        cwd: &Path,
    ) -> Result<Self, KernelError> {
        tokio::fs::create_dir_all(cwd).await?;
        let ready = tokio::time::timeout(spec.ready_timeout, async {
            loop {
                match transport.recv().await? {
                    KernelReply::Ready => return Ok::<(), KernelError>(()),
                    other => {
                        tracing::debug!(?other, "ignoring pre-ready kernel message");
                    }
                }
            }
        })
        .await;
        match ready {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(KernelError::StartFailed(err.to_string())),
            Err(_) => {
                let _ = transport.shutdown(Duration::from_secs(1)).await;
                return Err(KernelError::StartFailed(
                    "kernel did not report ready in time".to_string(),
                ));
            }
        }

        tracing::info!(session_id, cwd = %cwd.display(), "kernel session started");
        Ok(Self {
            session_id: session_id.to_string(),
            cwd: cwd.to_path_buf(),
            created_at: Utc::now(),
            last_activity: Mutex::new(Utc::now()),
            loaded_plugins: Mutex::new(Vec::new()),
            plugin_configs: Mutex::new(HashMap::new()),
            execution_count: AtomicUsize::new(0),
            transport,
            io_lock: tokio::sync::Mutex::new(()),
            shutdown_grace: spec.shutdown_grace,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn info(&self) -> KernelSessionInfo {
        KernelSessionInfo {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            last_activity: *self.last_activity.lock().expect("activity lock"),
            loaded_plugins: self.loaded_plugins.lock().expect("plugins lock").clone(),
            execution_count: self.execution_count.load(Ordering::SeqCst),
            cwd: self.cwd.clone(),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Utc::now();
    }

    /// Submit code and consume kernel messages until the matching idle
    /// status.
    ///
    /// Every stream chunk is recorded *and* handed to `on_output` (in
    /// kernel order, without coalescing) before the message loop continues.
    /// On deadline expiry the kernel is interrupted and `Timeout` surfaces.
    pub async fn execute(
        &self,
        exec_id: &str,
        code: &str,
        deadline: Duration,
        mut on_output: Option<&mut (dyn FnMut(&str, &str) + Send)>,
    ) -> Result<ExecutionResult, KernelError> {
        let _io = self.io_lock.lock().await;
        self.transport
            .send(&KernelRequest::Execute {
                exec_id: exec_id.to_string(),
                code: code.to_string(),
            })
            .await?;

        let mut result = ExecutionResult {
            execution_id: exec_id.to_string(),
            code: code.to_string(),
            is_success: true,
            ..ExecutionResult::default()
        };

        let expires = Instant::now() + deadline;
        loop {
            let remaining = expires.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = self.transport.send(&KernelRequest::Interrupt).await;
                return Err(KernelError::Timeout);
            }
            let reply = match tokio::time::timeout(remaining, self.transport.recv()).await {
                Ok(reply) => reply?,
                Err(_) => {
                    let _ = self.transport.send(&KernelRequest::Interrupt).await;
                    return Err(KernelError::Timeout);
                }
            };
            match reply {
                KernelReply::Stream { parent, name, text } if parent == exec_id => {
                    if let Some(cb) = on_output.as_deref_mut() {
                        cb(name.as_str(), &text);
                    }
                    match name {
                        crate::StreamName::Stdout => result.stdout.push(text),
                        crate::StreamName::Stderr => result.stderr.push(text),
                    }
                }
                KernelReply::ExecuteResult { parent, data }
                | KernelReply::DisplayData { parent, data }
                    if parent == exec_id =>
                {
                    result.output.extend(data);
                }
                KernelReply::Log {
                    parent,
                    level,
                    tag,
                    message,
                } if parent == exec_id => {
                    result.log.push((level, tag, message));
                }
                KernelReply::Artifact { parent, artifact } if parent == exec_id => {
                    result.artifacts.push(artifact);
                }
                KernelReply::Error {
                    parent,
                    ename,
                    evalue,
                    traceback,
                } if parent == exec_id => {
                    result.is_success = false;
                    let mut message = format!("{}: {}", ename, evalue);
                    if !traceback.is_empty() {
                        message.push('\n');
                        message.push_str(&traceback.join("\n"));
                    }
                    result.error = Some(message);
                }
                KernelReply::Status { parent, state } if parent == exec_id => {
                    if state == KernelState::Idle {
                        break;
                    }
                }
                other => {
                    tracing::debug!(?other, "ignoring kernel message for another execution");
                }
            }
        }

        result.variables = self.introspect_variables(exec_id).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "variable introspection failed");
            Vec::new()
        });

        self.execution_count.fetch_add(1, Ordering::SeqCst);
        self.touch();
        Ok(result)
    }

    async fn introspect_variables(
        &self,
        exec_id: &str,
    ) -> Result<Vec<(String, String)>, KernelError> {
        self.transport
            .send(&KernelRequest::Introspect {
                exec_id: exec_id.to_string(),
            })
            .await?;
        let expires = Instant::now() + INTROSPECT_TIMEOUT;
        loop {
            let remaining = expires.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(KernelError::Timeout);
            }
            let reply = tokio::time::timeout(remaining, self.transport.recv())
                .await
                .map_err(|_| KernelError::Timeout)??;
            if let KernelReply::Variables { parent, variables } = reply {
                if parent == exec_id {
                    return Ok(filter_variables(variables));
                }
            }
        }
    }

    /// Inject plugin source through the privileged control channel.
    pub async fn register_plugin(
        &self,
        name: &str,
        source: &str,
        config: Value,
    ) -> Result<(), KernelError> {
        let _io = self.io_lock.lock().await;
        self.transport
            .send(&KernelRequest::RegisterPlugin {
                name: name.to_string(),
                source: source.to_string(),
                config: config.clone(),
            })
            .await?;
        let expires = Instant::now() + CONTROL_TIMEOUT;
        loop {
            let remaining = expires.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(KernelError::PluginLoadFailed(format!(
                    "{}: kernel did not acknowledge",
                    name
                )));
            }
            let reply = tokio::time::timeout(remaining, self.transport.recv())
                .await
                .map_err(|_| KernelError::PluginLoadFailed(format!("{}: timed out", name)))??;
            match reply {
                KernelReply::PluginLoaded { name: loaded } if loaded == name => break,
                KernelReply::PluginError { name: failed, message } if failed == name => {
                    return Err(KernelError::PluginLoadFailed(format!("{}: {}", name, message)));
                }
                other => {
                    tracing::debug!(?other, "ignoring kernel message while loading plugin");
                }
            }
        }

        let mut plugins = self.loaded_plugins.lock().expect("plugins lock");
        if !plugins.iter().any(|p| p == name) {
            plugins.push(name.to_string());
        }
        self.plugin_configs
            .lock()
            .expect("plugin configs lock")
            .insert(name.to_string(), config);
        self.touch();
        tracing::info!(session_id = %self.session_id, plugin = name, "plugin loaded");
        Ok(())
    }

    /// Write session-scoped variables into the kernel namespace.
    pub async fn update_variables(
        &self,
        variables: HashMap<String, String>,
    ) -> Result<(), KernelError> {
        let _io = self.io_lock.lock().await;
        self.transport
            .send(&KernelRequest::UpdateVariables { variables })
            .await?;
        let expires = Instant::now() + CONTROL_TIMEOUT;
        loop {
            let remaining = expires.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(KernelError::Timeout);
            }
            let reply = tokio::time::timeout(remaining, self.transport.recv())
                .await
                .map_err(|_| KernelError::Timeout)??;
            if matches!(reply, KernelReply::VariablesUpdated) {
                self.touch();
                return Ok(());
            }
        }
    }

    /// Write an uploaded file into the session cwd.
    ///
    /// Any filename whose basename differs from the given name (directory
    /// components, parent references) is rejected outright.
    pub async fn upload_file(&self, filename: &str, content: &[u8]) -> Result<PathBuf, KernelError> {
        let basename = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| KernelError::PathTraversal(filename.to_string()))?;
        if basename != filename {
            return Err(KernelError::PathTraversal(filename.to_string()));
        }
        let target = self.cwd.join(basename);
        tokio::fs::write(&target, content).await?;
        self.touch();
        tracing::info!(session_id = %self.session_id, file = basename, "file uploaded");
        Ok(target)
    }

    /// Absolute path of an artifact previously produced by execution; must
    /// resolve under the session cwd.
    pub async fn artifact_path(&self, name: &str) -> Result<PathBuf, KernelError> {
        let candidate = self.cwd.join(name);
        let cwd = tokio::fs::canonicalize(&self.cwd).await?;
        let resolved = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|_| KernelError::ArtifactNotFound(name.to_string()))?;
        if !resolved.starts_with(&cwd) {
            return Err(KernelError::PathTraversal(name.to_string()));
        }
        if !tokio::fs::metadata(&resolved).await?.is_file() {
            return Err(KernelError::ArtifactNotFound(name.to_string()));
        }
        Ok(resolved)
    }

    /// Interrupt, then shut the kernel down; force-kill on timeout.
    /// Idempotent.
    pub async fn stop(&self) -> Result<(), KernelError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.transport.send(&KernelRequest::Interrupt).await;
        let _ = self.transport.send(&KernelRequest::Shutdown).await;
        self.transport.shutdown(self.shutdown_grace).await?;
        tracing::info!(session_id = %self.session_id, "kernel session stopped");
        Ok(())
    }
}

fn filter_variables(raw: Vec<VariableInfo>) -> Vec<(String, String)> {
    raw.into_iter()
        .filter(|v| !v.name.starts_with('_'))
        .filter(|v| !IGNORED_NAMES.contains(&v.name.as_str()))
        .filter(|v| !IGNORED_KINDS.contains(&v.kind.as_str()))
        .map(|v| {
            let repr = if v.repr.chars().count() > REPR_LIMIT {
                v.repr.chars().take(REPR_LIMIT).collect()
            } else {
                v.repr
            };
            (v.name, repr)
        })
        .collect()
}
