use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::mpsc;

use skein_kernel::{
    ExecutionResult, KernelError, KernelLaunchSpec, KernelSession, KernelSessionInfo,
};

use crate::ApiError;

/// One frame of a streamed execution.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Output { stream: String, text: String },
    Result(ExecutionResult),
    Done,
}

/// Brings up kernel sessions; swapped out for a scripted kernel in tests.
#[async_trait]
pub trait KernelFactory: Send + Sync {
    async fn start_session(
        &self,
        session_id: &str,
        session_dir: &Path,
        cwd: &Path,
    ) -> Result<KernelSession, KernelError>;
}

/// Production factory: spawns the configured kernel subprocess.
pub struct ProcessKernelFactory {
    launch: KernelLaunchSpec,
}

impl ProcessKernelFactory {
    pub fn new(launch: KernelLaunchSpec) -> Self {
        Self { launch }
    }
}

#[async_trait]
impl KernelFactory for ProcessKernelFactory {
    async fn start_session(
        &self,
        session_id: &str,
        session_dir: &Path,
        cwd: &Path,
    ) -> Result<KernelSession, KernelError> {
        KernelSession::start(&self.launch, session_id, session_dir, cwd).await
    }
}

/// Secondary artifact source consulted when the execution session is
/// absent. Implementations must verify the requesting caller owns the
/// target session and must never resolve a path outside that session's
/// working directory.
pub trait ArtifactFallback: Send + Sync {
    fn artifact_path(&self, session_id: &str, filename: &str) -> Option<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub work_dir: PathBuf,
    /// Soft per-execution deadline; on expiry the kernel is interrupted.
    pub execution_timeout: Duration,
}

/// Owner of all kernel sessions and their working directories.
///
/// The session map lock is held only for lookups and membership changes;
/// kernel I/O always happens on an `Arc` cloned out of the map.
pub struct SessionManager {
    config: SessionManagerConfig,
    factory: Arc<dyn KernelFactory>,
    sessions: RwLock<HashMap<String, Arc<KernelSession>>>,
    // Ids reserved while a kernel is still starting, so concurrent creates
    // conflict without holding the map lock across the spawn.
    starting: Mutex<HashSet<String>>,
}

impl SessionManager {
    pub fn new(
        config: SessionManagerConfig,
        factory: Arc<dyn KernelFactory>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.work_dir)?;
        tracing::info!(work_dir = %config.work_dir.display(), "session manager initialized");
        Ok(Self {
            config,
            factory,
            sessions: RwLock::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
        })
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().expect("sessions lock").len()
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .expect("sessions lock")
            .contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<KernelSession>> {
        self.sessions
            .read()
            .expect("sessions lock")
            .get(session_id)
            .cloned()
    }

    fn require(&self, session_id: &str) -> Result<Arc<KernelSession>, ApiError> {
        self.get(session_id)
            .ok_or_else(|| ApiError::SessionNotFound(session_id.to_string()))
    }

    pub fn list(&self) -> Vec<KernelSessionInfo> {
        self.sessions
            .read()
            .expect("sessions lock")
            .values()
            .map(|s| s.info())
            .collect()
    }

    /// Create a session with a fresh working directory under the work root.
    pub async fn create(
        &self,
        session_id: Option<String>,
        cwd: Option<PathBuf>,
    ) -> Result<Arc<KernelSession>, ApiError> {
        let session_id =
            session_id.unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));

        {
            let sessions = self.sessions.read().expect("sessions lock");
            let mut starting = self.starting.lock().expect("starting lock");
            if sessions.contains_key(&session_id) || !starting.insert(session_id.clone()) {
                return Err(ApiError::SessionExists(session_id));
            }
        }

        let session_dir = self.config.work_dir.join("sessions").join(&session_id);
        let cwd = cwd.unwrap_or_else(|| session_dir.join("cwd"));
        let started = self
            .factory
            .start_session(&session_id, &session_dir, &cwd)
            .await;

        let session = match started {
            Ok(session) => Arc::new(session),
            Err(err) => {
                self.starting.lock().expect("starting lock").remove(&session_id);
                tracing::error!(session_id, error = %err, "failed to create session");
                return Err(ApiError::Kernel(err));
            }
        };

        self.sessions
            .write()
            .expect("sessions lock")
            .insert(session_id.clone(), session.clone());
        self.starting.lock().expect("starting lock").remove(&session_id);
        tracing::info!(session_id, cwd = %session.cwd().display(), "session created");
        Ok(session)
    }

    /// Stop a session's kernel and remove the record. The record is removed
    /// even if the kernel refuses to die quietly.
    pub async fn stop(&self, session_id: &str) -> Result<(), ApiError> {
        let session = self
            .sessions
            .write()
            .expect("sessions lock")
            .remove(session_id)
            .ok_or_else(|| ApiError::SessionNotFound(session_id.to_string()))?;
        if let Err(err) = session.stop().await {
            tracing::error!(session_id, error = %err, "error stopping session");
        }
        tracing::info!(session_id, "session stopped");
        Ok(())
    }

    pub async fn load_plugin(
        &self,
        session_id: &str,
        name: &str,
        code: &str,
        config: serde_json::Value,
    ) -> Result<(), ApiError> {
        let session = self.require(session_id)?;
        session.register_plugin(name, code, config).await?;
        Ok(())
    }

    /// Execute code in a session, persisting inline artifacts afterwards so
    /// the download endpoint can serve them.
    pub async fn execute(
        &self,
        session_id: &str,
        exec_id: &str,
        code: &str,
        on_output: Option<&mut (dyn FnMut(&str, &str) + Send)>,
    ) -> Result<ExecutionResult, ApiError> {
        let session = self.require(session_id)?;
        let mut result = session
            .execute(exec_id, code, self.config.execution_timeout, on_output)
            .await?;
        save_inline_artifacts(session.cwd(), &mut result).await;
        Ok(result)
    }

    /// Run an execution on a background task, streaming frames into the
    /// channel. A `Result` frame and a terminating `Done` frame are always
    /// sent, even on failure.
    pub fn execute_detached(
        self: &Arc<Self>,
        session_id: String,
        exec_id: String,
        code: String,
        tx: mpsc::UnboundedSender<StreamFrame>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let output_tx = tx.clone();
            let mut on_output = move |stream: &str, text: &str| {
                let _ = output_tx.send(StreamFrame::Output {
                    stream: stream.to_string(),
                    text: text.to_string(),
                });
            };
            let result = manager
                .execute(&session_id, &exec_id, &code, Some(&mut on_output))
                .await
                .unwrap_or_else(|err| {
                    tracing::error!(session_id, exec_id, error = %err, "streaming execution failed");
                    ExecutionResult::failed(exec_id.clone(), code.clone(), err.to_string())
                });
            let _ = tx.send(StreamFrame::Result(result));
            let _ = tx.send(StreamFrame::Done);
        });
    }

    pub async fn update_variables(
        &self,
        session_id: &str,
        variables: HashMap<String, String>,
    ) -> Result<(), ApiError> {
        let session = self.require(session_id)?;
        session.update_variables(variables).await?;
        Ok(())
    }

    pub async fn upload_file(
        &self,
        session_id: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<PathBuf, ApiError> {
        let session = self.require(session_id)?;
        Ok(session.upload_file(filename, content).await?)
    }

    pub async fn artifact_path(
        &self,
        session_id: &str,
        filename: &str,
    ) -> Result<PathBuf, ApiError> {
        let session = self.require(session_id)?;
        Ok(session.artifact_path(filename).await?)
    }
}

/// Persist base64 display-data artifacts to `cwd/<name>_image.<ext>` and
/// record the file name so a download URL can be constructed.
async fn save_inline_artifacts(cwd: &Path, result: &mut ExecutionResult) {
    for artifact in &mut result.artifacts {
        let Some(content) = artifact.file_content.clone() else {
            continue;
        };
        if !artifact.file_name.is_empty() {
            continue;
        }
        let ext = extension_for_mime(&artifact.mime_type);
        let file_name = format!("{}_image{}", artifact.name, ext);
        let path = cwd.join(&file_name);

        let write_result = if artifact.file_content_encoding.as_deref() == Some("base64") {
            match base64::engine::general_purpose::STANDARD.decode(content.as_bytes()) {
                Ok(bytes) => tokio::fs::write(&path, bytes).await,
                Err(err) => {
                    tracing::warn!(name = %artifact.name, error = %err, "undecodable inline artifact");
                    continue;
                }
            }
        } else {
            tokio::fs::write(&path, content.as_bytes()).await
        };

        match write_result {
            Ok(()) => {
                artifact.file_name = file_name.clone();
                artifact.original_name = file_name;
            }
            Err(err) => {
                tracing::warn!(name = %artifact.name, error = %err, "failed to save inline artifact");
            }
        }
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/svg+xml" => ".svg",
        "text/html" => ".html",
        "application/json" => ".json",
        _ => ".bin",
    }
}

/// Best-effort content type for artifact downloads.
pub(crate) fn detect_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "csv" => "text/csv",
        "txt" | "log" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_kernel::{
        KernelReply, KernelRequest, KernelState, KernelTransport, StreamName,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct ScriptedTransport {
        replies: StdMutex<VecDeque<KernelReply>>,
    }

    #[async_trait]
    impl KernelTransport for ScriptedTransport {
        async fn send(&self, _request: &KernelRequest) -> Result<(), KernelError> {
            Ok(())
        }

        async fn recv(&self) -> Result<KernelReply, KernelError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| KernelError::Transport("script exhausted".to_string()))
        }

        async fn shutdown(&self, _grace: Duration) -> Result<(), KernelError> {
            Ok(())
        }
    }

    struct ScriptedFactory {
        scripts: StdMutex<VecDeque<Vec<KernelReply>>>,
    }

    impl ScriptedFactory {
        fn new(scripts: Vec<Vec<KernelReply>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(scripts.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl KernelFactory for ScriptedFactory {
        async fn start_session(
            &self,
            session_id: &str,
            _session_dir: &Path,
            cwd: &Path,
        ) -> Result<KernelSession, KernelError> {
            let mut replies = vec![KernelReply::Ready];
            replies.extend(
                self.scripts
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_default(),
            );
            KernelSession::start_with_transport(
                Box::new(ScriptedTransport {
                    replies: StdMutex::new(replies.into_iter().collect()),
                }),
                &KernelLaunchSpec::default(),
                session_id,
                cwd,
            )
            .await
        }
    }

    fn manager_with_scripts(
        work_dir: &Path,
        scripts: Vec<Vec<KernelReply>>,
    ) -> Arc<SessionManager> {
        Arc::new(
            SessionManager::new(
                SessionManagerConfig {
                    work_dir: work_dir.to_path_buf(),
                    execution_timeout: Duration::from_secs(5),
                },
                ScriptedFactory::new(scripts),
            )
            .unwrap(),
        )
    }

    fn exec_script(exec_id: &str) -> Vec<KernelReply> {
        vec![
            KernelReply::Stream {
                parent: exec_id.to_string(),
                name: StreamName::Stdout,
                text: "hello\n".to_string(),
            },
            KernelReply::Status {
                parent: exec_id.to_string(),
                state: KernelState::Idle,
            },
            KernelReply::Variables {
                parent: exec_id.to_string(),
                variables: vec![],
            },
        ]
    }

    #[test]
    fn test_create_conflicts_on_existing_id() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_with_scripts(dir.path(), vec![vec![], vec![]]);

            manager.create(Some("s1".to_string()), None).await.unwrap();
            assert_eq!(manager.active_session_count(), 1);

            let err = manager.create(Some("s1".to_string()), None).await.unwrap_err();
            assert!(matches!(err, ApiError::SessionExists(_)));
            // The existing session is untouched by the failed create.
            assert!(manager.session_exists("s1"));
            assert_eq!(manager.active_session_count(), 1);
        });
    }

    #[test]
    fn test_create_lays_out_session_directories() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_with_scripts(dir.path(), vec![vec![]]);
            let session = manager.create(Some("s1".to_string()), None).await.unwrap();
            assert_eq!(
                session.cwd(),
                dir.path().join("sessions").join("s1").join("cwd")
            );
            assert!(session.cwd().is_dir());
        });
    }

    #[test]
    fn test_stop_unknown_session_is_not_found() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_with_scripts(dir.path(), vec![]);
            assert!(matches!(
                manager.stop("nope").await.unwrap_err(),
                ApiError::SessionNotFound(_)
            ));
        });
    }

    #[test]
    fn test_execute_routes_to_session() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_with_scripts(dir.path(), vec![exec_script("e1")]);
            manager.create(Some("s1".to_string()), None).await.unwrap();

            let result = manager
                .execute("s1", "e1", "print('hello')", None)
                .await
                .unwrap();
            assert!(result.is_success);
            assert_eq!(result.stdout, vec!["hello\n"]);
        });
    }

    #[test]
    fn test_execute_detached_always_terminates_with_done() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_with_scripts(dir.path(), vec![exec_script("e1")]);
            manager.create(Some("s1".to_string()), None).await.unwrap();

            let (tx, mut rx) = mpsc::unbounded_channel();
            manager.execute_detached(
                "s1".to_string(),
                "e1".to_string(),
                "print('hello')".to_string(),
                tx,
            );

            let mut frames = Vec::new();
            while let Some(frame) = rx.recv().await {
                frames.push(frame);
            }
            assert!(matches!(frames.first(), Some(StreamFrame::Output { .. })));
            assert!(matches!(
                frames[frames.len() - 2],
                StreamFrame::Result(ref r) if r.is_success
            ));
            assert!(matches!(frames.last(), Some(StreamFrame::Done)));
        });
    }

    #[test]
    fn test_execute_detached_reports_failure_as_result() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_with_scripts(dir.path(), vec![]);

            let (tx, mut rx) = mpsc::unbounded_channel();
            // No such session: the stream still ends with result + done.
            manager.execute_detached(
                "ghost".to_string(),
                "e1".to_string(),
                "1".to_string(),
                tx,
            );

            let mut frames = Vec::new();
            while let Some(frame) = rx.recv().await {
                frames.push(frame);
            }
            assert!(matches!(
                frames.first(),
                Some(StreamFrame::Result(r)) if !r.is_success
            ));
            assert!(matches!(frames.last(), Some(StreamFrame::Done)));
        });
    }

    #[test]
    fn test_inline_artifacts_are_persisted() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let png = base64::engine::general_purpose::STANDARD.encode(b"not-a-real-png");
            let script = vec![
                KernelReply::Artifact {
                    parent: "e1".to_string(),
                    artifact: skein_kernel::ExecutionArtifact {
                        name: "chart".to_string(),
                        kind: "image".to_string(),
                        mime_type: "image/png".to_string(),
                        file_content: Some(png),
                        file_content_encoding: Some("base64".to_string()),
                        ..skein_kernel::ExecutionArtifact::default()
                    },
                },
                KernelReply::Status {
                    parent: "e1".to_string(),
                    state: KernelState::Idle,
                },
                KernelReply::Variables {
                    parent: "e1".to_string(),
                    variables: vec![],
                },
            ];
            let manager = manager_with_scripts(dir.path(), vec![script]);
            manager.create(Some("s1".to_string()), None).await.unwrap();

            let result = manager.execute("s1", "e1", "plot()", None).await.unwrap();
            assert_eq!(result.artifacts[0].file_name, "chart_image.png");
            let saved = manager.artifact_path("s1", "chart_image.png").await.unwrap();
            assert_eq!(tokio::fs::read(saved).await.unwrap(), b"not-a-real-png");
        });
    }

    #[test]
    fn test_upload_path_traversal_maps_to_bad_request() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager_with_scripts(dir.path(), vec![vec![]]);
            manager.create(Some("s1".to_string()), None).await.unwrap();

            let err = manager
                .upload_file("s1", "../escape.txt", b"data")
                .await
                .unwrap_err();
            assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
            assert!(!dir.path().join("escape.txt").exists());
        });
    }

    #[test]
    fn test_detect_mime_extension_table() {
        assert_eq!(detect_mime(Path::new("a.png")), "image/png");
        assert_eq!(detect_mime(Path::new("a.csv")), "text/csv");
        assert_eq!(detect_mime(Path::new("a")), "application/octet-stream");
    }
}
