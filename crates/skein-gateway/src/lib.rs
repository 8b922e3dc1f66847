//! Web gateway: projects the session event bus onto a persistent duplex
//! (WebSocket) connection, replays conversation history on connect, and
//! forwards inbound messages (user turns, confirmations, file uploads)
//! into the orchestrator.

mod protocol;
mod ws;

pub use protocol::{event_frames, history_frames};
pub use ws::ws_chat;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::extract::{Path, State};
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;

use skein_runtime::{Session, SessionError};
use skein_server::ArtifactFallback;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("access denied")]
    AccessDenied,
    #[error("artifact {0} not found")]
    ArtifactNotFound(String),
    #[error("{0}")]
    Session(#[from] SessionError),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::SessionNotFound(_) | GatewayError::ArtifactNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::AccessDenied => StatusCode::FORBIDDEN,
            GatewayError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Creates orchestrator sessions for the gateway (roles, model bindings,
/// execution client all pre-wired by the embedder).
pub trait SessionFactory: Send + Sync {
    fn create_session(&self, session_id: &str) -> Result<Arc<Session>, SessionError>;
}

/// A session as seen by the gateway: the orchestrator session plus the
/// connection-scoped turn flag and staged uploads.
pub struct GatewaySession {
    pub session: Arc<Session>,
    pub is_processing: AtomicBool,
    pub pending_files: Mutex<Vec<(String, Vec<u8>)>>,
}

/// Owner of gateway sessions.
pub struct GatewayManager {
    factory: Arc<dyn SessionFactory>,
    sessions: Mutex<HashMap<String, Arc<GatewaySession>>>,
}

impl GatewayManager {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn create_session(&self) -> Result<Arc<GatewaySession>, GatewayError> {
        let session_id = format!("chat-{}", uuid::Uuid::new_v4());
        let session = self.factory.create_session(&session_id)?;
        let gateway_session = Arc::new(GatewaySession {
            session,
            is_processing: AtomicBool::new(false),
            pending_files: Mutex::new(Vec::new()),
        });
        self.sessions
            .lock()
            .expect("sessions lock")
            .insert(session_id.clone(), gateway_session.clone());
        tracing::info!(session_id, "chat session created");
        Ok(gateway_session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<GatewaySession>> {
        self.sessions
            .lock()
            .expect("sessions lock")
            .get(session_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.sessions
            .lock()
            .expect("sessions lock")
            .keys()
            .cloned()
            .collect()
    }

    pub fn delete(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .lock()
            .expect("sessions lock")
            .remove(session_id);
        match removed {
            Some(session) => {
                session.session.stop();
                tracing::info!(session_id, "chat session deleted");
                true
            }
            None => false,
        }
    }

    pub fn cleanup_all(&self) {
        let sessions: Vec<Arc<GatewaySession>> = {
            let mut map = self.sessions.lock().expect("sessions lock");
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.session.stop();
        }
    }

    /// Resolve an artifact inside a session's execution cwd, rejecting any
    /// path that escapes it.
    fn contained_artifact_path(&self, session_id: &str, filename: &str) -> Result<PathBuf, GatewayError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;
        let cwd = session
            .session
            .execution_cwd()
            .ok_or_else(|| GatewayError::ArtifactNotFound(filename.to_string()))?;
        let cwd = cwd
            .canonicalize()
            .map_err(|_| GatewayError::ArtifactNotFound(filename.to_string()))?;
        let candidate = cwd.join(filename);
        let resolved = candidate
            .canonicalize()
            .map_err(|_| GatewayError::ArtifactNotFound(filename.to_string()))?;
        if !resolved.starts_with(&cwd) {
            return Err(GatewayError::AccessDenied);
        }
        Ok(resolved)
    }
}

/// Cross-boundary artifact fallback for the execution server: only resolves
/// sessions this gateway owns, confined to their working directories.
impl ArtifactFallback for GatewayManager {
    fn artifact_path(&self, session_id: &str, filename: &str) -> Option<PathBuf> {
        self.contained_artifact_path(session_id, filename).ok()
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<GatewayManager>,
}

pub fn router(manager: Arc<GatewayManager>) -> Router {
    Router::new()
        .route(
            "/api/v1/chat/sessions",
            get(list_sessions).post(create_session),
        )
        .route("/api/v1/chat/sessions/{id}", axum::routing::delete(delete_session))
        .route(
            "/api/v1/chat/sessions/{id}/artifacts/{filename}",
            get(download_artifact),
        )
        .route("/api/v1/chat/ws/{id}", get(ws_chat))
        .with_state(GatewayState { manager })
}

async fn create_session(
    State(state): State<GatewayState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let session = state.manager.create_session()?;
    Ok(Json(json!({
        "session_id": session.session.session_id(),
        "status": "created",
    })))
}

async fn list_sessions(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let sessions: Vec<serde_json::Value> = state
        .manager
        .list()
        .into_iter()
        .map(|id| json!({ "session_id": id }))
        .collect();
    Json(json!({ "sessions": sessions }))
}

async fn delete_session(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    if state.manager.delete(&id) {
        Json(json!({ "status": "deleted" }))
    } else {
        Json(json!({ "status": "not_found" }))
    }
}

async fn download_artifact(
    State(state): State<GatewayState>,
    Path((id, filename)): Path<(String, String)>,
) -> Result<impl IntoResponse, GatewayError> {
    let path = state.manager.contained_artifact_path(&id, &filename)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| GatewayError::ArtifactNotFound(filename))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_runtime::Planner;
    use std::sync::Arc;

    struct NullLlm;

    impl skein_runtime::LanguageModel for NullLlm {
        fn complete(
            &self,
            _messages: &[skein_runtime::ChatMessage],
        ) -> Result<String, skein_runtime::RoleError> {
            Ok(r#"{"message": "ok", "send_to": "User"}"#.to_string())
        }
    }

    struct TestFactory;

    impl SessionFactory for TestFactory {
        fn create_session(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
            Ok(Arc::new(
                Session::builder(session_id)
                    .planner(Arc::new(Planner::new(Arc::new(NullLlm), vec![])))
                    .build()?,
            ))
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let manager = GatewayManager::new(Arc::new(TestFactory));
        let session = manager.create_session().unwrap();
        let id = session.session.session_id().to_string();

        assert!(manager.get(&id).is_some());
        assert_eq!(manager.list(), vec![id.clone()]);
        assert!(manager.delete(&id));
        assert!(!manager.delete(&id));
        assert!(manager.get(&id).is_none());
    }

    #[test]
    fn test_artifact_fallback_requires_owned_session() {
        let manager = GatewayManager::new(Arc::new(TestFactory));
        assert!(manager.artifact_path("nope", "file.txt").is_none());
    }
}
