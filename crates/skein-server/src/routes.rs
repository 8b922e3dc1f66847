use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde_json::json;
use tokio::sync::mpsc;

use crate::auth::verify_api_key;
use crate::manager::{detect_mime, ArtifactFallback, SessionManager, StreamFrame};
use crate::models::*;
use crate::{ApiError, SERVER_VERSION};

/// How long an unclaimed stream stays around before it is dropped.
const STREAM_CLAIM_WINDOW: Duration = Duration::from_secs(300);

type StreamRegistry = Arc<Mutex<HashMap<String, mpsc::UnboundedReceiver<StreamFrame>>>>;

#[derive(Clone)]
pub struct AppState {
    manager: Arc<SessionManager>,
    api_key: Option<String>,
    streams: StreamRegistry,
    fallback: Option<Arc<dyn ArtifactFallback>>,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>, api_key: Option<String>) -> Self {
        Self {
            manager,
            api_key,
            streams: Arc::new(Mutex::new(HashMap::new())),
            fallback: None,
        }
    }

    pub fn with_artifact_fallback(mut self, fallback: Arc<dyn ArtifactFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn authorize(&self, headers: &HeaderMap, peer: SocketAddr) -> Result<(), ApiError> {
        verify_api_key(self.api_key.as_deref(), headers, Some(peer.ip()))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/v1/sessions/{id}",
            get(session_info).delete(stop_session),
        )
        .route("/api/v1/sessions/{id}/plugins", post(load_plugin))
        .route("/api/v1/sessions/{id}/execute", post(execute_code))
        .route(
            "/api/v1/sessions/{id}/execute/{exec_id}/stream",
            get(stream_execution),
        )
        .route(
            "/api/v1/sessions/{id}/variables",
            post(update_variables),
        )
        .route("/api/v1/sessions/{id}/files", post(upload_file))
        .route(
            "/api/v1/sessions/{id}/artifacts/{filename}",
            get(download_artifact),
        )
        .with_state(state)
}

/// Liveness; deliberately unauthenticated so launchers can probe it.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: SERVER_VERSION,
        active_sessions: state.manager.active_session_count(),
    })
}

async fn list_sessions(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<SessionListResponse>, ApiError> {
    state.authorize(&headers, peer)?;
    let sessions: Vec<SessionInfoResponse> = state
        .manager
        .list()
        .into_iter()
        .map(SessionInfoResponse::from)
        .collect();
    let total_count = sessions.len();
    Ok(Json(SessionListResponse {
        sessions,
        total_count,
    }))
}

async fn create_session(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers, peer)?;
    let session = state
        .manager
        .create(request.session_id, request.cwd)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.session_id().to_string(),
            status: "created",
            cwd: session.cwd().to_path_buf(),
        }),
    ))
}

async fn session_info(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SessionInfoResponse>, ApiError> {
    state.authorize(&headers, peer)?;
    let session = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::SessionNotFound(id))?;
    Ok(Json(SessionInfoResponse::from(session.info())))
}

async fn stop_session(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<StopSessionResponse>, ApiError> {
    state.authorize(&headers, peer)?;
    state.manager.stop(&id).await?;
    Ok(Json(StopSessionResponse {
        session_id: id,
        status: "stopped",
    }))
}

async fn load_plugin(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<LoadPluginRequest>,
) -> Result<Json<LoadPluginResponse>, ApiError> {
    state.authorize(&headers, peer)?;
    state
        .manager
        .load_plugin(&id, &request.name, &request.code, request.config)
        .await?;
    Ok(Json(LoadPluginResponse {
        name: request.name,
        status: "loaded",
    }))
}

async fn execute_code(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<ExecuteCodeRequest>,
) -> Result<axum::response::Response, ApiError> {
    state.authorize(&headers, peer)?;
    if !state.manager.session_exists(&id) {
        return Err(ApiError::SessionNotFound(id));
    }

    if request.stream {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream_key = format!("{}:{}", id, request.exec_id);
        state
            .streams
            .lock()
            .expect("streams lock")
            .insert(stream_key.clone(), rx);

        // Drop the stream if no client ever claims it.
        let registry = state.streams.clone();
        let janitor_key = stream_key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STREAM_CLAIM_WINDOW).await;
            registry.lock().expect("streams lock").remove(&janitor_key);
        });

        state
            .manager
            .execute_detached(id.clone(), request.exec_id.clone(), request.code, tx);

        let response = ExecuteStreamResponse {
            execution_id: request.exec_id.clone(),
            stream_url: format!("/api/v1/sessions/{}/execute/{}/stream", id, request.exec_id),
        };
        return Ok((StatusCode::ACCEPTED, Json(response)).into_response());
    }

    let mut result = state
        .manager
        .execute(&id, &request.exec_id, &request.code, None)
        .await?;
    attach_download_urls(&mut result, &id);
    Ok(Json(result).into_response())
}

/// SSE event name and JSON payload of one stream frame.
pub(crate) fn frame_payload(frame: &StreamFrame) -> (&'static str, Option<serde_json::Value>) {
    match frame {
        StreamFrame::Output { stream, text } => {
            ("output", Some(json!({ "type": stream, "text": text })))
        }
        StreamFrame::Result(result) => (
            "result",
            Some(serde_json::to_value(result).unwrap_or_else(|_| json!({}))),
        ),
        StreamFrame::Done => ("done", Some(json!({}))),
    }
}

async fn stream_execution(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((id, exec_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers, peer)?;
    let stream_key = format!("{}:{}", id, exec_id);
    let mut rx = state
        .streams
        .lock()
        .expect("streams lock")
        .remove(&stream_key)
        .ok_or_else(|| ApiError::StreamNotFound(exec_id.clone()))?;

    let session_id = id.clone();
    let event_stream = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            let frame = match frame {
                StreamFrame::Result(mut result) => {
                    attach_download_urls(&mut result, &session_id);
                    StreamFrame::Result(result)
                }
                other => other,
            };
            let (name, payload) = frame_payload(&frame);
            let data = payload
                .map(|p| p.to_string())
                .unwrap_or_else(|| "{}".to_string());
            yield Ok::<SseEvent, std::convert::Infallible>(
                SseEvent::default().event(name).data(data),
            );
            if matches!(frame, StreamFrame::Done) {
                break;
            }
        }
    };

    Ok(Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    ))
}

async fn update_variables(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UpdateVariablesRequest>,
) -> Result<Json<UpdateVariablesResponse>, ApiError> {
    state.authorize(&headers, peer)?;
    state
        .manager
        .update_variables(&id, request.variables.clone())
        .await?;
    Ok(Json(UpdateVariablesResponse {
        status: "updated",
        variables: request.variables,
    }))
}

async fn upload_file(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UploadFileRequest>,
) -> Result<Json<UploadFileResponse>, ApiError> {
    state.authorize(&headers, peer)?;
    let content = match request.encoding {
        UploadEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(request.content.as_bytes())
            .map_err(|e| ApiError::BadRequest(format!("invalid base64 content: {}", e)))?,
        UploadEncoding::Text => request.content.into_bytes(),
    };
    let path = state
        .manager
        .upload_file(&id, &request.filename, &content)
        .await?;
    Ok(Json(UploadFileResponse {
        filename: request.filename,
        status: "uploaded",
        path,
    }))
}

async fn download_artifact(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((id, filename)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers, peer)?;

    let path = if state.manager.session_exists(&id) {
        state.manager.artifact_path(&id, &filename).await?
    } else {
        // The execution session is gone; a configured fallback source may
        // still own the file (it asserts caller ownership itself).
        state
            .fallback
            .as_ref()
            .and_then(|f| f.artifact_path(&id, &filename))
            .ok_or_else(|| ApiError::ArtifactNotFound(filename.clone()))?
    };

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::ArtifactNotFound(filename.clone()))?;
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        detect_mime(&path).parse().expect("static mime value"),
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", filename)
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid artifact filename".to_string()))?,
    );
    Ok((response_headers, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_kernel::ExecutionResult;

    #[test]
    fn test_output_frame_payload_schema() {
        let frame = StreamFrame::Output {
            stream: "stdout".to_string(),
            text: "0\n".to_string(),
        };
        let (name, payload) = frame_payload(&frame);
        assert_eq!(name, "output");
        assert_eq!(payload.unwrap(), json!({"type": "stdout", "text": "0\n"}));
    }

    #[test]
    fn test_result_frame_payload_contains_result_fields() {
        let frame = StreamFrame::Result(ExecutionResult {
            execution_id: "e1".to_string(),
            is_success: true,
            ..ExecutionResult::default()
        });
        let (name, payload) = frame_payload(&frame);
        assert_eq!(name, "result");
        let payload = payload.unwrap();
        assert_eq!(payload["execution_id"], "e1");
        assert_eq!(payload["is_success"], true);
    }

    #[test]
    fn test_done_frame_payload_is_empty_object() {
        let (name, payload) = frame_payload(&StreamFrame::Done);
        assert_eq!(name, "done");
        assert_eq!(payload.unwrap(), json!({}));
    }
}
