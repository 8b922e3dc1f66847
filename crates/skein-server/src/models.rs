use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use skein_kernel::{ExecutionResult, KernelSessionInfo};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sessions: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: Option<String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub status: &'static str,
    pub cwd: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    pub session_id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SessionInfoResponse {
    pub session_id: String,
    pub status: &'static str,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub loaded_plugins: Vec<String>,
    pub execution_count: usize,
    pub cwd: PathBuf,
}

impl From<KernelSessionInfo> for SessionInfoResponse {
    fn from(info: KernelSessionInfo) -> Self {
        Self {
            session_id: info.session_id,
            status: "running",
            created_at: info.created_at,
            last_activity: info.last_activity,
            loaded_plugins: info.loaded_plugins,
            execution_count: info.execution_count,
            cwd: info.cwd,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfoResponse>,
    pub total_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct LoadPluginRequest {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Serialize)]
pub struct LoadPluginResponse {
    pub name: String,
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteCodeRequest {
    pub exec_id: String,
    pub code: String,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct ExecuteStreamResponse {
    pub execution_id: String,
    pub stream_url: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateVariablesRequest {
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct UpdateVariablesResponse {
    pub status: &'static str,
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadEncoding {
    Base64,
    Text,
}

impl Default for UploadEncoding {
    fn default() -> Self {
        UploadEncoding::Base64
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadFileRequest {
    pub filename: String,
    pub content: String,
    #[serde(default)]
    pub encoding: UploadEncoding,
}

#[derive(Debug, Serialize)]
pub struct UploadFileResponse {
    pub filename: String,
    pub status: &'static str,
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// Fill `download_url` on every artifact that has a saved file.
pub fn attach_download_urls(result: &mut ExecutionResult, session_id: &str) {
    for artifact in &mut result.artifacts {
        if !artifact.file_name.is_empty() {
            artifact.download_url = Some(format!(
                "/api/v1/sessions/{}/artifacts/{}",
                session_id, artifact.file_name
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_kernel::ExecutionArtifact;

    #[test]
    fn test_upload_request_defaults_to_base64() {
        let raw = serde_json::json!({"filename": "a.txt", "content": "aGk="});
        let request: UploadFileRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.encoding, UploadEncoding::Base64);
    }

    #[test]
    fn test_attach_download_urls_skips_inline_only_artifacts() {
        let mut result = ExecutionResult {
            artifacts: vec![
                ExecutionArtifact {
                    name: "saved".to_string(),
                    file_name: "saved_image.png".to_string(),
                    ..ExecutionArtifact::default()
                },
                ExecutionArtifact {
                    name: "inline".to_string(),
                    ..ExecutionArtifact::default()
                },
            ],
            ..ExecutionResult::default()
        };
        attach_download_urls(&mut result, "s1");
        assert_eq!(
            result.artifacts[0].download_url.as_deref(),
            Some("/api/v1/sessions/s1/artifacts/saved_image.png")
        );
        assert!(result.artifacts[1].download_url.is_none());
    }
}
