use std::collections::HashMap;
use std::io::BufReader;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{json, Value};

use skein_kernel::ExecutionResult;

use crate::sse::SseFrames;
use crate::ClientError;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ExecutionClientConfig {
    pub server_url: String,
    pub api_key: Option<String>,
    /// Deadline for execute requests (the stream read inherits it).
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ExecutionClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            api_key: None,
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthInfo {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
}

/// HTTP binding of one execution session.
///
/// Mirrors the kernel-session interface: start/stop, plugins, variables,
/// execute (with optional streaming callback), file upload and artifact
/// download.
pub struct ExecutionClient {
    session_id: String,
    config: ExecutionClientConfig,
    http: Client,
    cwd: Option<String>,
    started: bool,
}

impl ExecutionClient {
    pub fn new(
        session_id: impl Into<String>,
        config: ExecutionClientConfig,
    ) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|_| ClientError::Decode("API key is not header-safe".to_string()))?;
            headers.insert("X-API-Key", value);
        }
        let http = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::ServerUnreachable(e.to_string()))?;
        Ok(Self {
            session_id: session_id.into(),
            config,
            http,
            cwd: None,
            started: false,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Server-assigned working directory, known after [`Self::start`].
    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v1{}",
            self.config.server_url.trim_end_matches('/'),
            path
        )
    }

    fn transport_error(err: reqwest::Error) -> ClientError {
        ClientError::ServerUnreachable(err.to_string())
    }

    fn handle_response(response: Response) -> Result<Value, ClientError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .map_err(|e| ClientError::Decode(e.to_string()));
        }
        let detail = response
            .json::<Value>()
            .ok()
            .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
            .unwrap_or_else(|| status.to_string());
        Err(ClientError::Api {
            status: status.as_u16(),
            detail,
        })
    }

    /// Probe `/health` with a short timeout.
    pub fn health_check(&self) -> Result<HealthInfo, ClientError> {
        let response = self
            .http
            .get(self.url("/health"))
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .map_err(Self::transport_error)?;
        let value = Self::handle_response(response)?;
        serde_json::from_value(value).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Create the session on the server. An already-existing session is
    /// reused rather than treated as an error.
    pub fn start(&mut self) -> Result<(), ClientError> {
        if self.started {
            return Ok(());
        }
        let body = json!({ "session_id": self.session_id, "cwd": null });
        let result = self
            .http
            .post(self.url("/sessions"))
            .json(&body)
            .send()
            .map_err(Self::transport_error)
            .and_then(Self::handle_response);
        match result {
            Ok(value) => {
                self.cwd = value
                    .get("cwd")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                self.started = true;
                tracing::info!(session_id = %self.session_id, "execution session started");
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                self.started = true;
                tracing::info!(session_id = %self.session_id, "execution session already exists; reusing");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Stop the session. Missing sessions and unreachable servers are not
    /// errors during shutdown.
    pub fn stop(&mut self) -> Result<(), ClientError> {
        if !self.started {
            return Ok(());
        }
        let result = self
            .http
            .delete(self.url(&format!("/sessions/{}", self.session_id)))
            .send()
            .map_err(Self::transport_error)
            .and_then(Self::handle_response);
        match result {
            Ok(_) => {
                self.started = false;
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                self.started = false;
                Ok(())
            }
            Err(ClientError::ServerUnreachable(reason)) => {
                tracing::debug!(reason, "server unavailable while stopping session");
                self.started = false;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn session_info(&self) -> Result<Value, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/sessions/{}", self.session_id)))
            .send()
            .map_err(Self::transport_error)?;
        Self::handle_response(response)
    }

    pub fn load_plugin(
        &self,
        name: &str,
        code: &str,
        config: Value,
    ) -> Result<(), ClientError> {
        let body = json!({ "name": name, "code": code, "config": config });
        let response = self
            .http
            .post(self.url(&format!("/sessions/{}/plugins", self.session_id)))
            .json(&body)
            .send()
            .map_err(Self::transport_error)?;
        Self::handle_response(response)?;
        Ok(())
    }

    pub fn update_variables(&self, variables: &HashMap<String, String>) -> Result<(), ClientError> {
        let body = json!({ "variables": variables });
        let response = self
            .http
            .post(self.url(&format!("/sessions/{}/variables", self.session_id)))
            .json(&body)
            .send()
            .map_err(Self::transport_error)?;
        Self::handle_response(response)?;
        Ok(())
    }

    /// Execute code in the session. With a callback the streaming endpoint
    /// is used and each output chunk is delivered as it arrives; without
    /// one the synchronous endpoint returns the full result.
    pub fn execute(
        &self,
        exec_id: &str,
        code: &str,
        on_output: Option<&mut dyn FnMut(&str, &str)>,
    ) -> Result<ExecutionResult, ClientError> {
        match on_output {
            Some(callback) => self.execute_streaming(exec_id, code, callback),
            None => self.execute_sync(exec_id, code),
        }
    }

    fn execute_sync(&self, exec_id: &str, code: &str) -> Result<ExecutionResult, ClientError> {
        let body = json!({ "exec_id": exec_id, "code": code, "stream": false });
        let response = self
            .http
            .post(self.url(&format!("/sessions/{}/execute", self.session_id)))
            .json(&body)
            .send()
            .map_err(Self::transport_error)?;
        let value = Self::handle_response(response)?;
        parse_execution_result(value, code)
    }

    fn execute_streaming(
        &self,
        exec_id: &str,
        code: &str,
        on_output: &mut dyn FnMut(&str, &str),
    ) -> Result<ExecutionResult, ClientError> {
        let body = json!({ "exec_id": exec_id, "code": code, "stream": true });
        let response = self
            .http
            .post(self.url(&format!("/sessions/{}/execute", self.session_id)))
            .json(&body)
            .send()
            .map_err(Self::transport_error)?;
        let init = Self::handle_response(response)?;
        let stream_url = init
            .get("stream_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::Decode("missing stream_url".to_string()))?;
        let stream_url = if stream_url.starts_with("http") {
            stream_url.to_string()
        } else {
            format!(
                "{}{}",
                self.config.server_url.trim_end_matches('/'),
                stream_url
            )
        };

        let response = self
            .http
            .get(stream_url)
            .send()
            .map_err(Self::transport_error)?;
        if !response.status().is_success() {
            return Err(ClientError::Api {
                status: response.status().as_u16(),
                detail: "stream unavailable".to_string(),
            });
        }

        let mut final_result: Option<ExecutionResult> = None;
        for frame in SseFrames::new(BufReader::new(response)) {
            let frame = frame?;
            match frame.event.as_str() {
                "output" => {
                    let Ok(data) = serde_json::from_str::<Value>(&frame.data) else {
                        continue;
                    };
                    let stream = data
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("stdout");
                    let text = data.get("text").and_then(|v| v.as_str()).unwrap_or("");
                    on_output(stream, text);
                }
                "result" => {
                    let value = serde_json::from_str::<Value>(&frame.data)
                        .map_err(|e| ClientError::Decode(e.to_string()))?;
                    final_result = Some(parse_execution_result(value, code)?);
                }
                "done" => break,
                _ => {}
            }
        }

        final_result.ok_or(ClientError::StreamTruncated)
    }

    /// Upload a file into the session's working directory (base64 body).
    pub fn upload_file(&self, filename: &str, content: &[u8]) -> Result<String, ClientError> {
        use base64::Engine;
        let body = json!({
            "filename": filename,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "encoding": "base64",
        });
        let response = self
            .http
            .post(self.url(&format!("/sessions/{}/files", self.session_id)))
            .json(&body)
            .send()
            .map_err(Self::transport_error)?;
        let value = Self::handle_response(response)?;
        Ok(value
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    pub fn download_artifact(&self, filename: &str) -> Result<Vec<u8>, ClientError> {
        let response = self
            .http
            .get(self.url(&format!(
                "/sessions/{}/artifacts/{}",
                self.session_id, filename
            )))
            .send()
            .map_err(Self::transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Api {
                status: status.as_u16(),
                detail: format!("failed to download artifact {}", filename),
            });
        }
        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(Self::transport_error)
    }
}

fn parse_execution_result(value: Value, code: &str) -> Result<ExecutionResult, ClientError> {
    let mut result: ExecutionResult =
        serde_json::from_value(value).map_err(|e| ClientError::Decode(e.to_string()))?;
    if result.code.is_empty() {
        result.code = code.to_string();
    }
    Ok(result)
}
