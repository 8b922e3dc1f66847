//! Configuration types recognized by the orchestration core.
//!
//! Sessions and the execution server are configured from one YAML document;
//! every section has working defaults so an empty file is valid.

mod loader;

pub use loader::{load_config, ConfigError};

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeinConfig {
    pub session: SessionConfig,
    pub execution: ExecutionConfig,
    pub compaction: CompactionConfig,
    pub code_interpreter: CodeInterpreterConfig,
    /// Per-role settings keyed by role alias.
    pub roles: BTreeMap<String, RoleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ordered role aliases to instantiate for each session.
    pub roles: Vec<String>,
    /// Abort a round after this many planner/worker hops.
    pub max_internal_hops: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            roles: vec!["Planner".to_string(), "CodeInterpreter".to_string()],
            max_internal_hops: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub server: ExecutionServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionServerConfig {
    /// Base URL the client binds to.
    pub url: String,
    pub api_key: Option<String>,
    /// Spawn a local server when the health probe fails.
    pub auto_start: bool,
    /// Auto-start inside a container runtime instead of a subprocess.
    pub container: bool,
    pub container_image: Option<String>,
    pub host: String,
    pub port: u16,
    /// Request timeout, seconds.
    pub timeout: u64,
    /// Startup deadline for auto-started servers, seconds.
    pub startup_timeout: u64,
    /// Terminate a server already listening on the port before starting.
    pub kill_existing: bool,
    pub work_dir: Option<PathBuf>,
}

impl Default for ExecutionServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            api_key: None,
            auto_start: false,
            container: false,
            container_image: None,
            host: "localhost".to_string(),
            port: 8000,
            timeout: 300,
            startup_timeout: 60,
            kill_existing: true,
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    pub threshold: usize,
    pub retain_recent: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 10,
            retain_recent: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeInterpreterConfig {
    /// Gate code execution on user approval.
    pub require_confirmation: bool,
    /// Per-round retry budget for recoverable execution failures.
    pub max_retry_count: usize,
    pub allowed_modules: Option<Vec<String>>,
    pub blocked_modules: Option<Vec<String>>,
    pub allowed_functions: Option<Vec<String>>,
    pub blocked_functions: Option<Vec<String>>,
}

impl Default for CodeInterpreterConfig {
    fn default() -> Self {
        Self {
            require_confirmation: false,
            max_retry_count: 3,
            allowed_modules: None,
            blocked_modules: None,
            allowed_functions: None,
            blocked_functions: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    pub compaction_prompt_path: Option<PathBuf>,
}
