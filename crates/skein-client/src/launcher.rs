use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::{ClientError, ExecutionClient, ExecutionClientConfig};

#[derive(Debug, Clone)]
pub struct ServerLauncherConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub work_dir: PathBuf,
    /// Run the server in a container runtime instead of a subprocess.
    pub container: bool,
    pub container_image: Option<String>,
    pub startup_timeout: Duration,
    /// Terminate whatever is already listening on the port before starting.
    pub kill_existing: bool,
    /// Server executable and leading arguments.
    pub server_command: Vec<String>,
}

impl Default for ServerLauncherConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            api_key: None,
            work_dir: PathBuf::from("."),
            container: false,
            container_image: None,
            startup_timeout: Duration::from_secs(60),
            kill_existing: true,
            server_command: vec!["skein-serverd".to_string()],
        }
    }
}

const DEFAULT_CONTAINER_IMAGE: &str = "skein/executor:latest";

/// Manages the lifecycle of a locally auto-started execution server.
pub struct ServerLauncher {
    config: ServerLauncherConfig,
    child: Option<Child>,
    container_id: Option<String>,
    started: bool,
}

impl ServerLauncher {
    pub fn new(config: ServerLauncherConfig) -> Self {
        Self {
            config,
            child: None,
            container_id: None,
            started: false,
        }
    }

    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.config.host, self.config.port)
    }

    /// Whether a healthy server already answers at the configured address.
    pub fn is_server_running(&self) -> bool {
        let Ok(probe) = ExecutionClient::new(
            "launcher-probe",
            ExecutionClientConfig {
                server_url: self.server_url(),
                api_key: self.config.api_key.clone(),
                ..ExecutionClientConfig::default()
            },
        ) else {
            return false;
        };
        probe.health_check().is_ok()
    }

    /// Ensure a server is available: reuse a healthy one (unless
    /// `kill_existing`), otherwise spawn and wait for readiness.
    pub fn start(&mut self) -> Result<(), ClientError> {
        if self.started {
            return Ok(());
        }

        if self.is_server_running() {
            if self.config.kill_existing {
                tracing::info!(url = %self.server_url(), "killing existing execution server");
                self.kill_existing_server();
                std::thread::sleep(Duration::from_secs(1));
            } else {
                tracing::info!(url = %self.server_url(), "execution server already running");
                self.started = true;
                return Ok(());
            }
        }

        if self.config.container {
            self.start_container()?;
        } else {
            self.start_subprocess()?;
        }
        self.wait_for_ready()?;
        self.started = true;
        Ok(())
    }

    fn start_subprocess(&mut self) -> Result<(), ClientError> {
        let (program, leading) = self
            .config
            .server_command
            .split_first()
            .ok_or_else(|| ClientError::ServerStartFailed("empty server command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(leading)
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--work-dir")
            .arg(&self.config.work_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(key) = &self.config.api_key {
            command.arg("--api-key").arg(key);
            command.env("SKEIN_SERVER_API_KEY", key);
        }
        command
            .env("SKEIN_SERVER_HOST", &self.config.host)
            .env("SKEIN_SERVER_PORT", self.config.port.to_string())
            .env("SKEIN_SERVER_WORK_DIR", &self.config.work_dir);

        let child = command
            .spawn()
            .map_err(|e| ClientError::ServerStartFailed(format!("spawn {}: {}", program, e)))?;
        tracing::info!(pid = child.id(), "execution server subprocess started");
        self.child = Some(child);
        Ok(())
    }

    fn start_container(&mut self) -> Result<(), ClientError> {
        let image = self
            .config
            .container_image
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTAINER_IMAGE.to_string());
        let work_dir = self
            .config
            .work_dir
            .canonicalize()
            .map_err(|e| ClientError::ServerStartFailed(format!("resolve work dir: {}", e)))?;

        let mut command = Command::new("docker");
        command
            .arg("run")
            .arg("-d")
            .arg("--rm")
            .arg("-p")
            .arg(format!("{}:8000", self.config.port))
            .arg("-v")
            .arg(format!("{}:/workspace", work_dir.display()))
            .arg("-e")
            .arg("SKEIN_SERVER_HOST=0.0.0.0")
            .arg("-e")
            .arg("SKEIN_SERVER_WORK_DIR=/workspace");
        if let Some(key) = &self.config.api_key {
            command.arg("-e").arg(format!("SKEIN_SERVER_API_KEY={}", key));
        }
        command.arg(&image);

        let output = command
            .output()
            .map_err(|e| ClientError::ServerStartFailed(format!("docker run: {}", e)))?;
        if !output.status.success() {
            return Err(ClientError::ServerStartFailed(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::info!(container = %container_id, image = %image, "execution server container started");
        self.container_id = Some(container_id);
        Ok(())
    }

    fn wait_for_ready(&mut self) -> Result<(), ClientError> {
        let deadline = Instant::now() + self.config.startup_timeout;
        tracing::info!(url = %self.server_url(), "waiting for execution server readiness");
        while Instant::now() < deadline {
            if self.is_server_running() {
                return Ok(());
            }
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.child = None;
                    return Err(ClientError::ServerStartFailed(format!(
                        "server process exited with {}",
                        status
                    )));
                }
            }
            std::thread::sleep(Duration::from_millis(500));
        }
        Err(ClientError::ServerStartFailed(format!(
            "server did not become ready within {:?}",
            self.config.startup_timeout
        )))
    }

    /// Stop whatever this launcher started. Servers it merely reused are
    /// left alone.
    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            tracing::info!(pid, "stopping execution server subprocess");
            #[cfg(unix)]
            {
                let _ = Command::new("kill")
                    .arg("-TERM")
                    .arg(pid.to_string())
                    .status();
                let deadline = Instant::now() + Duration::from_secs(10);
                while Instant::now() < deadline {
                    if let Ok(Some(_)) = child.try_wait() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
            if matches!(child.try_wait(), Ok(None) | Err(_)) {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        if let Some(container_id) = self.container_id.take() {
            tracing::info!(container = %container_id, "stopping execution server container");
            let _ = Command::new("docker")
                .arg("stop")
                .arg("--time")
                .arg("10")
                .arg(&container_id)
                .status();
        }
        self.started = false;
    }

    #[cfg(unix)]
    fn kill_existing_server(&self) {
        let output = Command::new("lsof")
            .arg("-ti")
            .arg(format!(":{}", self.config.port))
            .output();
        let Ok(output) = output else {
            tracing::debug!("lsof unavailable; cannot kill existing server");
            return;
        };
        for pid in String::from_utf8_lossy(&output.stdout).split_whitespace() {
            let _ = Command::new("kill").arg("-TERM").arg(pid).status();
        }
        std::thread::sleep(Duration::from_secs(1));
        if let Ok(output) = Command::new("lsof")
            .arg("-ti")
            .arg(format!(":{}", self.config.port))
            .output()
        {
            for pid in String::from_utf8_lossy(&output.stdout).split_whitespace() {
                let _ = Command::new("kill").arg("-KILL").arg(pid).status();
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_existing_server(&self) {
        tracing::warn!("kill_existing is only supported on unix platforms");
    }
}

impl Drop for ServerLauncher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_url_from_config() {
        let launcher = ServerLauncher::new(ServerLauncherConfig {
            host: "127.0.0.1".to_string(),
            port: 9321,
            ..ServerLauncherConfig::default()
        });
        assert_eq!(launcher.server_url(), "http://127.0.0.1:9321");
    }

    #[test]
    fn test_empty_server_command_fails_fast() {
        let mut launcher = ServerLauncher::new(ServerLauncherConfig {
            server_command: Vec::new(),
            kill_existing: false,
            // Nothing listens on this port, so start() goes to spawn.
            port: 59998,
            ..ServerLauncherConfig::default()
        });
        assert!(matches!(
            launcher.start(),
            Err(ClientError::ServerStartFailed(_))
        ));
    }

    #[test]
    fn test_missing_binary_fails_before_deadline() {
        let mut launcher = ServerLauncher::new(ServerLauncherConfig {
            server_command: vec!["skein-serverd-definitely-missing".to_string()],
            kill_existing: false,
            port: 59997,
            startup_timeout: Duration::from_secs(1),
            ..ServerLauncherConfig::default()
        });
        let err = launcher.start().unwrap_err();
        assert!(matches!(err, ClientError::ServerStartFailed(_)));
    }
}
