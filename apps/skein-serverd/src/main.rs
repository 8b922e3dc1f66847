use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use skein_kernel::KernelLaunchSpec;
use skein_server::{ProcessKernelFactory, SessionManager, SessionManagerConfig};

#[derive(Debug, Parser)]
#[command(name = "skein-serverd", about = "Skein code execution server")]
struct Args {
    /// Optional YAML configuration file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, env = "SKEIN_SERVER_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "SKEIN_SERVER_PORT", default_value_t = 8000)]
    port: u16,
    /// Root directory for session state (kernels, working directories).
    #[arg(long, env = "SKEIN_SERVER_WORK_DIR", default_value = "./workspace")]
    work_dir: PathBuf,
    /// Shared API key; omit to disable authentication.
    #[arg(long, env = "SKEIN_SERVER_API_KEY")]
    api_key: Option<String>,
    /// Kernel subprocess command.
    #[arg(long, default_value = "skein-kernel")]
    kernel_cmd: String,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut api_key = args.api_key;
    let mut execution_timeout = Duration::from_secs(300);
    if let Some(config_path) = &args.config {
        let config = skein_config::load_config(config_path)
            .with_context(|| format!("load config {}", config_path.display()))?;
        let server = config.execution.server;
        if api_key.is_none() {
            api_key = server.api_key;
        }
        execution_timeout = Duration::from_secs(server.timeout);
    }

    let launch = KernelLaunchSpec {
        program: args.kernel_cmd,
        ..KernelLaunchSpec::default()
    };
    let manager = Arc::new(
        SessionManager::new(
            SessionManagerConfig {
                work_dir: args.work_dir,
                execution_timeout,
            },
            Arc::new(ProcessKernelFactory::new(launch)),
        )
        .context("initialize session manager")?,
    );

    let listen: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("parse listen address")?;
    tracing::info!(%listen, "starting skein execution server");
    skein_server::run_server(manager, api_key, listen)
        .await
        .context("server terminated with error")
}
