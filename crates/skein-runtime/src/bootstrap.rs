use std::sync::Arc;
use std::time::Duration;

use skein_client::{
    ExecutionClient, ExecutionClientConfig, ServerLauncher, ServerLauncherConfig,
};
use skein_compaction::{
    CompactorConfig, ContextCompactor, MemoryRoundsSource, Summarizer,
};
use skein_config::SkeinConfig;

use crate::{CodeInterpreter, LanguageModel, Planner, Session, SessionError};

/// Build a ready-to-use session from configuration.
///
/// Role discovery is a static table: `Planner` and `CodeInterpreter` are
/// the known aliases; anything else in `session.roles` is a configuration
/// error. The summarizer is only consulted when compaction is enabled.
pub fn build_session(
    session_id: &str,
    config: &SkeinConfig,
    llm: Arc<dyn LanguageModel>,
    summarizer: Option<Arc<dyn Summarizer>>,
) -> Result<Session, SessionError> {
    let worker_aliases: Vec<String> = config
        .session
        .roles
        .iter()
        .filter(|alias| alias.as_str() != "Planner")
        .cloned()
        .collect();
    for alias in &worker_aliases {
        if alias != "CodeInterpreter" {
            return Err(SessionError::Bootstrap(format!(
                "unknown role alias in session.roles: {}",
                alias
            )));
        }
    }

    let planner = Arc::new(Planner::new(llm.clone(), worker_aliases.clone()));
    let mut builder = Session::builder(session_id)
        .planner(planner)
        .max_internal_hops(config.session.max_internal_hops);

    if worker_aliases.iter().any(|a| a == "CodeInterpreter") {
        let server = &config.execution.server;
        let launcher = if server.auto_start {
            let mut launcher = ServerLauncher::new(ServerLauncherConfig {
                host: server.host.clone(),
                port: server.port,
                api_key: server.api_key.clone(),
                work_dir: server
                    .work_dir
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join("skein-server")),
                container: server.container,
                container_image: server.container_image.clone(),
                startup_timeout: Duration::from_secs(server.startup_timeout),
                kill_existing: server.kill_existing,
                ..ServerLauncherConfig::default()
            });
            launcher
                .start()
                .map_err(|e| SessionError::Bootstrap(e.to_string()))?;
            Some(launcher)
        } else {
            None
        };

        let client = ExecutionClient::new(
            session_id,
            ExecutionClientConfig {
                server_url: server.url.clone(),
                api_key: server.api_key.clone(),
                timeout: Duration::from_secs(server.timeout),
                ..ExecutionClientConfig::default()
            },
        )
        .map_err(|e| SessionError::Bootstrap(e.to_string()))?;

        let mut interpreter = CodeInterpreter::new(
            llm.clone(),
            Box::new(client),
            config.code_interpreter.clone(),
        );
        if let Some(launcher) = launcher {
            interpreter = interpreter.with_launcher(launcher);
        }
        builder = builder.worker(Arc::new(interpreter));
    }

    let mut session = builder.build()?;

    if config.compaction.enabled {
        let Some(summarizer) = summarizer else {
            return Err(SessionError::Bootstrap(
                "compaction is enabled but no summarizer was provided".to_string(),
            ));
        };
        for alias in &config.session.roles {
            let prompt_path = config
                .roles
                .get(alias)
                .and_then(|r| r.compaction_prompt_path.clone());
            let compactor = Arc::new(ContextCompactor::new(
                CompactorConfig {
                    threshold: config.compaction.threshold,
                    retain_recent: config.compaction.retain_recent,
                    prompt_template_path: prompt_path,
                    ..CompactorConfig::default()
                },
                summarizer.clone(),
                Arc::new(MemoryRoundsSource::new(session.memory(), alias)),
            ));
            session.attach_compactor(alias, compactor);
        }
    }

    Ok(session)
}
