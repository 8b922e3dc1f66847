use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::SkeinConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<SkeinConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: SkeinConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &SkeinConfig) -> Result<(), ConfigError> {
    if config.session.roles.is_empty() {
        return Err(ConfigError::Invalid(
            "session.roles must not be empty".to_string(),
        ));
    }
    for role in &config.session.roles {
        if role.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "session.roles[] must not contain empty aliases".to_string(),
            ));
        }
    }
    if config.session.max_internal_hops == 0 {
        return Err(ConfigError::Invalid(
            "session.max_internal_hops must be > 0".to_string(),
        ));
    }

    let server = &config.execution.server;
    if server.url.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "execution.server.url must not be empty".to_string(),
        ));
    }
    if server.timeout == 0 {
        return Err(ConfigError::Invalid(
            "execution.server.timeout must be > 0".to_string(),
        ));
    }

    if config.compaction.threshold == 0 {
        return Err(ConfigError::Invalid(
            "compaction.threshold must be > 0".to_string(),
        ));
    }
    if config.compaction.retain_recent >= config.compaction.threshold {
        return Err(ConfigError::Invalid(
            "compaction.retain_recent must be smaller than compaction.threshold".to_string(),
        ));
    }

    let ci = &config.code_interpreter;
    if ci.allowed_modules.is_some() && ci.blocked_modules.is_some() {
        return Err(ConfigError::Invalid(
            "only one of code_interpreter.allowed_modules or blocked_modules may be set"
                .to_string(),
        ));
    }
    if ci.allowed_functions.is_some() && ci.blocked_functions.is_some() {
        return Err(ConfigError::Invalid(
            "only one of code_interpreter.allowed_functions or blocked_functions may be set"
                .to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{}}").unwrap();
        let config = load_config(file.path()).expect("load");
        assert_eq!(config.session.roles, vec!["Planner", "CodeInterpreter"]);
        assert_eq!(config.execution.server.port, 8000);
        assert_eq!(config.code_interpreter.max_retry_count, 3);
        assert!(!config.compaction.enabled);
    }

    #[test]
    fn test_full_document_round_trips_options() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
session:
  roles: [Planner, CodeInterpreter]
  max_internal_hops: 6
execution:
  server:
    url: http://127.0.0.1:9000
    api_key: secret
    auto_start: true
    container: true
    container_image: skein/executor:latest
    port: 9000
    timeout: 120
compaction:
  enabled: true
  threshold: 5
  retain_recent: 2
code_interpreter:
  require_confirmation: true
  max_retry_count: 2
roles:
  Planner:
    compaction_prompt_path: prompts/planner_compaction.yaml
"#
        )
        .unwrap();
        let config = load_config(file.path()).expect("load");
        assert!(config.execution.server.auto_start);
        assert_eq!(config.execution.server.api_key.as_deref(), Some("secret"));
        assert_eq!(config.compaction.threshold, 5);
        assert!(config.code_interpreter.require_confirmation);
        assert!(config.roles["Planner"].compaction_prompt_path.is_some());
    }

    #[test]
    fn test_validation_rejects_empty_roles() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "session:\n  roles: []").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validation_rejects_retain_recent_at_threshold() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "compaction:\n  threshold: 3\n  retain_recent: 3").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validation_rejects_conflicting_verification_lists() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "code_interpreter:\n  allowed_modules: [pandas]\n  blocked_modules: [os]"
        )
        .unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
