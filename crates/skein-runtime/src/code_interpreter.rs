use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;

use skein_config::CodeInterpreterConfig;
use skein_kernel::ExecutionResult;
use skein_memory::{AttachmentKind, Memory, Post};

use crate::executor::CodeExecutor;
use crate::llm::{ChatMessage, LanguageModel};
use crate::role::{Role, RoleContext};
use crate::verification::CodeVerifier;
use crate::RoleError;

fn code_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:\w+)?\n(.*?)```").expect("static regex"))
}

/// Worker that turns the planner's request into code, verifies it, gates
/// it on user confirmation when configured, runs it against the execution
/// service, and feeds recoverable failures back into its own retry loop.
pub struct CodeInterpreter {
    alias: String,
    llm: Arc<dyn LanguageModel>,
    executor: Mutex<Box<dyn CodeExecutor>>,
    verifier: CodeVerifier,
    config: CodeInterpreterConfig,
    confirmation_timeout: Option<Duration>,
    /// Auto-started local server, kept alive for the session's lifetime.
    launcher: Mutex<Option<skein_client::ServerLauncher>>,
}

impl CodeInterpreter {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        executor: Box<dyn CodeExecutor>,
        config: CodeInterpreterConfig,
    ) -> Self {
        let verifier = CodeVerifier::from_config(&config);
        Self {
            alias: "CodeInterpreter".to_string(),
            llm,
            executor: Mutex::new(executor),
            verifier,
            config,
            confirmation_timeout: None,
            launcher: Mutex::new(None),
        }
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = Some(timeout);
        self
    }

    /// Adopt the launcher that auto-started the execution server; it is
    /// stopped when this role shuts down.
    pub fn with_launcher(self, launcher: skein_client::ServerLauncher) -> Self {
        *self.launcher.lock().expect("launcher lock") = Some(launcher);
        self
    }

    fn instructions(&self) -> String {
        let mut text = String::from(
            "You are the CodeInterpreter of a multi-agent system. Generate code \
             that fulfils the request. Reply with exactly one fenced code block \
             and nothing else.",
        );
        if let Some(allowed) = &self.verifier.allowed_modules {
            text.push_str(&format!(
                "\nOnly these modules may be imported: {}.",
                allowed.join(", ")
            ));
        }
        if let Some(blocked) = &self.verifier.blocked_modules {
            text.push_str(&format!(
                "\nThese modules must not be imported: {}.",
                blocked.join(", ")
            ));
        }
        text
    }

    fn generate_code(
        &self,
        memory: &Memory,
        revise: Option<&str>,
    ) -> Result<String, RoleError> {
        let rounds = memory
            .get_role_rounds(&self.alias, false)
            .map_err(|e| RoleError::Other(e.to_string()))?;
        let mut messages = vec![ChatMessage::system(self.instructions())];
        for round in &rounds {
            for post in &round.posts {
                if post.send_from == self.alias {
                    messages.push(ChatMessage::assistant(post.message.clone()));
                } else {
                    messages.push(ChatMessage::user(format!(
                        "{}: {}",
                        post.send_from, post.message
                    )));
                }
            }
        }
        if let Some(revise) = revise {
            messages.push(ChatMessage::user(format!(
                "The previous attempt failed; fix the problem and reply with \
                 corrected code.\n{}",
                revise
            )));
        }
        let raw = self.llm.complete(&messages)?;
        Ok(extract_code(&raw))
    }
}

impl Role for CodeInterpreter {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn reply(&self, memory: &Memory, ctx: &RoleContext) -> Result<Post, RoleError> {
        let mut executor = self.executor.lock().expect("executor lock");
        executor.start()?;

        let session_vars = ctx.session_vars.lock().expect("session vars lock").clone();
        if !session_vars.is_empty() {
            executor.update_variables(&session_vars)?;
        }

        let mut proxy = ctx.emitter.clone().create_post_proxy(&self.alias);
        let mut revise: Option<String> = None;

        loop {
            let code = match self.generate_code(memory, revise.as_deref()) {
                Ok(code) => code,
                Err(err) => {
                    let _ = proxy.end(Some(&err.to_string()));
                    return Err(err);
                }
            };
            proxy.attach(AttachmentKind::ReplyType, "code")?;
            proxy.attach(AttachmentKind::ReplyContent, &code)?;

            if let Err(errors) = self.verifier.verify(&code) {
                proxy.attach(AttachmentKind::Verification, "INCORRECT")?;
                proxy.attach(AttachmentKind::CodeError, &errors.join("\n"))?;
                let failure = RoleError::CodeVerificationFailed(errors);
                match self.consume_retry(ctx, &mut proxy, &failure)? {
                    Some(message) => {
                        revise = Some(message);
                        continue;
                    }
                    None => {
                        proxy.update_message(&give_up_message(&self.config, &failure), true)?;
                        proxy.update_send_to("Planner")?;
                        return Ok(proxy.end(None)?);
                    }
                }
            }
            proxy.attach(AttachmentKind::Verification, "CORRECT")?;

            if self.config.require_confirmation {
                match proxy.request_confirmation(&code, self.confirmation_timeout) {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = proxy.end(Some("user rejected code execution"));
                        return Err(RoleError::ConfirmationDenied);
                    }
                    Err(err) => {
                        let _ = proxy.end(Some(&err.to_string()));
                        return Err(RoleError::Event(err));
                    }
                }
            }

            proxy.update_status("executing code")?;
            let exec_id = format!("exec-{}", uuid::Uuid::new_v4());
            let execution = {
                let proxy_ref = &mut proxy;
                let mut on_output = |stream: &str, text: &str| {
                    let _ = proxy_ref.execution_output(stream, text);
                };
                executor.execute(&exec_id, &code, Some(&mut on_output))
            };

            let result = match execution {
                Ok(result) => result,
                Err(err) => {
                    // Transport failures are fatal to the turn.
                    let _ = proxy.end(Some(&err.to_string()));
                    return Err(RoleError::Transport(err));
                }
            };

            if result.is_success {
                attach_success(&mut proxy, &result)?;
                let summary = describe_success(&result);
                proxy.update_message(&summary, true)?;
                proxy.update_send_to("Planner")?;
                return Ok(proxy.end(None)?);
            }

            let error_text = result
                .error
                .clone()
                .unwrap_or_else(|| "execution failed without detail".to_string());
            proxy.attach(AttachmentKind::ExecutionStatus, "FAILURE")?;
            proxy.attach(AttachmentKind::CodeError, &error_text)?;
            let failure = RoleError::ExecutionFailed(error_text);
            match self.consume_retry(ctx, &mut proxy, &failure)? {
                Some(message) => {
                    revise = Some(message);
                }
                None => {
                    proxy.update_message(&give_up_message(&self.config, &failure), true)?;
                    proxy.update_send_to("Planner")?;
                    return Ok(proxy.end(None)?);
                }
            }
        }
    }

    fn stage_file(&self, name: &str, content: &[u8]) -> Result<bool, RoleError> {
        let mut executor = self.executor.lock().expect("executor lock");
        executor.start()?;
        executor.upload_file(name, content)?;
        Ok(true)
    }

    fn execution_cwd(&self) -> Option<PathBuf> {
        self.executor
            .lock()
            .expect("executor lock")
            .cwd()
            .map(PathBuf::from)
    }

    fn shutdown(&self) {
        if let Err(err) = self.executor.lock().expect("executor lock").stop() {
            tracing::debug!(error = %err, "executor stop failed during shutdown");
        }
        if let Some(mut launcher) = self.launcher.lock().expect("launcher lock").take() {
            launcher.stop();
        }
    }
}

impl CodeInterpreter {
    /// Consume one unit of the per-round retry budget. Returns the revise
    /// message for the next attempt, or `None` once the budget is spent.
    fn consume_retry(
        &self,
        ctx: &RoleContext,
        proxy: &mut skein_events::PostProxy,
        failure: &RoleError,
    ) -> Result<Option<String>, RoleError> {
        let used = ctx.retries_used.fetch_add(1, Ordering::SeqCst) + 1;
        if used < self.config.max_retry_count {
            tracing::info!(
                attempt = used,
                budget = self.config.max_retry_count,
                error = %failure,
                "recoverable failure; retrying code generation"
            );
            proxy.attach(AttachmentKind::ReviseMessage, &failure.to_string())?;
            return Ok(Some(failure.to_string()));
        }
        tracing::warn!(
            budget = self.config.max_retry_count,
            error = %failure,
            "retry budget exhausted; surfacing failure to planner"
        );
        Ok(None)
    }
}

fn give_up_message(config: &CodeInterpreterConfig, failure: &RoleError) -> String {
    format!(
        "The task could not be completed within {} attempts. Last error:\n{}",
        config.max_retry_count, failure
    )
}

fn extract_code(raw: &str) -> String {
    if let Some(captures) = code_fence_re().captures(raw) {
        return captures[1].trim().to_string();
    }
    raw.trim().to_string()
}

fn attach_success(
    proxy: &mut skein_events::PostProxy,
    result: &ExecutionResult,
) -> Result<(), RoleError> {
    proxy.attach(AttachmentKind::ExecutionStatus, "SUCCESS")?;
    proxy.attach(AttachmentKind::ExecutionResult, &describe_output(result))?;
    if !result.artifacts.is_empty() {
        let paths: Vec<String> = result
            .artifacts
            .iter()
            .map(|a| {
                a.download_url
                    .clone()
                    .unwrap_or_else(|| a.file_name.clone())
            })
            .filter(|p| !p.is_empty())
            .collect();
        proxy.attach_with_extra(
            AttachmentKind::ArtifactPaths,
            &paths.join("\n"),
            json!(paths),
        )?;
    }
    if !result.variables.is_empty() {
        proxy.attach_with_extra(
            AttachmentKind::SessionVariables,
            &result
                .variables
                .iter()
                .map(|(n, r)| format!("{} = {}", n, r))
                .collect::<Vec<_>>()
                .join("\n"),
            json!(result.variables),
        )?;
    }
    Ok(())
}

fn describe_output(result: &ExecutionResult) -> String {
    let mut parts = Vec::new();
    let stdout = result.stdout_text();
    if !stdout.is_empty() {
        parts.push(stdout);
    }
    for (name, value) in &result.output {
        parts.push(format!("{}: {}", name, value));
    }
    if parts.is_empty() {
        parts.push("(no output)".to_string());
    }
    parts.join("\n")
}

fn describe_success(result: &ExecutionResult) -> String {
    format!(
        "The execution of the generated code succeeded.\n{}",
        describe_output(result)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_code_from_fence() {
        let raw = "Here you go:\n```python\nprint('hi')\n```\nDone.";
        assert_eq!(extract_code(raw), "print('hi')");
    }

    #[test]
    fn test_extract_code_without_fence_uses_whole_reply() {
        assert_eq!(extract_code("x = 1\n"), "x = 1");
    }

    #[test]
    fn test_describe_output_includes_stdout_and_display_values() {
        let result = ExecutionResult {
            stdout: vec!["hello\n".to_string()],
            output: vec![("mean".to_string(), "3.5".to_string())],
            ..ExecutionResult::default()
        };
        let text = describe_output(&result);
        assert!(text.contains("hello"));
        assert!(text.contains("mean: 3.5"));
    }
}
