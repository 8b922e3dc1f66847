use std::sync::Arc;

use serde_json::Value;

use skein_memory::{AttachmentKind, CompactedMessage, Memory, Post, Round};

use crate::llm::{ChatMessage, LanguageModel};
use crate::role::{Role, RoleContext};
use crate::RoleError;

/// The conversation driver: reads the user's intent, decides which worker
/// (if any) should act, and phrases the final answer.
pub struct Planner {
    alias: String,
    llm: Arc<dyn LanguageModel>,
    /// Role aliases the planner may dispatch to.
    workers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct PlannerResponse {
    thought: String,
    message: String,
    send_to: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LanguageModel>, workers: Vec<String>) -> Self {
        Self {
            alias: "Planner".to_string(),
            llm,
            workers,
        }
    }

    fn instructions(&self) -> String {
        format!(
            "You are the Planner of a multi-agent system. You decide who acts next.\n\
             Available workers: {}.\n\
             Reply with a single JSON object: \
             {{\"thought\": \"...\", \"message\": \"...\", \"send_to\": \"...\"}}.\n\
             Set send_to to a worker alias to delegate, or to \"User\" when the \
             task is complete and message is the final answer.",
            self.workers.join(", ")
        )
    }

    fn known_recipient(&self, alias: &str) -> bool {
        alias == "User" || self.workers.iter().any(|w| w == alias)
    }
}

impl Role for Planner {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn reply(&self, memory: &Memory, ctx: &RoleContext) -> Result<Post, RoleError> {
        let (rounds, compaction) = memory
            .get_role_rounds_with_compaction(&self.alias, false)
            .map_err(|e| RoleError::Other(e.to_string()))?;

        let mut messages = vec![ChatMessage::system(self.instructions())];
        messages.extend(render_history(&self.alias, &rounds, compaction.as_ref()));

        let mut proxy = ctx.emitter.clone().create_post_proxy(&self.alias);
        proxy.update_status("thinking")?;

        // Stream raw model output as an attachment; the parsed reply
        // becomes the post message afterwards.
        proxy.start_attachment(AttachmentKind::ReplyContent)?;
        let raw = {
            let proxy_ref = &mut proxy;
            let mut on_delta = |delta: &str| {
                let _ = proxy_ref.update_attachment(delta, false);
            };
            self.llm.complete_stream(&messages, &mut on_delta)?
        };
        proxy.update_attachment("", true)?;

        match parse_planner_response(&raw) {
            Some(response) if self.known_recipient(&response.send_to) => {
                if !response.thought.is_empty() {
                    proxy.attach(AttachmentKind::Thought, &response.thought)?;
                }
                proxy.update_message(&response.message, true)?;
                proxy.update_send_to(&response.send_to)?;
                Ok(proxy.end(None)?)
            }
            Some(response) => {
                tracing::warn!(send_to = %response.send_to, "planner chose an unknown recipient");
                proxy.attach(AttachmentKind::InvalidResponse, &raw)?;
                proxy.update_message(&response.message, true)?;
                proxy.update_send_to("User")?;
                Ok(proxy.end(None)?)
            }
            None => {
                // Not JSON; treat the whole completion as a user-facing
                // answer rather than failing the round.
                tracing::warn!("planner response was not valid JSON; forwarding verbatim");
                proxy.attach(AttachmentKind::InvalidResponse, &raw)?;
                proxy.update_message(raw.trim(), true)?;
                proxy.update_send_to("User")?;
                Ok(proxy.end(None)?)
            }
        }
    }
}

/// Render role-visible history as chat messages, splicing the compacted
/// summary in front of the rounds it does not cover.
fn render_history(
    role: &str,
    rounds: &[Round],
    compaction: Option<&CompactedMessage>,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let skip = match compaction {
        Some(compacted) => {
            messages.push(ChatMessage::system(compacted.to_system_message()));
            compacted.end_index
        }
        None => 0,
    };
    for round in rounds.iter().skip(skip) {
        for post in &round.posts {
            if post.send_from == role {
                messages.push(ChatMessage::assistant(post.message.clone()));
            } else {
                messages.push(ChatMessage::user(format!(
                    "{}: {}",
                    post.send_from, post.message
                )));
            }
        }
    }
    messages
}

fn parse_planner_response(raw: &str) -> Option<PlannerResponse> {
    let stripped = strip_code_fence(raw);
    let value: Value = serde_json::from_str(stripped.trim()).ok()?;
    let body = value.get("response").unwrap_or(&value);
    let message = body.get("message")?.as_str()?.to_string();
    let send_to = body
        .get("send_to")
        .and_then(|v| v.as_str())
        .unwrap_or("User")
        .to_string();
    let thought = body
        .get("thought")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some(PlannerResponse {
        thought,
        message,
        send_to,
    })
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest
        .split_once('\n')
        .map(|(_, body)| body)
        .unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
