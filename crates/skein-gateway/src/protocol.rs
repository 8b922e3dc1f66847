use serde_json::{json, Value};

use skein_events::{PostEventType, RoundEventType, SessionEvent};
use skein_memory::Conversation;

/// Translate one bus event into the gateway wire frames it produces.
///
/// `last_attachment_id` tracks the attachment currently being streamed so
/// an `attachment_start` frame precedes the first update of each
/// attachment.
pub fn event_frames(event: &SessionEvent, last_attachment_id: &mut String) -> Vec<Value> {
    match event {
        SessionEvent::Session { .. } => Vec::new(),
        SessionEvent::Round { t, round_id, msg, .. } => match t {
            RoundEventType::RoundStart => {
                vec![json!({ "type": "round_start", "round_id": round_id })]
            }
            RoundEventType::RoundEnd => {
                vec![json!({ "type": "round_end", "round_id": round_id })]
            }
            RoundEventType::RoundError => vec![json!({
                "type": "round_error",
                "round_id": round_id,
                "message": msg,
            })],
        },
        SessionEvent::Post {
            t,
            post_id,
            round_id,
            msg,
            extra,
        } => match t {
            PostEventType::PostStart => vec![json!({
                "type": "post_start",
                "post_id": post_id,
                "round_id": round_id,
                "role": extra.get("role").and_then(Value::as_str).unwrap_or("Unknown"),
            })],
            PostEventType::PostEnd => {
                let mut frame = json!({ "type": "post_end", "post_id": post_id });
                if let Some(error) = extra.get("error").and_then(Value::as_str) {
                    frame["error"] = json!(error);
                }
                vec![frame]
            }
            PostEventType::PostMessageUpdate => vec![json!({
                "type": "message_update",
                "post_id": post_id,
                "text": msg,
                "is_end": extra.get("is_end").and_then(Value::as_bool).unwrap_or(true),
            })],
            PostEventType::PostAttachmentUpdate => {
                let attachment_id = extra
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let is_end = extra.get("is_end").and_then(Value::as_bool).unwrap_or(true);
                let mut frames = Vec::new();
                if attachment_id != *last_attachment_id {
                    frames.push(json!({
                        "type": "attachment_start",
                        "post_id": post_id,
                        "attachment_id": attachment_id,
                        "attachment_type": extra.get("kind").cloned().unwrap_or(Value::Null),
                    }));
                    *last_attachment_id = attachment_id.clone();
                }
                frames.push(json!({
                    "type": "attachment_update",
                    "post_id": post_id,
                    "attachment_id": attachment_id,
                    "content": msg,
                    "is_end": is_end,
                }));
                if is_end {
                    last_attachment_id.clear();
                }
                frames
            }
            PostEventType::PostSendToUpdate => vec![json!({
                "type": "send_to_update",
                "post_id": post_id,
                "send_to": extra.get("role").and_then(Value::as_str).unwrap_or("Unknown"),
            })],
            PostEventType::PostStatusUpdate => vec![json!({
                "type": "status_update",
                "post_id": post_id,
                "status": msg,
            })],
            PostEventType::PostExecutionOutput => vec![json!({
                "type": "execution_output",
                "post_id": post_id,
                "stream": extra.get("stream").and_then(Value::as_str).unwrap_or("stdout"),
                "text": extra.get("text").and_then(Value::as_str).unwrap_or(msg),
            })],
            PostEventType::PostConfirmationRequest => vec![json!({
                "type": "confirm_request",
                "post_id": post_id,
                "round_id": round_id,
                "code": extra.get("code").and_then(Value::as_str).unwrap_or(msg),
            })],
            // The decision is visible to the requester already; clients
            // only need the request.
            PostEventType::PostConfirmationResponse => Vec::new(),
        },
    }
}

/// Synthesize the replay frames for an existing conversation, in order:
/// per round `round_start`, a reconstructed user post, every stored post
/// with its attachments (`is_end=true`), then `round_end`.
pub fn history_frames(conversation: &Conversation) -> Vec<Value> {
    let mut frames = Vec::new();
    for round in &conversation.rounds {
        frames.push(json!({ "type": "round_start", "round_id": round.id }));

        if !round.user_query.is_empty() {
            let user_post_id = format!("user-{}", round.id);
            frames.push(json!({
                "type": "post_start",
                "post_id": user_post_id,
                "round_id": round.id,
                "role": "User",
            }));
            frames.push(json!({
                "type": "message_update",
                "post_id": user_post_id,
                "text": round.user_query,
                "is_end": true,
            }));
            frames.push(json!({ "type": "post_end", "post_id": user_post_id }));
        }

        for post in &round.posts {
            // The reconstructed user post above covers the user's query.
            if post.send_from == "User" {
                continue;
            }
            frames.push(json!({
                "type": "post_start",
                "post_id": post.id,
                "round_id": round.id,
                "role": post.send_from,
            }));
            frames.push(json!({
                "type": "send_to_update",
                "post_id": post.id,
                "send_to": post.send_to,
            }));
            for attachment in &post.attachments {
                frames.push(json!({
                    "type": "attachment_start",
                    "post_id": post.id,
                    "attachment_id": attachment.id,
                    "attachment_type": attachment.kind,
                }));
                frames.push(json!({
                    "type": "attachment_update",
                    "post_id": post.id,
                    "attachment_id": attachment.id,
                    "content": attachment.content,
                    "is_end": true,
                }));
            }
            if !post.message.is_empty() {
                frames.push(json!({
                    "type": "message_update",
                    "post_id": post.id,
                    "text": post.message,
                    "is_end": true,
                }));
            }
            frames.push(json!({ "type": "post_end", "post_id": post.id }));
        }

        frames.push(json!({ "type": "round_end", "round_id": round.id }));
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_memory::{Attachment, AttachmentKind, Post, Round};

    #[test]
    fn test_round_events_map_to_frames() {
        let mut last = String::new();
        let frames = event_frames(
            &SessionEvent::Round {
                t: RoundEventType::RoundError,
                round_id: "round-1".to_string(),
                msg: "boom".to_string(),
                extra: Value::Null,
            },
            &mut last,
        );
        assert_eq!(frames[0]["type"], "round_error");
        assert_eq!(frames[0]["message"], "boom");
    }

    #[test]
    fn test_attachment_updates_insert_start_frame_once() {
        let mut last = String::new();
        let event = |content: &str, is_end: bool| SessionEvent::Post {
            t: PostEventType::PostAttachmentUpdate,
            post_id: "post-1".to_string(),
            round_id: "round-1".to_string(),
            msg: content.to_string(),
            extra: json!({ "id": "atta-1", "kind": "reply_content", "is_end": is_end }),
        };

        let first = event_frames(&event("he", false), &mut last);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0]["type"], "attachment_start");
        assert_eq!(first[1]["type"], "attachment_update");

        let second = event_frames(&event("llo", true), &mut last);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0]["type"], "attachment_update");
        assert_eq!(second[0]["is_end"], true);
        assert!(last.is_empty());
    }

    #[test]
    fn test_post_end_error_included_when_present() {
        let mut last = String::new();
        let frames = event_frames(
            &SessionEvent::Post {
                t: PostEventType::PostEnd,
                post_id: "post-1".to_string(),
                round_id: "round-1".to_string(),
                msg: "kernel died".to_string(),
                extra: json!({ "error": "kernel died" }),
            },
            &mut last,
        );
        assert_eq!(frames[0]["error"], "kernel died");
    }

    #[test]
    fn test_history_replay_reconstructs_user_and_role_posts() {
        let mut conversation = Conversation::init();
        let mut round = Round::create("plot the data");
        round.add_post(
            Post::new("User")
                .with_send_to("Planner")
                .with_message("plot the data"),
        );
        let mut reply = Post::new("Planner")
            .with_send_to("User")
            .with_message("here you go");
        reply.add_attachment(Attachment::new(AttachmentKind::Thought, "easy"));
        round.add_post(reply);
        conversation.add_round(round.clone());

        let frames = history_frames(&conversation);
        let types: Vec<&str> = frames
            .iter()
            .map(|f| f["type"].as_str().unwrap())
            .collect();
        assert_eq!(
            types,
            vec![
                "round_start",
                "post_start",
                "message_update",
                "post_end",
                "post_start",
                "send_to_update",
                "attachment_start",
                "attachment_update",
                "message_update",
                "post_end",
                "round_end",
            ]
        );
        // Attachment updates in replay are always terminal.
        let update = frames.iter().find(|f| f["type"] == "attachment_update").unwrap();
        assert_eq!(update["is_end"], true);
    }
}
