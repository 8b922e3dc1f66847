use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use skein_events::{EventHandlerError, SessionEvent, SessionEventHandler};
use skein_memory::RoundState;

use crate::protocol::{event_frames, history_frames};
use crate::{GatewaySession, GatewayState};

/// Bus subscriber that forwards live events into the connection's outbound
/// queue. Runs on orchestrator threads, so it only does a non-blocking
/// channel send.
struct WsEventHandler {
    tx: mpsc::UnboundedSender<Value>,
    last_attachment_id: Mutex<String>,
}

impl SessionEventHandler for WsEventHandler {
    fn handle(&self, event: &SessionEvent) -> Result<(), EventHandlerError> {
        let mut last = self.last_attachment_id.lock().expect("attachment id lock");
        for frame in event_frames(event, &mut last) {
            self.tx
                .send(frame)
                .map_err(|_| EventHandlerError("ws connection closed".to_string()))?;
        }
        Ok(())
    }
}

pub async fn ws_chat(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<GatewayState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match state.manager.get(&session_id) {
            Some(session) => handle_socket(socket, session).await,
            None => {
                let mut socket = socket;
                let _ = socket
                    .send(Message::Text(
                        json!({ "type": "error", "message": "Session not found" })
                            .to_string()
                            .into(),
                    ))
                    .await;
                let _ = socket.close().await;
            }
        }
    })
}

async fn handle_socket(socket: WebSocket, session: Arc<GatewaySession>) {
    let session_id = session.session.session_id().to_string();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    // Writer task: the only place that touches the sink.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink
                .send(Message::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let handler = Arc::new(WsEventHandler {
        tx: tx.clone(),
        last_attachment_id: Mutex::new(String::new()),
    });
    let handler_token = session.session.emitter().register(handler);

    let _ = tx.send(json!({ "type": "connected", "session_id": session_id }));
    for frame in history_frames(&session.session.memory().conversation_snapshot()) {
        let _ = tx.send(frame);
    }
    let _ = tx.send(json!({ "type": "history_complete" }));

    while let Some(message) = stream.next().await {
        let Ok(message) = message else { break };
        let Message::Text(text) = message else {
            if matches!(message, Message::Close(_)) {
                break;
            }
            continue;
        };
        let Ok(inbound) = serde_json::from_str::<Value>(text.as_str()) else {
            let _ = tx.send(json!({ "type": "error", "message": "Malformed message" }));
            continue;
        };

        match inbound.get("type").and_then(Value::as_str) {
            Some("send_message") => {
                if session.is_processing.swap(true, Ordering::SeqCst) {
                    let _ = tx.send(json!({
                        "type": "error",
                        "message": "Already processing a message",
                    }));
                    continue;
                }
                let message = inbound
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let files: Vec<(String, Vec<u8>)> = {
                    let mut pending = session.pending_files.lock().expect("pending files lock");
                    pending.drain(..).collect()
                };
                let session_for_turn = session.clone();
                let tx_for_turn = tx.clone();
                // The turn blocks on roles and the execution client; run it
                // on a plain thread, never on the async runtime.
                std::thread::spawn(move || {
                    run_turn(session_for_turn, message, files, tx_for_turn);
                });
            }
            Some("confirm") => {
                let approved = inbound
                    .get("approved")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                session.session.emitter().provide_confirmation(approved);
            }
            Some("upload_file") => {
                let filename = inbound
                    .get("filename")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let content = inbound
                    .get("content_b64")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match base64::engine::general_purpose::STANDARD.decode(content.as_bytes()) {
                    Ok(bytes) => {
                        session
                            .pending_files
                            .lock()
                            .expect("pending files lock")
                            .push((filename.clone(), bytes));
                        let _ = tx.send(json!({
                            "type": "file_uploaded",
                            "filename": filename,
                        }));
                    }
                    Err(_) => {
                        let _ = tx.send(json!({
                            "type": "error",
                            "message": format!("File {} is not valid base64", filename),
                        }));
                    }
                }
            }
            Some(other) => {
                tracing::debug!(kind = other, "ignoring unknown inbound message");
            }
            None => {
                let _ = tx.send(json!({ "type": "error", "message": "Missing message type" }));
            }
        }
    }

    session.session.emitter().unregister(handler_token);
    drop(tx);
    let _ = writer.await;
    tracing::info!(session_id = %session.session.session_id(), "websocket disconnected");
}

fn run_turn(
    session: Arc<GatewaySession>,
    message: String,
    files: Vec<(String, Vec<u8>)>,
    tx: mpsc::UnboundedSender<Value>,
) {
    let outcome = session.session.send_message_with_files(&message, &files);
    match outcome {
        Ok(round) => {
            let result = round
                .posts
                .last()
                .filter(|post| post.send_to == "User" && round.state == RoundState::Finished)
                .map(|post| post.message.clone());
            let _ = tx.send(json!({
                "type": "message_complete",
                "result": result,
            }));
        }
        Err(err) => {
            tracing::warn!(error = %err, "turn failed");
            let _ = tx.send(json!({ "type": "error", "message": err.to_string() }));
        }
    }
    session.is_processing.store(false, Ordering::SeqCst);
}
