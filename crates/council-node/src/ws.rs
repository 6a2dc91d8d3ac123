// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket bridge — forwards a session's event stream to browser clients.
//!
//! # Wire format
//!
//! JSON over WebSocket text frames.  The client drives a small control
//! plane:
//!
//! ```json
//! { "type": "join",  "sessionId": "…" }
//! { "type": "leave" }
//! ```
//!
//! After a join, every [`SessionEvent`] of that session is pushed as a JSON
//! frame in publish order.  Joining mid-session delivers only events
//! published after the join; history comes from the query endpoints.  On
//! reconnect the client is expected to re-join; missed events are not
//! replayed.  A client that falls behind the event buffer receives an error
//! frame instead of blocking the orchestrator.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use council_core::SessionEvent;

use crate::routes::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ControlFrame {
    #[serde(alias = "joinSession")]
    Join {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
    },
    #[serde(alias = "leaveSession")]
    Leave,
}

/// HTTP handler for GET /ws.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("WebSocket client connected");
    let mut subscription: Option<broadcast::Receiver<SessionEvent>> = None;

    loop {
        tokio::select! {
            // Incoming control frame from the client.
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlFrame>(&text) {
                            Ok(ControlFrame::Join { session_id }) => {
                                debug!(session = %session_id, "client joined session");
                                subscription = Some(state.hub.subscribe(session_id));
                                send_json(
                                    &mut socket,
                                    &serde_json::json!({ "type": "joined", "sessionId": session_id }),
                                )
                                .await;
                            }
                            Ok(ControlFrame::Leave) => {
                                subscription = None;
                                send_json(&mut socket, &serde_json::json!({ "type": "left" })).await;
                            }
                            Err(e) => {
                                warn!("invalid control frame: {e}");
                                send_json(
                                    &mut socket,
                                    &serde_json::json!({
                                        "type": "error",
                                        "message": format!("invalid control frame: {e}"),
                                    }),
                                )
                                .await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!("WebSocket recv error: {e}");
                        break;
                    }
                }
            }
            // Outgoing event from the joined session.
            result = recv_event(&mut subscription), if subscription.is_some() => {
                match result {
                    Ok(ev) => {
                        if let Ok(json) = serde_json::to_string(&ev) {
                            if socket.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged by {n} events");
                        send_json(
                            &mut socket,
                            &serde_json::json!({
                                "type": "error",
                                "message": format!("event stream lagged by {n} events"),
                            }),
                        )
                        .await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        subscription = None;
                    }
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

async fn recv_event(
    subscription: &mut Option<broadcast::Receiver<SessionEvent>>,
) -> Result<SessionEvent, broadcast::error::RecvError> {
    match subscription {
        Some(rx) => rx.recv().await,
        // Unreachable behind the select guard, but keep the future inert.
        None => std::future::pending().await,
    }
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) {
    if let Ok(json) = serde_json::to_string(value) {
        let _ = socket.send(Message::Text(json)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_frame_parses_both_spellings() {
        let id = Uuid::new_v4();
        for ty in ["join", "joinSession"] {
            let frame: ControlFrame = serde_json::from_str(&format!(
                r#"{{ "type": "{ty}", "sessionId": "{id}" }}"#
            ))
            .unwrap();
            assert!(matches!(frame, ControlFrame::Join { session_id } if session_id == id));
        }
    }

    #[test]
    fn leave_frame_parses() {
        let frame: ControlFrame = serde_json::from_str(r#"{ "type": "leave" }"#).unwrap();
        assert!(matches!(frame, ControlFrame::Leave));
    }

    #[test]
    fn unknown_frame_is_rejected() {
        assert!(serde_json::from_str::<ControlFrame>(r#"{ "type": "dance" }"#).is_err());
    }
}
