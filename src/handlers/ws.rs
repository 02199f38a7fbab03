//! WebSocket handler: auth via username query, registration with the
//! realtime service, ping/pong keepalive, 300s stale timeout.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::trace;

use crate::events::ClientEvent;
use crate::registry;
use crate::AppState;

const PONG_JSON: &str = r#"{"type":"pong"}"#;
const PING_TIMEOUT_SECS: u64 = 300;
const IDLE_CHECK_SECS: u64 = 60;

#[derive(Deserialize)]
pub struct WsQuery {
    username: Option<String>,
}

/// Upgrades the connection after validating the username query param. The
/// identity is assumed to be authenticated upstream; a connection without a
/// username is refused before the upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let username = match q.username.as_deref().map(str::trim) {
        Some(u) if !u.is_empty() => u.to_string(),
        _ => {
            return (StatusCode::UNAUTHORIZED, "Missing username query param").into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, username, state))
}

async fn handle_socket(mut socket: WebSocket, username: String, state: AppState) {
    let Some((entry, mut rx)) = state.realtime.connect(&username) else {
        // Service is draining; the client's reconnect policy takes it from here.
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let conn_id = entry.conn_id;
    let mut idle = tokio::time::interval(Duration::from_secs(IDLE_CHECK_SECS));
    idle.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            // Superseded by a reconnect, or the service is shutting down.
            () = entry.close.notified() => break,
            _ = idle.tick() => {
                let age = registry::now_secs()
                    .saturating_sub(entry.last_ping_at.load(Ordering::Relaxed));
                if age > PING_TIMEOUT_SECS {
                    trace!("ws idle timeout username={} conn_id={}", username, conn_id);
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(ClientEvent::Ping) => {
                            entry
                                .last_ping_at
                                .store(registry::now_secs(), Ordering::Relaxed);
                            trace!("ws ping received username={} conn_id={}", username, conn_id);
                            if socket.send(Message::Text(PONG_JSON.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(ClientEvent::TypingStart { to }) => {
                            state.realtime.relay_typing(&username, &to, true);
                        }
                        Ok(ClientEvent::TypingStop { to }) => {
                            state.realtime.relay_typing(&username, &to, false);
                        }
                        Err(_) => {
                            trace!("ws unrecognized frame username={}", username);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            }
        }
    }
    state.realtime.disconnect(&username, conn_id);
}
