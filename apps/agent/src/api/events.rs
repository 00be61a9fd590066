//! WebSocket event feed: job-controller broadcasts serialized as JSON.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::broadcast::error::RecvError;

use super::SharedState;

pub async fn ws_events(State(state): State<SharedState>, upgrade: WebSocketUpgrade) -> Response {
    let receiver = state.controller.subscribe();
    upgrade.on_upgrade(move |socket| forward_events(socket, receiver))
}

async fn forward_events(
    mut socket: WebSocket,
    mut receiver: tokio::sync::broadcast::Receiver<crate::jobs::JobEvent>,
) {
    loop {
        match receiver.recv().await {
            Ok(event) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("Dropping unserializable event: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    // Client went away.
                    return;
                }
            }
            Err(RecvError::Lagged(missed)) => {
                log::debug!("WS subscriber lagged, {missed} events skipped");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
