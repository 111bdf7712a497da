//! Per-run WebSocket event stream.
//!
//! One live socket per run: connecting replaces any prior subscriber and
//! there is no history replay. The server only pushes; inbound frames are
//! drained solely to notice the close handshake.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use tracing::{debug, warn};

use dirigent::events::Envelope;

use crate::state::AppState;

/// GET /ws/:run_id
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(run_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, run_id, state))
}

async fn run_socket(mut socket: WebSocket, run_id: String, state: AppState) {
    let mut rx = state.events.subscribe(&run_id);
    debug!(run_id, "websocket attached");

    let connected = Envelope::orchestrator(
        "connected",
        serde_json::json!({ "run_id": run_id }),
    );
    if send_envelope(&mut socket, &connected).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else {
                    // Replaced by a newer subscriber or the run was detached.
                    debug!(run_id, "event channel closed, dropping socket");
                    break;
                };
                if send_envelope(&mut socket, &envelope).await.is_err() {
                    debug!(run_id, "websocket send failed, client gone");
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(run_id, "websocket closed by client");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(run_id, err = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), ()> {
    let json = serde_json::to_string(envelope).map_err(|_| ())?;
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}
