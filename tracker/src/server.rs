//! Websocket transport and the read-only HTTP API.

use crate::hub::Hub;
use crate::metrics_defs::EVENTS_REJECTED;
use crate::protocol::{self, Inbound, ProtocolError};
use crate::types::ConnectionId;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use parking_lot::Mutex;
use serde_json::Value;
use shared::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone)]
pub struct AppState {
    hub: Arc<Mutex<Hub>>,
    next_connection: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(hub: Arc<Mutex<Hub>>) -> Self {
        AppState {
            hub,
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_connection_id(&self) -> ConnectionId {
        format!("conn-{}", self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    fn dispatch(&self, conn: &str, decoded: Result<Inbound, ProtocolError>) {
        match decoded {
            Ok(event) => self.hub.lock().handle(conn, event),
            Err(e) => {
                counter!(EVENTS_REJECTED).increment(1);
                tracing::warn!(conn, error = %e, "Discarding malformed frame");
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .route("/api/devices", get(devices))
        .with_state(state)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn devices(State(state): State<AppState>) -> Json<Value> {
    Json(state.hub.lock().snapshot_json())
}

async fn serve_socket(mut socket: WebSocket, state: AppState) {
    let conn = state.next_connection_id();
    let mut rx = state.hub.lock().connect(&conn);

    loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                if let Err(e) = socket.send(Message::Text(frame.as_ref().into())).await {
                    tracing::debug!(conn, error = %e, "Failed to write frame");
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    state.dispatch(&conn, protocol::decode(text.as_str()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    state.dispatch(&conn, protocol::decode_binary(&bytes));
                }
                Some(Ok(Message::Close(_))) | None => break,
                // ping and pong are answered by axum
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn, error = %e, "Websocket read failed");
                    break;
                }
            }
        }
    }

    state.hub.lock().disconnect(&conn);
}
