//! Peer WebSocket endpoint.
//!
//! The browser agent connects to `GET /ws`. At most one peer is active; a new
//! connection replaces the old one. Message shapes are listed in
//! [`crate::tunnel`].

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use tracing::info;

use crate::AppState;

/// `GET /ws`: upgrade and hand the socket to the tunnel.
pub async fn peer_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    info!("Peer WebSocket upgrade");
    ws.on_upgrade(move |socket| state.tunnel.clone().serve(socket))
}
