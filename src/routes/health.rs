//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health`: liveness probe.
///
/// Returns status, uptime, version, peer connectivity, open request channels
/// and tunnel counters. No authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let ts = &state.tunnel_stats;

    let events = ts.events.lock().await;
    let now = std::time::Instant::now();
    let recent_events: Vec<Value> = events
        .iter()
        .rev()
        .take(10)
        .map(|e| {
            let ago = now.duration_since(e.timestamp).as_secs();
            let ago_str = if ago < 60 {
                format!("{ago}s ago")
            } else if ago < 3600 {
                format!("{}m ago", ago / 60)
            } else {
                format!("{}h ago", ago / 3600)
            };
            json!({
                "time": ago_str,
                "event": e.event_type.as_str(),
                "detail": e.detail,
            })
        })
        .collect();
    drop(events);

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "peer": {
            "connected": state.tunnel.is_connected(),
            "open_channels": state.tunnel.registry().len(),
            "verification_pending": state.tunnel.verification_pending().load(Ordering::Relaxed),
            "connections": ts.connections.load(Ordering::Relaxed),
            "messages_sent": ts.messages_sent.load(Ordering::Relaxed),
            "messages_received": ts.messages_received.load(Ordering::Relaxed),
            "dropped_frames": ts.dropped_frames.load(Ordering::Relaxed),
            "recent_events": recent_events,
        },
    }))
}
