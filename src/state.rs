//! Shared application state passed to every handler via Axum's `State` extractor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};

use crate::catalog::ModelCatalog;
use crate::config::Config;
use crate::mapping::SessionDefaults;
use crate::tunnel::peer::PeerTunnel;

/// Shared application state for the bridge server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// The single browser peer and its channel registry.
    pub tunnel: PeerTunnel,
    /// Tunnel connection stats and event history.
    pub tunnel_stats: Arc<TunnelStats>,
    pub catalog: Arc<ModelCatalog>,
    /// Fallback session ids. Seeded from `[bridge]`, replaced by id capture.
    pub defaults: Arc<RwLock<SessionDefaults>>,
}

impl AppState {
    pub fn new(config: Config, catalog: ModelCatalog) -> Self {
        let tunnel_stats = Arc::new(TunnelStats::new());
        let defaults = SessionDefaults {
            session_id: config.bridge.session_id.clone(),
            message_id: config.bridge.message_id.clone(),
        };
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            tunnel: PeerTunnel::new(tunnel_stats.clone()),
            tunnel_stats,
            catalog: Arc::new(catalog),
            defaults: Arc::new(RwLock::new(defaults)),
        }
    }
}

/// Tunnel connection event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelEventType {
    Connected,
    Replaced,
    Disconnected,
    WriterFailed,
}

impl TunnelEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Replaced => "replaced",
            Self::Disconnected => "disconnected",
            Self::WriterFailed => "writer_failed",
        }
    }
}

/// A tunnel lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    pub timestamp: Instant,
    pub event_type: TunnelEventType,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_TUNNEL_EVENTS: usize = 50;

/// Tunnel statistics: atomics for the per-message hot path, a Mutex only for
/// the event log.
pub struct TunnelStats {
    pub connected: AtomicBool,
    pub connections: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    /// Peer messages that could not be routed to an open channel.
    pub dropped_frames: AtomicU64,
    pub events: Mutex<VecDeque<ConnectionEvent>>,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connections: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            events: Mutex::new(VecDeque::with_capacity(MAX_TUNNEL_EVENTS)),
        }
    }

    /// Push a connection event, evicting oldest if at capacity.
    pub async fn push_event(&self, event_type: TunnelEventType, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_TUNNEL_EVENTS {
            events.pop_front();
        }
        events.push_back(ConnectionEvent {
            timestamp: Instant::now(),
            event_type,
            detail,
        });
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_log_is_bounded() {
        let stats = TunnelStats::new();
        for i in 0..(MAX_TUNNEL_EVENTS + 5) {
            stats
                .push_event(TunnelEventType::Connected, format!("conn {i}"))
                .await;
        }
        let events = stats.events.lock().await;
        assert_eq!(events.len(), MAX_TUNNEL_EVENTS);
        assert_eq!(events.front().map(|e| e.detail.as_str()), Some("conn 5"));
    }
}
