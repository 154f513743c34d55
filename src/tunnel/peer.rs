//! The single browser peer connection.
//!
//! At most one connection is active. A new connection replaces the old one:
//! the old handler is signalled through its watch channel and, when it exits,
//! fails only the channels that were dispatched over it. When the *active*
//! connection ends, the reference is cleared and every open channel receives
//! one synthesized error frame before the registry is emptied, so no caller
//! waits on a connection that no longer exists.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};

use super::registry::{short_id, Channel, ChannelRegistry};
use super::{ChatPayload, Envelope, Frame, PeerCommand, PeerMessage, PEER_DISCONNECTED};
use crate::error::BridgeError;
use crate::state::{TunnelEventType, TunnelStats};
use crate::stream::format::RefreshHook;

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 256;

struct ActivePeer {
    id: u64,
    tx: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
}

/// Owner of the peer connection slot. Cheap to clone.
#[derive(Clone)]
pub struct PeerTunnel {
    registry: ChannelRegistry,
    current: Arc<RwLock<Option<ActivePeer>>>,
    next_id: Arc<AtomicU64>,
    verification_pending: Arc<AtomicBool>,
    stats: Arc<TunnelStats>,
}

impl PeerTunnel {
    pub fn new(stats: Arc<TunnelStats>) -> Self {
        Self {
            registry: ChannelRegistry::new(),
            current: Arc::new(RwLock::new(None)),
            next_id: Arc::new(AtomicU64::new(0)),
            verification_pending: Arc::new(AtomicBool::new(false)),
            stats,
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Shared flag set while a verification refresh is outstanding.
    pub fn verification_pending(&self) -> Arc<AtomicBool> {
        self.verification_pending.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::Relaxed)
    }

    /// Run one accepted WebSocket until it closes or is replaced.
    pub async fn serve(self, socket: WebSocket) {
        let (mut ws_sink, mut ws_stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let (conn, mut shutdown_rx) = self.install(tx).await;

        async move {
            let stats = self.stats.clone();
            let send_task = tokio::spawn(
                async move {
                    while let Some(text) = rx.recv().await {
                        if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                            warn!("Peer write failed: {e}");
                            stats
                                .push_event(TunnelEventType::WriterFailed, e.to_string())
                                .await;
                            break;
                        }
                    }
                }
                .in_current_span(),
            );

            loop {
                let msg = tokio::select! {
                    msg = ws_stream.next() => match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("Peer read failed: {e}");
                            break;
                        }
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        info!("Peer handler shutting down (replaced by new connection)");
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => self.handle_text(text.as_str()),
                    Message::Close(_) => break,
                    Message::Binary(data) => {
                        debug!(len = data.len(), "Ignoring binary frame from peer");
                    }
                    _ => {}
                }
            }

            send_task.abort();
            self.disconnect(conn).await;
        }
        .instrument(info_span!("peer", conn))
        .await;
    }

    /// Make `tx` the active connection, superseding any previous one.
    async fn install(&self, tx: mpsc::Sender<String>) -> (u64, watch::Receiver<bool>) {
        let conn = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let previous = {
            let mut current = self.current.write().await;
            self.stats.connected.store(true, Ordering::Relaxed);
            current.replace(ActivePeer {
                id: conn,
                tx,
                shutdown,
            })
        };
        if let Some(old) = previous {
            warn!(old = old.id, new = conn, "Peer reconnected while a connection exists, replacing");
            let _ = old.shutdown.send(true);
            self.stats
                .push_event(TunnelEventType::Replaced, format!("conn {} replaced by {conn}", old.id))
                .await;
        }
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        self.stats
            .push_event(TunnelEventType::Connected, format!("conn {conn}"))
            .await;
        info!(conn, "Peer connected");
        (conn, shutdown_rx)
    }

    /// Tear down after connection `conn` ended.
    ///
    /// The slot stays locked until the channels are failed, so a peer that
    /// installs meanwhile cannot have its own requests swept up here.
    async fn disconnect(&self, conn: u64) {
        let current_failed = {
            let mut current = self.current.write().await;
            if current.as_ref().is_some_and(|p| p.id == conn) {
                *current = None;
                self.stats.connected.store(false, Ordering::Relaxed);
                Some(self.registry.fail_all(PEER_DISCONNECTED))
            } else {
                None
            }
        };

        if let Some(failed) = current_failed {
            warn!(conn, failed, "Peer disconnected");
            self.stats
                .push_event(
                    TunnelEventType::Disconnected,
                    format!("conn {conn}, {failed} requests failed"),
                )
                .await;
        } else {
            let failed = self.registry.fail_connection(conn, PEER_DISCONNECTED);
            info!(conn, failed, "Superseded peer connection closed");
        }
    }

    /// Route one inbound text message. Malformed or unroutable messages are
    /// dropped.
    pub fn handle_text(&self, text: &str) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let msg = match serde_json::from_str::<PeerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                let preview: String = text.chars().take(100).collect();
                warn!("Invalid message from peer ({e}): {preview}");
                self.stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let (Some(request_id), Some(data)) = (msg.request_id, msg.data) else {
            warn!("Peer message without request_id or data (dropped)");
            self.stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !self.registry.route(&request_id, Frame::from_data(data)) {
            self.stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Active connection id and sender, or `ServiceUnavailable`.
    async fn active(&self) -> Result<(u64, mpsc::Sender<String>), BridgeError> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|p| (p.id, p.tx.clone()))
            .ok_or(BridgeError::ServiceUnavailable)
    }

    async fn send_text(&self, tx: &mpsc::Sender<String>, text: String) -> Result<(), BridgeError> {
        tx.send(text)
            .await
            .map_err(|_| BridgeError::ServiceUnavailable)?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn send_command(&self, command: PeerCommand) -> Result<(), BridgeError> {
        let (_, tx) = self.active().await?;
        let text = serde_json::to_string(&command)
            .map_err(|e| BridgeError::Internal(format!("serialize command: {e}")))?;
        self.send_text(&tx, text).await?;
        info!(?command, "Command sent to peer");
        Ok(())
    }

    /// Send a chat request for `channel`. The channel is bound to the
    /// connection before the write so a replacement cannot orphan it.
    pub async fn dispatch(&self, channel: &Channel, payload: ChatPayload) -> Result<(), BridgeError> {
        let (conn, tx) = self.active().await?;
        let envelope = Envelope {
            request_id: channel.request_id().to_string(),
            payload,
        };
        let text = serde_json::to_string(&envelope)
            .map_err(|e| BridgeError::Internal(format!("serialize envelope: {e}")))?;
        self.registry.bind(channel.request_id(), conn);
        self.send_text(&tx, text).await?;
        debug!(request_id = %short_id(channel.request_id()), conn, "Request dispatched to peer");
        Ok(())
    }

    /// Ask the peer to reload, unless a refresh is already outstanding.
    pub async fn request_refresh(&self) {
        if self.verification_pending.swap(true, Ordering::SeqCst) {
            debug!("Verification refresh already pending, not sending another");
            return;
        }
        if let Err(e) = self.send_command(PeerCommand::Refresh).await {
            warn!("Could not request verification refresh: {e}");
            self.verification_pending.store(false, Ordering::SeqCst);
        }
    }

    /// Hook for the formatters: spawns [`request_refresh`](Self::request_refresh).
    pub fn refresh_hook(&self) -> RefreshHook {
        let tunnel = self.clone();
        Arc::new(move || {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.request_refresh().await });
        })
    }
}
