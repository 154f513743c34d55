//! Per-request channel registry.
//!
//! Maps a generated `request_id` to the unbounded FIFO feeding that request's
//! decoder. The map is the one structure shared between the peer receive loop
//! and every in-flight request, so each operation takes the lock exactly once
//! and never holds it across an `.await`.
//!
//! A [`Channel`] is the request side of an entry. Dropping it closes the entry,
//! which gives cleanup on every exit path, including a client that disconnects
//! mid-stream and cancels the handler future.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Frame;

struct ChannelEntry {
    tx: mpsc::UnboundedSender<Frame>,
    created_at: Instant,
    /// Tunnel connection the request was dispatched over, once sent.
    connection: Option<u64>,
}

/// Shared map of open channels. Cheap to clone.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<Mutex<HashMap<String, ChannelEntry>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ChannelEntry>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh request id and its queue.
    pub fn open(&self) -> Channel {
        let (tx, rx) = mpsc::unbounded_channel();
        let created_at = Instant::now();
        let mut channels = self.lock();
        let mut request_id = uuid::Uuid::new_v4().to_string();
        while channels.contains_key(&request_id) {
            request_id = uuid::Uuid::new_v4().to_string();
        }
        channels.insert(
            request_id.clone(),
            ChannelEntry {
                tx,
                created_at,
                connection: None,
            },
        );
        drop(channels);
        debug!(request_id = %short_id(&request_id), "Channel opened");

        Channel {
            request_id,
            rx,
            registry: self.clone(),
        }
    }

    /// Append `frame` to the channel's queue. Unknown ids are logged and the
    /// frame is discarded. Returns whether the frame was delivered.
    pub fn route(&self, request_id: &str, frame: Frame) -> bool {
        let mut channels = self.lock();
        let Some(entry) = channels.get(request_id) else {
            drop(channels);
            warn!(request_id = %short_id(request_id), "Frame for unknown channel (dropped)");
            return false;
        };
        if entry.tx.send(frame).is_ok() {
            return true;
        }
        // Receiver is gone without having closed; reap the entry.
        channels.remove(request_id);
        false
    }

    /// Record which tunnel connection carried the request.
    pub fn bind(&self, request_id: &str, connection: u64) {
        if let Some(entry) = self.lock().get_mut(request_id) {
            entry.connection = Some(connection);
        }
    }

    /// Remove the entry. Closing an unknown or already-closed id is a no-op.
    pub fn close(&self, request_id: &str) -> bool {
        let removed = self.lock().remove(request_id);
        match removed {
            Some(entry) => {
                debug!(
                    request_id = %short_id(request_id),
                    age_ms = entry.created_at.elapsed().as_millis(),
                    "Channel closed"
                );
                true
            }
            None => false,
        }
    }

    /// Push one synthesized error frame into every open channel, then clear
    /// the registry. Both happen under a single lock acquisition.
    pub fn fail_all(&self, reason: &str) -> usize {
        let mut channels = self.lock();
        let count = channels.len();
        for (_, entry) in channels.drain() {
            let _ = entry.tx.send(Frame::error(reason));
        }
        count
    }

    /// Like [`fail_all`](Self::fail_all) but only for channels dispatched over
    /// `connection`. Used when a superseded connection finally ends.
    pub fn fail_connection(&self, connection: u64, reason: &str) -> usize {
        let mut channels = self.lock();
        let doomed: Vec<String> = channels
            .iter()
            .filter(|(_, e)| e.connection == Some(connection))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            if let Some(entry) = channels.remove(id) {
                let _ = entry.tx.send(Frame::error(reason));
            }
        }
        doomed.len()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Request-side handle of one registry entry. Closes the entry on drop.
pub struct Channel {
    request_id: String,
    rx: mpsc::UnboundedReceiver<Frame>,
    registry: ChannelRegistry,
}

impl Channel {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next frame, or `None` once the registry dropped the entry and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Close the registry entry now instead of waiting for drop.
    pub fn close(&self) {
        self.registry.close(&self.request_id);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.registry.close(&self.request_id);
    }
}

/// First 8 characters of an id, for log lines.
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
