//! Turning a channel's frames into rendered responses.
//!
//! - [`decoder`]: pure incremental tokenizer, frames in, [`Event`]s out.
//! - [`ChannelEvents`]: drains one channel's queue through a decoder, bounded
//!   by the idle timeout.
//! - [`format`]: renders the event sequence as SSE chunks or one JSON body.

pub mod decoder;
pub mod format;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::Stream;
use tracing::{debug, info, warn};

use crate::tunnel::registry::{short_id, Channel};
use crate::tunnel::{Frame, PEER_DISCONNECTED};
use decoder::StreamDecoder;

/// A decoded unit of a reply. Exactly one terminal event (`Finish` or
/// `Error`) ends every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Content(String),
    Finish(String),
    Error(String),
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish(_) | Self::Error(_))
    }
}

/// Event source for one request: owns the channel and its decoder.
///
/// The channel is closed as soon as the terminal event is handed out, and in
/// any case when this value is dropped.
pub struct ChannelEvents {
    channel: Option<Channel>,
    request_id: String,
    decoder: StreamDecoder,
    pending: VecDeque<Event>,
    idle_timeout: Duration,
    verification_pending: Arc<AtomicBool>,
}

impl ChannelEvents {
    pub fn new(
        channel: Channel,
        idle_timeout: Duration,
        verification_pending: Arc<AtomicBool>,
    ) -> Self {
        let decoder = StreamDecoder::new()
            .with_pending_verification(verification_pending.load(Ordering::Relaxed));
        Self {
            request_id: channel.request_id().to_string(),
            channel: Some(channel),
            decoder,
            pending: VecDeque::new(),
            idle_timeout,
            verification_pending,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next event, or `None` after the terminal event was returned.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.is_terminal() {
                    self.finish();
                }
                return Some(event);
            }
            if self.decoder.is_terminal() {
                return None;
            }
            let channel = self.channel.as_mut()?;
            let events = match tokio::time::timeout(self.idle_timeout, channel.recv()).await {
                Ok(Some(frame)) => self.decoder.feed(frame),
                Ok(None) => self.decoder.feed(Frame::error(PEER_DISCONNECTED)),
                Err(_) => {
                    let secs = self.idle_timeout.as_secs();
                    warn!(
                        request_id = %short_id(&self.request_id),
                        "No data from peer for {secs}s"
                    );
                    self.decoder.timeout(secs).into_iter().collect()
                }
            };
            self.pending.extend(events);
        }
    }

    fn finish(&mut self) {
        if self.decoder.verification_cleared() {
            info!(
                request_id = %short_id(&self.request_id),
                "Request completed, clearing verification-refresh state"
            );
            self.verification_pending.store(false, Ordering::Relaxed);
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        debug!(request_id = %short_id(&self.request_id), "Event stream finished");
    }

    /// Adapt into a `Stream` of events.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send {
        futures::stream::unfold(self, |mut events| async move {
            let event = events.next().await?;
            Some((event, events))
        })
    }
}
