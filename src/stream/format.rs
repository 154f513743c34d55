//! OpenAI-compatible rendering of a channel's event sequence.
//!
//! Incremental mode writes one SSE chunk per event and always finishes with a
//! terminal chunk and `data: [DONE]`, even on failure: once the 200 status is
//! on the wire an error can only be reported as content. Aggregate mode
//! buffers everything and returns either the full completion body or a
//! [`BridgeError`] carrying the classified upstream failure.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use super::Event;
use crate::error::{BridgeError, UpstreamError, UpstreamErrorKind};
use crate::tunnel::registry::short_id;
use crate::tunnel::DONE_SENTINEL;

/// Finish reason the upstream uses when it cut the reply short.
pub const CONTENT_FILTER_REASON: &str = "content-filter";

/// Appended to the content when the reply was cut short upstream.
pub const CONTENT_FILTER_NOTICE: &str = "\n\nThe response was terminated, most likely by \
     upstream moderation or because the context limit was exceeded.";

/// Invoked when a peer error turns out to be a verification challenge.
pub type RefreshHook = Arc<dyn Fn() + Send + Sync>;

/// Identity shared by every chunk of one completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub id: String,
    pub model: String,
    pub created: u64,
    /// Channel request id, for log lines only.
    pub request_id: String,
}

impl Completion {
    pub fn new(model: &str, request_id: &str) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            model: model.to_string(),
            created,
            request_id: request_id.to_string(),
        }
    }

    pub fn chunk(&self, content: Option<&str>, finish_reason: Option<&str>) -> Value {
        let delta = match content {
            Some(text) if !text.is_empty() => json!({ "content": text }),
            _ => json!({}),
        };
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }

    pub fn body(&self, content: &str, finish_reason: &str) -> Value {
        let completion_tokens = content.len() / 4;
        json!({
            "id": self.id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": finish_reason,
            }],
            "usage": {
                "prompt_tokens": 0,
                "completion_tokens": completion_tokens,
                "total_tokens": completion_tokens,
            },
        })
    }
}

/// Classify a raw peer error, firing the refresh hook for challenges.
pub fn classify_error(raw: &str, request_id: &str, on_challenge: &RefreshHook) -> UpstreamError {
    let err = UpstreamError::from_raw(raw);
    match err.kind {
        UpstreamErrorKind::AttachmentTooLarge => {
            warn!(request_id = %short_id(request_id), "Attachment rejected as too large");
        }
        UpstreamErrorKind::VerificationChallenge => {
            warn!(
                request_id = %short_id(request_id),
                "Verification challenge detected, requesting peer refresh"
            );
            on_challenge();
        }
        UpstreamErrorKind::Other => {}
    }
    err
}

/// SSE `data` payloads for one event, in order.
pub fn incremental_payloads(
    completion: &Completion,
    event: &Event,
    on_challenge: &RefreshHook,
) -> Vec<String> {
    let chunks = match event {
        Event::Content(text) => return vec![completion.chunk(Some(text), None).to_string()],
        Event::Finish(reason) => {
            let mut chunks = Vec::with_capacity(3);
            if reason == CONTENT_FILTER_REASON {
                chunks.push(completion.chunk(Some(CONTENT_FILTER_NOTICE), None));
            }
            chunks.push(completion.chunk(None, Some(reason)));
            debug!(request_id = %short_id(&completion.request_id), "Stream finished: {reason}");
            chunks
        }
        Event::Error(raw) => {
            error!(request_id = %short_id(&completion.request_id), "Error in stream: {raw}");
            let err = classify_error(raw, &completion.request_id, on_challenge);
            let text = format!("\n\n[Bridge Error]: {}", err.message);
            vec![
                completion.chunk(Some(&text), None),
                completion.chunk(None, Some("stop")),
            ]
        }
    };
    chunks
        .iter()
        .map(Value::to_string)
        .chain(std::iter::once(DONE_SENTINEL.to_string()))
        .collect()
}

/// Render events as a server-sent event stream.
pub fn incremental<S>(
    events: S,
    completion: Completion,
    on_challenge: RefreshHook,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>>
where
    S: Stream<Item = Event> + Send + 'static,
{
    let stream = events.flat_map(move |event| {
        let payloads = incremental_payloads(&completion, &event, &on_challenge);
        stream::iter(
            payloads
                .into_iter()
                .map(|data| Ok::<_, Infallible>(SseEvent::default().data(data))),
        )
    });
    Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
}

/// Collect events into one completion body. No partial body is ever returned.
pub async fn aggregate<S>(
    events: S,
    completion: Completion,
    on_challenge: RefreshHook,
) -> Result<Value, BridgeError>
where
    S: Stream<Item = Event>,
{
    let mut events = std::pin::pin!(events);
    let mut content = String::new();
    while let Some(event) = events.next().await {
        match event {
            Event::Content(text) => content.push_str(&text),
            Event::Finish(reason) => {
                if reason == CONTENT_FILTER_REASON {
                    content.push_str(CONTENT_FILTER_NOTICE);
                }
                debug!(
                    request_id = %short_id(&completion.request_id),
                    chars = content.len(),
                    "Aggregated response complete"
                );
                return Ok(completion.body(&content, &reason));
            }
            Event::Error(raw) => {
                error!(
                    request_id = %short_id(&completion.request_id),
                    "Error while aggregating: {raw}"
                );
                let err = classify_error(&raw, &completion.request_id, &on_challenge);
                return Err(BridgeError::Upstream(err));
            }
        }
    }
    Err(BridgeError::Internal(
        "event stream ended without a terminal event".to_string(),
    ))
}
