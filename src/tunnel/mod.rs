//! Single-peer tunnel to the browser automation agent.
//!
//! - [`registry`]: per-request channels keyed by `request_id`.
//! - [`peer`]: the one live WebSocket connection, its writer task and
//!   receive loop.
//!
//! ## Wire format
//!
//! Bridge → peer (JSON text frames):
//!
//! | Message                                                   | Purpose                       |
//! |-----------------------------------------------------------|-------------------------------|
//! | `{"command": "refresh"}`                                  | reload the page               |
//! | `{"command": "activate_id_capture"}`                      | arm session-id capture        |
//! | `{"command": "send_page_source"}`                         | post page HTML back to us     |
//! | `{"request_id", "payload": {message_templates, ...}}`     | dispatch one chat request     |
//!
//! Peer → bridge: `{"request_id", "data"}` where `data` is a text fragment,
//! an array of fragments, an `{"error": ...}` object, or the string `"[DONE]"`.

pub mod peer;
pub mod registry;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::templates::MessageTemplate;

/// End-of-stream sentinel sent by the peer as `data`.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Error text delivered to every open channel when the peer goes away.
pub const PEER_DISCONNECTED: &str = "peer disconnected";

/// Out-of-band commands the bridge can send to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PeerCommand {
    Refresh,
    ActivateIdCapture,
    SendPageSource,
}

/// Outbound chat dispatch, correlated to replies by `request_id`.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub request_id: String,
    pub payload: ChatPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatPayload {
    pub message_templates: Vec<MessageTemplate>,
    pub target_model_id: Option<String>,
    pub session_id: String,
    pub message_id: String,
}

/// Raw message pushed by the peer. Both fields are required for routing.
#[derive(Debug, Deserialize)]
pub struct PeerMessage {
    pub request_id: Option<String>,
    pub data: Option<Value>,
}

/// One unit of peer output for a single channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Text to append to the decoder buffer (arrays are already flattened).
    Text(String),
    /// Structured `{"error": ...}` object; the payload is the `error` value.
    Error(Value),
    /// The `[DONE]` sentinel.
    Done,
}

impl Frame {
    /// Interpret a peer `data` value.
    pub fn from_data(data: Value) -> Self {
        match data {
            Value::String(s) if s == DONE_SENTINEL => Self::Done,
            Value::String(s) => Self::Text(s),
            Value::Array(items) => Self::Text(items.iter().map(fragment_text).collect()),
            Value::Object(mut map) if map.contains_key("error") => {
                Self::Error(map.remove("error").unwrap_or(Value::Null))
            }
            other => Self::Text(other.to_string()),
        }
    }

    /// Synthesized error frame used when the peer goes away.
    pub fn error(message: &str) -> Self {
        Self::Error(Value::String(message.to_string()))
    }
}

fn fragment_text(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
