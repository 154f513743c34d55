//! Incremental tokenizer for the peer's streaming text protocol.
//!
//! The peer emits loosely framed lines such as
//!
//! ```text
//! a0:"Hello"
//! a0:" world"
//! a2:[{"type":"image","image":"https://..."}]
//! ad:{"finishReason":"stop"}
//! ```
//!
//! where the leading `a`/`b` is the participant role (two roles interleave in
//! battle mode and are merged here). Fragments can split anywhere, so the
//! decoder keeps one buffer and walks it left to right once per frame:
//!
//! - complete tokens are decoded into [`Event`]s and the consumed prefix is
//!   dropped from the buffer;
//! - complete but malformed tokens are skipped;
//! - an incomplete token at the tail is held back until more data arrives;
//! - text that cannot start a token is discarded, except for a short tail that
//!   might be the beginning of one.
//!
//! Structured `{"error": ...}` objects and interstitial-challenge markers are
//! recognised in the same pass, in buffer order, so the event sequence does not
//! depend on how the input was split into frames.

use serde_json::Value;
use tracing::warn;

use super::Event;
use crate::error::{BridgeError, CHALLENGE_MARKERS};
use crate::tunnel::Frame;

/// Length of a token prefix such as `a0:`.
const PREFIX_LEN: usize = 3;

/// Bytes kept at the end of the buffer when no token is pending. Longer than
/// any challenge marker and any `{ "error"` opener.
const TAIL_HOLD: usize = 64;

/// Reason used when `[DONE]` arrives without an explicit finish token.
const DEFAULT_FINISH_REASON: &str = "stop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderPhase {
    Accumulating,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Text,
    Image,
    Finish,
}

#[derive(Debug, Clone, Copy)]
enum Hit {
    Token(usize, TokenKind),
    ErrorObject(usize),
    Challenge(&'static str),
}

enum Scan {
    /// Token spans `..end`; `event` is what it decoded to, if anything.
    Complete { end: usize, event: Option<Event> },
    /// Token is complete up to `end` but its payload did not parse.
    Invalid { end: usize },
    Incomplete,
}

/// Decoder state for one channel. Never shared between channels.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: String,
    has_emitted_content: bool,
    pending_verification: bool,
    verification_cleared: bool,
    finish_reason: Option<String>,
    phase: DecoderPhase,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            has_emitted_content: false,
            pending_verification: false,
            verification_cleared: false,
            finish_reason: None,
            phase: DecoderPhase::Accumulating,
        }
    }

    /// Start with the verification-refresh flag set, as when a refresh was
    /// requested from the peer before this channel opened.
    #[must_use]
    pub fn with_pending_verification(mut self, pending: bool) -> Self {
        self.pending_verification = pending;
        self
    }

    pub fn phase(&self) -> DecoderPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase != DecoderPhase::Accumulating
    }

    pub fn has_emitted_content(&self) -> bool {
        self.has_emitted_content
    }

    pub fn pending_verification(&self) -> bool {
        self.pending_verification
    }

    /// True when a successful completion cleared a pending verification flag.
    pub fn verification_cleared(&self) -> bool {
        self.verification_cleared
    }

    /// Bytes currently held back waiting for more input.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Consume one frame and return the events it completes, in order.
    /// After a terminal event every further frame yields nothing.
    pub fn feed(&mut self, frame: Frame) -> Vec<Event> {
        let mut events = Vec::new();
        if self.is_terminal() {
            return events;
        }
        match frame {
            Frame::Error(value) => events.push(self.fail(error_message(&value))),
            Frame::Done => events.push(self.finish()),
            Frame::Text(text) => {
                self.buffer.push_str(&text);
                self.drain(&mut events);
            }
        }
        events
    }

    /// Terminate with a timeout error if still waiting for data.
    pub fn timeout(&mut self, secs: u64) -> Option<Event> {
        if self.is_terminal() {
            return None;
        }
        Some(self.fail(BridgeError::UpstreamTimeout(secs).to_string()))
    }

    fn fail(&mut self, message: String) -> Event {
        self.phase = DecoderPhase::Failed;
        self.buffer.clear();
        Event::Error(message)
    }

    fn finish(&mut self) -> Event {
        if self.has_emitted_content && self.pending_verification {
            self.pending_verification = false;
            self.verification_cleared = true;
        }
        self.phase = DecoderPhase::Done;
        self.buffer.clear();
        Event::Finish(
            self.finish_reason
                .take()
                .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string()),
        )
    }

    /// Decode everything complete in the buffer, then drop the consumed
    /// prefix.
    fn drain(&mut self, events: &mut Vec<Event>) {
        let mut pos = 0;
        let keep_from = loop {
            let Some(hit) = next_hit(self.buffer.as_bytes(), pos) else {
                break tail_boundary(&self.buffer, pos);
            };
            match hit {
                Hit::Challenge(marker) => {
                    events.push(
                        self.fail(format!("verification challenge page received: {marker}")),
                    );
                    return;
                }
                Hit::ErrorObject(start) => match balanced_end(self.buffer.as_bytes(), start) {
                    None => break start,
                    Some(end) => {
                        let parsed = serde_json::from_str::<Value>(&self.buffer[start..end]);
                        match parsed {
                            Ok(Value::Object(map)) if map.contains_key("error") => {
                                let message = error_message(&map["error"]);
                                events.push(self.fail(message));
                                return;
                            }
                            _ => pos = start + 1,
                        }
                    }
                },
                Hit::Token(start, kind) => match self.scan_token(start, kind) {
                    Scan::Incomplete => break start,
                    Scan::Invalid { end } => pos = end,
                    Scan::Complete { end, event } => {
                        if let Some(event) = event {
                            events.push(event);
                        }
                        pos = end;
                    }
                },
            }
        };
        self.buffer.drain(..keep_from);
    }

    fn scan_token(&mut self, start: usize, kind: TokenKind) -> Scan {
        let bytes = self.buffer.as_bytes();
        let body = start + PREFIX_LEN;
        let Some(&opener) = bytes.get(body) else {
            return Scan::Incomplete;
        };
        match kind {
            TokenKind::Text => {
                if opener != b'"' {
                    return Scan::Invalid { end: body };
                }
                let Some(end) = string_end(bytes, body) else {
                    return Scan::Incomplete;
                };
                match serde_json::from_str::<String>(&self.buffer[body..end]) {
                    Ok(text) if text.is_empty() => Scan::Complete { end, event: None },
                    Ok(text) => {
                        self.has_emitted_content = true;
                        Scan::Complete {
                            end,
                            event: Some(Event::Content(text)),
                        }
                    }
                    Err(_) => Scan::Invalid { end },
                }
            }
            TokenKind::Image => {
                if opener != b'[' {
                    return Scan::Invalid { end: body };
                }
                let Some(end) = balanced_end(bytes, body) else {
                    return Scan::Incomplete;
                };
                match serde_json::from_str::<Vec<Value>>(&self.buffer[body..end]) {
                    Ok(items) => {
                        let event = items.first().and_then(image_markdown).map(|md| {
                            self.has_emitted_content = true;
                            Event::Content(md)
                        });
                        Scan::Complete { end, event }
                    }
                    Err(e) => {
                        warn!("Failed to parse image token: {e}");
                        Scan::Invalid { end }
                    }
                }
            }
            TokenKind::Finish => {
                if opener != b'{' {
                    return Scan::Invalid { end: body };
                }
                let Some(end) = balanced_end(bytes, body) else {
                    return Scan::Incomplete;
                };
                match serde_json::from_str::<Value>(&self.buffer[body..end]) {
                    Ok(value) if value.get("finishReason").is_some() => {
                        let reason = value["finishReason"]
                            .as_str()
                            .unwrap_or(DEFAULT_FINISH_REASON)
                            .to_string();
                        self.finish_reason = Some(reason);
                        Scan::Complete { end, event: None }
                    }
                    _ => Scan::Invalid { end },
                }
            }
        }
    }
}

/// Render the first image descriptor of an image token as markdown.
fn image_markdown(item: &Value) -> Option<String> {
    if item.get("type").and_then(Value::as_str) != Some("image") {
        return None;
    }
    let url = item.get("image")?;
    let url = url.as_str().map_or_else(|| url.to_string(), ToString::to_string);
    Some(format!("![Image]({url})"))
}

/// Message text carried by an `error` value.
pub fn error_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message") {
            Some(Value::String(s)) => s.clone(),
            _ => value.to_string(),
        },
        Value::Null => "unknown upstream error".to_string(),
        other => other.to_string(),
    }
}

/// First token, error object or challenge marker at or after `from`.
fn next_hit(bytes: &[u8], from: usize) -> Option<Hit> {
    (from..bytes.len()).find_map(|i| hit_at(bytes, i))
}

fn hit_at(bytes: &[u8], i: usize) -> Option<Hit> {
    match bytes[i] {
        b'a' | b'b' if bytes.get(i + 2) == Some(&b':') => {
            let kind = match bytes.get(i + 1) {
                Some(b'0') => TokenKind::Text,
                Some(b'2') => TokenKind::Image,
                Some(b'd') => TokenKind::Finish,
                _ => return None,
            };
            Some(Hit::Token(i, kind))
        }
        b'{' => {
            let rest = &bytes[i + 1..];
            let skip = rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
            rest[skip..]
                .starts_with(b"\"error\"")
                .then_some(Hit::ErrorObject(i))
        }
        _ => CHALLENGE_MARKERS
            .iter()
            .find(|m| {
                bytes
                    .get(i..i + m.len())
                    .is_some_and(|w| w.eq_ignore_ascii_case(m.as_bytes()))
            })
            .map(|m| Hit::Challenge(*m)),
    }
}

/// End (exclusive) of the JSON string literal whose opening quote is at `open`.
fn string_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// End (exclusive) of the bracketed JSON value opening at `open`. Brackets
/// inside string literals are ignored.
fn balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i = string_end(bytes, i)?;
                continue;
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Where to cut the buffer when nothing is pending: keep a short tail that
/// might start a token or marker, but never anything before `pos`.
fn tail_boundary(buffer: &str, pos: usize) -> usize {
    let mut cut = pos.max(buffer.len().saturating_sub(TAIL_HOLD));
    if let Some(open) = pending_error_opener(buffer.as_bytes(), pos) {
        cut = cut.min(open);
    }
    while !buffer.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

/// Trailing `{` that whitespace and a prefix of `"error"` could still turn
/// into an error object, however much whitespace follows it.
fn pending_error_opener(bytes: &[u8], from: usize) -> Option<usize> {
    const ERROR_KEY: &[u8] = b"\"error\"";
    let open = from + bytes[from..].iter().rposition(|&b| b == b'{')?;
    let rest = &bytes[open + 1..];
    let skip = rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
    ERROR_KEY.starts_with(&rest[skip..]).then_some(open)
}
