//! Error taxonomy for the gateway boundary.
//!
//! Every failure that reaches an HTTP handler is a [`BridgeError`]. Errors
//! reported by the peer mid-stream are classified into an [`UpstreamErrorKind`]
//! before they are rendered, which picks both the user-facing text and the
//! status code of an aggregate response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Markers that identify a human-verification interstitial page.
pub const CHALLENGE_MARKERS: [&str; 2] = [
    "<title>Just a moment...</title>",
    "Enable JavaScript and cookies to continue",
];

/// User-facing text for an oversized attachment.
pub const ATTACHMENT_TOO_LARGE_MESSAGE: &str =
    "Upload failed: the attachment exceeds the upstream size limit (usually about 5MB). \
     Compress it or use a smaller file.";

/// User-facing text after a verification refresh was requested from the peer.
pub const CHALLENGE_MESSAGE: &str =
    "Human-verification page detected. A verification refresh was attempted, please retry shortly.";

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("browser peer is not connected; open the target page and enable the userscript")]
    ServiceUnavailable,
    #[error("Response timed out after {0} seconds.")]
    UpstreamTimeout(u64),
    #[error("{0}")]
    Upstream(UpstreamError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(e) => e.kind.status(),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) | Self::BadRequest(_) => "invalid_request_error",
            Self::Upstream(_) => "bridge_error",
            Self::ServiceUnavailable | Self::UpstreamTimeout(_) | Self::Internal(_) => {
                "server_error"
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::ServiceUnavailable => "peer_unavailable",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Upstream(e) => e.kind.code(),
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Upstream(e) => format!("[Bridge Error]: {}", e.message),
            other => other.to_string(),
        };
        (
            self.status(),
            Json(json!({
                "error": {
                    "message": message,
                    "type": self.error_type(),
                    "code": self.code(),
                }
            })),
        )
            .into_response()
    }
}

/// Classification of an error text reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    AttachmentTooLarge,
    VerificationChallenge,
    Other,
}

impl UpstreamErrorKind {
    /// Classify raw peer error text. Size-limit wins over a challenge marker.
    pub fn classify(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();
        if raw.contains("413") || lower.contains("too large") {
            Self::AttachmentTooLarge
        } else if is_challenge_page(raw) || lower.contains("cloudflare") {
            Self::VerificationChallenge
        } else {
            Self::Other
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            Self::AttachmentTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::VerificationChallenge | Self::Other => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::AttachmentTooLarge => "attachment_too_large",
            Self::VerificationChallenge | Self::Other => "processing_error",
        }
    }
}

/// A classified peer error with its user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub message: String,
}

impl UpstreamError {
    /// Classify `raw` and substitute the user-facing text for known kinds.
    /// Unclassified messages pass through verbatim.
    pub fn from_raw(raw: &str) -> Self {
        let kind = UpstreamErrorKind::classify(raw);
        let message = match kind {
            UpstreamErrorKind::AttachmentTooLarge => ATTACHMENT_TOO_LARGE_MESSAGE.to_string(),
            UpstreamErrorKind::VerificationChallenge => CHALLENGE_MESSAGE.to_string(),
            UpstreamErrorKind::Other => raw.to_string(),
        };
        Self { kind, message }
    }
}

/// Case-insensitive check for any interstitial-challenge marker.
pub fn is_challenge_page(text: &str) -> bool {
    CHALLENGE_MARKERS
        .iter()
        .any(|m| find_ascii_case_insensitive(text.as_bytes(), m.as_bytes(), 0).is_some())
}

/// Byte offset of the first ASCII-case-insensitive occurrence of `needle`
/// at or after `from`.
pub fn find_ascii_case_insensitive(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() || from > haystack.len() - needle.len()
    {
        return None;
    }
    (from..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}
