//! Shared-secret bearer authentication.
//!
//! When `[auth] api_key` is non-empty, the chat endpoint and the operator
//! triggers under `/internal` require `Authorization: Bearer <key>`, matched
//! exactly. Health, model listing, the peer WebSocket and the peer's
//! page-source upload stay open. An empty key disables the check.

use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::BridgeError;

/// Extension type carrying the expected API key, injected into the router
/// layer so [`require_api_key`] can access it without touching `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Check the bearer token in `headers` against `api_key`.
///
/// Both a missing/malformed header and a wrong key are `Unauthorized`.
pub fn authorize(headers: &HeaderMap, api_key: &str) -> Result<(), BridgeError> {
    if api_key.is_empty() {
        return Ok(());
    }
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| {
            BridgeError::Unauthorized(
                "API key required: send it as 'Authorization: Bearer <key>'".to_string(),
            )
        })?;
    if !constant_time_eq(api_key.as_bytes(), provided.as_bytes()) {
        return Err(BridgeError::Unauthorized("invalid API key".to_string()));
    }
    Ok(())
}

/// Axum middleware form of [`authorize`]. The expected key comes from the
/// [`ApiKey`] extension.
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(api_key)) = request.extensions().get::<ApiKey>().cloned() else {
        return BridgeError::Internal("server configuration error".to_string()).into_response();
    };
    if let Err(e) = authorize(request.headers(), &api_key) {
        return e.into_response();
    }
    next.run(request).await
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}
