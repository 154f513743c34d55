//! Operator triggers for the peer commands.
//!
//! - `POST /internal/refresh`: reload the peer page
//! - `POST /internal/request_page_source`: ask the peer to post its page HTML
//!   to `/internal/update_models`
//! - `POST /internal/capture_ids`: arm id capture and wait for the browser to
//!   report the session it is on; the result becomes the default session

use std::time::Duration;

use axum::{extract::State, Json};
use serde_json::{json, Value};
use tracing::info;

use crate::capture::{CaptureError, CaptureListener};
use crate::error::BridgeError;
use crate::mapping::SessionDefaults;
use crate::tunnel::PeerCommand;
use crate::AppState;

pub async fn refresh(State(state): State<AppState>) -> Result<Json<Value>, BridgeError> {
    state.tunnel.send_command(PeerCommand::Refresh).await?;
    Ok(Json(json!({ "status": "success", "command": "refresh" })))
}

pub async fn request_page_source(
    State(state): State<AppState>,
) -> Result<Json<Value>, BridgeError> {
    state.tunnel.send_command(PeerCommand::SendPageSource).await?;
    Ok(Json(json!({ "status": "success", "command": "send_page_source" })))
}

pub async fn capture_ids(State(state): State<AppState>) -> Result<Json<Value>, BridgeError> {
    if !state.tunnel.is_connected() {
        return Err(BridgeError::ServiceUnavailable);
    }
    let capture = &state.config.capture;
    let listener = CaptureListener::bind(&capture.listen)
        .await
        .map_err(|e| BridgeError::Internal(e.to_string()))?;
    state
        .tunnel
        .send_command(PeerCommand::ActivateIdCapture)
        .await?;

    let ids = listener
        .wait(Duration::from_secs(capture.timeout_secs))
        .await
        .map_err(|e| match e {
            CaptureError::Timeout(secs) => BridgeError::UpstreamTimeout(secs),
            other => BridgeError::Internal(other.to_string()),
        })?;

    *state.defaults.write().await = SessionDefaults {
        session_id: ids.session_id.clone(),
        message_id: ids.message_id.clone(),
    };
    info!("Default session updated from capture");
    Ok(Json(json!({
        "status": "success",
        "session_id": ids.session_id,
        "message_id": ids.message_id,
    })))
}
