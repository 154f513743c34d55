//! Model catalog endpoints.
//!
//! - `GET /v1/models`: OpenAI model list built from the catalog
//! - `POST /internal/update_models`: replace the catalog from raw page source

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::error::BridgeError;
use crate::AppState;

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let data: Vec<Value> = state
        .catalog
        .list()
        .await
        .into_iter()
        .map(|m| {
            json!({
                "id": m.public_name,
                "object": "model",
                "created": created,
                "owned_by": "lmbridge",
                "type": m.kind,
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// Body is the page HTML as posted by the peer after `send_page_source`.
pub async fn update_models(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<Value>, BridgeError> {
    let count = state.catalog.update_from_page(&body).await?;
    Ok(Json(json!({ "status": "success", "count": count })))
}
