//! `POST /v1/chat/completions`: the gateway from OpenAI-style requests to the
//! peer tunnel.
//!
//! Checks run in order: JSON body, bearer key, `model`, session routing, peer
//! availability. Only then is the reply rendered, incrementally when
//! `stream` is set in the body or query string, otherwise as one JSON body.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::info;

use crate::auth;
use crate::error::BridgeError;
use crate::stream::{format, format::Completion, ChannelEvents};
use crate::templates::{build_templates, ChatMessage, TemplateOptions};
use crate::tunnel::registry::short_id;
use crate::tunnel::ChatPayload;
use crate::AppState;

/// Request body. Fields other than these are accepted and ignored.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub stream: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatQuery {
    pub stream: Option<bool>,
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, BridgeError> {
    let request: ChatRequest = serde_json::from_slice(&body)
        .map_err(|e| BridgeError::BadRequest(format!("invalid JSON body: {e}")))?;

    auth::authorize(&headers, &state.config.auth.api_key)?;

    let model = request
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| BridgeError::BadRequest("'model' is required".to_string()))?
        .to_string();

    let route = {
        let defaults = state.defaults.read().await;
        state.config.model_endpoints.resolve(&model, &defaults)?
    };

    let bridge = &state.config.bridge;
    let options = TemplateOptions {
        tavern_mode: bridge.tavern_mode,
        bypass_sensitivity: bridge.bypass_sensitivity,
        battle_target: route
            .battle_target
            .clone()
            .unwrap_or_else(|| bridge.battle_target.clone()),
    };
    let payload = ChatPayload {
        message_templates: build_templates(&request.messages, &options),
        target_model_id: state.catalog.id_for(&model).await,
        session_id: route.session_id,
        message_id: route.message_id,
    };

    let channel = state.tunnel.registry().open();
    state.tunnel.dispatch(&channel, payload).await?;

    let stream = query.stream.or(request.stream).unwrap_or(false);
    info!(
        request_id = %short_id(channel.request_id()),
        model = %model,
        stream,
        "Chat request dispatched"
    );

    let completion = Completion::new(&model, channel.request_id());
    let events = ChannelEvents::new(
        channel,
        Duration::from_secs(bridge.stream_response_timeout_secs),
        state.tunnel.verification_pending(),
    )
    .into_stream();
    let on_challenge = state.tunnel.refresh_hook();

    if stream {
        Ok(format::incremental(events, completion, on_challenge).into_response())
    } else {
        let body = format::aggregate(events, completion, on_challenge).await?;
        Ok(Json(body).into_response())
    }
}
