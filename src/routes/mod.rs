//! HTTP route handlers and the router that wires them together.
//!
//! Public: health, model list, the peer WebSocket and the page-source upload
//! the peer answers `send_page_source` with (the userscript holds no key).
//! The chat endpoint checks the bearer key itself, after the body parses. The
//! operator triggers under `/internal` sit behind
//! [`crate::auth::require_api_key`].

pub mod chat;
pub mod control;
pub mod health;
pub mod models;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::ws;
use crate::AppState;

/// Page sources posted by the peer routinely exceed axum's 2 MB default.
const PAGE_SOURCE_LIMIT: usize = 64 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let update_models = post(models::update_models).layer(DefaultBodyLimit::max(PAGE_SOURCE_LIMIT));
    let public_routes = Router::new()
        .route("/health", get(health::health))
        .route("/models", get(models::list_models))
        .route("/v1/models", get(models::list_models))
        .route("/chat/completions", post(chat::chat_completions))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/ws", get(ws::peer_upgrade))
        .route("/internal/update_models", update_models.clone())
        .route("/internal/update_available_models", update_models);

    let internal_routes = Router::new()
        .route("/internal/refresh", post(control::refresh))
        .route("/internal/request_page_source", post(control::request_page_source))
        .route("/internal/capture_ids", post(control::capture_ids))
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(internal_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::catalog::ModelCatalog;
    use crate::config::Config;

    fn app(api_key: &str) -> Router {
        let mut config = Config::default();
        config.auth.api_key = api_key.to_string();
        config.bridge.session_id = "sess".to_string();
        config.bridge.message_id = "msg".to_string();
        router(AppState::new(config, ModelCatalog::empty("unused.json")))
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn chat(body: &str, auth: Option<&str>) -> Request<Body> {
        let mut req = Request::post("/v1/chat/completions").header("content-type", "application/json");
        if let Some(key) = auth {
            req = req.header("authorization", format!("Bearer {key}"));
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = call(app("secret"), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["peer"]["connected"], false);
        assert_eq!(body["peer"]["open_channels"], 0);
    }

    #[tokio::test]
    async fn models_list_is_empty_without_catalog() {
        let req = Request::get("/v1/models").body(Body::empty()).unwrap();
        let (status, body) = call(app(""), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"object": "list", "data": []}));
    }

    #[tokio::test]
    async fn malformed_json_is_rejected_before_auth() {
        let (status, body) = call(app("secret"), chat("{not json", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn chat_requires_bearer_key() {
        let body = r#"{"model":"m","messages":[]}"#;
        let (status, _) = call(app("secret"), chat(body, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(app("secret"), chat(body, Some("wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_model_is_bad_request() {
        let (status, _) = call(app(""), chat(r#"{"messages":[]}"#, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_without_peer_is_unavailable() {
        let state = {
            let mut config = Config::default();
            config.bridge.session_id = "sess".to_string();
            config.bridge.message_id = "msg".to_string();
            AppState::new(config, ModelCatalog::empty("unused.json"))
        };
        let body = r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#;
        let (status, _) = call(router(state.clone()), chat(body, None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.tunnel.registry().is_empty());
    }

    #[tokio::test]
    async fn missing_session_ids_is_bad_request() {
        let app = router(AppState::new(Config::default(), ModelCatalog::empty("unused.json")));
        let body = r#"{"model":"m","messages":[]}"#;
        let (status, body) = call(app, chat(body, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn internal_routes_require_key() {
        let req = Request::post("/internal/refresh").body(Body::empty()).unwrap();
        let (status, _) = call(app("secret"), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::post("/internal/refresh")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(app("secret"), req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn update_models_rejects_page_without_models() {
        let req = Request::post("/internal/update_models")
            .body(Body::from("<html>nothing here</html>"))
            .unwrap();
        let (status, _) = call(app(""), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn peer_page_upload_needs_no_key() {
        let path = std::env::temp_dir().join(format!("lmbridge-routes-{}.json", uuid::Uuid::new_v4()));
        let mut config = Config::default();
        config.auth.api_key = "secret".to_string();
        let state = AppState::new(config, ModelCatalog::empty(&path));
        let model = r#"{"id":"0a1b-2c","publicName":"alpha","capabilities":{"outputCapabilities":{"text":true}}}"#;
        let page = format!("<script>push([1,\"{}\"])</script>", model.replace('"', r#"\""#));

        for route in ["/internal/update_models", "/internal/update_available_models"] {
            let req = Request::post(route).body(Body::from(page.clone())).unwrap();
            let (status, body) = call(router(state.clone()), req).await;
            assert_eq!(status, StatusCode::OK, "{route}");
            assert_eq!(body["count"], 1);
        }
        assert_eq!(state.catalog.id_for("alpha").await.as_deref(), Some("0a1b-2c"));
        let _ = std::fs::remove_file(&path);

        // The operator triggers stay guarded.
        let req = Request::post("/internal/request_page_source").body(Body::empty()).unwrap();
        let (status, _) = call(router(state), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
