//! One-shot listener that captures session identifiers from the browser.
//!
//! After the peer receives `{"command": "activate_id_capture"}`, the userscript
//! posts `{"sessionId", "messageId"}` to `http://<capture.listen>/update` from
//! the page origin, hence the permissive CORS. The listener accepts the first
//! valid payload, or gives up after the timeout, and shuts down either way.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to start capture listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("no identifiers received within {0} seconds")]
    Timeout(u64),
    #[error("capture listener stopped before receiving identifiers")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedIds {
    pub session_id: String,
    pub message_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePayload {
    session_id: Option<String>,
    message_id: Option<String>,
}

type Slot = Arc<Mutex<Option<oneshot::Sender<CapturedIds>>>>;

/// A bound, not yet serving, capture listener.
pub struct CaptureListener {
    listener: TcpListener,
}

impl CaptureListener {
    pub async fn bind(addr: &str) -> Result<Self, CaptureError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CaptureError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Serve `/update` until one valid payload arrives or `timeout` elapses.
    pub async fn wait(self, timeout: Duration) -> Result<CapturedIds, CaptureError> {
        let (ids_tx, ids_rx) = oneshot::channel();
        let slot: Slot = Arc::new(Mutex::new(Some(ids_tx)));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::POST, Method::OPTIONS])
            .allow_headers([CONTENT_TYPE]);
        let app = Router::new()
            .route("/update", post(update).options(preflight))
            .layer(cors)
            .with_state(slot);

        if let Some(addr) = self.local_addr() {
            info!(%addr, timeout_secs = timeout.as_secs(), "Capture listener waiting on /update");
        }
        let server = tokio::spawn(async move {
            let shutdown = async {
                let _ = stop_rx.await;
            };
            if let Err(e) = axum::serve(self.listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("Capture listener error: {e}");
            }
        });

        let result = match tokio::time::timeout(timeout, ids_rx).await {
            Ok(Ok(ids)) => Ok(ids),
            Ok(Err(_)) => Err(CaptureError::Closed),
            Err(_) => Err(CaptureError::Timeout(timeout.as_secs())),
        };

        let _ = stop_tx.send(());
        if tokio::time::timeout(Duration::from_secs(2), server).await.is_err() {
            warn!("Capture listener did not stop in time");
        }
        match &result {
            Ok(ids) => info!(
                session = %tail(&ids.session_id),
                message = %tail(&ids.message_id),
                "Captured session identifiers"
            ),
            Err(e) => warn!("Identifier capture failed: {e}"),
        }
        result
    }
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn update(State(slot): State<Slot>, Json(payload): Json<UpdatePayload>) -> Response {
    let ids = match (payload.session_id, payload.message_id) {
        (Some(s), Some(m)) if !s.is_empty() && !m.is_empty() => CapturedIds {
            session_id: s,
            message_id: m,
        },
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Missing sessionId or messageId"})),
            )
                .into_response();
        }
    };
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(tx) = sender {
        let _ = tx.send(ids);
    }
    Json(json!({"status": "success"})).into_response()
}

fn tail(id: &str) -> &str {
    id.get(id.len().saturating_sub(6)..).unwrap_or(id)
}
