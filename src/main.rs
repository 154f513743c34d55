#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # lmbridge
//!
//! OpenAI-compatible chat-completion gateway in front of a browser agent.
//!
//! One browser tab running the companion userscript connects to `/ws` and
//! performs the actual upstream requests. Every HTTP request becomes one
//! logical channel multiplexed over that single WebSocket, keyed by a
//! request id, so many requests can be in flight concurrently.
//!
//! ## API surface
//!
//! | Method | Path                                | Auth   | Description                       |
//! |--------|-------------------------------------|--------|-----------------------------------|
//! | GET    | `/health`                           | No     | Liveness and tunnel status        |
//! | GET    | `/v1/models`                        | No     | Model list from the catalog       |
//! | POST   | `/v1/chat/completions`              | Yes    | Chat completion, SSE or JSON      |
//! | GET    | `/ws`                               | No     | Peer WebSocket                    |
//! | POST   | `/internal/refresh`                 | Yes    | Reload the peer page              |
//! | POST   | `/internal/request_page_source`     | Yes    | Ask the peer for its page HTML    |
//! | POST   | `/internal/update_models`           | No     | Rebuild the catalog from HTML     |
//! | POST   | `/internal/capture_ids`             | Yes    | Capture default session ids       |
//!
//! `/models` and `/chat/completions` are served without the `/v1` prefix too.
//! Auth applies only when `[auth] api_key` is set.

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use lmbridge::{build_router, AppState, Config, ModelCatalog};

/// Chat-completion gateway multiplexed over one browser-agent WebSocket.
#[derive(Parser)]
#[command(name = "lmbridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            init_tracing("info");
            error!("{e}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.logging.level);

    info!("lmbridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.auth.enabled() {
        info!("API key authentication enabled");
    } else {
        warn!("No API key configured, chat and /internal endpoints are open");
    }
    if config.model_endpoints.is_empty() {
        info!("No model endpoint mappings, every model uses the default session");
    } else {
        info!("{} model endpoint mapping(s) loaded", config.model_endpoints.len());
    }

    let catalog = ModelCatalog::load(&config.bridge.models_file).await;
    let state = AppState::new(config, catalog);
    let app = build_router(state.clone());

    let listener = match TcpListener::bind(&state.config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", state.config.server.listen);
            std::process::exit(1);
        }
    };
    info!("Server ready, waiting for the browser peer on /ws");

    let tunnel = state.tunnel.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("Shutting down...");
        // Open responses wait on their channels; end them so the drain finishes.
        let failed = tunnel.registry().fail_all("server shutting down");
        if failed > 0 {
            info!(failed, "Failed in-flight requests");
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
    }
    info!("Goodbye");
}

fn init_tracing(default_level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
