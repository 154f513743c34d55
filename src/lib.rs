#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! lmbridge library: the building blocks of the gateway binary.
//!
//! - `tunnel`: the single peer WebSocket and the per-request channel registry
//! - `stream`: decoding the peer's raw response text into events, and
//!   rendering those as SSE chunks or one aggregate body
//! - `templates`: OpenAI messages to the peer's message templates
//! - `mapping`: model name to upstream session routing
//! - `catalog`: model name to upstream model id, refreshed from page source
//! - `capture`: one-shot listener for session ids reported by the browser
//! - `routes`, `ws`: HTTP and WebSocket handlers
//! - `auth`, `config`, `error`, `state`: the ambient pieces

pub mod auth;
pub mod capture;
pub mod catalog;
pub mod config;
pub mod error;
pub mod mapping;
pub mod routes;
pub mod state;
pub mod stream;
pub mod templates;
pub mod tunnel;
pub mod ws;

pub use auth::ApiKey;
pub use catalog::ModelCatalog;
pub use config::Config;
pub use error::BridgeError;
pub use routes::router as build_router;
pub use state::AppState;
