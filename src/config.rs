//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `LMBRIDGE_API_KEY`, `LMBRIDGE_LISTEN`,
//!    `LMBRIDGE_SESSION_ID`, `LMBRIDGE_MESSAGE_ID`
//! 2. **Config file**: path via `--config <path>`, or `lmbridge.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:5102"
//!
//! [auth]
//! api_key = ""                        # empty = no authentication
//!
//! [bridge]
//! stream_response_timeout_secs = 360
//! session_id = ""
//! message_id = ""
//! battle_target = "A"
//! tavern_mode = false
//! bypass_sensitivity = false
//! models_file = "available_models.json"
//!
//! [capture]
//! listen = "127.0.0.1:5103"
//! timeout_secs = 20
//!
//! [logging]
//! level = "info"
//!
//! [model_endpoints]
//! "model-a" = { session_id = "...", message_id = "..." }
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::mapping::ModelEndpoints;

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "lmbridge.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub model_endpoints: ModelEndpoints,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:5102`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Shared bearer token. Empty disables authentication.
    #[serde(default)]
    pub api_key: String,
}

impl AuthConfig {
    pub fn enabled(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Request routing and payload shaping.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Idle timeout per request channel, in seconds (default 360).
    #[serde(default = "default_stream_timeout")]
    pub stream_response_timeout_secs: u64,
    /// Default session id when a model has no mapping.
    #[serde(default)]
    pub session_id: String,
    /// Default message id when a model has no mapping.
    #[serde(default)]
    pub message_id: String,
    /// Participant position for non-system messages, `A` or `B` (default `A`).
    #[serde(default = "default_battle_target")]
    pub battle_target: String,
    #[serde(default)]
    pub tavern_mode: bool,
    #[serde(default)]
    pub bypass_sensitivity: bool,
    /// Model catalog file (default `available_models.json`).
    #[serde(default = "default_models_file")]
    pub models_file: String,
}

/// One-shot identifier capture listener.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Address for the ephemeral `/update` listener (default `127.0.0.1:5103`).
    #[serde(default = "default_capture_listen")]
    pub listen: String,
    /// Seconds to wait for the browser to post ids (default 20).
    #[serde(default = "default_capture_timeout")]
    pub timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:5102".to_string()
}
fn default_stream_timeout() -> u64 {
    360
}
fn default_battle_target() -> String {
    "A".to_string()
}
fn default_models_file() -> String {
    "available_models.json".to_string()
}
fn default_capture_listen() -> String {
    "127.0.0.1:5103".to_string()
}
fn default_capture_timeout() -> u64 {
    20
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stream_response_timeout_secs: default_stream_timeout(),
            session_id: String::new(),
            message_id: String::new(),
            battle_target: default_battle_target(),
            tavern_mode: false,
            bypass_sensitivity: false,
            models_file: default_models_file(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            listen: default_capture_listen(),
            timeout_secs: default_capture_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `lmbridge.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("LMBRIDGE_API_KEY") {
            self.auth.api_key = key;
        }
        if let Some(listen) = var("LMBRIDGE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(id) = var("LMBRIDGE_SESSION_ID") {
            self.bridge.session_id = id;
        }
        if let Some(id) = var("LMBRIDGE_MESSAGE_ID") {
            self.bridge.message_id = id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = Config::default();
        assert_eq!(config.server.listen, "127.0.0.1:5102");
        assert_eq!(config.bridge.stream_response_timeout_secs, 360);
        assert_eq!(config.bridge.battle_target, "A");
        assert_eq!(config.capture.timeout_secs, 20);
        assert!(!config.auth.enabled());
        assert!(config.model_endpoints.is_empty());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::parse(
            "test.toml",
            r#"
            [auth]
            api_key = "secret"

            [bridge]
            tavern_mode = true

            [model_endpoints]
            "m" = { session_id = "s", message_id = "x" }
            "#,
        )
        .unwrap();
        assert!(config.auth.enabled());
        assert!(config.bridge.tavern_mode);
        assert_eq!(config.bridge.models_file, "available_models.json");
        assert_eq!(config.model_endpoints.len(), 1);
    }

    #[test]
    fn invalid_file_is_parse_error() {
        let err = Config::parse("bad.toml", "[server\nlisten = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn env_overrides_file() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "LMBRIDGE_API_KEY" => Some("k".into()),
            "LMBRIDGE_SESSION_ID" => Some("sid".into()),
            _ => None,
        });
        assert_eq!(config.auth.api_key, "k");
        assert_eq!(config.bridge.session_id, "sid");
        assert_eq!(config.server.listen, "127.0.0.1:5102");
    }

    #[test]
    fn missing_explicit_file_is_read_error() {
        let err = Config::load(Some("/nonexistent/lmbridge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
