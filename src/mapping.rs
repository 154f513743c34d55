//! Model name to session routing.
//!
//! Each `[model_endpoints]` entry is either a single mapping or a list of
//! mappings. A list spreads traffic across several upstream sessions: one is
//! picked uniformly at random per request.
//!
//! ```toml
//! [model_endpoints]
//! "model-a" = { session_id = "s1", message_id = "m1", mode = "direct_chat" }
//! "model-b" = [
//!   { session_id = "s2", message_id = "m2", mode = "battle", battle_target = "A" },
//!   { session_id = "s3", message_id = "m3", mode = "battle", battle_target = "B" },
//! ]
//! ```

use std::collections::HashMap;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    DirectChat,
    Battle,
}

impl ChatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectChat => "direct_chat",
            Self::Battle => "battle",
        }
    }
}

/// One upstream session a model can be routed to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointMapping {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub message_id: String,
    pub mode: Option<ChatMode>,
    pub battle_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EndpointEntry {
    One(EndpointMapping),
    Many(Vec<EndpointMapping>),
}

impl EndpointEntry {
    fn choose(&self) -> Option<&EndpointMapping> {
        match self {
            Self::One(mapping) => Some(mapping),
            Self::Many(list) => list.choose(&mut rand::thread_rng()),
        }
    }
}

/// Resolved routing for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRoute {
    pub session_id: String,
    pub message_id: String,
    pub mode: Option<ChatMode>,
    pub battle_target: Option<String>,
}

impl SessionRoute {
    fn is_usable(&self) -> bool {
        !self.session_id.trim().is_empty() && !self.message_id.trim().is_empty()
    }
}

/// Global fallback ids, updated at runtime by the capture listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDefaults {
    pub session_id: String,
    pub message_id: String,
}

/// The `[model_endpoints]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ModelEndpoints(HashMap<String, EndpointEntry>);

impl ModelEndpoints {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mapping configured for `model`, picking randomly among several.
    pub fn lookup(&self, model: &str) -> Option<SessionRoute> {
        let entry = self.0.get(model)?;
        if matches!(entry, EndpointEntry::Many(_)) {
            debug!(model, "Choosing randomly among mapped sessions");
        }
        let mapping = entry.choose()?;
        Some(SessionRoute {
            session_id: mapping.session_id.clone(),
            message_id: mapping.message_id.clone(),
            mode: mapping.mode,
            battle_target: mapping.battle_target.clone(),
        })
    }

    /// Route for `model`: its own mapping when usable, else the global
    /// defaults. Fails when neither yields both ids.
    pub fn resolve(
        &self,
        model: &str,
        defaults: &SessionDefaults,
    ) -> Result<SessionRoute, BridgeError> {
        if let Some(route) = self.lookup(model).filter(SessionRoute::is_usable) {
            info!(
                model,
                session = %tail(&route.session_id),
                mode = route.mode.map_or("default", ChatMode::as_str),
                "Using mapped session"
            );
            return Ok(route);
        }
        let fallback = SessionRoute {
            session_id: defaults.session_id.clone(),
            message_id: defaults.message_id.clone(),
            mode: None,
            battle_target: None,
        };
        if !fallback.is_usable() {
            return Err(BridgeError::BadRequest(format!(
                "no session mapping for model '{model}' and no default session configured"
            )));
        }
        debug!(model, session = %tail(&fallback.session_id), "Using default session");
        Ok(fallback)
    }
}

/// Last 6 characters of an id, for log lines.
fn tail(id: &str) -> &str {
    let start = id.len().saturating_sub(6);
    id.get(start..).unwrap_or(id)
}
