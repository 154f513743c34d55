//! Model catalog: public model names, upstream ids and output kinds.
//!
//! Backed by a JSON file holding the raw model objects as scraped from the
//! upstream page. The page embeds them as escaped JSON inside script tags, so
//! extraction looks for `{\"id\":\"<uuid>\"` openers and brace-matches from
//! there.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::BridgeError;

/// Upper bound on the length of one embedded model object.
const OBJECT_SEARCH_LIMIT: usize = 10_000;

const ESCAPED_ID_OPENER: &str = r#"{\"id\":\""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Video,
    Image,
    Search,
    Text,
    Unknown,
}

impl ModelKind {
    /// First capability advertised in `capabilities.outputCapabilities`.
    fn from_model(model: &Value) -> Self {
        let caps = &model["capabilities"]["outputCapabilities"];
        let enabled = |key: &str| match caps.get(key) {
            None | Some(Value::Null | Value::Bool(false)) => false,
            Some(Value::Object(m)) => !m.is_empty(),
            Some(_) => true,
        };
        [
            ("video", Self::Video),
            ("image", Self::Image),
            ("search", Self::Search),
            ("text", Self::Text),
        ]
        .into_iter()
        .find(|(key, _)| enabled(*key))
        .map_or(Self::Unknown, |(_, kind)| kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub public_name: String,
    pub id: String,
    pub kind: ModelKind,
}

impl ModelInfo {
    fn from_value(model: &Value) -> Option<Self> {
        Some(Self {
            public_name: model.get("publicName")?.as_str()?.to_string(),
            id: model.get("id")?.as_str()?.to_string(),
            kind: ModelKind::from_model(model),
        })
    }
}

pub struct ModelCatalog {
    path: PathBuf,
    models: RwLock<Vec<ModelInfo>>,
}

impl ModelCatalog {
    /// Catalog with no backing data yet.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            models: RwLock::new(Vec::new()),
        }
    }

    /// Load from `path`. A missing or unreadable file yields an empty catalog.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let catalog = Self::empty(path);
        match read_models(&catalog.path).await {
            Ok(models) => {
                info!(count = models.len(), path = %catalog.path.display(), "Model catalog loaded");
                *catalog.models.write().await = models;
            }
            Err(e) => {
                warn!(path = %catalog.path.display(), "Model catalog not loaded: {e}");
            }
        }
        catalog
    }

    pub async fn list(&self) -> Vec<ModelInfo> {
        self.models.read().await.clone()
    }

    /// Upstream id for a public model name.
    pub async fn id_for(&self, public_name: &str) -> Option<String> {
        self.models
            .read()
            .await
            .iter()
            .find(|m| m.public_name == public_name)
            .map(|m| m.id.clone())
    }

    /// Replace the catalog with the models embedded in `html` and persist the
    /// raw objects. Returns the number of models stored.
    pub async fn update_from_page(&self, html: &str) -> Result<usize, BridgeError> {
        let raw = extract_models(html);
        if raw.is_empty() {
            return Err(BridgeError::BadRequest(
                "no model data found in page content".to_string(),
            ));
        }

        let json = serde_json::to_string_pretty(&raw)
            .map_err(|e| BridgeError::Internal(format!("serialize models: {e}")))?;
        tokio::fs::write(&self.path, json).await.map_err(|e| {
            BridgeError::Internal(format!("write {}: {e}", self.path.display()))
        })?;

        let models: Vec<ModelInfo> = raw.iter().filter_map(ModelInfo::from_value).collect();
        let count = models.len();
        *self.models.write().await = models;
        info!(count, path = %self.path.display(), "Model catalog updated");
        Ok(count)
    }
}

async fn read_models(path: &Path) -> Result<Vec<ModelInfo>, String> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| e.to_string())?;
    let raw: Vec<Value> = serde_json::from_str(&content).map_err(|e| e.to_string())?;
    Ok(raw.iter().filter_map(ModelInfo::from_value).collect())
}

/// Raw model objects embedded in page source, de-duplicated by `publicName`
/// in order of first appearance.
pub fn extract_models(html: &str) -> Vec<Value> {
    let mut models = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut from = 0;

    while let Some(offset) = html[from..].find(ESCAPED_ID_OPENER) {
        let start = from + offset;
        from = start + ESCAPED_ID_OPENER.len();
        if !has_hex_id(&html[from..]) {
            continue;
        }
        let Some(end) = matching_brace(html.as_bytes(), start) else {
            continue;
        };
        let unescaped = html[start..end].replace(r#"\""#, "\"").replace(r"\\", r"\");
        match serde_json::from_str::<Value>(&unescaped) {
            Ok(model) => {
                let Some(name) = model.get("publicName").and_then(Value::as_str) else {
                    continue;
                };
                if seen.insert(name.to_string()) {
                    models.push(model);
                }
            }
            Err(e) => {
                let preview: String = unescaped.chars().take(150).collect();
                debug!("Skipping unparsable model object ({e}): {preview}");
            }
        }
    }
    models
}

/// `rest` starts with `<hex-or-dash>+\"`.
fn has_hex_id(rest: &str) -> bool {
    let id_len = rest
        .bytes()
        .take_while(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b) || *b == b'-')
        .count();
    id_len > 0 && rest[id_len..].starts_with(r#"\""#)
}

fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let limit = bytes.len().min(start + OBJECT_SEARCH_LIMIT);
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate().take(limit).skip(start) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn escaped(obj: &str) -> String {
        obj.replace('"', r#"\""#)
    }

    const ALPHA: &str = r#"{"id":"0a1b-2c","publicName":"alpha","capabilities":{"outputCapabilities":{"image":{"aspectRatios":["1:1"]}}}}"#;
    const BETA: &str =
        r#"{"id":"ffee-01","publicName":"beta","capabilities":{"outputCapabilities":{"text":true}}}"#;

    fn page() -> String {
        format!(
            "<script>self.__next_f.push([1,\"{}\"]); x {} y {}</script>",
            escaped(ALPHA),
            escaped(BETA),
            escaped(ALPHA)
        )
    }

    #[test]
    fn extracts_and_dedupes() {
        let models = extract_models(&page());
        assert_eq!(models.len(), 2);
        assert_eq!(models[0]["publicName"], "alpha");
        assert_eq!(models[1]["publicName"], "beta");
    }

    #[test]
    fn ignores_non_hex_ids_and_unterminated_objects() {
        let html = r#"{\"id\":\"xyz\",\"publicName\":\"n\"} {\"id\":\"abc\",\"publicName\":\"m\""#;
        assert!(extract_models(html).is_empty());
    }

    #[test]
    fn kind_follows_capability_priority() {
        let models: Vec<ModelInfo> = extract_models(&page())
            .iter()
            .filter_map(ModelInfo::from_value)
            .collect();
        assert_eq!(models[0].kind, ModelKind::Image);
        assert_eq!(models[1].kind, ModelKind::Text);

        let none = serde_json::json!({"id": "1", "publicName": "x"});
        assert_eq!(ModelKind::from_model(&none), ModelKind::Unknown);
    }

    #[tokio::test]
    async fn update_persists_and_reloads() {
        let path = std::env::temp_dir().join(format!("lmbridge-models-{}.json", uuid::Uuid::new_v4()));
        let catalog = ModelCatalog::empty(&path);
        assert_eq!(catalog.update_from_page(&page()).await.unwrap(), 2);
        assert_eq!(catalog.id_for("beta").await.as_deref(), Some("ffee-01"));

        let reloaded = ModelCatalog::load(&path).await;
        assert_eq!(reloaded.list().await.len(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn update_without_models_is_bad_request() {
        let catalog = ModelCatalog::empty(std::env::temp_dir().join("lmbridge-unused.json"));
        let err = catalog.update_from_page("<html></html>").await.unwrap_err();
        assert!(matches!(err, BridgeError::BadRequest(_)));
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let catalog = ModelCatalog::load("/nonexistent/lmbridge/models.json").await;
        assert!(catalog.list().await.is_empty());
    }
}
