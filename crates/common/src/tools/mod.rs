//! Per-tool model settings
//!
//! Provides:
//! - The closed set of pipeline tools and their allowed models
//! - Validated partial updates persisted to a backing store
//! - Copy-on-start snapshots consumed by pipeline runs

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{info, warn};
use validator::Validate;

/// Named pipeline tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    Reformulation,
    RegularSearch,
    TrustedSearch,
    Synthesis,
}

impl ToolName {
    pub const ALL: [ToolName; 4] = [
        ToolName::Reformulation,
        ToolName::RegularSearch,
        ToolName::TrustedSearch,
        ToolName::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::Reformulation => "reformulation",
            ToolName::RegularSearch => "regular_search",
            ToolName::TrustedSearch => "trusted_search",
            ToolName::Synthesis => "synthesis",
        }
    }

    /// Models this tool may be configured with. Search tools need a model
    /// that supports the hosted web search tool.
    pub fn allowed_models(&self) -> &'static [&'static str] {
        match self {
            ToolName::Reformulation => &["gpt-4.1-nano", "gpt-4.1-mini", "gpt-4.1", "gpt-4o-mini", "gpt-4o"],
            ToolName::RegularSearch | ToolName::TrustedSearch => {
                &["gpt-4.1-mini", "gpt-4.1", "gpt-4o-mini", "gpt-4o"]
            }
            ToolName::Synthesis => &["gpt-4.1-mini", "gpt-4.1", "gpt-4o-mini", "gpt-4o", "o4-mini"],
        }
    }

    pub fn default_config(&self) -> ToolConfig {
        let (model, temperature, max_tokens) = match self {
            ToolName::Reformulation => ("gpt-4.1-mini", 0.2, 200),
            ToolName::RegularSearch => ("gpt-4.1-mini", 0.2, 1500),
            ToolName::TrustedSearch => ("gpt-4.1-mini", 0.1, 1500),
            ToolName::Synthesis => ("gpt-4.1", 0.3, 1800),
        };
        ToolConfig {
            model: model.to_string(),
            temperature,
            max_tokens,
            enabled: true,
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        ToolName::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AppError::ConfigNotFound { tool: s.to_string() })
    }
}

/// Settings for a single tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub enabled: bool,
}

/// Partial update; absent fields keep their current value
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct ToolConfigPatch {
    #[validate(length(min = 1, max = 64))]
    pub model: Option<String>,

    #[validate(range(min = 0.0, max = 1.0))]
    pub temperature: Option<f32>,

    #[validate(range(min = 1, max = 32768))]
    pub max_tokens: Option<i64>,

    pub enabled: Option<bool>,
}

impl ToolConfigPatch {
    fn check(&self, tool: ToolName) -> Result<()> {
        let invalid = |field: &str, message: String| AppError::ConfigValidation {
            tool: tool.to_string(),
            field: field.to_string(),
            message,
        };

        if let Some(t) = self.temperature {
            if !t.is_finite() {
                return Err(invalid("temperature", "must be a finite number".into()));
            }
        }

        if let Err(errors) = self.validate() {
            let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            if let Some((field, errs)) = fields.into_iter().next() {
                let message = match (field.as_ref(), errs.first()) {
                    ("temperature", _) => "must be within [0, 1]".to_string(),
                    ("max_tokens", _) => "must be a positive integer (at most 32768)".to_string(),
                    (_, Some(e)) => e.to_string(),
                    (_, None) => "invalid value".to_string(),
                };
                return Err(invalid(field.as_ref(), message));
            }
        }

        if let Some(model) = &self.model {
            if !tool.allowed_models().contains(&model.as_str()) {
                return Err(invalid(
                    "model",
                    format!("'{}' is not allowed; expected one of {:?}", model, tool.allowed_models()),
                ));
            }
        }

        Ok(())
    }

    fn apply(&self, current: &ToolConfig) -> ToolConfig {
        ToolConfig {
            model: self.model.clone().unwrap_or_else(|| current.model.clone()),
            temperature: self.temperature.unwrap_or(current.temperature),
            max_tokens: self
                .max_tokens
                .and_then(|m| u32::try_from(m).ok())
                .unwrap_or(current.max_tokens),
            enabled: self.enabled.unwrap_or(current.enabled),
        }
    }
}

impl ToolConfig {
    /// Full validation used when loading persisted settings
    fn validate_for(&self, tool: ToolName) -> Result<()> {
        ToolConfigPatch {
            model: Some(self.model.clone()),
            temperature: Some(self.temperature),
            max_tokens: Some(i64::from(self.max_tokens)),
            enabled: Some(self.enabled),
        }
        .check(tool)
    }
}

/// Immutable view of every tool's settings taken at run start
#[derive(Debug, Clone, PartialEq)]
pub struct ToolConfigSnapshot(Arc<BTreeMap<ToolName, ToolConfig>>);

impl ToolConfigSnapshot {
    pub fn tool(&self, name: ToolName) -> ToolConfig {
        self.0.get(&name).cloned().unwrap_or_else(|| name.default_config())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ToolName, &ToolConfig)> {
        self.0.iter()
    }
}

impl Default for ToolConfigSnapshot {
    fn default() -> Self {
        Self(Arc::new(defaults()))
    }
}

fn defaults() -> BTreeMap<ToolName, ToolConfig> {
    ToolName::ALL.into_iter().map(|t| (t, t.default_config())).collect()
}

/// Persistence for tool settings
#[async_trait]
pub trait ToolConfigBackend: Send + Sync {
    /// `None` when nothing has been persisted yet
    async fn load(&self) -> Result<Option<HashMap<String, ToolConfig>>>;

    async fn save(&self, configs: &BTreeMap<ToolName, ToolConfig>) -> Result<()>;
}

/// JSON file backend; writes go through a temp file and a rename
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ToolConfigBackend for JsonFileBackend {
    async fn load(&self) -> Result<Option<HashMap<String, ToolConfig>>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Storage {
                message: format!("Failed to read {}: {}", self.path.display(), e),
            }),
        }
    }

    async fn save(&self, configs: &BTreeMap<ToolName, ToolConfig>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(configs)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-process backend
#[derive(Default)]
pub struct InMemoryBackend {
    stored: Mutex<Option<HashMap<String, ToolConfig>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// What a fresh store would load right now
    pub fn persisted(&self) -> Option<HashMap<String, ToolConfig>> {
        self.stored.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl ToolConfigBackend for InMemoryBackend {
    async fn load(&self) -> Result<Option<HashMap<String, ToolConfig>>> {
        Ok(self.persisted())
    }

    async fn save(&self, configs: &BTreeMap<ToolName, ToolConfig>) -> Result<()> {
        let mut stored = self.stored.lock().map_err(|_| AppError::Storage {
            message: "in-memory tool store poisoned".into(),
        })?;
        *stored = Some(
            configs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        );
        Ok(())
    }
}

/// Validated, persisted tool settings
pub struct ToolConfigStore {
    backend: Arc<dyn ToolConfigBackend>,
    configs: RwLock<Arc<BTreeMap<ToolName, ToolConfig>>>,
}

impl ToolConfigStore {
    /// Open the store, seeding defaults for tools the backend does not know
    pub async fn open(backend: Arc<dyn ToolConfigBackend>) -> Result<Self> {
        let configs = load_validated(backend.as_ref()).await?;
        info!(tools = configs.len(), "Tool configuration loaded");
        Ok(Self {
            backend,
            configs: RwLock::new(Arc::new(configs)),
        })
    }

    /// Store backed by memory only, seeded with defaults
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(InMemoryBackend::new()),
            configs: RwLock::new(Arc::new(defaults())),
        }
    }

    pub async fn get(&self, tool_name: &str) -> Result<ToolConfig> {
        let tool: ToolName = tool_name.parse()?;
        Ok(self
            .configs
            .read()
            .await
            .get(&tool)
            .cloned()
            .unwrap_or_else(|| tool.default_config()))
    }

    /// Validate, persist, then publish. Runs already holding a snapshot keep
    /// their old values.
    pub async fn update(&self, tool_name: &str, patch: ToolConfigPatch) -> Result<ToolConfig> {
        let tool: ToolName = tool_name.parse()?;
        patch.check(tool)?;

        let mut guard = self.configs.write().await;
        let current = guard.get(&tool).cloned().unwrap_or_else(|| tool.default_config());
        let updated = patch.apply(&current);

        let mut next = guard.as_ref().clone();
        next.insert(tool, updated.clone());
        self.backend.save(&next).await?;
        *guard = Arc::new(next);

        info!(
            tool = %tool,
            model = %updated.model,
            temperature = updated.temperature,
            max_tokens = updated.max_tokens,
            enabled = updated.enabled,
            "Tool configuration updated"
        );
        Ok(updated)
    }

    pub async fn snapshot(&self) -> ToolConfigSnapshot {
        ToolConfigSnapshot(self.configs.read().await.clone())
    }

    /// Re-read the backing store; on error the current settings stay
    pub async fn reload(&self) -> Result<ToolConfigSnapshot> {
        let configs = Arc::new(load_validated(self.backend.as_ref()).await?);
        *self.configs.write().await = configs.clone();
        info!("Tool configuration reloaded");
        Ok(ToolConfigSnapshot(configs))
    }
}

async fn load_validated(backend: &dyn ToolConfigBackend) -> Result<BTreeMap<ToolName, ToolConfig>> {
    let mut configs = defaults();
    let Some(stored) = backend.load().await? else {
        return Ok(configs);
    };

    for (name, config) in stored {
        let tool = match name.parse::<ToolName>() {
            Ok(tool) => tool,
            Err(_) => {
                warn!(tool = %name, "Ignoring settings for unknown tool");
                continue;
            }
        };
        config.validate_for(tool).map_err(|e| AppError::Configuration {
            message: format!("Persisted tool settings are invalid: {}", e),
        })?;
        configs.insert(tool, config);
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch() -> ToolConfigPatch {
        ToolConfigPatch::default()
    }

    #[tokio::test]
    async fn test_get_unknown_tool() {
        let store = ToolConfigStore::in_memory();
        let err = store.get("image_generation").await.unwrap_err();
        assert!(matches!(err, AppError::ConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_persists_and_applies_partially() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = ToolConfigStore::open(backend.clone()).await.unwrap();

        let updated = store
            .update("synthesis", ToolConfigPatch { temperature: Some(0.7), ..patch() })
            .await
            .unwrap();

        assert_eq!(updated.temperature, 0.7);
        assert_eq!(updated.model, ToolName::Synthesis.default_config().model);
        assert_eq!(store.get("synthesis").await.unwrap(), updated);
        assert_eq!(backend.persisted().unwrap()["synthesis"], updated);
    }

    #[tokio::test]
    async fn test_invalid_updates_leave_config_unchanged() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = ToolConfigStore::open(backend.clone()).await.unwrap();
        let before = store.get("regular_search").await.unwrap();

        let bad_patches = [
            ToolConfigPatch { temperature: Some(1.5), ..patch() },
            ToolConfigPatch { temperature: Some(-0.1), ..patch() },
            ToolConfigPatch { temperature: Some(f32::NAN), ..patch() },
            ToolConfigPatch { max_tokens: Some(0), ..patch() },
            ToolConfigPatch { max_tokens: Some(-20), ..patch() },
            ToolConfigPatch { model: Some("o4-mini".into()), ..patch() },
        ];

        for bad in bad_patches {
            let err = store.update("regular_search", bad).await.unwrap_err();
            assert!(matches!(err, AppError::ConfigValidation { .. }), "got {:?}", err);
        }

        assert_eq!(store.get("regular_search").await.unwrap(), before);
        assert!(backend.persisted().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_is_copy_on_start() {
        let store = ToolConfigStore::in_memory();
        let snapshot = store.snapshot().await;

        store
            .update("reformulation", ToolConfigPatch { max_tokens: Some(64), ..patch() })
            .await
            .unwrap();

        assert_eq!(snapshot.tool(ToolName::Reformulation).max_tokens, 200);
        assert_eq!(store.snapshot().await.tool(ToolName::Reformulation).max_tokens, 64);
    }

    #[tokio::test]
    async fn test_json_file_round_trip_and_reload() {
        let dir = std::env::temp_dir().join(format!("civica-tools-{}", uuid::Uuid::new_v4()));
        let path = dir.join("tools.json");

        let store = ToolConfigStore::open(Arc::new(JsonFileBackend::new(&path))).await.unwrap();
        store
            .update("trusted_search", ToolConfigPatch { enabled: Some(false), ..patch() })
            .await
            .unwrap();

        let reopened = ToolConfigStore::open(Arc::new(JsonFileBackend::new(&path))).await.unwrap();
        assert!(!reopened.get("trusted_search").await.unwrap().enabled);

        // An out-of-band edit becomes visible after reload
        let mut raw: HashMap<String, ToolConfig> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        raw.get_mut("trusted_search").unwrap().enabled = true;
        std::fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

        assert!(!reopened.get("trusted_search").await.unwrap().enabled);
        let snapshot = reopened.reload().await.unwrap();
        assert!(snapshot.tool(ToolName::TrustedSearch).enabled);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_invalid_persisted_settings_are_rejected() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut bad = defaults();
        bad.get_mut(&ToolName::Synthesis).unwrap().temperature = 3.0;
        backend.save(&bad).await.unwrap();

        let err = ToolConfigStore::open(backend).await.err().unwrap();
        assert!(matches!(err, AppError::Configuration { .. }));
    }
}
