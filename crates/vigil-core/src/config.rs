// Watchdog Configuration Store
// Layered JSON config: file < env < runtime < cli

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{Result, WatchdogError};
use crate::storage::{save_json, CONFIG_FILE};
use vigil_types::WatchdogConfig;

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Read-mostly configuration store. The scan loop takes a fresh
/// `snapshot()` each tick, so edits apply on the next tick and never
/// retroactively reclassify in-flight scans.
#[derive(Clone)]
pub struct WatchdogConfigStore {
    file_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl WatchdogConfigStore {
    pub async fn new(state_dir: &Path, cli_overrides: Option<Value>) -> Result<Self> {
        fs::create_dir_all(state_dir).await?;
        let file_path = state_dir.join(CONFIG_FILE);
        let file = read_json_file(&file_path).await?;

        let layers = ConfigLayers {
            file,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        let store = Self {
            file_path,
            layers: Arc::new(RwLock::new(layers)),
        };
        store.save_file().await?;
        Ok(store)
    }

    /// Effective typed configuration. Falls back to defaults field by
    /// field; a fully unreadable merge yields the hard-coded defaults so
    /// the scan loop never stalls on configuration.
    pub async fn snapshot(&self) -> WatchdogConfig {
        let merged = self.effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn file_value(&self) -> Value {
        self.layers.read().await.file.clone()
    }

    /// Merge a patch into the persisted file layer. The patched result is
    /// validated before commit; a patch that breaks deserialization is
    /// rejected and nothing changes.
    pub async fn patch(&self, patch: Value) -> Result<WatchdogConfig> {
        {
            let mut layers = self.layers.write().await;
            let mut candidate = layers.file.clone();
            deep_merge(&mut candidate, &patch);
            let mut merged = candidate.clone();
            deep_merge(&mut merged, &layers.env);
            deep_merge(&mut merged, &layers.runtime);
            deep_merge(&mut merged, &layers.cli);
            serde_json::from_value::<WatchdogConfig>(merged)
                .map_err(|e| WatchdogError::Config(format!("rejected config patch: {}", e)))?;
            layers.file = candidate;
        }
        self.save_file().await?;
        Ok(self.snapshot().await)
    }

    /// Merge a patch into the volatile runtime layer (not persisted).
    pub async fn patch_runtime(&self, patch: Value) -> Result<WatchdogConfig> {
        {
            let mut layers = self.layers.write().await;
            let mut candidate = layers.runtime.clone();
            deep_merge(&mut candidate, &patch);
            layers.runtime = candidate;
        }
        Ok(self.snapshot().await)
    }

    async fn save_file(&self) -> Result<()> {
        let snapshot = self.layers.read().await.file.clone();
        write_json_file(&self.file_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn write_json_file(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    save_json(path, value).await
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Ok(raw) = std::env::var("VIGIL_SCAN_INTERVAL_MS") {
        if let Ok(ms) = raw.trim().parse::<u64>() {
            deep_merge(&mut root, &json!({ "scan_interval_ms": ms }));
        }
    }
    if let Ok(raw) = std::env::var("VIGIL_SCAN_ENABLED") {
        if let Some(enabled) = parse_bool_like(&raw) {
            deep_merge(&mut root, &json!({ "scan_enabled": enabled }));
        }
    }
    if let Ok(raw) = std::env::var("VIGIL_MAX_RETRIES") {
        if let Ok(n) = raw.trim().parse::<u32>() {
            deep_merge(&mut root, &json!({ "global": { "max_retries": n } }));
        }
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
