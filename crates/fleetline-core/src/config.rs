use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    managed: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Generalizes the teacher's layered JSON merge to YAML-backed layers for
/// `config/{model_tiers,model_pricing,permissions,providers}.yaml` plus a
/// `settings.yaml` carrying the §6 option list. Precedence, low to high:
/// defaults < global < project < env < runtime < CLI overrides.
pub struct ConfigStore {
    global_path: PathBuf,
    project_path: PathBuf,
    managed_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn load(
        global_path: PathBuf,
        project_path: PathBuf,
        managed_path: PathBuf,
        cli_overrides: Value,
    ) -> anyhow::Result<Self> {
        let global = read_yaml(&global_path).await;
        let project = read_yaml(&project_path).await;
        let managed = read_yaml(&managed_path).await;
        let layers = ConfigLayers {
            global,
            project,
            managed,
            env: env_layer(),
            runtime: Value::Object(Default::default()),
            cli: cli_overrides,
        };
        Ok(Self {
            global_path,
            project_path,
            managed_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn effective(&self) -> Value {
        let layers = self.layers.read().await;
        let mut merged = default_settings();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.managed);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get(&self, pointer: &str) -> Option<Value> {
        self.effective().await.pointer(pointer).cloned()
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<()> {
        let mut layers = self.layers.write().await;
        deep_merge(&mut layers.project, &patch);
        write_yaml(&self.project_path, &layers.project).await
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<()> {
        let mut layers = self.layers.write().await;
        deep_merge(&mut layers.global, &patch);
        write_yaml(&self.global_path, &layers.global).await
    }

    pub async fn patch_runtime(&self, patch: Value) {
        let mut layers = self.layers.write().await;
        deep_merge(&mut layers.runtime, &patch);
    }

    pub fn managed_path(&self) -> &Path {
        &self.managed_path
    }
}

async fn read_yaml(path: &Path) -> Value {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => serde_yaml::from_str(&contents).unwrap_or(Value::Object(Default::default())),
        Err(_) => Value::Object(Default::default()),
    }
}

async fn write_yaml(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let text = serde_yaml::to_string(value)?;
    tokio::fs::write(path, text).await?;
    Ok(())
}

/// The §6 recognized options with their documented defaults.
fn default_settings() -> Value {
    json!({
        "activity_log": { "enabled": true, "compression": true, "retention_count": 2 },
        "snapshot": {
            "enabled": true,
            "trigger_agent_count": 10,
            "trigger_token_count": 20000,
            "compression": true,
            "retention_days": 7
        },
        "backup": { "enabled": false, "on_handoff": true, "on_token_limit": true, "async": true },
        "analytics": { "enabled": true, "batch_size": 100 },
        "performance_budgets_ms": { "event": 1.0, "snapshot": 100.0, "query": 10.0, "backup_minutes": 2.0 },
        "token_limit_warning_threshold": 0.9,
        "default_token_budget": 200000,
        "session_id_format": "session_%Y%m%d_%H%M%S",
        "approvals": { "enabled": true, "threshold": 0.7 }
    })
}

/// Reads the documented `SUBAGENT_*` env overrides into a config-shaped
/// patch so they slot into the normal merge order.
fn env_layer() -> Value {
    let mut obj = serde_json::Map::new();

    if let Ok(count) = env::var("SUBAGENT_SNAPSHOT_AGENT_COUNT").and_then(|v| v.parse::<u64>().map_err(|_| env::VarError::NotPresent)) {
        obj.insert(
            "snapshot".into(),
            json!({ "trigger_agent_count": count }),
        );
    }
    if let Ok(count) = env::var("SUBAGENT_SNAPSHOT_TOKEN_COUNT").and_then(|v| v.parse::<u64>().map_err(|_| env::VarError::NotPresent)) {
        merge_into(&mut obj, "snapshot", json!({ "trigger_token_count": count }));
    }
    if let Ok(flag) = env::var("SUBAGENT_BACKUP_ENABLED") {
        merge_into(&mut obj, "backup", json!({ "enabled": parse_bool(&flag) }));
    }
    if let Ok(flag) = env::var("SUBAGENT_ANALYTICS_ENABLED") {
        merge_into(&mut obj, "analytics", json!({ "enabled": parse_bool(&flag) }));
    }
    if let Ok(budget) = env::var("SUBAGENT_TOKEN_BUDGET").and_then(|v| v.parse::<u64>().map_err(|_| env::VarError::NotPresent)) {
        obj.insert("default_token_budget".into(), json!(budget));
    }
    if let Ok(flag) = env::var("SUBAGENT_APPROVALS_ENABLED") {
        merge_into(&mut obj, "approvals", json!({ "enabled": parse_bool(&flag) }));
    }
    if let Ok(threshold) = env::var("SUBAGENT_APPROVAL_THRESHOLD").and_then(|v| v.parse::<f64>().map_err(|_| env::VarError::NotPresent)) {
        merge_into(&mut obj, "approvals", json!({ "threshold": threshold }));
    }

    Value::Object(obj)
}

fn merge_into(obj: &mut serde_json::Map<String, Value>, key: &str, patch: Value) {
    let mut slot = obj.remove(key).unwrap_or(Value::Object(Default::default()));
    deep_merge(&mut slot, &patch);
    obj.insert(key.to_string(), slot);
}

fn parse_bool(v: &str) -> bool {
    matches!(v, "1" | "true" | "TRUE" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn defaults_are_effective_without_any_layer_files() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::load(
            dir.path().join("global.yaml"),
            dir.path().join("project.yaml"),
            dir.path().join("managed.yaml"),
            Value::Object(Default::default()),
        )
        .await
        .unwrap();
        let effective = store.effective().await;
        assert_eq!(effective["default_token_budget"], json!(200000));
    }

    #[tokio::test]
    async fn project_patch_overrides_defaults_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::load(
            dir.path().join("global.yaml"),
            dir.path().join("project.yaml"),
            dir.path().join("managed.yaml"),
            Value::Object(Default::default()),
        )
        .await
        .unwrap();
        store.patch_project(json!({ "default_token_budget": 50000 })).await.unwrap();
        let effective = store.effective().await;
        assert_eq!(effective["default_token_budget"], json!(50000));
    }

    #[tokio::test]
    async fn cli_overrides_win_over_every_other_layer() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::load(
            dir.path().join("global.yaml"),
            dir.path().join("project.yaml"),
            dir.path().join("managed.yaml"),
            json!({ "default_token_budget": 1 }),
        )
        .await
        .unwrap();
        store.patch_project(json!({ "default_token_budget": 50000 })).await.unwrap();
        let effective = store.effective().await;
        assert_eq!(effective["default_token_budget"], json!(1));
    }
}
