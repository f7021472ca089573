use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use fleetline_types::{AgentRecord, AgentStatus, Event};
use serde_json::{json, Map};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event_bus::EventBus;
use crate::storage::atomic_write_json;

/// Metrics a caller may attach to a heartbeat, e.g. an adapter reporting
/// the token/cost usage an LLM call just consumed (spec S3: "record
/// heartbeat with `metrics.tokens_used=10`"). Any field left `None` is
/// left at its current value.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatUpdate {
    pub tokens_used: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub status: Option<AgentStatus>,
    pub session_id: Option<String>,
}

impl AgentFilter {
    fn matches(&self, record: &AgentRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if record.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Cooperative process handle: pause/resume flip an in-memory flag agents
/// are expected to check between steps; terminate trips a cancellation
/// token. There is no real subprocess here (LLM execution is out of
/// scope) — this is the hook an adapter wires a running agent task to.
#[derive(Clone)]
pub struct ProcessHandle {
    pub paused: Arc<tokio::sync::Notify>,
    pub is_paused: Arc<std::sync::atomic::AtomicBool>,
    pub cancel: CancellationToken,
}

impl ProcessHandle {
    fn new() -> Self {
        Self {
            paused: Arc::new(tokio::sync::Notify::new()),
            is_paused: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    fn pause(&self) {
        self.is_paused.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn resume(&self) {
        self.is_paused.store(false, std::sync::atomic::Ordering::SeqCst);
        self.paused.notify_waiters();
    }

    fn terminate(&self) {
        self.cancel.cancel();
    }
}

/// Persistent agent records and the lifecycle state machine (spec 4.I).
/// Records live in a single append-safe JSON file, written atomically via
/// temp-then-rename.
pub struct AgentRegistry {
    records: Arc<RwLock<HashMap<String, AgentRecord>>>,
    handles: Arc<RwLock<HashMap<String, ProcessHandle>>>,
    storage_path: PathBuf,
    bus: Arc<EventBus>,
}

impl AgentRegistry {
    pub fn new(storage_path: PathBuf, bus: Arc<EventBus>) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            handles: Arc::new(RwLock::new(HashMap::new())),
            storage_path,
            bus,
        }
    }

    pub async fn load(storage_path: PathBuf, bus: Arc<EventBus>) -> anyhow::Result<Self> {
        let records: HashMap<String, AgentRecord> = match tokio::fs::read(&storage_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            records: Arc::new(RwLock::new(records)),
            handles: Arc::new(RwLock::new(HashMap::new())),
            storage_path,
            bus,
        })
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let records = self.records.read().await;
        atomic_write_json(&self.storage_path, &*records).await
    }

    pub async fn create(&self, agent_id: impl Into<String>, agent_type: impl Into<String>, model: impl Into<String>) -> AgentRecord {
        let record = AgentRecord::new(agent_id, agent_type, model);
        self.records.write().await.insert(record.agent_id.clone(), record.clone());
        self.handles.write().await.insert(record.agent_id.clone(), ProcessHandle::new());
        let _ = self.persist().await;
        record
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.records.read().await.get(agent_id).cloned()
    }

    pub async fn list(&self, filter: &AgentFilter) -> Vec<AgentRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub async fn update<F>(&self, agent_id: &str, f: F) -> Option<AgentRecord>
    where
        F: FnOnce(&mut AgentRecord),
    {
        let mut records = self.records.write().await;
        let record = records.get_mut(agent_id)?;
        f(record);
        record.updated_at = Utc::now();
        let out = record.clone();
        drop(records);
        let _ = self.persist().await;
        Some(out)
    }

    /// Records a heartbeat and, if metrics came with it, folds them into
    /// the record's budget tally before evaluating the budget enforcer
    /// (spec 4.J). A hard breach terminates the agent in the same call —
    /// there is no separate monitor loop polling agents in this process,
    /// so the heartbeat path is where a breach actually gets caught.
    pub async fn record_heartbeat(&self, agent_id: &str, update: HeartbeatUpdate) -> Option<AgentRecord> {
        let record = self
            .update(agent_id, |r| {
                r.last_heartbeat = Some(Utc::now());
                if let Some(v) = update.tokens_used {
                    r.metrics.tokens_used = v;
                }
                if let Some(v) = update.input_tokens {
                    r.metrics.input_tokens = v;
                }
                if let Some(v) = update.output_tokens {
                    r.metrics.output_tokens = v;
                }
                if let Some(v) = update.cost_usd {
                    r.metrics.cost_usd = v;
                }
            })
            .await?;

        let check = crate::budget::check(&record, Utc::now());
        if !check.exceeded {
            return Some(record);
        }

        let reason = check.reason.clone().unwrap_or_else(|| "budget_exceeded".to_string());
        self.update(agent_id, |r| {
            r.metadata.insert("error".into(), json!(reason));
        })
        .await;
        self.transition(agent_id, AgentStatus::Terminated).await
    }

    /// Applies a lifecycle transition. Illegal transitions out of a
    /// terminal state are no-ops and emit no events (invariant 3).
    pub async fn transition(&self, agent_id: &str, next: AgentStatus) -> Option<AgentRecord> {
        let mut records = self.records.write().await;
        let record = records.get_mut(agent_id)?;
        let applied = record.transition(next);
        let out = record.clone();
        drop(records);

        if !applied {
            return Some(out);
        }
        let _ = self.persist().await;

        match next {
            AgentStatus::Completed => {
                self.emit_terminal(&out, "agent.completed").await;
            }
            AgentStatus::Terminated => {
                let is_timeout = out
                    .metadata
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(|reason| reason == "heartbeat_timeout" || reason == "sla_timeout")
                    .unwrap_or(false);
                self.emit_terminal(&out, if is_timeout { "agent.timeout" } else { "agent.failed" }).await;
            }
            AgentStatus::Failed => {
                self.emit_terminal(&out, "agent.failed").await;
            }
            _ => {}
        }
        Some(out)
    }

    async fn emit_terminal(&self, record: &AgentRecord, event_type: &str) {
        let mut payload = Map::new();
        payload.insert("agent".into(), json!(record.agent_id));
        payload.insert("status".into(), json!(record.status));
        payload.insert("model".into(), json!(record.model));
        payload.insert("tokens_used".into(), json!(record.metrics.tokens_used));
        payload.insert("input_tokens".into(), json!(record.metrics.input_tokens));
        payload.insert("output_tokens".into(), json!(record.metrics.output_tokens));
        if let (Some(started), Some(completed)) = (record.started_at, record.completed_at) {
            payload.insert(
                "duration_ms".into(),
                json!((completed - started).num_milliseconds().max(0)),
            );
        }
        if let Some(error) = record.metadata.get("error") {
            payload.insert("error".into(), error.clone());
        }
        if let Ok(event) = Event::new(
            event_type,
            record.session_id.clone().unwrap_or_else(|| "session_default".into()),
            payload,
        ) {
            self.bus.publish(event);
        }
    }

    pub async fn pause(&self, agent_id: &str) -> bool {
        if self.transition(agent_id, AgentStatus::Paused).await.is_none() {
            return false;
        }
        if let Some(handle) = self.handles.read().await.get(agent_id) {
            handle.pause();
        }
        true
    }

    pub async fn resume(&self, agent_id: &str) -> bool {
        if self.transition(agent_id, AgentStatus::Running).await.is_none() {
            return false;
        }
        if let Some(handle) = self.handles.read().await.get(agent_id) {
            handle.resume();
        }
        true
    }

    pub async fn terminate(&self, agent_id: &str) -> bool {
        let transitioned = self.transition(agent_id, AgentStatus::Terminated).await.is_some();
        if let Some(handle) = self.handles.read().await.get(agent_id) {
            handle.terminate();
        }
        info!(agent_id, "terminate requested");
        transitioned
    }

    pub async fn switch_model(&self, agent_id: &str, model: impl Into<String>) -> Option<AgentRecord> {
        self.update(agent_id, |r| r.model = model.into()).await
    }

    pub async fn handle_for(&self, agent_id: &str) -> Option<ProcessHandle> {
        self.handles.read().await.get(agent_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn registry() -> (AgentRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agents.json");
        let bus = Arc::new(EventBus::new());
        (AgentRegistry::new(path, bus), dir)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (registry, _dir) = registry().await;
        registry.create("a1", "build", "strong-1").await;
        let record = registry.get("a1").await.unwrap();
        assert_eq!(record.status, AgentStatus::Pending);
    }

    #[tokio::test]
    async fn illegal_transition_out_of_terminal_state_is_noop() {
        let (registry, _dir) = registry().await;
        registry.create("a1", "build", "strong-1").await;
        registry.transition("a1", AgentStatus::Running).await;
        registry.transition("a1", AgentStatus::Completed).await;
        let before = registry.get("a1").await.unwrap();
        registry.transition("a1", AgentStatus::Running).await;
        let after = registry.get("a1").await.unwrap();
        assert_eq!(before.status, after.status);
        assert_eq!(after.status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn heartbeat_breaching_token_limit_terminates_agent() {
        let (registry, _dir) = registry().await;
        registry.create("a1", "build", "strong-1").await;
        registry.transition("a1", AgentStatus::Running).await;
        registry.update("a1", |r| r.budget.token_limit = Some(100)).await;

        let update = HeartbeatUpdate { tokens_used: Some(150), ..Default::default() };
        let record = registry.record_heartbeat("a1", update).await.unwrap();

        assert_eq!(record.status, AgentStatus::Terminated);
        assert_eq!(record.metadata.get("error").and_then(|v| v.as_str()), Some("token_limit"));
    }

    #[tokio::test]
    async fn heartbeat_within_budget_does_not_terminate() {
        let (registry, _dir) = registry().await;
        registry.create("a1", "build", "strong-1").await;
        registry.transition("a1", AgentStatus::Running).await;
        registry.update("a1", |r| r.budget.token_limit = Some(1000)).await;

        let update = HeartbeatUpdate { tokens_used: Some(10), ..Default::default() };
        let record = registry.record_heartbeat("a1", update).await.unwrap();

        assert_eq!(record.status, AgentStatus::Running);
        assert_eq!(record.metrics.tokens_used, 10);
    }

    #[tokio::test]
    async fn pause_sets_cooperative_flag() {
        let (registry, _dir) = registry().await;
        registry.create("a1", "build", "strong-1").await;
        registry.transition("a1", AgentStatus::Running).await;
        registry.pause("a1").await;
        let handle = registry.handle_for("a1").await.unwrap();
        assert!(handle.is_paused.load(std::sync::atomic::Ordering::SeqCst));
    }
}
