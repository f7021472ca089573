use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleetline_core::{EventBus, EventHandler};
use fleetline_snapshot::SnapshotManager;
use fleetline_types::Event;
use serde_json::{json, Map};
use tokio::sync::Mutex;
use tracing::{error, info};

const DEFAULT_AGENT_INTERVAL: u64 = 10;
const TOKEN_WARNING_THRESHOLD_PCT: f64 = 70.0;

/// Fires an automatic snapshot every `agent_interval` `agent.invoked`
/// events, or immediately on a `session.token_warning` at ≥70% of the
/// session budget (spec 4.E). Snapshot creation never blocks the
/// triggering event's dispatch — failures publish `snapshot.failed`
/// rather than propagating.
pub struct SnapshotTrigger {
    manager: Arc<SnapshotManager>,
    bus: Arc<EventBus>,
    agent_interval: u64,
    state: Mutex<State>,
    snapshot_count: AtomicU64,
}

#[derive(Default)]
struct State {
    agent_count: u64,
    last_snapshot_at_agent: u64,
    token_count: u64,
}

impl SnapshotTrigger {
    pub fn new(manager: Arc<SnapshotManager>, bus: Arc<EventBus>) -> Self {
        Self::with_interval(manager, bus, DEFAULT_AGENT_INTERVAL)
    }

    pub fn with_interval(manager: Arc<SnapshotManager>, bus: Arc<EventBus>, agent_interval: u64) -> Self {
        Self {
            manager,
            bus,
            agent_interval,
            state: Mutex::new(State::default()),
            snapshot_count: AtomicU64::new(0),
        }
    }

    pub fn snapshot_count(&self) -> u64 {
        self.snapshot_count.load(Ordering::Relaxed)
    }

    async fn handle_agent_invoked(&self) -> Option<(String, u64, u64)> {
        let mut state = self.state.lock().await;
        state.agent_count += 1;
        let since_last = state.agent_count - state.last_snapshot_at_agent;
        if since_last >= self.agent_interval {
            state.last_snapshot_at_agent = state.agent_count;
            Some((format!("agent_count_{}", self.agent_interval), state.agent_count, state.token_count))
        } else {
            None
        }
    }

    async fn handle_token_warning(&self, event: &Event) -> Option<(String, u64, u64)> {
        let percent = event.payload.get("percent").and_then(|v| v.as_f64()).unwrap_or(0.0);
        if percent < TOKEN_WARNING_THRESHOLD_PCT {
            return None;
        }
        let tokens_used = event.payload.get("tokens_used").and_then(|v| v.as_u64()).unwrap_or(0);
        let mut state = self.state.lock().await;
        state.token_count = tokens_used;
        Some((format!("token_limit_{}pct", percent as u64), state.agent_count, tokens_used))
    }

    async fn create_and_publish(&self, session_id: &str, trigger: String, agent_count: u64, token_count: u64) {
        match self
            .manager
            .create(session_id, &trigger, agent_count, token_count, Vec::new(), None, None)
            .await
        {
            Ok(snapshot) => {
                self.snapshot_count.fetch_add(1, Ordering::Relaxed);
                info!(snapshot_id = %snapshot.snapshot_id, trigger = %trigger, "snapshot created");
                let mut payload = Map::new();
                payload.insert("snapshot_id".into(), json!(snapshot.snapshot_id));
                payload.insert("trigger".into(), json!(trigger));
                payload.insert("agent_count".into(), json!(agent_count));
                payload.insert("token_count".into(), json!(token_count));
                if let Ok(created) = Event::new("snapshot.created", session_id, payload) {
                    self.bus.publish_and_wait(created).await;
                }
            }
            Err(err) => {
                error!(error = %err, "snapshot creation failed");
                let mut payload = Map::new();
                payload.insert("trigger".into(), json!(trigger));
                payload.insert("error_msg".into(), json!(err.to_string()));
                payload.insert("agent_count".into(), json!(agent_count));
                if let Ok(failed) = Event::new("snapshot.failed", session_id, payload) {
                    self.bus.publish_and_wait(failed).await;
                }
            }
        }
    }
}

#[async_trait]
impl EventHandler for SnapshotTrigger {
    fn name(&self) -> &str {
        "snapshot-trigger"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let trigger = match event.event_type.as_str() {
            "agent.invoked" => self.handle_agent_invoked().await,
            "session.token_warning" => self.handle_token_warning(event).await,
            _ => None,
        };
        if let Some((trigger, agent_count, token_count)) = trigger {
            self.create_and_publish(&event.session_id, trigger, agent_count, token_count).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetline_core::DataPaths;
    use tempfile::TempDir;

    async fn trigger() -> (SnapshotTrigger, TempDir) {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(SnapshotManager::new(DataPaths { root: dir.path().to_path_buf() }, false));
        let bus = Arc::new(EventBus::new());
        (SnapshotTrigger::with_interval(manager, bus, 2), dir)
    }

    #[tokio::test]
    async fn fires_after_interval_agent_invocations() {
        let (trigger, _dir) = trigger().await;
        for _ in 0..2 {
            let event = Event::new("agent.invoked", "s1", Map::new()).unwrap();
            trigger.handle(&event).await.unwrap();
        }
        assert_eq!(trigger.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn token_warning_above_threshold_fires_immediately() {
        let (trigger, _dir) = trigger().await;
        let mut payload = Map::new();
        payload.insert("percent".into(), json!(75));
        payload.insert("tokens_used".into(), json!(150_000));
        let event = Event::new("session.token_warning", "s1", payload).unwrap();
        trigger.handle(&event).await.unwrap();
        assert_eq!(trigger.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn token_warning_below_threshold_does_not_fire() {
        let (trigger, _dir) = trigger().await;
        let mut payload = Map::new();
        payload.insert("percent".into(), json!(40));
        let event = Event::new("session.token_warning", "s1", payload).unwrap();
        trigger.handle(&event).await.unwrap();
        assert_eq!(trigger.snapshot_count(), 0);
    }
}
