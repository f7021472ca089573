use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleetline_core::{DataPaths, EventBus, EventHandler, TaskStore};
use fleetline_types::Event;
use serde_json::{json, Map};
use tokio::sync::Mutex;
use tracing::{info, warn};

const DEFAULT_AGENT_INTERVAL: u64 = 10;
const DEFAULT_TOKEN_INTERVAL: u64 = 20_000;
const DEFAULT_TOP_K: usize = 3;

#[derive(Default)]
struct State {
    agent_count: u64,
    last_check_at_agent: u64,
    token_count: u64,
    last_check_at_tokens: u64,
}

/// Analogous to the snapshot trigger, but surfaces open requirements from
/// the PRD instead of capturing state (spec 4.F). Fires every `agent`
/// agents invoked or every `tokens` tokens consumed since the last check,
/// selecting up to `top_k` incomplete, highest-priority requirements.
/// `force()` bypasses both counters.
pub struct ReferenceCheckTrigger {
    tasks: Arc<TaskStore>,
    paths: DataPaths,
    bus: Arc<EventBus>,
    agent_interval: u64,
    token_interval: u64,
    top_k: usize,
    state: Mutex<State>,
    check_count: AtomicU64,
}

impl ReferenceCheckTrigger {
    pub fn new(tasks: Arc<TaskStore>, paths: DataPaths, bus: Arc<EventBus>) -> Self {
        Self {
            tasks,
            paths,
            bus,
            agent_interval: DEFAULT_AGENT_INTERVAL,
            token_interval: DEFAULT_TOKEN_INTERVAL,
            top_k: DEFAULT_TOP_K,
            state: Mutex::new(State::default()),
            check_count: AtomicU64::new(0),
        }
    }

    pub fn with_intervals(mut self, agent_interval: u64, token_interval: u64) -> Self {
        self.agent_interval = agent_interval;
        self.token_interval = token_interval;
        self
    }

    pub fn check_count(&self) -> u64 {
        self.check_count.load(Ordering::Relaxed)
    }

    /// Bypasses the counters entirely: always renders and publishes a
    /// reference check for the given session.
    pub async fn force(&self, session_id: &str) {
        self.run_check(session_id).await;
    }

    async fn prd_exists(&self) -> bool {
        tokio::fs::metadata(self.paths.prd_file()).await.is_ok()
    }

    async fn maybe_fire_on_agent(&self) -> bool {
        let mut state = self.state.lock().await;
        state.agent_count += 1;
        if state.agent_count - state.last_check_at_agent >= self.agent_interval {
            state.last_check_at_agent = state.agent_count;
            true
        } else {
            false
        }
    }

    async fn maybe_fire_on_tokens(&self, event: &Event) -> bool {
        let tokens_used = event.payload.get("tokens_used").and_then(|v| v.as_u64()).unwrap_or(0);
        let mut state = self.state.lock().await;
        state.token_count = state.token_count.max(tokens_used);
        if state.token_count - state.last_check_at_tokens >= self.token_interval {
            state.last_check_at_tokens = state.token_count;
            true
        } else {
            false
        }
    }

    async fn run_check(&self, session_id: &str) {
        if !self.prd_exists().await {
            warn!("reference check fired but no PRD document is present, skipping");
            return;
        }

        let requirements = self.tasks.top_incomplete(self.top_k).await;
        self.check_count.fetch_add(1, Ordering::Relaxed);

        let mut triggered_payload = Map::new();
        triggered_payload.insert("requirement_count".into(), json!(requirements.len()));
        if let Ok(triggered) = Event::new("reference_check.triggered", session_id, triggered_payload) {
            self.bus.publish_and_wait(triggered).await;
        }

        let prompt = render_reference_prompt(&requirements);
        info!(session_id, count = requirements.len(), "reference check completed");

        let mut completed_payload = Map::new();
        completed_payload.insert(
            "requirement_ids".into(),
            json!(requirements.iter().map(|t| t.id.clone()).collect::<Vec<_>>()),
        );
        completed_payload.insert("prompt".into(), json!(prompt));
        if let Ok(completed) = Event::new("reference_check.completed", session_id, completed_payload) {
            self.bus.publish_and_wait(completed).await;
        }
    }
}

fn render_reference_prompt(requirements: &[fleetline_types::TaskRecord]) -> String {
    if requirements.is_empty() {
        return "No open requirements remain.".to_string();
    }
    let mut prompt = String::from("Open requirements to verify against current behavior:\n");
    for task in requirements {
        prompt.push_str(&format!("- [{}] (p{}) {}\n", task.id, task.priority, task.description));
    }
    prompt
}

#[async_trait]
impl EventHandler for ReferenceCheckTrigger {
    fn name(&self) -> &str {
        "reference-check-trigger"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let should_fire = match event.event_type.as_str() {
            "agent.invoked" => self.maybe_fire_on_agent().await,
            "agent.completed" => self.maybe_fire_on_tokens(event).await,
            _ => false,
        };
        if should_fire {
            self.run_check(&event.session_id).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn harness() -> (ReferenceCheckTrigger, TempDir) {
        let dir = TempDir::new().unwrap();
        let paths = DataPaths { root: dir.path().to_path_buf() };
        tokio::fs::create_dir_all(paths.requirements_dir()).await.unwrap();
        tokio::fs::write(paths.prd_file(), b"# PRD").await.unwrap();
        let tasks = Arc::new(TaskStore::new(paths.clone()));
        let bus = Arc::new(EventBus::new());
        let trigger = ReferenceCheckTrigger::new(tasks, paths, bus).with_intervals(2, 1_000_000);
        (trigger, dir)
    }

    #[tokio::test]
    async fn fires_after_interval_agent_invocations() {
        let (trigger, _dir) = harness().await;
        for _ in 0..2 {
            let event = Event::new("agent.invoked", "s1", Map::new()).unwrap();
            trigger.handle(&event).await.unwrap();
        }
        assert_eq!(trigger.check_count(), 1);
    }

    #[tokio::test]
    async fn without_prd_no_check_is_recorded() {
        let dir = TempDir::new().unwrap();
        let paths = DataPaths { root: dir.path().to_path_buf() };
        let tasks = Arc::new(TaskStore::new(paths.clone()));
        let bus = Arc::new(EventBus::new());
        let trigger = ReferenceCheckTrigger::new(tasks, paths, bus).with_intervals(1, 1_000_000);
        let event = Event::new("agent.invoked", "s1", Map::new()).unwrap();
        trigger.handle(&event).await.unwrap();
        assert_eq!(trigger.check_count(), 0);
    }

    #[tokio::test]
    async fn force_bypasses_counters() {
        let (trigger, _dir) = harness().await;
        trigger.force("s1").await;
        assert_eq!(trigger.check_count(), 1);
    }

    #[tokio::test]
    async fn selects_top_k_incomplete_by_priority() {
        let (trigger, _dir) = harness().await;
        trigger.tasks.create("low", "low prio", 1).await.unwrap();
        trigger.tasks.create("high", "high prio", 5).await.unwrap();
        trigger.tasks.create("mid", "mid prio", 3).await.unwrap();
        trigger.force("s1").await;
        assert_eq!(trigger.check_count(), 1);
    }
}
