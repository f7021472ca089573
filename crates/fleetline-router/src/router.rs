use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use fleetline_core::{EventBus, EventHandler};
use fleetline_types::Event;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tokio::sync::Mutex;
use tracing::info;

use crate::complexity::{score, TaskSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Weak,
    Base,
    Strong,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Weak => "weak",
            Tier::Base => "base",
            Tier::Strong => "strong",
        }
    }

    /// `weak -> base -> strong`, saturating at `strong`.
    pub fn upgrade(self) -> Tier {
        match self {
            Tier::Weak => Tier::Base,
            Tier::Base | Tier::Strong => Tier::Strong,
        }
    }

    /// `strong -> base -> weak`, saturating at `weak`.
    pub fn downgrade(self) -> Tier {
        match self {
            Tier::Strong => Tier::Base,
            Tier::Base | Tier::Weak => Tier::Weak,
        }
    }
}

/// `score <= 3 -> weak`, `score <= 7 -> base`, else `strong` (spec 4.L).
pub fn tier_for_score(task_score: u8) -> Tier {
    match task_score {
        0..=3 => Tier::Weak,
        4..=7 => Tier::Base,
        _ => Tier::Strong,
    }
}

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub name: String,
    pub tier: Tier,
    pub priority: i32,
    pub free_tier: bool,
}

/// Carried verbatim from `original_source/src/orchestration/model_router.py`
/// (SPEC_FULL §3): running counters a dashboard or CLI can query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingStats {
    pub total_routes: u64,
    pub by_tier: std::collections::HashMap<String, u64>,
    pub upgrades: u64,
    pub downgrades: u64,
    pub free_tier_used: u64,
}

/// Scores a task, selects a tier, and picks a model within that tier
/// (spec 4.L). `force_strong_for` overrides the scored tier for named task
/// types; `prefer_free_tier` prefers a free-tier model within the chosen
/// tier before falling back to the highest-priority paid one — both kept
/// verbatim from the original as config-driven behavior (SPEC_FULL §3).
pub struct ModelRouter {
    models: Vec<ModelEntry>,
    force_strong_for: HashSet<String>,
    prefer_free_tier: bool,
    stats: Mutex<RoutingStats>,
}

impl ModelRouter {
    pub fn new(models: Vec<ModelEntry>, force_strong_for: HashSet<String>, prefer_free_tier: bool) -> Self {
        Self {
            models,
            force_strong_for,
            prefer_free_tier,
            stats: Mutex::new(RoutingStats::default()),
        }
    }

    pub async fn stats(&self) -> RoutingStats {
        self.stats.lock().await.clone()
    }

    pub async fn route(&self, task: &TaskSpec) -> Option<(Tier, ModelEntry)> {
        let task_score = score(task);
        let tier = if self.force_strong_for.contains(&task.task_type) {
            Tier::Strong
        } else {
            tier_for_score(task_score)
        };
        let model = self.select_model(tier).await?;

        let mut stats = self.stats.lock().await;
        stats.total_routes += 1;
        *stats.by_tier.entry(tier.as_str().to_string()).or_default() += 1;
        if model.free_tier {
            stats.free_tier_used += 1;
        }
        Some((tier, model))
    }

    async fn select_model(&self, tier: Tier) -> Option<ModelEntry> {
        let candidates: Vec<&ModelEntry> = self.models.iter().filter(|m| m.tier == tier).collect();
        if candidates.is_empty() {
            return None;
        }
        if self.prefer_free_tier {
            if let Some(free) = candidates.iter().filter(|m| m.free_tier).max_by_key(|m| m.priority) {
                return Some((*free).clone());
            }
        }
        candidates.into_iter().max_by_key(|m| m.priority).cloned()
    }

    pub async fn upgrade_tier(&self, current: Tier, reason: &str) -> Tier {
        let next = current.upgrade();
        if next != current {
            self.stats.lock().await.upgrades += 1;
            info!(from = current.as_str(), to = next.as_str(), reason, "tier upgraded");
        }
        next
    }

    pub async fn downgrade_tier(&self, current: Tier, reason: &str) -> Tier {
        let next = current.downgrade();
        if next != current {
            self.stats.lock().await.downgrades += 1;
            info!(from = current.as_str(), to = next.as_str(), reason, "tier downgraded");
        }
        next
    }

    pub fn model_for(&self, tier: Tier) -> Option<&ModelEntry> {
        self.models.iter().filter(|m| m.tier == tier).max_by_key(|m| m.priority)
    }
}

/// Phrases in an `agent.failed` error message that suggest the failure was
/// a capability shortfall rather than an environment error, worth
/// recommending a tier upgrade for.
const QUALITY_FAILURE_PATTERNS: &[&str] = &[
    "could not understand",
    "failed to produce",
    "incoherent",
    "hallucinat",
    "low quality",
    "insufficient reasoning",
];

/// Converts `agent.invoked` into a `model.selected` emission, and on
/// `agent.failed` whose error text matches a quality pattern, emits a
/// `model.tier_upgrade` recommendation — idempotent per `(agent, session)`
/// (spec 4.L subscriber half).
pub struct ModelRoutingSubscriber {
    router: Arc<ModelRouter>,
    bus: Arc<EventBus>,
    recommended: Mutex<HashSet<(String, String)>>,
}

impl ModelRoutingSubscriber {
    pub fn new(router: Arc<ModelRouter>, bus: Arc<EventBus>) -> Self {
        Self {
            router,
            bus,
            recommended: Mutex::new(HashSet::new()),
        }
    }

    async fn handle_invoked(&self, event: &Event) -> anyhow::Result<()> {
        let task_type = event.payload.get("task_type").and_then(|v| v.as_str()).unwrap_or("code_implementation");
        let context_tokens = event.payload.get("context_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let files = event
            .payload
            .get("files")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let task = TaskSpec {
            task_type: task_type.to_string(),
            context_tokens,
            files,
            weak_tier_recent_failure: false,
        };

        let Some((tier, model)) = self.router.route(&task).await else {
            return Ok(());
        };

        let mut payload = Map::new();
        payload.insert("agent".into(), json!(event.payload.get("agent").cloned().unwrap_or(json!(""))));
        payload.insert("tier".into(), json!(tier.as_str()));
        payload.insert("model".into(), json!(model.name));
        if let Ok(selected) = Event::new("model.selected", &event.session_id, payload) {
            self.bus.publish(selected);
        }
        Ok(())
    }

    async fn handle_failed(&self, event: &Event) -> anyhow::Result<()> {
        let error = event.payload.get("error").and_then(|v| v.as_str()).unwrap_or("");
        let lowered = error.to_ascii_lowercase();
        if !QUALITY_FAILURE_PATTERNS.iter().any(|p| lowered.contains(p)) {
            return Ok(());
        }

        let agent = event.payload.get("agent").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let key = (event.session_id.clone(), agent.clone());
        {
            let mut recommended = self.recommended.lock().await;
            if recommended.contains(&key) {
                return Ok(());
            }
            recommended.insert(key);
        }

        let mut payload = Map::new();
        payload.insert("agent".into(), json!(agent));
        payload.insert("reason".into(), json!("quality_failure"));
        if let Ok(upgrade) = Event::new("model.tier_upgrade", &event.session_id, payload) {
            self.bus.publish(upgrade);
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ModelRoutingSubscriber {
    fn name(&self) -> &str {
        "model-routing"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match event.event_type.as_str() {
            "agent.invoked" => self.handle_invoked(event).await,
            "agent.failed" => self.handle_failed(event).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_models() -> Vec<ModelEntry> {
        vec![
            ModelEntry { name: "weak-free".into(), tier: Tier::Weak, priority: 1, free_tier: true },
            ModelEntry { name: "weak-paid".into(), tier: Tier::Weak, priority: 2, free_tier: false },
            ModelEntry { name: "base-1".into(), tier: Tier::Base, priority: 1, free_tier: false },
            ModelEntry { name: "strong-1".into(), tier: Tier::Strong, priority: 1, free_tier: false },
        ]
    }

    #[tokio::test]
    async fn log_summary_routes_to_weak_tier_preferring_free() {
        let router = ModelRouter::new(sample_models(), HashSet::new(), true);
        let task = TaskSpec { task_type: "log_summary".into(), context_tokens: 5000, files: vec![], weak_tier_recent_failure: false };
        let (tier, model) = router.route(&task).await.unwrap();
        assert_eq!(tier, Tier::Weak);
        assert_eq!(model.name, "weak-free");
    }

    #[tokio::test]
    async fn force_strong_for_overrides_scored_tier() {
        let mut force = HashSet::new();
        force.insert("log_summary".to_string());
        let router = ModelRouter::new(sample_models(), force, false);
        let task = TaskSpec { task_type: "log_summary".into(), context_tokens: 100, files: vec![], weak_tier_recent_failure: false };
        let (tier, model) = router.route(&task).await.unwrap();
        assert_eq!(tier, Tier::Strong);
        assert_eq!(model.name, "strong-1");
    }

    #[tokio::test]
    async fn upgrade_and_downgrade_saturate_at_the_ends() {
        let router = ModelRouter::new(sample_models(), HashSet::new(), false);
        assert_eq!(router.upgrade_tier(Tier::Strong, "x").await, Tier::Strong);
        assert_eq!(router.downgrade_tier(Tier::Weak, "x").await, Tier::Weak);
        assert_eq!(router.upgrade_tier(Tier::Weak, "x").await, Tier::Base);
    }

    #[tokio::test]
    async fn failed_with_quality_pattern_recommends_upgrade_once() {
        let router = Arc::new(ModelRouter::new(sample_models(), HashSet::new(), false));
        let bus = Arc::new(EventBus::new());
        let subscriber = ModelRoutingSubscriber::new(router, bus);

        let mut payload = Map::new();
        payload.insert("agent".into(), json!("a1"));
        payload.insert("error".into(), json!("model output was incoherent"));
        let event = Event::new("agent.failed", "s1", payload).unwrap();
        subscriber.handle(&event).await.unwrap();
        subscriber.handle(&event).await.unwrap();

        assert_eq!(subscriber.recommended.lock().await.len(), 1);
    }
}
