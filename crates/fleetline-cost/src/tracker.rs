use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use fleetline_core::{EventBus, EventHandler};
use fleetline_types::Event;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tokio::sync::Mutex;
use tracing::warn;

use crate::pricing::PriceTable;

/// `(window, threshold)` — a budget warning fires once per pair per
/// process lifetime (Open Question 4: in-memory only, resets on restart).
type AlertKey = (&'static str, u32);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostTotals {
    pub total_cost_usd: f64,
    pub by_session: HashMap<String, f64>,
    pub by_model: HashMap<String, f64>,
    pub by_agent: HashMap<String, f64>,
    pub by_hour: HashMap<String, f64>,
    pub by_day: HashMap<String, f64>,
    pub by_week: HashMap<String, f64>,
}

/// Subscribes to `agent.completed` and prices token usage per model (spec
/// 4.G). Tracks running totals per session/model/agent plus hourly/
/// daily/weekly buckets (SPEC_FULL §3, `original_source/cost_tracker.py`).
/// Evaluates budget thresholds (default 50/70/90%) on every update and
/// publishes `cost.budget_warning` once per `(window, threshold)` pair.
pub struct CostTracker {
    prices: PriceTable,
    bus: Arc<EventBus>,
    totals: Mutex<CostTotals>,
    fired_alerts: Mutex<HashSet<AlertKey>>,
    hourly_cap_usd: Option<f64>,
    daily_cap_usd: Option<f64>,
    thresholds: Vec<u32>,
}

impl CostTracker {
    pub fn new(prices: PriceTable, bus: Arc<EventBus>) -> Self {
        Self {
            prices,
            bus,
            totals: Mutex::new(CostTotals::default()),
            fired_alerts: Mutex::new(HashSet::new()),
            hourly_cap_usd: None,
            daily_cap_usd: None,
            thresholds: vec![50, 70, 90],
        }
    }

    pub fn with_caps(mut self, hourly_cap_usd: Option<f64>, daily_cap_usd: Option<f64>) -> Self {
        self.hourly_cap_usd = hourly_cap_usd;
        self.daily_cap_usd = daily_cap_usd;
        self
    }

    pub async fn totals(&self) -> CostTotals {
        self.totals.lock().await.clone()
    }

    /// Flags models whose tracked spend exceeds `threshold_usd` and
    /// suggests falling back to a cheaper tier (spec 4.G optimization API).
    pub async fn optimization_opportunities(&self, threshold_usd: f64) -> Vec<(String, f64)> {
        self.totals
            .lock()
            .await
            .by_model
            .iter()
            .filter(|(_, &spend)| spend > threshold_usd)
            .map(|(model, &spend)| (model.clone(), spend))
            .collect()
    }

    async fn record(&self, session_id: &str, model: &str, agent_id: &str, cost: f64, now: DateTime<Utc>) {
        let mut totals = self.totals.lock().await;
        totals.total_cost_usd += cost;
        *totals.by_session.entry(session_id.to_string()).or_default() += cost;
        *totals.by_model.entry(model.to_string()).or_default() += cost;
        *totals.by_agent.entry(agent_id.to_string()).or_default() += cost;
        *totals.by_hour.entry(hour_bucket(now)).or_default() += cost;
        *totals.by_day.entry(day_bucket(now)).or_default() += cost;
        *totals.by_week.entry(week_bucket(now)).or_default() += cost;
    }

    async fn evaluate_thresholds(&self, session_id: &str, now: DateTime<Utc>) {
        if let Some(cap) = self.hourly_cap_usd {
            let spent = self.totals.lock().await.by_hour.get(&hour_bucket(now)).copied().unwrap_or(0.0);
            self.maybe_warn(session_id, "hourly", spent, cap).await;
        }
        if let Some(cap) = self.daily_cap_usd {
            let spent = self.totals.lock().await.by_day.get(&day_bucket(now)).copied().unwrap_or(0.0);
            self.maybe_warn(session_id, "daily", spent, cap).await;
        }
    }

    async fn maybe_warn(&self, session_id: &str, window: &'static str, spent: f64, cap: f64) {
        let percent = (spent / cap * 100.0).floor() as u32;
        for &threshold in &self.thresholds {
            if percent < threshold {
                continue;
            }
            let key = (window, threshold);
            let mut fired = self.fired_alerts.lock().await;
            if fired.contains(&key) {
                continue;
            }
            fired.insert(key);
            drop(fired);

            let mut payload = Map::new();
            payload.insert("window".into(), json!(window));
            payload.insert("threshold_pct".into(), json!(threshold));
            payload.insert("spent_usd".into(), json!(spent));
            payload.insert("cap_usd".into(), json!(cap));
            if let Ok(event) = Event::new("cost.budget_warning", session_id, payload) {
                self.bus.publish_and_wait(event).await;
            }
        }
    }
}

fn hour_bucket(now: DateTime<Utc>) -> String {
    format!("{}-{:02}-{:02}T{:02}", now.year(), now.month(), now.day(), now.hour())
}

fn day_bucket(now: DateTime<Utc>) -> String {
    format!("{}-{:02}-{:02}", now.year(), now.month(), now.day())
}

fn week_bucket(now: DateTime<Utc>) -> String {
    let iso = now.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}

#[async_trait]
impl EventHandler for CostTracker {
    fn name(&self) -> &str {
        "cost-tracker"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if event.event_type != "agent.completed" {
            return Ok(());
        }

        let model = event.payload.get("model").and_then(|v| v.as_str()).unwrap_or_default();
        let agent_id = event.payload.get("agent").and_then(|v| v.as_str()).unwrap_or_default();
        let input_tokens = event.payload.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let output_tokens = event.payload.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);

        let cost = match self.prices.cost(model, input_tokens, output_tokens) {
            Some(cost) => cost,
            None => {
                warn!(model, "no pricing entry for model, cost recorded as $0");
                0.0
            }
        };

        let now = Utc::now();
        self.record(&event.session_id, model, agent_id, cost, now).await;

        let mut payload = Map::new();
        payload.insert("model".into(), json!(model));
        payload.insert("agent".into(), json!(agent_id));
        payload.insert("cost_usd".into(), json!(cost));
        if let Ok(tracked) = Event::new("cost.tracked", &event.session_id, payload) {
            self.bus.publish(tracked);
        }

        self.evaluate_thresholds(&event.session_id, now).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::ModelPrice;
    use std::collections::HashMap as StdMap;

    fn tracker_with_caps(hourly: Option<f64>, daily: Option<f64>) -> CostTracker {
        let mut prices = StdMap::new();
        prices.insert(
            "strong-1".to_string(),
            ModelPrice { input_price_per_million: 3.0, output_price_per_million: 15.0 },
        );
        CostTracker::new(PriceTable::new(prices), Arc::new(EventBus::new())).with_caps(hourly, daily)
    }

    fn completed_event(input_tokens: u64, output_tokens: u64) -> Event {
        let mut payload = Map::new();
        payload.insert("model".into(), json!("strong-1"));
        payload.insert("agent".into(), json!("a1"));
        payload.insert("input_tokens".into(), json!(input_tokens));
        payload.insert("output_tokens".into(), json!(output_tokens));
        Event::new("agent.completed", "s1", payload).unwrap()
    }

    #[tokio::test]
    async fn known_model_accumulates_cost_by_session_and_model() {
        let tracker = tracker_with_caps(None, None);
        tracker.handle(&completed_event(1_000_000, 0)).await.unwrap();
        let totals = tracker.totals().await;
        assert!((totals.by_session["s1"] - 3.0).abs() < 1e-9);
        assert!((totals.by_model["strong-1"] - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_model_costs_zero_and_does_not_panic() {
        let tracker = CostTracker::new(PriceTable::default(), Arc::new(EventBus::new()));
        let mut payload = Map::new();
        payload.insert("model".into(), json!("mystery"));
        payload.insert("input_tokens".into(), json!(1000));
        let event = Event::new("agent.completed", "s1", payload).unwrap();
        tracker.handle(&event).await.unwrap();
        let totals = tracker.totals().await;
        assert_eq!(totals.total_cost_usd, 0.0);
    }

    #[tokio::test]
    async fn threshold_breach_fires_once_per_window_threshold_pair() {
        let tracker = tracker_with_caps(Some(1.0), None);
        // 1_000_000 input tokens -> $3, well above every threshold of a $1 cap.
        tracker.handle(&completed_event(1_000_000, 0)).await.unwrap();
        tracker.handle(&completed_event(1, 0)).await.unwrap();
        // no direct assertion on bus fan-out here (no subscriber attached);
        // this exercises the dedup path without panicking twice.
        let totals = tracker.totals().await;
        assert!(totals.total_cost_usd > 3.0);
    }
}
