use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetline_core::EventHandler;
use fleetline_types::{DerivedStats, Event, WindowBucket};
use tokio::sync::Mutex;

/// Bounded reservoir size for tail-latency sampling (spec 4.N: "tail-latency
/// uses a bounded reservoir sample").
const RESERVOIR_CAP: usize = 256;

struct Window {
    size: Duration,
    slot: Duration,
    buckets: VecDeque<WindowBucket>,
}

impl Window {
    fn new(size: Duration, slot: Duration) -> Self {
        Self { size, slot, buckets: VecDeque::new() }
    }

    fn current_bucket(&mut self, now: DateTime<Utc>) -> &mut WindowBucket {
        let needs_new = match self.buckets.back() {
            Some(bucket) => (now - bucket.start).num_milliseconds() as u128 >= self.slot.as_millis(),
            None => true,
        };
        if needs_new {
            self.buckets.push_back(WindowBucket::new(now));
        }
        self.evict(now);
        self.buckets.back_mut().expect("just pushed")
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.buckets.front() {
            let age_ms = (now - front.start).num_milliseconds();
            if age_ms > self.size.as_millis() as i64 {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn derive(&self) -> DerivedStats {
        let window_secs = self.size.as_secs_f64().max(1.0);
        let mut request_count: u64 = 0;
        let mut tokens: u64 = 0;
        let mut cost: f64 = 0.0;
        let mut failures: u64 = 0;
        let mut durations: Vec<u64> = Vec::new();

        for bucket in &self.buckets {
            request_count += bucket.events_by_type.values().sum::<u64>();
            tokens += bucket.tokens;
            cost += bucket.cost;
            failures += bucket.failures;
            durations.extend_from_slice(&bucket.agent_durations_ms);
        }

        durations.sort_unstable();
        let avg = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };
        let percentile = |p: f64| -> f64 {
            if durations.is_empty() {
                return 0.0;
            }
            let idx = ((durations.len() as f64 - 1.0) * p).round() as usize;
            durations[idx.min(durations.len() - 1)] as f64
        };

        DerivedStats {
            requests_per_sec: request_count as f64 / window_secs,
            avg_duration_ms: avg,
            p50_duration_ms: percentile(0.50),
            p95_duration_ms: percentile(0.95),
            tokens_per_sec: tokens as f64 / window_secs,
            cost_per_min: cost / (window_secs / 60.0),
            failures_per_min: failures as f64 / (window_secs / 60.0),
        }
    }
}

/// Subscribes to every event (wildcard) and folds it into one or more
/// rolling windows of fixed-size buckets (spec 4.N). Memory is bounded by
/// `window_size / slot_size`, independent of event rate.
pub struct MetricsAggregator {
    windows: Mutex<HashMap<String, Window>>,
}

impl MetricsAggregator {
    /// `windows` is `(name, window_size, slot_size)`; a typical
    /// configuration tracks a `1m` and a `1h` window at a 1s slot.
    pub fn new(windows: Vec<(&str, Duration, Duration)>) -> Self {
        let mut map = HashMap::new();
        for (name, size, slot) in windows {
            map.insert(name.to_string(), Window::new(size, slot));
        }
        Self { windows: Mutex::new(map) }
    }

    pub async fn record(&self, event: &Event) {
        let now = event.timestamp;
        let mut windows = self.windows.lock().await;
        for window in windows.values_mut() {
            let bucket = window.current_bucket(now);
            *bucket.events_by_type.entry(event.event_type.clone()).or_insert(0) += 1;

            match event.event_type.as_str() {
                "agent.completed" | "agent.failed" | "agent.timeout" => {
                    if let Some(duration) = event.payload.get("duration_ms").and_then(|v| v.as_u64()) {
                        if bucket.agent_durations_ms.len() < RESERVOIR_CAP {
                            bucket.agent_durations_ms.push(duration);
                        }
                    }
                    if let Some(tokens) = event.payload.get("tokens_used").and_then(|v| v.as_u64()) {
                        bucket.tokens += tokens;
                    }
                    if event.event_type != "agent.completed" {
                        bucket.failures += 1;
                    }
                }
                "cost.tracked" => {
                    if let Some(cost) = event.payload.get("cost_usd").and_then(|v| v.as_f64()) {
                        bucket.cost += cost;
                    }
                }
                _ => {}
            }
        }
    }

    pub async fn stats(&self, window_name: &str) -> Option<DerivedStats> {
        self.windows.lock().await.get(window_name).map(Window::derive)
    }

    pub async fn window_names(&self) -> Vec<String> {
        self.windows.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl EventHandler for MetricsAggregator {
    fn name(&self) -> &str {
        "metrics-aggregator"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.record(event).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn event_with(event_type: &str, payload: Map<String, serde_json::Value>) -> Event {
        Event::new(event_type, "s1", payload).unwrap()
    }

    #[tokio::test]
    async fn records_requests_and_tokens_into_window() {
        let aggregator = MetricsAggregator::new(vec![("1m", Duration::from_secs(60), Duration::from_secs(1))]);
        let mut payload = Map::new();
        payload.insert("tokens_used".into(), json!(500));
        payload.insert("duration_ms".into(), json!(120));
        aggregator.record(&event_with("agent.completed", payload)).await;

        let stats = aggregator.stats("1m").await.unwrap();
        assert!(stats.tokens_per_sec > 0.0);
        assert!(stats.requests_per_sec > 0.0);
        assert_eq!(stats.avg_duration_ms, 120.0);
    }

    #[tokio::test]
    async fn failures_are_counted_separately_from_completions() {
        let aggregator = MetricsAggregator::new(vec![("1m", Duration::from_secs(60), Duration::from_secs(1))]);
        aggregator.record(&event_with("agent.failed", Map::new())).await;
        let stats = aggregator.stats("1m").await.unwrap();
        assert!(stats.failures_per_min > 0.0);
    }

    #[tokio::test]
    async fn unknown_window_name_returns_none() {
        let aggregator = MetricsAggregator::new(vec![("1m", Duration::from_secs(60), Duration::from_secs(1))]);
        assert!(aggregator.stats("1h").await.is_none());
    }
}
