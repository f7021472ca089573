use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-window bucket for the rolling-window metrics aggregator. One bucket
/// covers one time slot (default one second); a window is a deque of these
/// bounded to `window_seconds / slot_seconds` entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowBucket {
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub events_by_type: HashMap<String, u64>,
    /// Bounded reservoir sample of agent run durations observed in this
    /// slot, used to fold tail-latency percentiles without retaining every
    /// observation.
    #[serde(default)]
    pub agent_durations_ms: Vec<u64>,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub failures: u64,
}

impl WindowBucket {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerivedStats {
    pub requests_per_sec: f64,
    pub avg_duration_ms: f64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub tokens_per_sec: f64,
    pub cost_per_min: f64,
    pub failures_per_min: f64,
}
