use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Terminated,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Terminated
        )
    }

    /// `pending -> running -> {paused <-> running} -> completed|failed|terminated`.
    /// Leaving a terminal state is never allowed.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (AgentStatus::Pending, AgentStatus::Running) => true,
            (AgentStatus::Pending, AgentStatus::Terminated) => true,
            (AgentStatus::Pending, AgentStatus::Failed) => true,
            (AgentStatus::Running, AgentStatus::Paused) => true,
            (AgentStatus::Paused, AgentStatus::Running) => true,
            (_, AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Terminated) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentBudget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_limit_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub elapsed_seconds: u64,
    #[serde(default)]
    pub heartbeat_age_seconds: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub agent_type: String,
    pub model: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub budget: AgentBudget,
    #[serde(default)]
    pub metrics: AgentMetrics,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentRecord {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            model: model.into(),
            status: AgentStatus::Pending,
            session_id: None,
            task_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
            budget: AgentBudget::default(),
            metrics: AgentMetrics::default(),
            metadata: Map::new(),
        }
    }

    /// Applies a lifecycle transition, stamping timestamps per the
    /// agent-record invariants. Returns `false` (no-op) for illegal
    /// transitions out of a terminal state.
    pub fn transition(&mut self, next: AgentStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        if next == AgentStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}
