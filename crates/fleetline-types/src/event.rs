use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::CoreError;

/// Immutable event record. Constructed once, never mutated; handlers
/// receive it by value or shared reference only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub trace_id: String,
    pub session_id: String,
}

impl Event {
    /// `trace_id` defaults to a fresh uuid v4 when not supplied.
    pub fn new(
        event_type: impl Into<String>,
        session_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Result<Self, CoreError> {
        Self::with_trace(event_type, session_id, payload, Uuid::new_v4().to_string())
    }

    pub fn with_trace(
        event_type: impl Into<String>,
        session_id: impl Into<String>,
        payload: Map<String, Value>,
        trace_id: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let event_type = event_type.into();
        let session_id = session_id.into();
        if event_type.is_empty() {
            return Err(CoreError::Validation("event_type cannot be empty".into()));
        }
        if session_id.is_empty() {
            return Err(CoreError::Validation("session_id cannot be empty".into()));
        }
        Ok(Self {
            event_type,
            timestamp: Utc::now(),
            payload,
            trace_id: trace_id.into(),
            session_id,
        })
    }

    /// Flattened representation used by the log writer and analytics
    /// ingester: one JSON object with `timestamp`, `session_id`, `trace_id`,
    /// `event_type` and every payload field promoted to the top level.
    pub fn flatten(&self) -> Value {
        let mut obj = self.payload.clone();
        obj.insert(
            "timestamp".into(),
            Value::String(self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        );
        obj.insert("session_id".into(), Value::String(self.session_id.clone()));
        obj.insert("trace_id".into(), Value::String(self.trace_id.clone()));
        obj.insert("event_type".into(), Value::String(self.event_type.clone()));
        Value::Object(obj)
    }
}

/// The closed dotted event-type registry from §6. Non-exhaustive so new
/// wire values decode as `Raw` instead of failing — the REDESIGN FLAG
/// ("reflection-based payloads" → tagged union) applied without losing
/// JSON wire compatibility: `Event::event_type` itself stays a `String`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EventKind {
    AgentInvoked,
    AgentCompleted,
    AgentFailed,
    AgentTimeout,
    AgentHandoff,
    AgentBlocked,
    ToolUsed,
    ToolError,
    ToolPerformance,
    ToolQuotaExceeded,
    SnapshotCreated,
    SnapshotRestored,
    SnapshotFailed,
    SnapshotCleanup,
    SessionStarted,
    SessionTokenWarning,
    SessionHandoffRequired,
    SessionEnded,
    CostTracked,
    CostBudgetWarning,
    CostOptimizationOpportunity,
    WorkflowStarted,
    WorkflowCompleted,
    TaskStarted,
    TaskStageChanged,
    TaskCompleted,
    TestRunStarted,
    TestRunCompleted,
    ApprovalRequired,
    ApprovalDecided,
    ApprovalGranted,
    ApprovalDenied,
    ReferenceCheckTriggered,
    ReferenceCheckCompleted,
    ModelSelected,
    ModelTierUpgrade,
    /// Forward-compat arm for any dotted name outside the closed registry.
    /// The schema registry flags these as `unvalidated` rather than
    /// rejecting them.
    Raw(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::AgentInvoked => "agent.invoked",
            EventKind::AgentCompleted => "agent.completed",
            EventKind::AgentFailed => "agent.failed",
            EventKind::AgentTimeout => "agent.timeout",
            EventKind::AgentHandoff => "agent.handoff",
            EventKind::AgentBlocked => "agent.blocked",
            EventKind::ToolUsed => "tool.used",
            EventKind::ToolError => "tool.error",
            EventKind::ToolPerformance => "tool.performance",
            EventKind::ToolQuotaExceeded => "tool.quota_exceeded",
            EventKind::SnapshotCreated => "snapshot.created",
            EventKind::SnapshotRestored => "snapshot.restored",
            EventKind::SnapshotFailed => "snapshot.failed",
            EventKind::SnapshotCleanup => "snapshot.cleanup",
            EventKind::SessionStarted => "session.started",
            EventKind::SessionTokenWarning => "session.token_warning",
            EventKind::SessionHandoffRequired => "session.handoff_required",
            EventKind::SessionEnded => "session.ended",
            EventKind::CostTracked => "cost.tracked",
            EventKind::CostBudgetWarning => "cost.budget_warning",
            EventKind::CostOptimizationOpportunity => "cost.optimization_opportunity",
            EventKind::WorkflowStarted => "workflow.started",
            EventKind::WorkflowCompleted => "workflow.completed",
            EventKind::TaskStarted => "task.started",
            EventKind::TaskStageChanged => "task.stage_changed",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TestRunStarted => "test.run_started",
            EventKind::TestRunCompleted => "test.run_completed",
            EventKind::ApprovalRequired => "approval.required",
            EventKind::ApprovalDecided => "approval.decided",
            EventKind::ApprovalGranted => "approval.granted",
            EventKind::ApprovalDenied => "approval.denied",
            EventKind::ReferenceCheckTriggered => "reference_check.triggered",
            EventKind::ReferenceCheckCompleted => "reference_check.completed",
            EventKind::ModelSelected => "model.selected",
            EventKind::ModelTierUpgrade => "model.tier_upgrade",
            EventKind::Raw(s) => s.as_str(),
        }
    }

    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "agent.invoked" => EventKind::AgentInvoked,
            "agent.completed" => EventKind::AgentCompleted,
            "agent.failed" => EventKind::AgentFailed,
            "agent.timeout" => EventKind::AgentTimeout,
            "agent.handoff" => EventKind::AgentHandoff,
            "agent.blocked" => EventKind::AgentBlocked,
            "tool.used" => EventKind::ToolUsed,
            "tool.error" => EventKind::ToolError,
            "tool.performance" => EventKind::ToolPerformance,
            "tool.quota_exceeded" => EventKind::ToolQuotaExceeded,
            "snapshot.created" => EventKind::SnapshotCreated,
            "snapshot.restored" => EventKind::SnapshotRestored,
            "snapshot.failed" => EventKind::SnapshotFailed,
            "snapshot.cleanup" => EventKind::SnapshotCleanup,
            "session.started" => EventKind::SessionStarted,
            "session.token_warning" => EventKind::SessionTokenWarning,
            "session.handoff_required" => EventKind::SessionHandoffRequired,
            "session.ended" => EventKind::SessionEnded,
            "cost.tracked" => EventKind::CostTracked,
            "cost.budget_warning" => EventKind::CostBudgetWarning,
            "cost.optimization_opportunity" => EventKind::CostOptimizationOpportunity,
            "workflow.started" => EventKind::WorkflowStarted,
            "workflow.completed" => EventKind::WorkflowCompleted,
            "task.started" => EventKind::TaskStarted,
            "task.stage_changed" => EventKind::TaskStageChanged,
            "task.completed" => EventKind::TaskCompleted,
            "test.run_started" => EventKind::TestRunStarted,
            "test.run_completed" => EventKind::TestRunCompleted,
            "approval.required" => EventKind::ApprovalRequired,
            "approval.decided" => EventKind::ApprovalDecided,
            "approval.granted" => EventKind::ApprovalGranted,
            "approval.denied" => EventKind::ApprovalDenied,
            "reference_check.triggered" => EventKind::ReferenceCheckTriggered,
            "reference_check.completed" => EventKind::ReferenceCheckCompleted,
            "model.selected" => EventKind::ModelSelected,
            "model.tier_upgrade" => EventKind::ModelTierUpgrade,
            other => EventKind::Raw(other.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Raw(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_rejects_empty_event_type() {
        let err = Event::new("", "s1", Map::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[test]
    fn constructor_rejects_empty_session_id() {
        let err = Event::new("agent.invoked", "", Map::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[test]
    fn event_kind_round_trips_known_names() {
        let kind = EventKind::parse("agent.invoked");
        assert!(kind.is_known());
        assert_eq!(kind.as_str(), "agent.invoked");
    }

    #[test]
    fn event_kind_falls_back_to_raw() {
        let kind = EventKind::parse("custom.thing");
        assert!(!kind.is_known());
        assert_eq!(kind.as_str(), "custom.thing");
    }

    #[test]
    fn flatten_promotes_payload_fields_to_top_level() {
        let mut payload = Map::new();
        payload.insert("agent".into(), Value::String("a1".into()));
        let event = Event::new("agent.invoked", "s1", payload).unwrap();
        let flat = event.flatten();
        assert_eq!(flat["agent"], Value::String("a1".into()));
        assert_eq!(flat["session_id"], Value::String("s1".into()));
        assert_eq!(flat["event_type"], Value::String("agent.invoked".into()));
    }
}
