use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use fleetline_core::{validate as validate_permission, EventBus, Operation, ProfileStore, ToolCall};
use fleetline_types::{ApprovalRecord, ApprovalStatus, Event};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::risk::{score as score_risk, ToolInvocation};

const DEFAULT_APPROVAL_THRESHOLD: f64 = 0.7;

/// A tool call as presented to the proxy — everything `validate_permission`
/// and the risk scorer need, plus the invocation metadata carried through
/// to `tool.used`.
#[derive(Debug, Clone)]
pub struct ProxyRequest<'a> {
    pub tool: &'a str,
    pub operation: Operation,
    pub path: Option<&'a Path>,
    pub requires_bash: bool,
    pub requires_network: bool,
    pub command: Option<&'a str>,
    pub payload_bytes: usize,
    pub modifies_tests: bool,
    pub agent: Option<&'a str>,
    pub profile: &'a str,
    /// Bypass signals (spec 4.K item 3 / SPEC_FULL §3): an already-granted
    /// `approval_id`, an `approved` flag set by the caller, or neither.
    pub approval_id: Option<&'a str>,
    pub approved: bool,
}

/// `{success, result?, error?}` — the proxy never throws (spec 4.K).
#[derive(Debug, Clone, Serialize)]
pub struct ProxyResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyResult {
    fn ok(result: Value) -> Self {
        Self { success: true, result: Some(result), error: None }
    }

    fn err(error: impl Into<String>) -> Self {
        Self { success: false, result: None, error: Some(error.into()) }
    }
}

/// Anything the caller's tool registry can execute once permission and
/// risk checks pass. A boxed async callable, the same shape the workflow
/// coordinator uses for agent-type handlers.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool: &str, path: Option<&Path>) -> anyhow::Result<Value>;
}

/// Wraps every tool invocation with permission validation, risk scoring,
/// and approval gating before dispatching to a `ToolExecutor` (spec 4.K).
pub struct ToolProxy {
    profiles: Arc<ProfileStore>,
    approvals: Arc<fleetline_core::ApprovalStore>,
    bus: Arc<EventBus>,
    executor: Arc<dyn ToolExecutor>,
    project_root: PathBuf,
    approvals_enabled: bool,
    approval_threshold: f64,
}

impl ToolProxy {
    pub fn new(
        profiles: Arc<ProfileStore>,
        approvals: Arc<fleetline_core::ApprovalStore>,
        bus: Arc<EventBus>,
        executor: Arc<dyn ToolExecutor>,
        project_root: PathBuf,
    ) -> Self {
        Self {
            profiles,
            approvals,
            bus,
            executor,
            project_root,
            approvals_enabled: true,
            approval_threshold: DEFAULT_APPROVAL_THRESHOLD,
        }
    }

    pub fn with_approvals(mut self, enabled: bool, threshold: f64) -> Self {
        self.approvals_enabled = enabled;
        self.approval_threshold = threshold;
        self
    }

    fn bypassed(request: &ProxyRequest<'_>) -> bool {
        request.approved || request.approval_id.is_some() || std::env::var("SUBAGENT_APPROVAL_BYPASS").is_ok()
    }

    pub async fn call(&self, session_id: &str, request: ProxyRequest<'_>) -> ProxyResult {
        let profile = self.profiles.get(request.profile).await;

        let call = ToolCall {
            tool: request.tool,
            operation: request.operation,
            path: request.path,
            requires_bash: request.requires_bash,
            requires_network: request.requires_network,
        };
        let permission = validate_permission(&call, &self.project_root, &profile);
        if !permission.allowed {
            let reason = permission.reason.clone().unwrap_or_else(|| "denied".to_string());
            self.log_tool_used(session_id, &request, false, 0, Some(&reason)).await;
            return ProxyResult::err(reason);
        }

        let outside_project = request
            .path
            .map(|p| !self.project_root.join(p).starts_with(&self.project_root))
            .unwrap_or(false);
        let invocation = ToolInvocation {
            operation: request.operation,
            path: request.path,
            requires_bash: request.requires_bash,
            requires_network: request.requires_network,
            command: request.command,
            payload_bytes: request.payload_bytes,
            modifies_tests: request.modifies_tests,
            outside_project,
        };
        let risk = score_risk(&invocation);

        if self.approvals_enabled && risk.score >= self.approval_threshold && !Self::bypassed(&request) {
            let record = ApprovalRecord {
                approval_id: Uuid::new_v4().to_string(),
                status: ApprovalStatus::Required,
                tool: request.tool.to_string(),
                risk_score: risk.score,
                reasons: risk.reasons.clone(),
                action: request.command.map(str::to_string).unwrap_or_else(|| request.tool.to_string()),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                decision: None,
                file_path: request.path.map(|p| p.to_string_lossy().to_string()),
                agent: request.agent.map(str::to_string),
                profile: Some(request.profile.to_string()),
                requires_network: request.requires_network,
                requires_bash: request.requires_bash,
                modifies_tests: request.modifies_tests,
                summary: None,
            };
            if let Err(err) = self.approvals.persist_new(record.clone()).await {
                warn!(error = %err, "failed to persist approval record");
            }

            let mut payload = Map::new();
            payload.insert("approval_id".into(), json!(record.approval_id));
            payload.insert("tool".into(), json!(request.tool));
            payload.insert("risk_score".into(), json!(risk.score));
            payload.insert("reasons".into(), json!(risk.reasons));
            if let Ok(event) = Event::new("approval.required", session_id, payload) {
                self.bus.publish_and_wait(event).await;
            }

            self.log_tool_used(session_id, &request, false, 0, Some("approval_required")).await;
            return ProxyResult::err("approval_required");
        }

        let start = Instant::now();
        let outcome = self.executor.execute(request.tool, request.path).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                self.log_tool_used(session_id, &request, true, elapsed_ms, None).await;
                ProxyResult::ok(result)
            }
            Err(err) => {
                let message = err.to_string();
                self.log_tool_used(session_id, &request, false, elapsed_ms, Some(&message)).await;
                ProxyResult::err(message)
            }
        }
    }

    async fn log_tool_used(&self, session_id: &str, request: &ProxyRequest<'_>, success: bool, duration_ms: u64, error: Option<&str>) {
        let mut payload = Map::new();
        payload.insert("tool".into(), json!(request.tool));
        payload.insert("success".into(), json!(success));
        payload.insert("duration_ms".into(), json!(duration_ms));
        if let Some(agent) = request.agent {
            payload.insert("agent".into(), json!(agent));
        }
        if let Some(error) = error {
            payload.insert("error".into(), json!(error));
        }
        info!(tool = request.tool, success, duration_ms, "tool.used");
        if let Ok(event) = Event::new("tool.used", session_id, payload) {
            self.bus.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetline_core::ApprovalStore;
    use fleetline_core::storage_paths::DataPaths;
    use tempfile::TempDir;

    struct EchoExecutor;

    #[async_trait::async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, tool: &str, _path: Option<&Path>) -> anyhow::Result<Value> {
            Ok(json!({"ran": tool}))
        }
    }

    struct FailingExecutor;

    #[async_trait::async_trait]
    impl ToolExecutor for FailingExecutor {
        async fn execute(&self, _tool: &str, _path: Option<&Path>) -> anyhow::Result<Value> {
            anyhow::bail!("tool blew up")
        }
    }

    fn proxy(dir: &TempDir, executor: Arc<dyn ToolExecutor>) -> ToolProxy {
        ToolProxy::new(
            Arc::new(ProfileStore::new()),
            Arc::new(ApprovalStore::new(DataPaths { root: dir.path().to_path_buf() })),
            Arc::new(EventBus::new()),
            executor,
            dir.path().to_path_buf(),
        )
    }

    #[tokio::test]
    async fn low_risk_read_executes_and_succeeds() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy(&dir, Arc::new(EchoExecutor));
        let path = PathBuf::from("src/main.rs");
        let request = ProxyRequest {
            tool: "read",
            operation: Operation::Read,
            path: Some(&path),
            requires_bash: false,
            requires_network: false,
            command: None,
            payload_bytes: 100,
            modifies_tests: false,
            agent: Some("a1"),
            profile: "default",
            approval_id: None,
            approved: false,
        };
        let result = proxy.call("s1", request).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn high_risk_delete_requires_approval_without_bypass() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy(&dir, Arc::new(EchoExecutor));
        let path = PathBuf::from("src/main.rs");
        let request = ProxyRequest {
            tool: "delete",
            operation: Operation::Delete,
            path: Some(&path),
            requires_bash: false,
            requires_network: false,
            command: None,
            payload_bytes: 0,
            modifies_tests: false,
            agent: Some("a1"),
            profile: "default",
            approval_id: None,
            approved: false,
        };
        let result = proxy.call("s1", request).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("approval_required"));
    }

    #[tokio::test]
    async fn high_risk_delete_with_approved_flag_bypasses_gate() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy(&dir, Arc::new(EchoExecutor));
        let path = PathBuf::from("src/main.rs");
        let request = ProxyRequest {
            tool: "delete",
            operation: Operation::Delete,
            path: Some(&path),
            requires_bash: false,
            requires_network: false,
            command: None,
            payload_bytes: 0,
            modifies_tests: false,
            agent: Some("a1"),
            profile: "default",
            approval_id: None,
            approved: true,
        };
        let result = proxy.call("s1", request).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn executor_failure_is_reported_not_thrown() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy(&dir, Arc::new(FailingExecutor));
        let path = PathBuf::from("readme.md");
        let request = ProxyRequest {
            tool: "read",
            operation: Operation::Read,
            path: Some(&path),
            requires_bash: false,
            requires_network: false,
            command: None,
            payload_bytes: 10,
            modifies_tests: false,
            agent: None,
            profile: "default",
            approval_id: None,
            approved: false,
        };
        let result = proxy.call("s1", request).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("tool blew up"));
    }

    #[tokio::test]
    async fn path_outside_project_is_denied_by_permission_check() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy(&dir, Arc::new(EchoExecutor));
        let path = PathBuf::from("../../etc/passwd");
        let request = ProxyRequest {
            tool: "read",
            operation: Operation::Read,
            path: Some(&path),
            requires_bash: false,
            requires_network: false,
            command: None,
            payload_bytes: 10,
            modifies_tests: false,
            agent: None,
            profile: "default",
            approval_id: None,
            approved: false,
        };
        let result = proxy.call("s1", request).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("path_outside_project"));
    }
}
