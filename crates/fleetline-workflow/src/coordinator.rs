use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use fleetline_core::{EventBus, HookDecision, HookDispatcher};
use fleetline_types::Event;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Scout,
    Plan,
    Build,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Completed,
    Failed,
}

/// One node of the workflow DAG (spec 4.M).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub agent_id: String,
    pub agent_type: String,
    pub phase: Phase,
    pub task_spec: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(skip)]
    pub state: TaskState,
    #[serde(skip)]
    pub result: Option<Value>,
    #[serde(skip)]
    pub error: Option<String>,
}

impl AgentTask {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>, phase: Phase, task_spec: Value, depends_on: Vec<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            phase,
            task_spec,
            depends_on,
            state: TaskState::Pending,
            result: None,
            error: None,
        }
    }
}

/// The registered async callable for an `agent_type`: takes `task_spec`
/// plus a `context` of `{dependencies: {dep_id: result}}` and returns a
/// result or an error (spec 4.M step 2).
#[async_trait]
pub trait AgentTypeHandler: Send + Sync {
    async fn run(&self, task_spec: &Value, context: &Value) -> anyhow::Result<Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("task {0} depends on unknown task {1}")]
    UnknownDependency(String, String),
    #[error("dependency cycle detected involving task {0}")]
    Cycle(String),
    #[error("duplicate agent_id {0}")]
    DuplicateAgentId(String),
    #[error("no handler registered for agent_type {0}")]
    NoHandler(String),
}

/// Validates and runs a DAG of `AgentTask`s (spec 4.M). Execution is a
/// fixed-point loop: collect every task whose dependencies are all
/// `completed`, run them concurrently, repeat until nothing is pending or
/// the workflow is stuck (a dependency failed upstream).
pub struct WorkflowCoordinator {
    handlers: HashMap<String, Arc<dyn AgentTypeHandler>>,
    bus: Arc<EventBus>,
    hooks: Option<Arc<HookDispatcher>>,
}

impl WorkflowCoordinator {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { handlers: HashMap::new(), bus, hooks: None }
    }

    /// Runs `hooks.run_pre`/`run_post`/`run_on_error` around every task's
    /// invocation (spec 4.H) — a `Deny` from a pre-hook cancels the task
    /// instead of calling its handler.
    pub fn with_hooks(mut self, hooks: Arc<HookDispatcher>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn register(&mut self, agent_type: impl Into<String>, handler: Arc<dyn AgentTypeHandler>) {
        self.handlers.insert(agent_type.into(), handler);
    }

    /// Checks every `depends_on` resolves to a task in the set and that
    /// the dependency graph is acyclic via DFS; any back-edge is an error.
    pub fn validate(tasks: &[AgentTask]) -> Result<(), WorkflowError> {
        let mut seen = HashSet::new();
        for task in tasks {
            if !seen.insert(task.agent_id.clone()) {
                return Err(WorkflowError::DuplicateAgentId(task.agent_id.clone()));
            }
        }
        let ids: HashSet<&str> = tasks.iter().map(|t| t.agent_id.as_str()).collect();
        for task in tasks {
            for dep in &task.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(WorkflowError::UnknownDependency(task.agent_id.clone(), dep.clone()));
                }
            }
        }

        let by_id: HashMap<&str, &AgentTask> = tasks.iter().map(|t| (t.agent_id.as_str(), t)).collect();
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(
            id: &'a str,
            by_id: &HashMap<&'a str, &'a AgentTask>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), WorkflowError> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(WorkflowError::Cycle(id.to_string())),
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            let task = by_id[id];
            for dep in &task.depends_on {
                visit(dep.as_str(), by_id, marks)?;
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        for task in tasks {
            visit(task.agent_id.as_str(), &by_id, &mut marks)?;
        }
        Ok(())
    }

    /// Runs the workflow to completion (or stuck). Returns the final
    /// tasks, each annotated with its terminal `state`/`result`/`error`.
    pub async fn run(&self, workflow_id: impl Into<String>, session_id: &str, tasks: Vec<AgentTask>) -> Result<Vec<AgentTask>, WorkflowError> {
        Self::validate(&tasks)?;
        for task in &tasks {
            if !self.handlers.contains_key(&task.agent_type) {
                return Err(WorkflowError::NoHandler(task.agent_type.clone()));
            }
        }

        let workflow_id = workflow_id.into();
        let tasks = Arc::new(RwLock::new(
            tasks.into_iter().map(|t| (t.agent_id.clone(), t)).collect::<HashMap<_, _>>(),
        ));

        self.emit(&workflow_id, session_id, "workflow.started", Map::new()).await;

        loop {
            let ready = self.collect_ready(&tasks).await;
            if ready.is_empty() {
                let stuck = self.has_pending(&tasks).await;
                if stuck {
                    warn!(workflow_id, "workflow stuck: no ready tasks but some remain pending");
                }
                break;
            }

            let results = futures::future::join_all(ready.into_iter().map(|agent_id| {
                let tasks = Arc::clone(&tasks);
                let workflow_id = workflow_id.clone();
                let session_id = session_id.to_string();
                async move { self.run_one(&workflow_id, &session_id, &tasks, agent_id).await }
            }))
            .await;
            let _ = results;
        }

        let mut completion = Map::new();
        let finished = tasks.read().await;
        let completed = finished.values().filter(|t| t.state == TaskState::Completed).count();
        let failed = finished.values().filter(|t| t.state == TaskState::Failed).count();
        completion.insert("completed".into(), json!(completed));
        completion.insert("failed".into(), json!(failed));
        drop(finished);
        self.emit(&workflow_id, session_id, "workflow.completed", completion).await;

        Ok(Arc::try_unwrap(tasks).map(|lock| lock.into_inner()).unwrap_or_default().into_values().collect())
    }

    async fn collect_ready(&self, tasks: &Arc<RwLock<HashMap<String, AgentTask>>>) -> Vec<String> {
        let tasks = tasks.read().await;
        tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .filter(|t| {
                t.depends_on
                    .iter()
                    .all(|dep| tasks.get(dep).map(|d| d.state == TaskState::Completed).unwrap_or(false))
            })
            .map(|t| t.agent_id.clone())
            .collect()
    }

    async fn has_pending(&self, tasks: &Arc<RwLock<HashMap<String, AgentTask>>>) -> bool {
        tasks.read().await.values().any(|t| t.state == TaskState::Pending)
    }

    async fn run_one(
        &self,
        workflow_id: &str,
        session_id: &str,
        tasks: &Arc<RwLock<HashMap<String, AgentTask>>>,
        agent_id: String,
    ) {
        let (task_spec, agent_type, depends_on) = {
            let tasks = tasks.read().await;
            let task = &tasks[&agent_id];
            (task.task_spec.clone(), task.agent_type.clone(), task.depends_on.clone())
        };

        let mut dependencies = Map::new();
        {
            let tasks = tasks.read().await;
            for dep in &depends_on {
                if let Some(result) = tasks.get(dep).and_then(|t| t.result.clone()) {
                    dependencies.insert(dep.clone(), result);
                }
            }
        }
        let context = json!({ "dependencies": Value::Object(dependencies) });

        let mut invoked = Map::new();
        invoked.insert("agent".into(), json!(agent_id));
        invoked.insert("agent_type".into(), json!(agent_type));
        let invoked_event = match Event::with_trace("agent.invoked", session_id, invoked, workflow_id) {
            Ok(event) => event,
            Err(_) => return,
        };

        if let Some(hooks) = &self.hooks {
            if let HookDecision::Deny(reason) = hooks.run_pre(&invoked_event).await {
                let mut tasks = tasks.write().await;
                let task = tasks.get_mut(&agent_id).expect("task present");
                task.error = Some(reason.clone());
                task.state = TaskState::Failed;
                drop(tasks);
                let mut payload = Map::new();
                payload.insert("agent".into(), json!(agent_id));
                payload.insert("agent_type".into(), json!(agent_type));
                payload.insert("reason".into(), json!(reason));
                self.emit_trace(workflow_id, session_id, "agent.blocked", payload).await;
                return;
            }
        }
        self.bus.publish_and_wait(invoked_event).await;

        let handler = self.handlers.get(&agent_type).cloned();
        let outcome = match handler {
            Some(handler) => handler.run(&task_spec, &context).await,
            None => Err(anyhow::anyhow!("no handler for {agent_type}")),
        };

        let mut tasks = tasks.write().await;
        let task = tasks.get_mut(&agent_id).expect("task present");
        match outcome {
            Ok(result) => {
                task.state = TaskState::Completed;
                task.result = Some(result.clone());
                let mut payload = Map::new();
                payload.insert("agent".into(), json!(agent_id));
                payload.insert("agent_type".into(), json!(agent_type));
                drop(tasks);
                if let (Some(hooks), Ok(event)) = (
                    &self.hooks,
                    Event::with_trace("agent.completed", session_id, payload.clone(), workflow_id),
                ) {
                    hooks.run_post(&event).await;
                }
                self.emit_trace(workflow_id, session_id, "agent.completed", payload).await;
            }
            Err(err) => {
                task.error = Some(err.to_string());
                task.state = TaskState::Failed;
                let mut payload = Map::new();
                payload.insert("agent".into(), json!(agent_id));
                payload.insert("agent_type".into(), json!(agent_type));
                payload.insert("error".into(), json!(err.to_string()));
                drop(tasks);
                if let (Some(hooks), Ok(event)) = (
                    &self.hooks,
                    Event::with_trace("agent.failed", session_id, payload.clone(), workflow_id),
                ) {
                    hooks.run_on_error(&event).await;
                }
                self.emit_trace(workflow_id, session_id, "agent.failed", payload).await;
            }
        }
    }

    async fn emit(&self, workflow_id: &str, session_id: &str, event_type: &str, mut payload: Map<String, Value>) {
        payload.insert("workflow_id".into(), json!(workflow_id));
        info!(workflow_id, event_type, "workflow event");
        if let Ok(event) = Event::with_trace(event_type, session_id, payload, workflow_id) {
            self.bus.publish_and_wait(event).await;
        }
    }

    async fn emit_trace(&self, workflow_id: &str, session_id: &str, event_type: &str, payload: Map<String, Value>) {
        if let Ok(event) = Event::with_trace(event_type, session_id, payload, workflow_id) {
            self.bus.publish_and_wait(event).await;
        }
    }
}

pub fn new_workflow_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl AgentTypeHandler for EchoHandler {
        async fn run(&self, task_spec: &Value, _context: &Value) -> anyhow::Result<Value> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(task_spec.clone())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl AgentTypeHandler for FailingHandler {
        async fn run(&self, _task_spec: &Value, _context: &Value) -> anyhow::Result<Value> {
            anyhow::bail!("scout failed")
        }
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let tasks = vec![AgentTask::new("a", "scout", Phase::Scout, json!({}), vec!["missing".into()])];
        let err = WorkflowCoordinator::validate(&tasks).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency(_, _)));
    }

    #[test]
    fn validate_rejects_cycle() {
        let tasks = vec![
            AgentTask::new("a", "scout", Phase::Scout, json!({}), vec!["b".into()]),
            AgentTask::new("b", "scout", Phase::Scout, json!({}), vec!["a".into()]),
        ];
        let err = WorkflowCoordinator::validate(&tasks).unwrap_err();
        assert!(matches!(err, WorkflowError::Cycle(_)));
    }

    #[tokio::test]
    async fn runs_dependent_tasks_in_order_and_completes() {
        let bus = Arc::new(EventBus::new());
        let mut coordinator = WorkflowCoordinator::new(bus);
        let count = Arc::new(AtomicUsize::new(0));
        coordinator.register("scout", Arc::new(EchoHandler(count.clone())));
        coordinator.register("build", Arc::new(EchoHandler(count.clone())));

        let tasks = vec![
            AgentTask::new("scout1", "scout", Phase::Scout, json!({"step": 1}), vec![]),
            AgentTask::new("build1", "build", Phase::Build, json!({"step": 2}), vec!["scout1".into()]),
        ];
        let finished = coordinator.run("wf1", "s1", tasks).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(finished.iter().all(|t| t.state == TaskState::Completed));
    }

    #[cfg(unix)]
    fn write_hook_script(dir: &std::path::Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pre_hook_deny_blocks_task_without_running_handler() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("pre-agent-invocation")).unwrap();
        write_hook_script(
            &dir.path().join("pre-agent-invocation"),
            "00-deny.sh",
            "#!/bin/sh\ncat >/dev/null\necho '{\"decision\":\"DENY\",\"message\":\"budget exhausted\"}'\n",
        );
        let hooks = Arc::new(HookDispatcher::discover(dir.path()));

        let bus = Arc::new(EventBus::new());
        let mut coordinator = WorkflowCoordinator::new(bus).with_hooks(hooks);
        let count = Arc::new(AtomicUsize::new(0));
        coordinator.register("scout", Arc::new(EchoHandler(count.clone())));

        let tasks = vec![AgentTask::new("scout1", "scout", Phase::Scout, json!({}), vec![])];
        let finished = coordinator.run("wf3", "s1", tasks).await.unwrap();

        let scout = finished.iter().find(|t| t.agent_id == "scout1").unwrap();
        assert_eq!(scout.state, TaskState::Failed);
        assert_eq!(scout.error.as_deref(), Some("budget exhausted"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn downstream_task_is_stuck_when_dependency_fails() {
        let bus = Arc::new(EventBus::new());
        let mut coordinator = WorkflowCoordinator::new(bus);
        coordinator.register("scout", Arc::new(FailingHandler));
        let count = Arc::new(AtomicUsize::new(0));
        coordinator.register("build", Arc::new(EchoHandler(count.clone())));

        let tasks = vec![
            AgentTask::new("scout1", "scout", Phase::Scout, json!({}), vec![]),
            AgentTask::new("build1", "build", Phase::Build, json!({}), vec!["scout1".into()]),
        ];
        let finished = coordinator.run("wf2", "s1", tasks).await.unwrap();

        let scout = finished.iter().find(|t| t.agent_id == "scout1").unwrap();
        let build = finished.iter().find(|t| t.agent_id == "build1").unwrap();
        assert_eq!(scout.state, TaskState::Failed);
        assert_eq!(build.state, TaskState::Pending);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
