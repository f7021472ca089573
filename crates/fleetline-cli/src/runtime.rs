use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleetline_core::storage_paths::DataPaths;
use fleetline_core::{
    AgentRegistry, ApprovalStore, ConfigStore, EventBus, HookDispatcher, ProfileStore, SessionStore, TaskStore,
};
use fleetline_cost::{CostTracker, PriceTable};
use fleetline_ingest::{AnalyticsIngester, LogWriter};
use fleetline_metrics::MetricsAggregator;
use fleetline_proxy::ToolProxy;
use fleetline_router::{ModelEntry, ModelRouter, ModelRoutingSubscriber, Tier};
use fleetline_snapshot::SnapshotManager;
use fleetline_triggers::{ReferenceCheckTrigger, SnapshotTrigger};
use fleetline_workflow::WorkflowCoordinator;

use crate::executor::FsToolExecutor;

/// Everything a CLI command needs, built once at startup and handed down
/// by reference — explicit dependency injection rather than globals
/// (DESIGN NOTES §9). Every subscriber below is wired onto `bus` exactly
/// once; commands reach storage through the owning store, never directly.
pub struct Runtime {
    pub project_root: PathBuf,
    pub paths: DataPaths,
    pub config: Arc<ConfigStore>,
    pub bus: Arc<EventBus>,
    pub agents: Arc<AgentRegistry>,
    pub sessions: Arc<SessionStore>,
    pub tasks: Arc<TaskStore>,
    pub approvals: Arc<ApprovalStore>,
    pub profiles: Arc<ProfileStore>,
    pub hooks: Arc<HookDispatcher>,
    pub log_writer: Arc<LogWriter>,
    pub analytics: Arc<AnalyticsIngester>,
    pub snapshots: Arc<SnapshotManager>,
    pub cost_tracker: Arc<CostTracker>,
    pub router: Arc<ModelRouter>,
    pub metrics: Arc<MetricsAggregator>,
    pub proxy: Arc<ToolProxy>,
    pub workflows: Arc<WorkflowCoordinator>,
}

impl Runtime {
    pub async fn init(project_root: &Path) -> anyhow::Result<Self> {
        let paths = DataPaths::resolve(project_root);
        for dir in [
            paths.logs_dir(),
            paths.state_dir(),
            paths.sessions_dir(),
            paths.analytics_dir(),
            paths.handoffs_dir(),
            paths.hooks_dir(),
            paths.config_dir(),
            paths.requirements_dir(),
            paths.tasks_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let global_config = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".subagent")
            .join("settings.yaml");
        let config = Arc::new(
            ConfigStore::load(
                global_config,
                paths.config_dir().join("settings.yaml"),
                paths.config_dir().join("settings.managed.yaml"),
                serde_json::Value::Object(Default::default()),
            )
            .await?,
        );
        let effective_config = config.effective().await;

        let bus = Arc::new(EventBus::new());

        let agents = Arc::new(AgentRegistry::load(paths.agents_file(), bus.clone()).await?);
        let sessions = Arc::new(SessionStore::new(paths.clone()));
        let tasks = Arc::new(TaskStore::load(paths.clone()).await?);
        let approvals = Arc::new(ApprovalStore::load(paths.clone()).await?);
        let profiles = Arc::new(ProfileStore::new());
        let hooks = Arc::new(HookDispatcher::discover(&paths.hooks_dir()));

        let log_writer = Arc::new(LogWriter::new(paths.clone(), true));
        bus.subscribe("*", log_writer.clone()).await;

        let analytics_batch_size = effective_config
            .pointer("/analytics/batch_size")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(100);
        let analytics = Arc::new(AnalyticsIngester::open_with_batch_size(paths.analytics_db(), analytics_batch_size).await?);
        bus.subscribe("*", analytics.clone()).await;

        let snapshots = Arc::new(SnapshotManager::new(paths.clone(), true));
        let snapshot_interval = effective_config
            .pointer("/snapshot/trigger_agent_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(10);
        let snapshot_trigger = Arc::new(SnapshotTrigger::with_interval(snapshots.clone(), bus.clone(), snapshot_interval));
        bus.subscribe("agent.invoked", snapshot_trigger.clone()).await;
        bus.subscribe("agent.completed", snapshot_trigger.clone()).await;

        let reference_trigger = Arc::new(ReferenceCheckTrigger::new(tasks.clone(), paths.clone(), bus.clone()));
        bus.subscribe("agent.invoked", reference_trigger.clone()).await;
        bus.subscribe("agent.completed", reference_trigger.clone()).await;

        let prices = PriceTable::load(&paths.config_dir().join("model_pricing.yaml")).await?;
        let cost_tracker = Arc::new(CostTracker::new(prices, bus.clone()));
        bus.subscribe("agent.completed", cost_tracker.clone()).await;

        let router = Arc::new(ModelRouter::new(default_model_catalog(), HashSet::new(), false));
        let routing_subscriber = Arc::new(ModelRoutingSubscriber::new(router.clone(), bus.clone()));
        bus.subscribe("agent.invoked", routing_subscriber.clone()).await;
        bus.subscribe("agent.failed", routing_subscriber.clone()).await;

        let metrics = Arc::new(MetricsAggregator::new(vec![
            ("1m", std::time::Duration::from_secs(60), std::time::Duration::from_secs(1)),
            ("1h", std::time::Duration::from_secs(3600), std::time::Duration::from_secs(10)),
        ]));
        bus.subscribe("*", metrics.clone()).await;

        let approvals_enabled = effective_config.pointer("/approvals/enabled").and_then(|v| v.as_bool()).unwrap_or(true);
        let approval_threshold = effective_config.pointer("/approvals/threshold").and_then(|v| v.as_f64()).unwrap_or(0.7);
        let executor = Arc::new(FsToolExecutor::new(project_root.to_path_buf()));
        let proxy = Arc::new(
            ToolProxy::new(profiles.clone(), approvals.clone(), bus.clone(), executor, project_root.to_path_buf())
                .with_approvals(approvals_enabled, approval_threshold),
        );

        // agent_type handlers are registered by callers that know how to
        // run a scout/plan/build step; none are wired in by default here.
        let workflows = Arc::new(WorkflowCoordinator::new(bus.clone()).with_hooks(hooks.clone()));

        Ok(Self {
            project_root: project_root.to_path_buf(),
            paths,
            config,
            bus,
            agents,
            sessions,
            tasks,
            approvals,
            profiles,
            hooks,
            log_writer,
            analytics,
            snapshots,
            cost_tracker,
            router,
            metrics,
            proxy,
            workflows,
        })
    }
}

/// A small built-in catalog so the router has something to select from
/// out of the box; real deployments override this from
/// `config/model_tiers.yaml` (not modeled here — see DESIGN.md).
fn default_model_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry { name: "weak-fast".into(), tier: Tier::Weak, priority: 1, free_tier: true },
        ModelEntry { name: "base-default".into(), tier: Tier::Base, priority: 1, free_tier: false },
        ModelEntry { name: "strong-reasoning".into(), tier: Tier::Strong, priority: 1, free_tier: false },
    ]
}
