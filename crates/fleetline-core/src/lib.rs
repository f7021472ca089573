pub mod agents;
pub mod approvals;
pub mod budget;
pub mod config;
pub mod event_bus;
pub mod hooks;
pub mod permissions;
pub mod schema;
pub mod sessions;
pub mod storage;
pub mod storage_paths;
pub mod tasks;

pub use agents::{AgentFilter, AgentRegistry, HeartbeatUpdate, ProcessHandle};
pub use approvals::ApprovalStore;
pub use budget::{check as check_budget, AlertSeverity, BudgetAlert, BudgetCheckResult, BudgetMetrics};
pub use config::ConfigStore;
pub use event_bus::{BusStats, EventBus, EventHandler};
pub use hooks::{HookDecision, HookDispatcher};
pub use permissions::{is_test_path, validate as validate_permission, Operation, PermissionCheck, ProfileStore, ToolCall};
pub use schema::{EventSchema, FieldSpec, FieldType, SchemaRegistry, ValidationOutcome};
pub use sessions::SessionStore;
pub use storage_paths::DataPaths;
pub use tasks::TaskStore;
