pub mod coordinator;

pub use coordinator::{new_workflow_id, AgentTask, AgentTypeHandler, Phase, TaskState, WorkflowCoordinator, WorkflowError};
