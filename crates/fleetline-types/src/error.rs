use serde::{Deserialize, Serialize};

/// Error taxonomy shared across the control plane. Kinds, not class names:
/// every control-plane response carries one of these as a stable `error`
/// string, independent of whatever `anyhow` chain produced it internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    PermissionDenied,
    ApprovalRequired,
    BudgetExceeded,
    TimeoutError,
    ProviderError,
    ToolExecutionError,
    IngestionError,
    ConfigError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ApprovalRequired => "approval_required",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::ToolExecutionError => "tool_execution_error",
            ErrorKind::IngestionError => "ingestion_error",
            ErrorKind::ConfigError => "config_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("approval required: {0}")]
    ApprovalRequired(String),
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("tool execution failed: {0}")]
    ToolExecution(String),
    #[error("ingestion failed: {0}")]
    Ingestion(String),
    #[error("config error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::ValidationError,
            CoreError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            CoreError::ApprovalRequired(_) => ErrorKind::ApprovalRequired,
            CoreError::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            CoreError::Timeout(_) => ErrorKind::TimeoutError,
            CoreError::Provider(_) => ErrorKind::ProviderError,
            CoreError::ToolExecution(_) => ErrorKind::ToolExecutionError,
            CoreError::Ingestion(_) => ErrorKind::IngestionError,
            CoreError::Config(_) => ErrorKind::ConfigError,
        }
    }
}

/// Uniform shape for control-plane responses (§7: "Control-plane operations
/// return a `{success, …}` shape").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Outcome<T> {
    pub fn ok(result: T) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}
