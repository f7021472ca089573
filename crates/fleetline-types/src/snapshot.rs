use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub session_id: String,
    pub trigger: String,
    pub created_at: DateTime<Utc>,
    pub agent_count: u64,
    pub token_count: u64,
    #[serde(default)]
    pub files_in_context: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_context: Option<Value>,
}
