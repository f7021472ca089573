use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Session {
    pub fn start(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::Active,
            metadata: Map::new(),
        }
    }

    pub fn end(&mut self, failed: bool) {
        if self.status != SessionStatus::Active {
            return;
        }
        self.ended_at = Some(Utc::now());
        self.status = if failed {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };
    }
}

/// Pointer persisted at `sessions/current.json`: at most one active session
/// is referenced at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentSessionPointer {
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
}
