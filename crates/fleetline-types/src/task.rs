use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub description: String,
    /// 1 (lowest) ..= 5 (highest).
    pub priority: u8,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub context: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, description: impl Into<String>, priority: u8) -> Self {
        Self {
            id: id.into(),
            title: None,
            description: description.into(),
            priority: priority.clamp(1, 5),
            acceptance_criteria: Vec::new(),
            context: Vec::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            metadata: Map::new(),
        }
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Done;
        self.completed_at = Some(Utc::now());
    }
}
