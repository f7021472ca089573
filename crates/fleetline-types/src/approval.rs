use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Required,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approval_id: String,
    pub status: ApprovalStatus,
    pub tool: String,
    pub risk_score: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
    pub action: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default)]
    pub requires_network: bool,
    #[serde(default)]
    pub requires_bash: bool,
    #[serde(default)]
    pub modifies_tests: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ApprovalRecord {
    pub fn decide(&mut self, granted: bool, decision: Option<String>) {
        if self.status != ApprovalStatus::Required {
            return;
        }
        self.status = if granted {
            ApprovalStatus::Granted
        } else {
            ApprovalStatus::Denied
        };
        self.decision = decision;
        self.updated_at = Utc::now();
    }
}
