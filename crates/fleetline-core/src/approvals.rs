use std::collections::HashMap;
use std::sync::Arc;

use fleetline_types::{ApprovalRecord, ApprovalStatus};
use tokio::sync::RwLock;

use crate::storage::atomic_write_json;
use crate::storage_paths::DataPaths;

/// Persisted approval records (§3 ApprovalRecord), same atomic-write
/// discipline as the agent registry (§5 shared-resource policy).
pub struct ApprovalStore {
    records: Arc<RwLock<HashMap<String, ApprovalRecord>>>,
    paths: DataPaths,
}

impl ApprovalStore {
    pub fn new(paths: DataPaths) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            paths,
        }
    }

    pub async fn load(paths: DataPaths) -> anyhow::Result<Self> {
        let records: HashMap<String, ApprovalRecord> = match tokio::fs::read(paths.approvals_file()).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            records: Arc::new(RwLock::new(records)),
            paths,
        })
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let records = self.records.read().await;
        atomic_write_json(&self.paths.approvals_file(), &*records).await
    }

    pub async fn persist_new(&self, record: ApprovalRecord) -> anyhow::Result<ApprovalRecord> {
        self.records.write().await.insert(record.approval_id.clone(), record.clone());
        self.persist().await?;
        Ok(record)
    }

    pub async fn get(&self, approval_id: &str) -> Option<ApprovalRecord> {
        self.records.read().await.get(approval_id).cloned()
    }

    pub async fn list(&self, status: Option<ApprovalStatus>) -> Vec<ApprovalRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|a| status.map(|s| a.status == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn decide(&self, approval_id: &str, granted: bool, decision: Option<String>) -> anyhow::Result<Option<ApprovalRecord>> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(approval_id) else {
            return Ok(None);
        };
        record.decide(granted, decision);
        let out = record.clone();
        drop(records);
        self.persist().await?;
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn required(id: &str) -> ApprovalRecord {
        ApprovalRecord {
            approval_id: id.to_string(),
            status: ApprovalStatus::Required,
            tool: "delete".into(),
            risk_score: 0.8,
            reasons: vec!["delete_operation".into()],
            action: "delete src/main.rs".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            decision: None,
            file_path: Some("src/main.rs".into()),
            agent: Some("a1".into()),
            profile: Some("default".into()),
            requires_network: false,
            requires_bash: false,
            modifies_tests: false,
            summary: None,
        }
    }

    #[tokio::test]
    async fn persist_new_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(DataPaths { root: dir.path().to_path_buf() });
        store.persist_new(required("ap1")).await.unwrap();
        let fetched = store.get("ap1").await.unwrap();
        assert_eq!(fetched.status, ApprovalStatus::Required);
    }

    #[tokio::test]
    async fn decide_transitions_status_once() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(DataPaths { root: dir.path().to_path_buf() });
        store.persist_new(required("ap1")).await.unwrap();
        let decided = store.decide("ap1", true, Some("ok".into())).await.unwrap().unwrap();
        assert_eq!(decided.status, ApprovalStatus::Granted);
        // deciding again is a no-op, status stays granted.
        let redecided = store.decide("ap1", false, None).await.unwrap().unwrap();
        assert_eq!(redecided.status, ApprovalStatus::Granted);
    }
}
