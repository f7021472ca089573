use std::collections::HashMap;
use std::sync::Arc;

use fleetline_types::{TaskRecord, TaskStatus};
use tokio::sync::RwLock;

use crate::storage::atomic_write_json;
use crate::storage_paths::DataPaths;

/// Persistent task list backing the `task_*` control-plane surface (§6).
/// Records live in a single append-safe JSON file, written atomically.
pub struct TaskStore {
    records: Arc<RwLock<HashMap<String, TaskRecord>>>,
    paths: DataPaths,
}

impl TaskStore {
    pub fn new(paths: DataPaths) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            paths,
        }
    }

    pub async fn load(paths: DataPaths) -> anyhow::Result<Self> {
        let records: HashMap<String, TaskRecord> = match tokio::fs::read(paths.tasks_file()).await {
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
        atomic_write_json(&self.paths.tasks_file(), &*records).await
    }

    pub async fn create(&self, id: impl Into<String>, description: impl Into<String>, priority: u8) -> anyhow::Result<TaskRecord> {
        let record = TaskRecord::new(id, description, priority);
        self.records.write().await.insert(record.id.clone(), record.clone());
        self.persist().await?;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Option<TaskRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|t| status.as_ref().map(|s| &t.status == s).unwrap_or(true))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        tasks
    }

    /// Highest-priority incomplete tasks, used by the reference-check
    /// trigger to select up to K requirements to surface (spec 4.F).
    pub async fn top_incomplete(&self, k: usize) -> Vec<TaskRecord> {
        self.list(None)
            .await
            .into_iter()
            .filter(|t| t.status != TaskStatus::Done)
            .take(k)
            .collect()
    }

    pub async fn update<F>(&self, id: &str, f: F) -> anyhow::Result<Option<TaskRecord>>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return Ok(None);
        };
        f(record);
        let out = record.clone();
        drop(records);
        self.persist().await?;
        Ok(Some(out))
    }

    pub async fn complete(&self, id: &str) -> anyhow::Result<Option<TaskRecord>> {
        self.update(id, |t| t.complete()).await
    }
}
