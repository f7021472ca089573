use std::path::PathBuf;
use std::sync::Arc;

use fleetline_types::{CurrentSessionPointer, Session, SessionStatus};
use tokio::sync::RwLock;
use tracing::info;

use crate::storage::atomic_write_json;
use crate::storage_paths::DataPaths;

/// Owns session lifecycle (§3 Session): `start_session` persists a
/// timestamped session record and atomically repoints `current.json`;
/// `end_session` marks the record terminal. At most one `active` session
/// is referenced by the pointer at a time.
pub struct SessionStore {
    paths: DataPaths,
    current: Arc<RwLock<Option<Session>>>,
}

impl SessionStore {
    pub fn new(paths: DataPaths) -> Self {
        Self {
            paths,
            current: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn start(&self, session_id: impl Into<String>) -> anyhow::Result<Session> {
        let session = Session::start(session_id);
        atomic_write_json(&self.paths.session_file(&session.session_id), &session).await?;
        atomic_write_json(
            &self.paths.current_session_pointer(),
            &CurrentSessionPointer {
                session_id: session.session_id.clone(),
                updated_at: session.started_at,
            },
        )
        .await?;
        info!(session_id = %session.session_id, "session started");
        *self.current.write().await = Some(session.clone());
        Ok(session)
    }

    pub async fn end(&self, session_id: &str, failed: bool) -> anyhow::Result<Option<Session>> {
        let mut session: Session = match read_json_file_opt(&self.paths.session_file(session_id)).await {
            Some(s) => s,
            None => return Ok(None),
        };
        session.end(failed);
        atomic_write_json(&self.paths.session_file(session_id), &session).await?;
        {
            let mut current = self.current.write().await;
            if current.as_ref().map(|s| s.session_id.as_str()) == Some(session_id) {
                *current = None;
            }
        }
        info!(session_id, status = ?session.status, "session ended");
        Ok(Some(session))
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        read_json_file_opt(&self.paths.session_file(session_id)).await
    }

    pub async fn current(&self) -> Option<Session> {
        let pointer: Option<CurrentSessionPointer> = read_json_file_opt(&self.paths.current_session_pointer()).await;
        let pointer = pointer?;
        self.get(&pointer.session_id).await
    }

    pub async fn list(&self) -> anyhow::Result<Vec<Session>> {
        let mut entries = match tokio::fs::read_dir(self.paths.sessions_dir()).await {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };
        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some("current.json") {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(session) = read_json_file_opt::<Session>(&path).await {
                sessions.push(session);
            }
        }
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }
}

async fn read_json_file_opt<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Option<T> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn start_then_current_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(DataPaths { root: dir.path().to_path_buf() });
        let started = store.start("s1").await.unwrap();
        assert_eq!(started.status, SessionStatus::Active);
        let current = store.current().await.unwrap();
        assert_eq!(current.session_id, "s1");
    }

    #[tokio::test]
    async fn end_marks_completed_and_clears_pointer() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(DataPaths { root: dir.path().to_path_buf() });
        store.start("s1").await.unwrap();
        let ended = store.end("s1", false).await.unwrap().unwrap();
        assert_eq!(ended.status, SessionStatus::Completed);
        assert!(store.current().await.is_none());
    }

    #[tokio::test]
    async fn list_returns_every_persisted_session() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(DataPaths { root: dir.path().to_path_buf() });
        store.start("s1").await.unwrap();
        store.end("s1", false).await.unwrap();
        store.start("s2").await.unwrap();
        let sessions = store.list().await.unwrap();
        assert_eq!(sessions.len(), 2);
    }
}
