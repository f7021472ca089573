use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use fleetline_core::DataPaths;
use fleetline_types::Snapshot;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

/// `create` serializes a session snapshot atomically (temp-then-rename),
/// optionally gzip-compressed, to `state/{session_id}_snap{NNN}.json[.gz]`
/// (spec 4.O). `restore` is read-only recovery of session context — it
/// does not reconcile or mutate live agents (Open Question 5).
pub struct SnapshotManager {
    paths: DataPaths,
    compress: bool,
    counters: Arc<Mutex<HashMap<String, u32>>>,
}

impl SnapshotManager {
    pub fn new(paths: DataPaths, compress: bool) -> Self {
        Self {
            paths,
            compress,
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn create(
        &self,
        session_id: &str,
        trigger: &str,
        agent_count: u64,
        token_count: u64,
        files_in_context: Vec<String>,
        git_state: Option<Value>,
        agent_context: Option<Value>,
    ) -> anyhow::Result<Snapshot> {
        let index = {
            let mut counters = self.counters.lock().await;
            let entry = counters.entry(session_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let snapshot = Snapshot {
            snapshot_id: format!("{session_id}_snap{index:03}"),
            session_id: session_id.to_string(),
            trigger: trigger.to_string(),
            created_at: Utc::now(),
            agent_count,
            token_count,
            files_in_context,
            git_state,
            agent_context,
        };

        let path = self.paths.snapshot_file(session_id, index);
        write_snapshot(&path, &snapshot, self.compress).await?;
        Ok(snapshot)
    }

    pub async fn restore(&self, snapshot_id: &str) -> anyhow::Result<Snapshot> {
        let plain = self.paths.state_dir().join(format!("{snapshot_id}.json"));
        let gz = self.paths.state_dir().join(format!("{snapshot_id}.json.gz"));
        if plain.exists() {
            read_snapshot(&plain, false).await
        } else if gz.exists() {
            read_snapshot(&gz, true).await
        } else {
            anyhow::bail!("snapshot not found: {snapshot_id}")
        }
    }

    pub async fn list(&self, session_id: Option<&str>) -> anyhow::Result<Vec<Snapshot>> {
        let dir = self.paths.state_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if !name.contains("_snap") {
                continue;
            }
            if let Some(session_id) = session_id {
                if !name.starts_with(&format!("{session_id}_snap")) {
                    continue;
                }
            }
            let compressed = name.ends_with(".gz");
            if let Ok(snapshot) = read_snapshot(&path, compressed).await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    pub async fn cleanup(&self, older_than: Duration) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - older_than;
        let snapshots = self.list(None).await?;
        let mut removed = 0;
        for snapshot in snapshots.iter().filter(|s| s.created_at < cutoff) {
            let plain = self.paths.state_dir().join(format!("{}.json", snapshot.snapshot_id));
            let gz = self.paths.state_dir().join(format!("{}.json.gz", snapshot.snapshot_id));
            if tokio::fs::remove_file(&plain).await.is_ok() || tokio::fs::remove_file(&gz).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Renders markdown combining the latest snapshot's stats and a tail
    /// of recent events, shaped after the original session-summary
    /// rendering (SPEC_FULL §3).
    pub async fn create_handoff_summary(
        &self,
        session_id: &str,
        reason: &str,
        recent_events: &[String],
    ) -> anyhow::Result<String> {
        let latest = self.list(Some(session_id)).await?.into_iter().last();

        let mut md = format!("# Handoff: {session_id}\n\nReason: {reason}\n\n");
        if let Some(snapshot) = &latest {
            md.push_str(&format!(
                "## Latest snapshot ({})\n- agent_count: {}\n- token_count: {}\n- files_in_context: {}\n\n",
                snapshot.snapshot_id,
                snapshot.agent_count,
                snapshot.token_count,
                snapshot.files_in_context.len(),
            ));
        } else {
            md.push_str("## Latest snapshot\nNone captured yet.\n\n");
        }

        md.push_str("## Recent events\n");
        for line in recent_events.iter().rev().take(20).rev() {
            md.push_str(&format!("- {line}\n"));
        }

        let path = self.paths.handoff_file(session_id, reason);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &md).await?;
        Ok(md)
    }
}

async fn write_snapshot(path: &PathBuf, snapshot: &Snapshot, compress: bool) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(snapshot)?;
    let final_path = if compress { path.with_extension("json.gz") } else { path.clone() };
    let tmp_path = final_path.with_extension(format!("tmp.{}", Uuid::new_v4()));

    if compress {
        let bytes = json.clone();
        tokio::task::spawn_blocking({
            let tmp_path = tmp_path.clone();
            move || -> anyhow::Result<()> {
                let file = std::fs::File::create(&tmp_path)?;
                let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
                encoder.write_all(&bytes)?;
                encoder.finish()?;
                Ok(())
            }
        })
        .await??;
    } else {
        tokio::fs::write(&tmp_path, &json).await?;
    }

    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

async fn read_snapshot(path: &PathBuf, compressed: bool) -> anyhow::Result<Snapshot> {
    let path = path.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<Snapshot> {
        let bytes = if compressed {
            let file = std::fs::File::open(&path)?;
            let mut decoder = flate2::read::GzDecoder::new(file);
            let mut buf = Vec::new();
            decoder.read_to_end(&mut buf)?;
            buf
        } else {
            std::fs::read(&path)?
        };
        Ok(serde_json::from_slice(&bytes)?)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_then_restore_round_trips() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(DataPaths { root: dir.path().to_path_buf() }, false);
        let created = manager
            .create("s1", "agent_count", 10, 5000, vec!["src/main.rs".into()], None, None)
            .await
            .unwrap();
        let restored = manager.restore(&created.snapshot_id).await.unwrap();
        assert_eq!(restored.agent_count, 10);
        assert_eq!(restored.snapshot_id, created.snapshot_id);
    }

    #[tokio::test]
    async fn list_filters_by_session() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(DataPaths { root: dir.path().to_path_buf() }, false);
        manager.create("s1", "t", 1, 1, vec![], None, None).await.unwrap();
        manager.create("s2", "t", 1, 1, vec![], None, None).await.unwrap();
        let s1_only = manager.list(Some("s1")).await.unwrap();
        assert_eq!(s1_only.len(), 1);
        assert_eq!(s1_only[0].session_id, "s1");
    }

    #[tokio::test]
    async fn handoff_summary_includes_latest_snapshot_stats() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(DataPaths { root: dir.path().to_path_buf() }, false);
        manager.create("s1", "manual", 3, 1000, vec![], None, None).await.unwrap();
        let md = manager
            .create_handoff_summary("s1", "manual", &["agent.invoked a1".to_string()])
            .await
            .unwrap();
        assert!(md.contains("agent_count: 3"));
        assert!(md.contains("agent.invoked a1"));
    }
}
