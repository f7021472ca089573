use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use fleetline_core::EventHandler;
use fleetline_types::Event;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Default)]
struct PendingRows {
    agents: Vec<(String, String, String, String)>,
    tool_usage: Vec<(String, String, bool, Option<String>)>,
    error_patterns: Vec<(String, String, String)>,
    sessions_started: Vec<String>,
    sessions_ended: Vec<String>,
}

impl PendingRows {
    fn len(&self) -> usize {
        self.agents.len() + self.tool_usage.len() + self.error_patterns.len() + self.sessions_started.len() + self.sessions_ended.len()
    }
}

/// Batch-inserts event rows into the analytics database (spec 4.D).
/// `rusqlite::Connection` is not `Send`-friendly across await points, so
/// every statement runs inside `spawn_blocking` behind a std `Mutex`,
/// mirroring the teacher's `tandem-memory::MemoryDatabase` wrapper style.
pub struct AnalyticsIngester {
    conn: Arc<StdMutex<Connection>>,
    pending: Mutex<PendingRows>,
    batch_size: usize,
    error_count: AtomicU64,
}

impl AnalyticsIngester {
    pub async fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        Self::open_with_batch_size(db_path, DEFAULT_BATCH_SIZE).await
    }

    pub async fn open_with_batch_size(db_path: PathBuf, batch_size: usize) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = tokio::task::spawn_blocking(move || -> anyhow::Result<Connection> {
            let conn = Connection::open(&db_path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
            pending: Mutex::new(PendingRows::default()),
            batch_size,
            error_count: AtomicU64::new(0),
        })
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub async fn flush(&self) {
        let pending = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        if pending.len() == 0 {
            return;
        }
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || commit_batch(&conn, pending)).await;
        match result {
            Ok(Ok(())) => {}
            _ => {
                warn!("analytics batch commit failed, dropping batch (logs remain source of truth)");
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn maybe_flush(&self) {
        let len = self.pending.lock().await.len();
        if len >= self.batch_size {
            self.flush().await;
        }
    }

    /// Completion/failure counts and tool-call volume per agent type —
    /// "performance by agent" from the spec 4.D read-only query surface.
    pub async fn performance_by_agent(&self) -> anyhow::Result<Vec<AgentPerformance>> {
        self.flush().await;
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<AgentPerformance>> {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT agent_type,
                        COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                        COUNT(*) FILTER (WHERE status IN ('failed', 'timeout')) AS failed
                 FROM agents
                 WHERE agent_type != ''
                 GROUP BY agent_type",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(AgentPerformance {
                        agent_type: row.get(0)?,
                        completed: row.get(1)?,
                        failed: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Success rate per tool — "tool effectiveness".
    pub async fn tool_effectiveness(&self) -> anyhow::Result<Vec<ToolEffectiveness>> {
        self.flush().await;
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<ToolEffectiveness>> {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT tool,
                        COUNT(*) AS total,
                        COUNT(*) FILTER (WHERE success = 1) AS successes
                 FROM tool_usage
                 GROUP BY tool",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let total: i64 = row.get(1)?;
                    let successes: i64 = row.get(2)?;
                    Ok(ToolEffectiveness {
                        tool: row.get(0)?,
                        total_calls: total,
                        success_rate: if total == 0 { 0.0 } else { successes as f64 / total as f64 },
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Most frequent `(tool, error_type)` pairs — "error patterns".
    pub async fn error_patterns(&self, top_n: usize) -> anyhow::Result<Vec<ErrorPattern>> {
        self.flush().await;
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<ErrorPattern>> {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT tool, error_type, COUNT(*) AS occurrences
                 FROM error_patterns
                 GROUP BY tool, error_type
                 ORDER BY occurrences DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![top_n as i64], |row| {
                    Ok(ErrorPattern {
                        tool: row.get(0)?,
                        error_type: row.get(1)?,
                        occurrences: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    /// One row per session with start/end timestamps — "session summary".
    pub async fn session_summary(&self, session_id: &str) -> anyhow::Result<Option<SessionSummary>> {
        self.flush().await;
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<SessionSummary>> {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT session_id, started_at, ended_at FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionSummary {
                        session_id: row.get(0)?,
                        started_at: row.get(1)?,
                        ended_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(anyhow::Error::from)
        })
        .await?
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentPerformance {
    pub agent_type: String,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolEffectiveness {
    pub tool: String,
    pub total_calls: i64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPattern {
    pub tool: String,
    pub error_type: String,
    pub occurrences: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agents (
            agent_id TEXT PRIMARY KEY,
            agent_type TEXT NOT NULL,
            model TEXT NOT NULL,
            status TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS tool_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tool TEXT NOT NULL,
            agent_id TEXT,
            success INTEGER NOT NULL,
            error_type TEXT
         );
         CREATE TABLE IF NOT EXISTS error_patterns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tool TEXT NOT NULL,
            agent_id TEXT,
            error_type TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            started_at TEXT,
            ended_at TEXT
         );",
    )?;
    Ok(())
}

fn commit_batch(conn: &Arc<StdMutex<Connection>>, pending: PendingRows) -> anyhow::Result<()> {
    let mut conn = conn.lock().unwrap();
    let tx = conn.transaction()?;

    for (agent_id, agent_type, model, status) in &pending.agents {
        tx.execute(
            "INSERT INTO agents (agent_id, agent_type, model, status) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_id) DO UPDATE SET status = excluded.status",
            params![agent_id, agent_type, model, status],
        )?;
    }

    for (tool, agent_id, success, error_type) in &pending.tool_usage {
        tx.execute(
            "INSERT INTO tool_usage (tool, agent_id, success, error_type) VALUES (?1, ?2, ?3, ?4)",
            params![tool, agent_id, *success as i64, error_type],
        )?;
        if !*success {
            tx.execute(
                "INSERT INTO error_patterns (tool, agent_id, error_type) VALUES (?1, ?2, ?3)",
                params![tool, agent_id, error_type.clone().unwrap_or_default()],
            )?;
        }
    }

    for (tool, agent_id, error_type) in &pending.error_patterns {
        tx.execute(
            "INSERT INTO error_patterns (tool, agent_id, error_type) VALUES (?1, ?2, ?3)",
            params![tool, agent_id, error_type],
        )?;
    }

    for session_id in &pending.sessions_started {
        tx.execute(
            "INSERT OR IGNORE INTO sessions (session_id, started_at) VALUES (?1, datetime('now'))",
            params![session_id],
        )?;
    }

    for session_id in &pending.sessions_ended {
        tx.execute(
            "UPDATE sessions SET ended_at = datetime('now') WHERE session_id = ?1",
            params![session_id],
        )?;
    }

    tx.commit()?;
    Ok(())
}

fn str_field<'a>(payload: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(|v| v.as_str())
}

#[async_trait]
impl EventHandler for AnalyticsIngester {
    fn name(&self) -> &str {
        "analytics-ingester"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match event.event_type.as_str() {
            "agent.invoked" => {
                let agent_id = str_field(&event.payload, "agent").unwrap_or_default().to_string();
                let agent_type = str_field(&event.payload, "agent_type").unwrap_or_default().to_string();
                let model = str_field(&event.payload, "model").unwrap_or_default().to_string();
                self.pending.lock().await.agents.push((agent_id, agent_type, model, "running".into()));
            }
            "agent.completed" | "agent.failed" | "agent.timeout" => {
                let agent_id = str_field(&event.payload, "agent").unwrap_or_default().to_string();
                let status = event.event_type.trim_start_matches("agent.").to_string();
                self.pending.lock().await.agents.push((agent_id, String::new(), String::new(), status));
            }
            "tool.used" | "tool.error" => {
                let tool = str_field(&event.payload, "tool").unwrap_or_default().to_string();
                let agent_id = str_field(&event.payload, "agent").map(|s| s.to_string()).unwrap_or_default();
                let success = event.payload.get("success").and_then(|v| v.as_bool()).unwrap_or(event.event_type == "tool.used");
                let error_type = str_field(&event.payload, "error_type").map(|s| s.to_string());
                self.pending.lock().await.tool_usage.push((tool, agent_id, success, error_type));
            }
            "session.started" => {
                self.pending.lock().await.sessions_started.push(event.session_id.clone());
            }
            "session.ended" => {
                self.pending.lock().await.sessions_ended.push(event.session_id.clone());
            }
            _ => return Ok(()),
        }
        self.maybe_flush().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    #[tokio::test]
    async fn tool_used_event_produces_a_row_after_flush() {
        let dir = TempDir::new().unwrap();
        let ingester = AnalyticsIngester::open(dir.path().join("tracking.db")).await.unwrap();

        let mut payload = Map::new();
        payload.insert("tool".into(), json!("read"));
        payload.insert("success".into(), json!(true));
        let event = Event::new("tool.used", "s1", payload).unwrap();
        ingester.handle(&event).await.unwrap();
        ingester.flush().await;

        let conn = ingester.conn.clone();
        let count: i64 = tokio::task::spawn_blocking(move || {
            conn.lock().unwrap().query_row("SELECT COUNT(*) FROM tool_usage", [], |r| r.get(0)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(ingester.error_count(), 0);
    }

    #[tokio::test]
    async fn tool_error_event_also_writes_error_pattern_row() {
        let dir = TempDir::new().unwrap();
        let ingester = AnalyticsIngester::open(dir.path().join("tracking.db")).await.unwrap();

        let mut payload = Map::new();
        payload.insert("tool".into(), json!("bash"));
        payload.insert("success".into(), json!(false));
        payload.insert("error_type".into(), json!("ToolExecutionError"));
        let event = Event::new("tool.error", "s1", payload).unwrap();
        ingester.handle(&event).await.unwrap();
        ingester.flush().await;

        let conn = ingester.conn.clone();
        let count: i64 = tokio::task::spawn_blocking(move || {
            conn.lock().unwrap().query_row("SELECT COUNT(*) FROM error_patterns", [], |r| r.get(0)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn performance_by_agent_groups_completions_and_failures_by_type() {
        let dir = TempDir::new().unwrap();
        let ingester = AnalyticsIngester::open(dir.path().join("tracking.db")).await.unwrap();

        let mut invoked = Map::new();
        invoked.insert("agent".into(), json!("a1"));
        invoked.insert("agent_type".into(), json!("scout"));
        ingester.handle(&Event::new("agent.invoked", "s1", invoked).unwrap()).await.unwrap();

        let mut completed = Map::new();
        completed.insert("agent".into(), json!("a1"));
        ingester.handle(&Event::new("agent.completed", "s1", completed).unwrap()).await.unwrap();
        ingester.flush().await;

        let rows = ingester.performance_by_agent().await.unwrap();
        let scout = rows.iter().find(|r| r.agent_type == "scout").unwrap();
        assert_eq!(scout.completed, 1);
        assert_eq!(scout.failed, 0);
    }

    #[tokio::test]
    async fn tool_effectiveness_computes_success_rate() {
        let dir = TempDir::new().unwrap();
        let ingester = AnalyticsIngester::open(dir.path().join("tracking.db")).await.unwrap();

        for success in [true, true, false] {
            let mut payload = Map::new();
            payload.insert("tool".into(), json!("write"));
            payload.insert("success".into(), json!(success));
            ingester.handle(&Event::new("tool.used", "s1", payload).unwrap()).await.unwrap();
        }
        ingester.flush().await;

        let rows = ingester.tool_effectiveness().await.unwrap();
        let write = rows.iter().find(|r| r.tool == "write").unwrap();
        assert_eq!(write.total_calls, 3);
        assert!((write.success_rate - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn session_summary_reports_start_and_end() {
        let dir = TempDir::new().unwrap();
        let ingester = AnalyticsIngester::open(dir.path().join("tracking.db")).await.unwrap();

        ingester.handle(&Event::new("session.started", "s1", Map::new()).unwrap()).await.unwrap();
        ingester.handle(&Event::new("session.ended", "s1", Map::new()).unwrap()).await.unwrap();
        ingester.flush().await;

        let summary = ingester.session_summary("s1").await.unwrap().unwrap();
        assert!(summary.started_at.is_some());
        assert!(summary.ended_at.is_some());
        assert!(ingester.session_summary("missing").await.unwrap().is_none());
    }
}
