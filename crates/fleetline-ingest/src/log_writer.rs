use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleetline_core::{DataPaths, EventHandler};
use fleetline_types::Event;
use tokio::sync::Mutex;
use tracing::warn;

const DEFAULT_BUFFER_SIZE: usize = 100;

/// Subscribes to every event (`*`). Flattens each event to a single JSON
/// line, buffers it in a bounded ring per session, and flushes to
/// `logs/{session_id}.jsonl[.gz]` on buffer-full, explicit `flush`, or
/// shutdown. A write error is counted but never propagated to the bus —
/// the writer drops the batch after one retry (§4.C).
pub struct LogWriter {
    paths: DataPaths,
    buffer_size: usize,
    compress: bool,
    buffers: Mutex<HashMap<String, Vec<String>>>,
    error_count: AtomicU64,
}

impl LogWriter {
    pub fn new(paths: DataPaths, compress: bool) -> Self {
        Self {
            paths,
            buffer_size: DEFAULT_BUFFER_SIZE,
            compress,
            buffers: Mutex::new(HashMap::new()),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub async fn flush(&self, session_id: &str) {
        let lines = {
            let mut buffers = self.buffers.lock().await;
            match buffers.get_mut(session_id) {
                Some(lines) if !lines.is_empty() => std::mem::take(lines),
                _ => return,
            }
        };
        self.write_lines(session_id, lines).await;
    }

    pub async fn flush_all(&self) {
        let sessions: Vec<String> = self.buffers.lock().await.keys().cloned().collect();
        for session_id in sessions {
            self.flush(&session_id).await;
        }
    }

    async fn write_lines(&self, session_id: &str, lines: Vec<String>) {
        let path = self.paths.log_file(session_id, self.compress);
        let compress = self.compress;
        let result = tokio::task::spawn_blocking(move || write_lines_sync(&path, &lines, compress)).await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(session_id, error = %err, "log writer failed after retry, dropping batch");
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(session_id, error = %err, "log writer task panicked");
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn write_lines_sync(path: &PathBuf, lines: &[String], compress: bool) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let write_once = || -> anyhow::Result<()> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        if compress {
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            for line in lines {
                encoder.write_all(line.as_bytes())?;
                encoder.write_all(b"\n")?;
            }
            encoder.finish()?;
        } else {
            let mut file = file;
            for line in lines {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
        }
        Ok(())
    };

    // A write error gets exactly one retry before the batch is dropped.
    write_once().or_else(|_| write_once())
}

#[async_trait]
impl EventHandler for LogWriter {
    fn name(&self) -> &str {
        "log-writer"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let line = event.flatten().to_string();
        let should_flush = {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers.entry(event.session_id.clone()).or_default();
            buffer.push(line);
            buffer.len() >= self.buffer_size
        };
        if should_flush {
            self.flush(&event.session_id).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    #[tokio::test]
    async fn flush_writes_buffered_lines_to_jsonl() {
        let dir = TempDir::new().unwrap();
        let paths = DataPaths { root: dir.path().to_path_buf() };
        let writer = LogWriter::new(paths.clone(), false);
        let event = Event::new("agent.invoked", "s1", Map::new()).unwrap();
        writer.handle(&event).await.unwrap();
        writer.flush("s1").await;

        let contents = std::fs::read_to_string(paths.log_file("s1", false)).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("agent.invoked"));
    }

    #[tokio::test]
    async fn buffer_full_triggers_automatic_flush() {
        let dir = TempDir::new().unwrap();
        let paths = DataPaths { root: dir.path().to_path_buf() };
        let writer = LogWriter::new(paths.clone(), false).with_buffer_size(2);
        for _ in 0..2 {
            let event = Event::new("agent.invoked", "s1", Map::new()).unwrap();
            writer.handle(&event).await.unwrap();
        }
        let contents = std::fs::read_to_string(paths.log_file("s1", false)).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
