use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use fleetline_core::{storage_paths::DataPaths, EventBus, EventHandler};
use fleetline_types::Event;
use tempfile::TempDir;
use tokio::sync::Mutex;

/// A controllable clock for tests that exercise time-based behavior
/// (budget heartbeats, cost-tracker buckets, snapshot cleanup windows)
/// without sleeping. Starts at a fixed instant and only moves when told.
#[derive(Clone)]
pub struct FakeClock {
    epoch_ms: Arc<AtomicI64>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { epoch_ms: Arc::new(AtomicI64::new(start.timestamp_millis())) }
    }

    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.epoch_ms.load(Ordering::SeqCst)).unwrap_or_else(Utc::now)
    }

    pub fn advance(&self, delta: ChronoDuration) {
        self.epoch_ms.fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
    }
}

/// Records every event it is handed, in delivery order, for assertions in
/// other crates' subscriber tests.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.events.lock().await.len()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording-handler"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// A fresh `EventBus` plus a `DataPaths` rooted in a temp directory that
/// is cleaned up when the harness drops — the shape every subscriber's
/// test suite constructs by hand otherwise.
pub struct TestHarness {
    pub bus: Arc<EventBus>,
    pub paths: DataPaths,
    _tempdir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let tempdir = TempDir::new().expect("create tempdir");
        let paths = DataPaths { root: tempdir.path().to_path_buf() };
        Self { bus: Arc::new(EventBus::new()), paths, _tempdir: tempdir }
    }

    pub fn project_root(&self) -> &std::path::Path {
        self._tempdir.path()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
