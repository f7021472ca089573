pub mod fixtures;

pub use fixtures::{FakeClock, RecordingHandler, TestHarness};
