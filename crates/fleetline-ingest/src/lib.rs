pub mod analytics;
pub mod log_writer;

pub use analytics::{AgentPerformance, AnalyticsIngester, ErrorPattern, SessionSummary, ToolEffectiveness};
pub use log_writer::LogWriter;
