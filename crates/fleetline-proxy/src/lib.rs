pub mod proxy;
pub mod risk;

pub use proxy::{ProxyRequest, ProxyResult, ToolExecutor, ToolProxy};
pub use risk::{score, RiskBreakdown, ToolInvocation};
