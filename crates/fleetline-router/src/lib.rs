pub mod complexity;
pub mod router;

pub use complexity::{score, TaskSpec};
pub use router::{ModelEntry, ModelRouter, ModelRoutingSubscriber, RoutingStats, Tier};
