pub mod reference_check_trigger;
pub mod snapshot_trigger;

pub use reference_check_trigger::ReferenceCheckTrigger;
pub use snapshot_trigger::SnapshotTrigger;
