pub mod candidates;
pub mod feed;
pub mod filters;
pub mod health;
pub mod snapshot;

#[allow(unused_imports)]
pub use health::{ws_healthy_decision, ws_healthy_exec, HealthVerdict};
#[allow(unused_imports)]
pub use snapshot::{BookSide, DepthLevel, Snapshot, SnapshotSource, SnapshotStore};
