pub mod clock;
pub mod events;
pub mod planner;
pub mod rollout;
pub mod workload;

pub use rollout::{error_policy, reconcile, Context, ReconcileError};
