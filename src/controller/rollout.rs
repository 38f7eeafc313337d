pub mod reconcile;
pub mod state_machine;
pub mod status;
pub mod validation;

// Re-export everything so the controller API stays flat
pub use reconcile::*;
pub use state_machine::*;
pub use status::*;
pub use validation::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "rollout_test.rs"]
mod tests;
