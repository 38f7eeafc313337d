//! HTTP server for health, metrics and admission endpoints
//!
//! One listener serves `/healthz`, `/readyz`, `/metrics` and the
//! Rollout admission webhook. Readiness follows the controller's
//! [`ControllerPhase`]. SIGTERM/SIGINT handling lives in [`shutdown`].

mod health;
pub mod metrics;
pub mod shutdown;
pub mod webhook;

pub use health::{run_server, ControllerPhase, ReadinessState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
