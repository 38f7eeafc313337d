//! stride: batch rollout controller for Kubernetes workloads
//!
//! A `Rollout` takes over a paused Deployment and drives its replica count
//! through the cumulative batch targets of a declarative plan, persisting
//! every step in the Rollout status so any reconcile can be replayed.

pub mod config;
pub mod controller;
pub mod crd;
pub mod server;
