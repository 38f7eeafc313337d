//! Prometheus metrics for the rollout controller
//!
//! - `stride_reconciliations_total{result}` - reconcile outcomes
//! - `stride_reconcile_duration_seconds{result}` - reconcile latency
//! - `stride_rollout_current_batch{namespace,rollout}` - batch being rolled
//! - `stride_scale_operations_total{result}` - workload scale patches

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_duration: HistogramVec,
    current_batch: IntGaugeVec,
    scale_operations: IntCounterVec,
}

/// Build the registry with every controller metric registered
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    let registry = Registry::new();

    let reconciliations = IntCounterVec::new(
        Opts::new(
            "stride_reconciliations_total",
            "Rollout reconciliations by result",
        ),
        &["result"],
    )?;
    let reconcile_duration = HistogramVec::new(
        HistogramOpts::new(
            "stride_reconcile_duration_seconds",
            "Time spent in one Rollout reconciliation",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["result"],
    )?;
    let current_batch = IntGaugeVec::new(
        Opts::new(
            "stride_rollout_current_batch",
            "Zero-based index of the batch each Rollout is rolling",
        ),
        &["namespace", "rollout"],
    )?;
    let scale_operations = IntCounterVec::new(
        Opts::new(
            "stride_scale_operations_total",
            "Workload scale patches by result",
        ),
        &["result"],
    )?;

    registry.register(Box::new(reconciliations.clone()))?;
    registry.register(Box::new(reconcile_duration.clone()))?;
    registry.register(Box::new(current_batch.clone()))?;
    registry.register(Box::new(scale_operations.clone()))?;

    Ok(Arc::new(ControllerMetrics {
        registry,
        reconciliations,
        reconcile_duration,
        current_batch,
        scale_operations,
    }))
}

impl ControllerMetrics {
    pub fn record_reconciliation_success(&self, duration_secs: f64) {
        self.record_reconciliation("success", duration_secs);
    }

    pub fn record_reconciliation_error(&self, duration_secs: f64) {
        self.record_reconciliation("error", duration_secs);
    }

    fn record_reconciliation(&self, result: &str, duration_secs: f64) {
        self.reconciliations.with_label_values(&[result]).inc();
        self.reconcile_duration
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn set_current_batch(&self, namespace: &str, rollout: &str, batch: i32) {
        self.current_batch
            .with_label_values(&[namespace, rollout])
            .set(batch as i64);
    }

    /// Drop per-rollout series once the Rollout is deleted
    pub fn forget_rollout(&self, namespace: &str, rollout: &str) {
        let _ = self.current_batch.remove_label_values(&[namespace, rollout]);
    }

    pub fn record_scale(&self, success: bool) {
        let result = if success { "success" } else { "error" };
        self.scale_operations.with_label_values(&[result]).inc();
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
