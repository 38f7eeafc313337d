use crate::config::ControllerConfig;
use crate::controller::clock::{Clock, SystemClock};
use crate::controller::events::{EventRecorder, KubeEventRecorder};
use crate::controller::workload::deployment::DeploymentKey;
use crate::controller::workload::{
    DeploymentClient, DeploymentDriver, DriverError, KubeDeploymentClient, WorkloadController,
    WorkloadDriver,
};
use crate::crd::rollout::{RollingState, Rollout, RolloutStatus, ROLLOUT_FINALIZER};
use crate::server::SharedMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::state_machine::{RolloutStateMachine, TickOutcome};
use super::status::{
    mark_failed, progressing_condition, reason, requeue_interval, status_changed,
    transition_events,
};
use super::validation::{batch_ready_timeout, validate_rollout};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Rollout missing namespace")]
    MissingNamespace,

    #[error("Rollout missing uid, cannot reference it as owner")]
    MissingUid,

    #[error("Workload operation failed: {0}")]
    DriverError(#[from] DriverError),

    #[error("Unsupported workload kind: {0}")]
    UnsupportedWorkload(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<ReconcileError>>),
}

/// Persists Rollout status
///
/// Production code uses `KubeStatusStore`; tests use `MockStatusStore`.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Write the whole status, pinned to `resource_version` when given
    async fn persist(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &RolloutStatus,
    ) -> Result<(), kube::Error>;
}

pub struct KubeStatusStore {
    client: kube::Client,
    field_manager: String,
}

impl KubeStatusStore {
    pub fn new(client: kube::Client, field_manager: &str) -> Self {
        KubeStatusStore {
            client,
            field_manager: field_manager.to_string(),
        }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn persist(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &RolloutStatus,
    ) -> Result<(), kube::Error> {
        let rollout_api: Api<Rollout> = Api::namespaced(self.client.clone(), namespace);
        let mut patch = serde_json::json!({ "status": status });
        if let Some(rv) = resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }

        rollout_api
            .patch_status(
                name,
                &PatchParams {
                    field_manager: Some(self.field_manager.clone()),
                    ..Default::default()
                },
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

pub struct Context {
    pub client: kube::Client,
    pub deployments: Arc<dyn DeploymentClient>,
    pub recorder: Arc<dyn EventRecorder>,
    pub status_store: Arc<dyn StatusStore>,
    pub clock: Arc<dyn Clock>,
    /// Used as field manager on every write
    pub controller_name: String,
    /// Bounded batch wait when the plan does not set one
    pub batch_ready_timeout: Duration,
    /// Optional controller metrics for Prometheus
    /// When Some, records reconciliation counts and durations
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    /// Create a Context wired to the cluster
    pub fn new(
        client: kube::Client,
        config: &ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            deployments: Arc::new(KubeDeploymentClient::new(client.clone())),
            recorder: Arc::new(KubeEventRecorder::new(
                client.clone(),
                &config.controller_name,
                config.instance.clone(),
            )),
            status_store: Arc::new(KubeStatusStore::new(
                client.clone(),
                &config.controller_name,
            )),
            clock: Arc::new(SystemClock),
            controller_name: config.controller_name.clone(),
            batch_ready_timeout: config.batch_ready_timeout,
            metrics,
            client,
        }
    }

    /// Create a Context backed by in-memory collaborators
    #[cfg(test)]
    #[allow(clippy::unwrap_used)] // Test helper - panicking is acceptable
    pub fn new_mock(
        deployments: Arc<crate::controller::workload::deployment::MockDeploymentClient>,
        recorder: Arc<crate::controller::events::MockEventRecorder>,
        status_store: Arc<MockStatusStore>,
        clock: Arc<crate::controller::clock::MockClock>,
    ) -> Self {
        // Install ring as the default crypto provider for rustls
        let _ = rustls::crypto::ring::default_provider().install_default();

        // The client is only used by the finalizer wrapper, never in unit tests
        let mut config = kube::Config::new("https://localhost:8080".parse().unwrap());
        config.default_namespace = "default".to_string();
        config.accept_invalid_certs = true;
        let client = kube::Client::try_from(config).unwrap();

        Context {
            client,
            deployments,
            recorder,
            status_store,
            clock,
            controller_name: crate::config::DEFAULT_CONTROLLER_NAME.to_string(),
            batch_ready_timeout: crate::config::DEFAULT_BATCH_READY_TIMEOUT,
            metrics: None,
        }
    }

    /// Build the Deployment driver for a Rollout
    fn deployment_driver(
        &self,
        rollout: &Rollout,
        namespace: &str,
    ) -> Result<DeploymentDriver, ReconcileError> {
        let owner_ref = rollout
            .controller_owner_ref(&())
            .ok_or(ReconcileError::MissingUid)?;
        let base = WorkloadController {
            recorder: self.recorder.clone(),
            owner_ref,
            regarding: rollout.object_ref(&()),
            current_batch: rollout.status.as_ref().map(|s| s.current_batch).unwrap_or(0),
            field_manager: self.controller_name.clone(),
        };

        Ok(DeploymentDriver::new(
            base,
            self.deployments.clone(),
            DeploymentKey::from_ref(rollout.spec.effective_source_ref(), namespace),
            DeploymentKey::from_ref(&rollout.spec.target_ref, namespace),
        ))
    }
}

/// Reconcile a Rollout resource
///
/// Entry point for the controller runtime. Keeps the release finalizer on the
/// Rollout and dispatches to `reconcile_rollout` while it lives and to
/// `release_rollout` once it is being deleted.
pub async fn reconcile(rollout: Arc<Rollout>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    // Start timing for metrics
    let start_time = std::time::Instant::now();

    let namespace = rollout
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let rollout_api: Api<Rollout> = Api::namespaced(ctx.client.clone(), &namespace);

    let tick_ctx = ctx.clone();
    let result = finalizer(&rollout_api, ROLLOUT_FINALIZER, rollout, |event| async move {
        match event {
            FinalizerEvent::Apply(rollout) => reconcile_rollout(&rollout, &tick_ctx).await,
            FinalizerEvent::Cleanup(rollout) => release_rollout(&rollout, &tick_ctx).await,
        }
    })
    .await
    .map_err(|e| ReconcileError::FinalizerError(Box::new(e)));

    if let Some(ref metrics) = ctx.metrics {
        let duration_secs = start_time.elapsed().as_secs_f64();
        match result {
            Ok(_) => metrics.record_reconciliation_success(duration_secs),
            Err(_) => metrics.record_reconciliation_error(duration_secs),
        }
    }

    result
}

/// Run one tick of the rollout engine and persist its outcome
///
/// 1. Validates the Rollout spec (an invalid spec fails the rollout before
///    any workload mutation)
/// 2. Selects the workload driver from `targetRef.kind`
/// 3. Runs the state machine for one step
/// 4. Persists the status if anything but `lastUpdateTime` changed, then
///    emits transition events
/// 5. Returns the driver's transient error after persisting, so the
///    scheduler backs off
pub async fn reconcile_rollout(rollout: &Rollout, ctx: &Context) -> Result<Action, ReconcileError> {
    let namespace = rollout
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = rollout.name_any();
    let now = ctx.clock.now();

    debug!(
        rollout = ?name,
        namespace = ?namespace,
        "Reconciling Rollout"
    );

    let current = rollout.status.as_ref();
    let batch_timeout = batch_ready_timeout(&rollout.spec.rollout_plan, ctx.batch_ready_timeout);

    let outcome = match validate_rollout(rollout) {
        Err(validation_error) => {
            error!(
                rollout = ?name,
                error = ?validation_error,
                "Rollout spec validation failed"
            );
            rejected_spec(rollout, validation_error, now)
        }
        Ok(()) => match rollout.spec.target_ref.kind.as_str() {
            "Deployment" => {
                let driver = ctx.deployment_driver(rollout, &namespace)?;
                run_tick(rollout, ctx, &driver, batch_timeout, now).await
            }
            other => return Err(ReconcileError::UnsupportedWorkload(other.to_string())),
        },
    };

    let TickOutcome { mut status, error } = outcome;

    if status_changed(current, &status) {
        status.last_update_time = Some(now.to_rfc3339());
        info!(
            rollout = ?name,
            state = %status.rolling_state,
            batch = status.current_batch,
            ready = status.ready_replicas,
            reason = progressing_condition(&status).map(|c| c.reason.as_str()).unwrap_or_default(),
            "Updating Rollout status"
        );

        if let Err(e) = ctx
            .status_store
            .persist(
                &namespace,
                &name,
                rollout.metadata.resource_version.as_deref(),
                &status,
            )
            .await
        {
            error!(error = ?e, rollout = ?name, "Failed to update status");
            return Err(ReconcileError::KubeError(e));
        }

        let regarding = rollout.object_ref(&());
        for event in transition_events(current, &status) {
            ctx.recorder.publish(&regarding, event).await;
        }
    } else {
        debug!(rollout = ?name, state = %status.rolling_state, "Status unchanged");
    }

    if let Some(ref metrics) = ctx.metrics {
        metrics.set_current_batch(&namespace, &name, status.current_batch);
    }

    if let Some(err) = error {
        return Err(ReconcileError::DriverError(err));
    }

    Ok(Action::requeue(requeue_interval(
        &status,
        batch_timeout,
        rollout.spec.rollout_plan.paused,
        now,
    )))
}

async fn run_tick<D: WorkloadDriver>(
    rollout: &Rollout,
    ctx: &Context,
    driver: &D,
    batch_timeout: Duration,
    now: DateTime<Utc>,
) -> TickOutcome {
    let name = rollout.name_any();
    let machine = RolloutStateMachine {
        name: &name,
        driver,
        plan: &rollout.spec.rollout_plan,
        generation: rollout.metadata.generation,
        batch_timeout,
        now,
        metrics: ctx.metrics.as_ref(),
    };
    machine.tick(rollout.status.as_ref()).await
}

/// An invalid spec is terminal for its generation
fn rejected_spec(rollout: &Rollout, message: String, now: DateTime<Utc>) -> TickOutcome {
    let mut status = rollout.status.clone().unwrap_or_default();
    status.observed_generation = rollout.metadata.generation;
    mark_failed(
        &mut status,
        reason::INVALID_PLAN,
        format!("Invalid Rollout spec: {}", message),
        now,
    );
    TickOutcome {
        status,
        error: None,
    }
}

/// Release the workload before the Rollout is removed
///
/// Only a workload whose controller reference is this very Rollout is
/// touched; without the release, garbage collection would follow the owner
/// reference and delete the workload.
pub async fn release_rollout(rollout: &Rollout, ctx: &Context) -> Result<Action, ReconcileError> {
    let namespace = rollout
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = rollout.name_any();
    let state = rollout
        .status
        .as_ref()
        .map(|s| s.rolling_state)
        .unwrap_or_default();

    if rollout.spec.target_ref.kind == "Deployment" {
        let driver = ctx.deployment_driver(rollout, &namespace)?;
        match driver.fetch_target().await? {
            Some(deploy) if driver.held_by_owner(&deploy) => {
                driver.finalize(&deploy).await?;
                info!(rollout = ?name, state = %state, "Released workload of deleted Rollout");
            }
            _ => debug!(rollout = ?name, "No workload held by deleted Rollout"),
        }
    } else {
        warn!(
            rollout = ?name,
            kind = %rollout.spec.target_ref.kind,
            "Deleted Rollout targets an unsupported kind, nothing to release"
        );
    }

    if state != RollingState::Succeeded {
        info!(rollout = ?name, state = %state, "Rollout deleted before completion");
    }
    if let Some(ref metrics) = ctx.metrics {
        metrics.forget_rollout(&namespace, &name);
    }

    Ok(Action::await_change())
}

/// Error policy for the controller
///
/// Requeues after a fixed delay. Uses `warn!` since reconciliation errors are
/// expected and trigger retries.
pub fn error_policy(rollout: Arc<Rollout>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    warn!(
        rollout = ?rollout.name_any(),
        error = %error,
        "Reconcile error (will retry)"
    );
    Action::requeue(Duration::from_secs(10))
}

/// In-memory status store for testing
#[cfg(test)]
#[derive(Default)]
pub struct MockStatusStore {
    writes: std::sync::Mutex<Vec<RolloutStatus>>,
    failing: std::sync::Mutex<usize>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a 409
    pub fn fail_next_writes(&self, count: usize) {
        *self.failing.lock().unwrap() = count;
    }

    pub fn writes(&self) -> Vec<RolloutStatus> {
        self.writes.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<RolloutStatus> {
        self.writes.lock().unwrap().last().cloned()
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl StatusStore for MockStatusStore {
    async fn persist(
        &self,
        _namespace: &str,
        name: &str,
        _resource_version: Option<&str>,
        status: &RolloutStatus,
    ) -> Result<(), kube::Error> {
        let mut failing = self.failing.lock().unwrap();
        if *failing > 0 {
            *failing -= 1;
            return Err(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("Operation cannot be fulfilled on rollouts \"{}\"", name),
                reason: "Conflict".to_string(),
                code: 409,
            }));
        }
        drop(failing);
        self.writes.lock().unwrap().push(status.clone());
        Ok(())
    }
}
