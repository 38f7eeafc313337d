use crate::controller::planner::{plan, validate_batches};
use crate::crd::rollout::{RollingState, Rollout, RolloutPlan, WorkloadRef};
use std::time::Duration;

/// Workload kinds with a driver
const SUPPORTED_WORKLOADS: &[(&str, &str)] = &[("apps/v1", "Deployment")];

/// Validate Rollout specification
///
/// Validates runtime constraints that cannot be enforced via CRD schema.
/// Used by both the reconcile loop (runtime) and the validating webhook (admission).
///
/// # Validation Rules
/// - `targetRef` (and `sourceRef` when set) name a supported workload kind
/// - `sourceRef` has the same kind as `targetRef`
/// - `rolloutBatches` is non-empty, well formed, and ordered
/// - `targetSize` must be >= 0 and large enough for every absolute batch
/// - `batchPartition` must be >= 0
/// - `batchReadyTimeoutSeconds` must be > 0
pub fn validate_rollout(rollout: &Rollout) -> Result<(), String> {
    let spec = &rollout.spec;

    validate_workload_ref("spec.targetRef", &spec.target_ref)?;
    if let Some(source) = &spec.source_ref {
        validate_workload_ref("spec.sourceRef", source)?;
        if source.kind != spec.target_ref.kind || source.api_version != spec.target_ref.api_version
        {
            return Err(format!(
                "spec.sourceRef kind {}/{} must match spec.targetRef kind {}/{}",
                source.api_version, source.kind, spec.target_ref.api_version, spec.target_ref.kind
            ));
        }
    }

    validate_plan(&spec.rollout_plan)
}

fn validate_workload_ref(field: &str, reference: &WorkloadRef) -> Result<(), String> {
    if reference.name.is_empty() {
        return Err(format!("{}.name cannot be empty", field));
    }

    let supported = SUPPORTED_WORKLOADS
        .iter()
        .any(|(api_version, kind)| reference.api_version == *api_version && reference.kind == *kind);
    if !supported {
        return Err(format!(
            "{} kind {}/{} is not supported (supported: {})",
            field,
            reference.api_version,
            reference.kind,
            SUPPORTED_WORKLOADS
                .iter()
                .map(|(api_version, kind)| format!("{}/{}", api_version, kind))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    Ok(())
}

fn validate_plan(rollout_plan: &RolloutPlan) -> Result<(), String> {
    validate_batches(&rollout_plan.rollout_batches)
        .map_err(|e| format!("spec.rolloutPlan: {}", e))?;

    if let Some(target_size) = rollout_plan.target_size {
        if target_size < 0 {
            return Err(format!(
                "spec.rolloutPlan.targetSize must be >= 0, got {}",
                target_size
            ));
        }
        // The total is known up front, so size-dependent checks run now
        plan(&rollout_plan.rollout_batches, target_size)
            .map_err(|e| format!("spec.rolloutPlan: {}", e))?;
    }

    if let Some(partition) = rollout_plan.batch_partition {
        if partition < 0 {
            return Err(format!(
                "spec.rolloutPlan.batchPartition must be >= 0, got {}",
                partition
            ));
        }
    }

    if let Some(timeout) = rollout_plan.batch_ready_timeout_seconds {
        if timeout <= 0 {
            return Err(format!(
                "spec.rolloutPlan.batchReadyTimeoutSeconds must be > 0, got {}",
                timeout
            ));
        }
    }

    Ok(())
}

/// Validate an update against the Rollout being replaced
///
/// Once verification has passed and until the rollout reaches a terminal
/// state, the workload references and the batch plan are frozen. `paused` and
/// `batchPartition` stay editable since they are how users steer a rollout.
pub fn validate_rollout_update(old: &Rollout, new: &Rollout) -> Result<(), String> {
    validate_rollout(new)?;

    let state = old
        .status
        .as_ref()
        .map(|s| s.rolling_state)
        .unwrap_or_default();
    let in_flight = state == RollingState::Initializing || state.owns_workload();
    if !in_flight {
        return Ok(());
    }

    if old.spec.target_ref != new.spec.target_ref
        || old.spec.effective_source_ref() != new.spec.effective_source_ref()
    {
        return Err(format!(
            "spec.targetRef and spec.sourceRef cannot change while the rollout is {}",
            state
        ));
    }

    let steerable = |p: &RolloutPlan| RolloutPlan {
        paused: false,
        batch_partition: None,
        ..p.clone()
    };
    if steerable(&old.spec.rollout_plan) != steerable(&new.spec.rollout_plan) {
        return Err(format!(
            "spec.rolloutPlan cannot change while the rollout is {}; only paused and batchPartition may be edited",
            state
        ));
    }

    Ok(())
}

/// Bounded wait of BatchVerifying: the plan's value, else the controller default
pub fn batch_ready_timeout(rollout_plan: &RolloutPlan, default: Duration) -> Duration {
    rollout_plan
        .batch_ready_timeout_seconds
        .filter(|seconds| *seconds > 0)
        .map(|seconds| Duration::from_secs(seconds as u64))
        .unwrap_or(default)
}
