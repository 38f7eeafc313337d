use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer placed on every Rollout so the workload is released before the
/// Rollout disappears (otherwise garbage collection would follow the owner
/// reference and delete the workload with it).
pub const ROLLOUT_FINALIZER: &str = "stride.dev/release-workload";

/// Rollout drives an existing workload through a batch-wise replica rollout
///
/// The Rollout takes over the workload referenced by `targetRef`, verifies it is
/// paused, then scales it through the cumulative batch targets of `rolloutPlan`.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "stride.dev",
    version = "v1alpha1",
    kind = "Rollout",
    namespaced,
    status = "RolloutStatus",
    printcolumn = r#"{"name":"Target", "type":"string", "jsonPath":".spec.targetRef.name"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.rollingState"}"#,
    printcolumn = r#"{"name":"Batch", "type":"integer", "jsonPath":".status.currentBatch"}"#,
    printcolumn = r#"{"name":"Upgraded", "type":"integer", "jsonPath":".status.upgradedReplicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct RolloutSpec {
    /// Workload holding the desired post-rollout template
    #[serde(rename = "targetRef")]
    pub target_ref: WorkloadRef,

    /// Workload holding the pre-rollout template.
    /// Defaults to `targetRef` for single-object workload kinds such as Deployment.
    #[serde(rename = "sourceRef", skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<WorkloadRef>,

    /// Batch plan the workload is driven through
    #[serde(rename = "rolloutPlan")]
    pub rollout_plan: RolloutPlan,
}

impl RolloutSpec {
    /// Source reference, falling back to the target for single-object kinds
    pub fn effective_source_ref(&self) -> &WorkloadRef {
        self.source_ref.as_ref().unwrap_or(&self.target_ref)
    }
}

/// Namespaced reference to a workload object
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct WorkloadRef {
    /// API version of the workload (e.g., "apps/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Kind of the workload (e.g., "Deployment")
    pub kind: String,

    /// Name of the workload
    pub name: String,

    /// Namespace of the workload. Defaults to the Rollout's namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl WorkloadRef {
    /// Namespace of the workload, defaulting to the owning Rollout's namespace
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

/// Declarative rollout plan, immutable while a rollout is in flight
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutPlan {
    /// Ordered batches; each entry is the cumulative replica target of that batch
    #[serde(rename = "rolloutBatches", default)]
    pub rollout_batches: Vec<RolloutBatch>,

    /// Total desired replica count. When unset, the workload's replica count
    /// observed at verification time is used.
    #[serde(rename = "targetSize", skip_serializing_if = "Option::is_none")]
    pub target_size: Option<i32>,

    /// Highest batch index allowed to start. The rollout holds once that batch
    /// is ready until the partition is raised.
    #[serde(rename = "batchPartition", skip_serializing_if = "Option::is_none")]
    pub batch_partition: Option<i32>,

    /// Stop making progress until unpaused
    #[serde(default)]
    pub paused: bool,

    /// Maximum seconds a batch may take to become ready before the rollout fails
    #[serde(
        rename = "batchReadyTimeoutSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub batch_ready_timeout_seconds: Option<i32>,
}

/// One step of the rollout
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct RolloutBatch {
    /// Cumulative replica target: an absolute count (e.g., 3) or a
    /// percentage of the total (e.g., "30%")
    pub replicas: IntOrString,
}

/// State of the rollout engine
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RollingState {
    /// Waiting for the source workload to exist and be paused
    #[default]
    Verifying,
    /// Claiming the workload and setting the first batch size
    Initializing,
    /// Scaling the workload to the current batch target
    Rolling,
    /// Waiting for the current batch to become ready
    BatchVerifying,
    /// Releasing the workload
    Finalizing,
    /// Rollout completed
    Succeeded,
    /// Rollout failed and requires a spec change
    Failed,
}

impl RollingState {
    /// Terminal states only refresh observed counts
    pub fn is_terminal(&self) -> bool {
        matches!(self, RollingState::Succeeded | RollingState::Failed)
    }

    /// States where the rollout holds ownership of the workload
    pub fn owns_workload(&self) -> bool {
        matches!(
            self,
            RollingState::Rolling | RollingState::BatchVerifying | RollingState::Finalizing
        )
    }
}

impl std::fmt::Display for RollingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Condition surfaced on the Rollout status
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct RolloutCondition {
    /// Condition type (currently always "Progressing")
    #[serde(rename = "type")]
    pub type_: String,

    /// "True" or "False"
    pub status: String,

    /// Machine-readable reason (e.g., "PreconditionFailed")
    pub reason: String,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the condition last changed status (RFC3339)
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

/// Status of the Rollout
///
/// Optional fields without `skip_serializing_if` serialize as `null` so a merge
/// patch of the whole status clears them.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutStatus {
    /// Current state of the rollout engine
    #[serde(rename = "rollingState", default)]
    pub rolling_state: RollingState,

    /// Zero-based index of the batch being rolled
    #[serde(rename = "currentBatch", default)]
    pub current_batch: i32,

    /// Replicas running the new template, from the workload's live status
    #[serde(rename = "upgradedReplicas", default)]
    pub upgraded_replicas: i32,

    /// Ready replicas, from the workload's live status
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,

    /// Last surfaced error, cleared on successful transition
    #[serde(rename = "lastError", default)]
    pub last_error: Option<String>,

    /// Time of the last persisted change (RFC3339)
    #[serde(rename = "lastUpdateTime", default)]
    pub last_update_time: Option<String>,

    /// Total desired replicas resolved at verification time
    #[serde(rename = "rolloutTargetSize", default)]
    pub rollout_target_size: Option<i32>,

    /// When the current batch was scaled (RFC3339)
    #[serde(rename = "batchStartedAt", default)]
    pub batch_started_at: Option<String>,

    /// Rollout generation this status was computed from
    #[serde(rename = "observedGeneration", default)]
    pub observed_generation: Option<i64>,

    /// Conditions surfaced to users
    #[serde(default)]
    pub conditions: Vec<RolloutCondition>,
}

#[cfg(test)]
#[path = "rollout_test.rs"]
mod tests;
