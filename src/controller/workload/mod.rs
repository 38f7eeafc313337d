//! Workload drivers
//!
//! A `WorkloadDriver` is the capability set the rollout engine needs from a
//! workload kind: verify it is quiescent, claim it, scale it, release it.
//! Each kind implements the trait once; shared plumbing (event recorder,
//! owner reference, status snapshot) lives in `WorkloadController` and is
//! composed into every driver.

pub mod deployment;
pub mod patch;

use crate::controller::events::{EventRecorder, RolloutEvent};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::PatchParams;
use std::sync::Arc;
use thiserror::Error;

pub use deployment::{DeploymentClient, DeploymentDriver, KubeDeploymentClient};

#[derive(Debug, Error)]
pub enum DriverError {
    /// The workload is not in a state the rollout may act on; needs user action
    #[error("{0}")]
    Precondition(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Failed to build workload patch: {0}")]
    SerializationError(String),
}

impl DriverError {
    /// Transient errors are retried with backoff by the scheduler; the others
    /// are surfaced in status and retried harmlessly on the regular requeue.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::KubeError(_))
    }

    /// Whether the error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, DriverError::KubeError(kube::Error::Api(err)) if err.code == 409)
    }
}

/// Replica counts read from a workload's live status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservedReplicas {
    /// Desired replica count from the workload spec
    pub desired: i32,
    /// Replicas running the current template
    pub updated: i32,
    /// Ready replicas
    pub ready: i32,
    /// The workload's status has not caught up with its latest spec
    pub stale: bool,
}

/// Capability set implemented once per workload kind
///
/// All operations are idempotent or re-derivable from live state, so the
/// engine can replay any step after a crash between the call and the status
/// write.
#[async_trait]
pub trait WorkloadDriver: Send + Sync {
    /// The kind's API object
    type Workload: Send + Sync;

    /// Kind name for logging
    fn kind(&self) -> &'static str;

    /// Check the source workload is safe to mutate
    ///
    /// * `Ok(false)` - source not found yet
    /// * `Err(DriverError::Precondition)` - found but not paused
    /// * `Ok(true)` - found and paused
    async fn verify_spec(&self) -> Result<bool, DriverError>;

    /// Read the target workload, `None` if it does not exist
    async fn fetch_target(&self) -> Result<Option<Self::Workload>, DriverError>;

    /// Replica counts from the workload's live status
    fn observe(&self, workload: &Self::Workload) -> ObservedReplicas;

    /// Take exclusive control of the workload
    ///
    /// Returns `Ok(true)` without mutating anything if this rollout kind
    /// already controls it.
    async fn claim_ownership(
        &self,
        workload: &Self::Workload,
        initial_size: Option<i32>,
    ) -> Result<bool, DriverError>;

    /// Set the desired replica count; does not wait for readiness
    async fn scale(&self, workload: &Self::Workload, target_replicas: i32)
        -> Result<(), DriverError>;

    /// Whether this very Rollout (matched by UID) holds the controller reference
    fn held_by_owner(&self, workload: &Self::Workload) -> bool;

    /// Release control, leaving the workload at its current size
    async fn finalize(&self, workload: &Self::Workload) -> Result<(), DriverError>;
}

/// Shared state injected into every kind-specific driver
pub struct WorkloadController {
    pub recorder: Arc<dyn EventRecorder>,
    /// Controller reference pointing at the owning Rollout
    pub owner_ref: OwnerReference,
    /// The owning Rollout, for event attribution
    pub regarding: ObjectReference,
    /// Batch index of the persisted status, for progress logging
    pub current_batch: i32,
    /// Field manager recorded on every patch
    pub field_manager: String,
}

impl WorkloadController {
    pub fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    pub async fn record(&self, event: RolloutEvent) {
        self.recorder.publish(&self.regarding, event).await;
    }

    /// Whether `reference` points at the same kind and API group as the owner
    pub fn is_owner_kind(&self, reference: &OwnerReference) -> bool {
        reference.kind == self.owner_ref.kind
            && api_group(&reference.api_version) == api_group(&self.owner_ref.api_version)
    }

    /// Whether the workload's controller reference is this rollout kind
    pub fn controls(&self, meta: &ObjectMeta) -> bool {
        controller_of(meta).is_some_and(|controller| self.is_owner_kind(controller))
    }

    /// Whether the controller reference is this exact Rollout object
    pub fn held(&self, meta: &ObjectMeta) -> bool {
        controller_of(meta).is_some_and(|controller| controller.uid == self.owner_ref.uid)
    }

    /// Owner references after claiming: stale references of the rollout kind
    /// are replaced by exactly one controller reference
    pub fn claimed_owner_references(&self, meta: &ObjectMeta) -> Vec<OwnerReference> {
        let mut refs: Vec<OwnerReference> = meta
            .owner_references
            .iter()
            .flatten()
            .filter(|r| !self.is_owner_kind(r))
            .cloned()
            .collect();
        refs.push(self.owner_ref.clone());
        refs
    }

    /// Owner references after releasing: every reference of the rollout kind removed
    pub fn released_owner_references(&self, meta: &ObjectMeta) -> Option<Vec<OwnerReference>> {
        let refs: Vec<OwnerReference> = meta
            .owner_references
            .iter()
            .flatten()
            .filter(|r| !self.is_owner_kind(r))
            .cloned()
            .collect();
        (!refs.is_empty()).then_some(refs)
    }
}

/// The owner reference flagged as controller, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
}

/// API group of an apiVersion string ("apps/v1" -> "apps", "v1" -> "")
pub fn api_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::events::MockEventRecorder;

    fn owner(api_version: &str, kind: &str, uid: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: format!("{}-owner", uid),
            uid: uid.to_string(),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }
    }

    fn controller() -> WorkloadController {
        WorkloadController {
            recorder: Arc::new(MockEventRecorder::new()),
            owner_ref: owner("stride.dev/v1alpha1", "Rollout", "rollout-uid", true),
            regarding: ObjectReference::default(),
            current_batch: 0,
            field_manager: "stride-controller".to_string(),
        }
    }

    #[test]
    fn test_api_group() {
        assert_eq!(api_group("apps/v1"), "apps");
        assert_eq!(api_group("stride.dev/v1beta1"), "stride.dev");
        assert_eq!(api_group("v1"), "");
    }

    #[test]
    fn test_owner_kind_ignores_version() {
        let c = controller();
        assert!(c.is_owner_kind(&owner("stride.dev/v1beta1", "Rollout", "other", true)));
        assert!(!c.is_owner_kind(&owner("argoproj.io/v1alpha1", "Rollout", "x", true)));
        assert!(!c.is_owner_kind(&owner("stride.dev/v1alpha1", "Canary", "x", true)));
    }

    #[test]
    fn test_controls_requires_controller_flag() {
        let c = controller();
        let meta = ObjectMeta {
            owner_references: Some(vec![owner("stride.dev/v1alpha1", "Rollout", "u", false)]),
            ..Default::default()
        };
        assert!(!c.controls(&meta));

        let meta = ObjectMeta {
            owner_references: Some(vec![owner("stride.dev/v1alpha1", "Rollout", "u", true)]),
            ..Default::default()
        };
        assert!(c.controls(&meta));
        assert!(!c.held(&meta), "same kind but a different Rollout");

        let meta = ObjectMeta {
            owner_references: Some(vec![c.owner_ref.clone()]),
            ..Default::default()
        };
        assert!(c.held(&meta));
    }

    #[test]
    fn test_claimed_owner_references_replaces_stale_rollout_refs() {
        let c = controller();
        let meta = ObjectMeta {
            owner_references: Some(vec![
                owner("v1", "ConfigMap", "cm", false),
                owner("stride.dev/v1alpha1", "Rollout", "stale", false),
            ]),
            ..Default::default()
        };

        let refs = c.claimed_owner_references(&meta);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].kind, "ConfigMap");
        assert_eq!(refs[1].uid, "rollout-uid");
    }

    #[test]
    fn test_released_owner_references() {
        let c = controller();
        let only_ours = ObjectMeta {
            owner_references: Some(vec![c.owner_ref.clone()]),
            ..Default::default()
        };
        assert_eq!(c.released_owner_references(&only_ours), None);

        let mixed = ObjectMeta {
            owner_references: Some(vec![owner("v1", "ConfigMap", "cm", false), c.owner_ref.clone()]),
            ..Default::default()
        };
        let released = c.released_owner_references(&mixed).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].kind, "ConfigMap");
    }
}
