//! Deployment workload driver
//!
//! For a Deployment the source and target references resolve to the same
//! object observed at two different times: "source" is the paused object with
//! its pre-rollout replica count, "target" is the object being scaled.

use super::patch::merge_patch_from;
use super::{DriverError, ObservedReplicas, WorkloadController, WorkloadDriver};
use crate::controller::events::RolloutEvent;
use crate::crd::rollout::WorkloadRef;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, error, info};

/// Namespaced name of a Deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentKey {
    pub namespace: String,
    pub name: String,
}

impl DeploymentKey {
    pub fn from_ref(reference: &WorkloadRef, default_namespace: &str) -> Self {
        DeploymentKey {
            namespace: reference.namespace_or(default_namespace).to_string(),
            name: reference.name.clone(),
        }
    }
}

impl std::fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read/patch access to Deployments
///
/// Production code uses `KubeDeploymentClient`; tests use an in-memory store.
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    async fn get(&self, key: &DeploymentKey) -> Result<Option<Deployment>, kube::Error>;

    async fn patch(
        &self,
        key: &DeploymentKey,
        params: &PatchParams,
        patch: &Value,
    ) -> Result<Deployment, kube::Error>;
}

pub struct KubeDeploymentClient {
    client: kube::Client,
}

impl KubeDeploymentClient {
    pub fn new(client: kube::Client) -> Self {
        KubeDeploymentClient { client }
    }
}

#[async_trait]
impl DeploymentClient for KubeDeploymentClient {
    async fn get(&self, key: &DeploymentKey) -> Result<Option<Deployment>, kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name).await
    }

    async fn patch(
        &self,
        key: &DeploymentKey,
        params: &PatchParams,
        patch: &Value,
    ) -> Result<Deployment, kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        api.patch(&key.name, params, &Patch::Merge(patch)).await
    }
}

/// Drives a single Deployment through the rollout
pub struct DeploymentDriver {
    base: WorkloadController,
    client: std::sync::Arc<dyn DeploymentClient>,
    source: DeploymentKey,
    target: DeploymentKey,
}

impl DeploymentDriver {
    pub fn new(
        base: WorkloadController,
        client: std::sync::Arc<dyn DeploymentClient>,
        source: DeploymentKey,
        target: DeploymentKey,
    ) -> Self {
        DeploymentDriver {
            base,
            client,
            source,
            target,
        }
    }

    fn key_of(&self, deploy: &Deployment) -> DeploymentKey {
        DeploymentKey {
            namespace: deploy
                .namespace()
                .unwrap_or_else(|| self.target.namespace.clone()),
            name: deploy.name_any(),
        }
    }

    /// Send the diff between `base` and `desired`, pinned to the base's version
    async fn patch_from(
        &self,
        base: &Deployment,
        desired: &Deployment,
    ) -> Result<Deployment, DriverError> {
        let patch = merge_patch_from(base, desired, base.metadata.resource_version.as_deref())
            .map_err(|e| DriverError::SerializationError(e.to_string()))?;

        Ok(self
            .client
            .patch(&self.key_of(base), &self.base.patch_params(), &patch)
            .await?)
    }
}

fn is_paused(deploy: &Deployment) -> bool {
    deploy
        .spec
        .as_ref()
        .and_then(|s| s.paused)
        .unwrap_or(false)
}

#[async_trait]
impl WorkloadDriver for DeploymentDriver {
    type Workload = Deployment;

    fn kind(&self) -> &'static str {
        "Deployment"
    }

    async fn verify_spec(&self) -> Result<bool, DriverError> {
        let source = match self.client.get(&self.source).await? {
            Some(deploy) => deploy,
            None => {
                debug!(deployment = %self.source, "Source deployment not found yet");
                return Ok(false);
            }
        };

        if !is_paused(&source) {
            return Err(DriverError::Precondition(format!(
                "the source workload {} is still being reconciled, need to be paused",
                source.name_any()
            )));
        }

        Ok(true)
    }

    async fn fetch_target(&self) -> Result<Option<Deployment>, DriverError> {
        Ok(self.client.get(&self.target).await?)
    }

    fn observe(&self, deploy: &Deployment) -> ObservedReplicas {
        let desired = deploy
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let status = deploy.status.as_ref();
        let observed_generation = status.and_then(|s| s.observed_generation);

        ObservedReplicas {
            desired,
            updated: status.and_then(|s| s.updated_replicas).unwrap_or(0),
            ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
            stale: match (deploy.metadata.generation, observed_generation) {
                (Some(generation), Some(observed)) => observed < generation,
                (Some(_), None) => true,
                _ => false,
            },
        }
    }

    async fn claim_ownership(
        &self,
        deploy: &Deployment,
        initial_size: Option<i32>,
    ) -> Result<bool, DriverError> {
        if self.base.controls(&deploy.metadata) {
            debug!(deployment = %deploy.name_any(), "Deployment already claimed");
            return Ok(true);
        }

        if let Some(other) = super::controller_of(&deploy.metadata) {
            let message = format!(
                "the target workload {} is controlled by {} {}, cannot claim it",
                deploy.name_any(),
                other.kind,
                other.name
            );
            self.base
                .record(RolloutEvent::warning("ClaimFailed", "Claim", message.clone()))
                .await;
            return Err(DriverError::Precondition(message));
        }

        let mut desired = deploy.clone();
        desired.metadata.owner_references =
            Some(self.base.claimed_owner_references(&deploy.metadata));
        let spec = desired.spec.get_or_insert_with(Default::default);
        spec.paused = Some(false);
        if let Some(size) = initial_size {
            spec.replicas = Some(size);
        }

        if let Err(e) = self.patch_from(deploy, &desired).await {
            error!(
                error = %e,
                deployment = %deploy.name_any(),
                "Failed to start the Deployment update"
            );
            self.base
                .record(RolloutEvent::warning(
                    "ClaimFailed",
                    "Claim",
                    format!("Failed to start the Deployment update: {}", e),
                ))
                .await;
            return Err(e);
        }

        info!(
            deployment = %deploy.name_any(),
            initial_size = ?initial_size,
            "Claimed deployment"
        );
        Ok(false)
    }

    async fn scale(&self, deploy: &Deployment, target_replicas: i32) -> Result<(), DriverError> {
        let mut desired = deploy.clone();
        desired.spec.get_or_insert_with(Default::default).replicas = Some(target_replicas);

        if let Err(e) = self.patch_from(deploy, &desired).await {
            error!(
                error = %e,
                deployment = %deploy.name_any(),
                target = target_replicas,
                "Failed to scale deployment"
            );
            self.base
                .record(RolloutEvent::warning(
                    "ScaleFailed",
                    "Scale",
                    format!(
                        "Failed to update the deployment {} to the correct target {}: {}",
                        deploy.name_any(),
                        target_replicas,
                        e
                    ),
                ))
                .await;
            return Err(e);
        }

        info!(
            deployment = %deploy.name_any(),
            target_replicas = target_replicas,
            batch = self.base.current_batch,
            "Submitted upgrade request for deployment"
        );
        Ok(())
    }

    fn held_by_owner(&self, deploy: &Deployment) -> bool {
        self.base.held(&deploy.metadata)
    }

    async fn finalize(&self, deploy: &Deployment) -> Result<(), DriverError> {
        let owned = deploy
            .metadata
            .owner_references
            .iter()
            .flatten()
            .any(|r| self.base.is_owner_kind(r));
        if !owned {
            debug!(deployment = %deploy.name_any(), "Deployment already released");
            return Ok(());
        }

        let mut desired = deploy.clone();
        desired.metadata.owner_references =
            self.base.released_owner_references(&deploy.metadata);

        self.patch_from(deploy, &desired).await?;

        info!(
            deployment = %deploy.name_any(),
            replicas = ?deploy.spec.as_ref().and_then(|s| s.replicas),
            "Released deployment"
        );
        Ok(())
    }
}

/// In-memory Deployment store for testing
///
/// Applies merge patches the way the API server does: it honors the
/// `metadata.resourceVersion` precondition (409 on mismatch), bumps the
/// resource version on every write and the generation on every spec change.
#[cfg(test)]
#[derive(Default)]
pub struct MockDeploymentClient {
    deployments: std::sync::Mutex<std::collections::HashMap<String, Deployment>>,
    patches: std::sync::Mutex<Vec<Value>>,
    failing_patches: std::sync::Mutex<usize>,
    concurrent_write: std::sync::atomic::AtomicBool,
    version: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
impl MockDeploymentClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn id(namespace: &str, name: &str) -> String {
        format!("{}/{}", namespace, name)
    }

    fn next_version(&self) -> String {
        (self
            .version
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1)
        .to_string()
    }

    /// Store a Deployment as-is, stamping a fresh resource version
    pub fn insert(&self, mut deploy: Deployment) {
        deploy.metadata.resource_version = Some(self.next_version());
        let id = Self::id(
            deploy.metadata.namespace.as_deref().unwrap_or("default"),
            &deploy.name_any(),
        );
        self.deployments.lock().unwrap().insert(id, deploy);
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.deployments
            .lock()
            .unwrap()
            .get(&Self::id(namespace, name))
            .cloned()
    }

    /// Simulate the Deployment controller catching up: observedGeneration
    /// follows generation and the given replica counts are reported
    pub fn set_status(&self, namespace: &str, name: &str, updated: i32, ready: i32) {
        let mut deploy = self.stored(namespace, name).expect("deployment exists");
        let status = deploy.status.get_or_insert_with(Default::default);
        status.observed_generation = deploy.metadata.generation;
        status.updated_replicas = Some(updated);
        status.ready_replicas = Some(ready);
        self.insert(deploy);
    }

    /// Make the next `count` patches fail with a 500
    pub fn fail_next_patches(&self, count: usize) {
        *self.failing_patches.lock().unwrap() = count;
    }

    /// Another writer touches the object just before the next patch lands
    pub fn write_concurrently_before_next_patch(&self) {
        self.concurrent_write
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn patches(&self) -> Vec<Value> {
        self.patches.lock().unwrap().clone()
    }

    pub fn patch_count(&self) -> usize {
        self.patches.lock().unwrap().len()
    }
}

#[cfg(test)]
fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used, clippy::expect_used)]
impl DeploymentClient for MockDeploymentClient {
    async fn get(&self, key: &DeploymentKey) -> Result<Option<Deployment>, kube::Error> {
        Ok(self.stored(&key.namespace, &key.name))
    }

    async fn patch(
        &self,
        key: &DeploymentKey,
        _params: &PatchParams,
        patch: &Value,
    ) -> Result<Deployment, kube::Error> {
        {
            let mut failing = self.failing_patches.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(api_error(
                    500,
                    "InternalError",
                    "injected patch failure".to_string(),
                ));
            }
        }

        if self
            .concurrent_write
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            if let Some(deploy) = self.stored(&key.namespace, &key.name) {
                self.insert(deploy);
            }
        }

        let current = self
            .stored(&key.namespace, &key.name)
            .ok_or_else(|| api_error(404, "NotFound", format!("deployment {} not found", key)))?;

        let expected = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str);
        if let Some(expected) = expected {
            if Some(expected) != current.metadata.resource_version.as_deref() {
                return Err(api_error(
                    409,
                    "Conflict",
                    format!("the object {} has been modified", key),
                ));
            }
        }

        self.patches.lock().unwrap().push(patch.clone());

        let mut value = serde_json::to_value(&current).unwrap();
        // Same RFC 7386 semantics the API server applies
        json_patch::merge(&mut value, patch);
        let mut updated: Deployment = serde_json::from_value(value).unwrap();
        if updated.spec != current.spec {
            updated.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
        }
        self.insert(updated);

        Ok(self.stored(&key.namespace, &key.name).expect("just stored"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "deployment_test.rs"]
mod tests;
