#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use kube::CustomResourceExt;

const ROLLOUT_YAML: &str = r#"
apiVersion: stride.dev/v1alpha1
kind: Rollout
metadata:
  name: web-rollout
  namespace: shop
spec:
  targetRef:
    apiVersion: apps/v1
    kind: Deployment
    name: web
  rolloutPlan:
    targetSize: 7
    batchPartition: 1
    batchReadyTimeoutSeconds: 120
    rolloutBatches:
    - replicas: 10%
    - replicas: 3
    - replicas: 100%
"#;

#[test]
fn test_rollout_deserialize_from_yaml() {
    let rollout: Rollout = serde_yaml::from_str(ROLLOUT_YAML).expect("Failed to deserialize Rollout");

    assert_eq!(rollout.metadata.name.as_deref(), Some("web-rollout"));
    assert_eq!(rollout.spec.target_ref.kind, "Deployment");
    assert_eq!(rollout.spec.target_ref.api_version, "apps/v1");
    assert!(rollout.spec.source_ref.is_none());

    let plan = &rollout.spec.rollout_plan;
    assert_eq!(plan.target_size, Some(7));
    assert_eq!(plan.batch_partition, Some(1));
    assert_eq!(plan.batch_ready_timeout_seconds, Some(120));
    assert!(!plan.paused);
    assert_eq!(plan.rollout_batches.len(), 3);
    assert_eq!(
        plan.rollout_batches[0].replicas,
        IntOrString::String("10%".to_string())
    );
    assert_eq!(plan.rollout_batches[1].replicas, IntOrString::Int(3));
}

#[test]
fn test_source_ref_defaults_to_target_ref() {
    let rollout: Rollout = serde_yaml::from_str(ROLLOUT_YAML).unwrap();
    assert_eq!(rollout.spec.effective_source_ref(), &rollout.spec.target_ref);
}

#[test]
fn test_explicit_source_ref_is_kept_distinct() {
    let yaml = r#"
apiVersion: stride.dev/v1alpha1
kind: Rollout
metadata:
  name: bg-rollout
spec:
  sourceRef:
    apiVersion: apps/v1
    kind: Deployment
    name: web-blue
    namespace: other
  targetRef:
    apiVersion: apps/v1
    kind: Deployment
    name: web-green
  rolloutPlan:
    rolloutBatches:
    - replicas: 100%
"#;
    let rollout: Rollout = serde_yaml::from_str(yaml).unwrap();

    let source = rollout.spec.effective_source_ref();
    assert_eq!(source.name, "web-blue");
    assert_eq!(source.namespace_or("default"), "other");
    assert_eq!(rollout.spec.target_ref.namespace_or("default"), "default");
}

#[test]
fn test_status_defaults_to_verifying() {
    let status: RolloutStatus = serde_json::from_str("{}").unwrap();

    assert_eq!(status.rolling_state, RollingState::Verifying);
    assert_eq!(status.current_batch, 0);
    assert!(status.last_error.is_none());
    assert!(status.conditions.is_empty());
}

#[test]
fn test_status_serializes_cleared_fields_as_null() {
    // A merge patch of the whole status must remove a previously set lastError
    let status = RolloutStatus::default();
    let json = serde_json::to_value(&status).unwrap();

    assert!(json.get("lastError").unwrap().is_null());
    assert!(json.get("batchStartedAt").unwrap().is_null());
    assert_eq!(json["rollingState"], "Verifying");
}

#[test]
fn test_rolling_state_terminal_and_ownership() {
    assert!(RollingState::Succeeded.is_terminal());
    assert!(RollingState::Failed.is_terminal());
    assert!(!RollingState::BatchVerifying.is_terminal());

    assert!(RollingState::Rolling.owns_workload());
    assert!(!RollingState::Verifying.owns_workload());
    assert!(!RollingState::Succeeded.owns_workload());
}

#[test]
fn test_crd_has_status_subresource_and_group() {
    let crd = Rollout::crd();

    assert_eq!(crd.spec.group, "stride.dev");
    assert_eq!(crd.spec.names.kind, "Rollout");
    assert_eq!(crd.spec.versions.len(), 1);

    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1alpha1");
    assert!(version
        .subresources
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .is_some());
}
