//! Tests for the validating admission webhook

use super::{admit_rollout, review_rollout};
use crate::crd::rollout::Rollout;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde_json::{json, Value};

fn rollout(batches: Value, state: Option<&str>) -> Value {
    let mut object = json!({
        "apiVersion": "stride.dev/v1alpha1",
        "kind": "Rollout",
        "metadata": {
            "name": "web",
            "namespace": "default"
        },
        "spec": {
            "targetRef": {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "name": "web"
            },
            "rolloutPlan": {
                "rolloutBatches": batches
            }
        }
    });
    if let Some(state) = state {
        object["status"] = json!({ "rollingState": state, "currentBatch": 1 });
    }
    object
}

/// AdmissionReview as the API server sends it
fn review_payload(operation: &str, object: Option<Value>, old_object: Option<Value>) -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "stride.dev", "version": "v1alpha1", "kind": "Rollout"},
            "resource": {"group": "stride.dev", "version": "v1alpha1", "resource": "rollouts"},
            "operation": operation,
            "name": "web",
            "namespace": "default",
            "userInfo": {"username": "admin"},
            "object": object,
            "oldObject": old_object,
            "dryRun": false
        }
    })
}

fn admit(operation: &str, object: Option<Value>, old_object: Option<Value>) -> AdmissionResponse {
    let review: AdmissionReview<Rollout> =
        serde_json::from_value(review_payload(operation, object, old_object)).unwrap();
    let request: AdmissionRequest<Rollout> = review.try_into().unwrap();
    admit_rollout(&request)
}

#[test]
fn test_create_valid_rollout_is_allowed() {
    let object = rollout(json!([{"replicas": "20%"}, {"replicas": "100%"}]), None);

    let response = admit("CREATE", Some(object), None);

    assert!(response.allowed);
    assert_eq!(response.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
}

#[test]
fn test_create_with_empty_plan_is_denied() {
    let object = rollout(json!([]), None);

    let response = admit("CREATE", Some(object), None);

    assert!(!response.allowed);
    assert!(
        response.result.message.contains("at least one batch"),
        "{}",
        response.result.message
    );
}

#[test]
fn test_create_with_malformed_percentage_is_denied() {
    let object = rollout(json!([{"replicas": "150%"}, {"replicas": "100%"}]), None);

    let response = admit("CREATE", Some(object), None);

    assert!(!response.allowed);
    assert!(response.result.message.contains("150%"));
}

#[test]
fn test_update_changing_plan_in_flight_is_denied() {
    let old = rollout(json!([{"replicas": "20%"}, {"replicas": "100%"}]), Some("BatchVerifying"));
    let new = rollout(json!([{"replicas": "50%"}, {"replicas": "100%"}]), Some("BatchVerifying"));

    let response = admit("UPDATE", Some(new), Some(old));

    assert!(!response.allowed);
    assert!(response
        .result
        .message
        .contains("cannot change while the rollout is BatchVerifying"));
}

#[test]
fn test_update_raising_partition_in_flight_is_allowed() {
    let old = rollout(json!([{"replicas": "20%"}, {"replicas": "100%"}]), Some("Rolling"));
    let mut new = old.clone();
    new["spec"]["rolloutPlan"]["batchPartition"] = json!(1);

    let response = admit("UPDATE", Some(new), Some(old));

    assert!(response.allowed);
}

#[test]
fn test_update_after_success_is_allowed() {
    let old = rollout(json!([{"replicas": "20%"}, {"replicas": "100%"}]), Some("Succeeded"));
    let new = rollout(json!([{"replicas": 1}, {"replicas": "100%"}]), Some("Succeeded"));

    let response = admit("UPDATE", Some(new), Some(old));

    assert!(response.allowed);
}

#[test]
fn test_delete_is_always_allowed() {
    let old = rollout(json!([]), Some("Rolling"));

    let response = admit("DELETE", None, Some(old));

    assert!(response.allowed);
}

#[test]
fn test_review_reply_echoes_uid_and_verdict() {
    let payload = review_payload("CREATE", Some(rollout(json!([]), None)), None);
    let review: AdmissionReview<Rollout> = serde_json::from_value(payload).unwrap();

    let reply = serde_json::to_value(review_rollout(review)).unwrap();

    assert_eq!(reply["apiVersion"], "admission.k8s.io/v1");
    assert_eq!(reply["kind"], "AdmissionReview");
    assert_eq!(reply["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
    assert_eq!(reply["response"]["allowed"], false);
}

#[test]
fn test_review_without_request_is_answered_invalid() {
    let review: AdmissionReview<Rollout> = serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview"
    }))
    .unwrap();

    let reply = review_rollout(review);

    let response = reply.response.unwrap();
    assert!(!response.allowed);
}
