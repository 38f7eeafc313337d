//! Validating admission webhook for Rollout resources
//!
//! Rejects Rollouts whose plan can never run, and edits that would change a
//! plan the controller is already executing.
//!
//! ## Endpoints
//! - POST /validate - Kubernetes AdmissionReview (admission.k8s.io/v1)
//!
//! ## Rules
//! - CREATE / UPDATE: the new object must pass `validate_rollout`
//! - UPDATE while in flight: targets and batch plan are frozen, `paused` and
//!   `batchPartition` stay editable
//! - DELETE and CONNECT are always allowed

use axum::{http::StatusCode, response::IntoResponse, Json};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use tracing::{info, warn};

use crate::controller::rollout::{validate_rollout, validate_rollout_update};
use crate::crd::rollout::Rollout;

/// Decide one admission request for a Rollout
pub fn admit_rollout(request: &AdmissionRequest<Rollout>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    let verdict = match (&request.operation, &request.object, &request.old_object) {
        (Operation::Create, Some(rollout), _) => validate_rollout(rollout),
        (Operation::Update, Some(rollout), Some(previous)) => {
            validate_rollout_update(previous, rollout)
        }
        (Operation::Update, Some(rollout), None) => validate_rollout(rollout),
        (Operation::Create | Operation::Update, None, _) => Err(format!(
            "{:?} request for {} carries no object",
            request.operation, request.name
        )),
        (Operation::Delete | Operation::Connect, _, _) => Ok(()),
    };

    match verdict {
        Ok(()) => {
            info!(
                uid = %request.uid,
                operation = ?request.operation,
                rollout = %request.name,
                namespace = ?request.namespace,
                "Admitted Rollout"
            );
            response
        }
        Err(message) => {
            warn!(
                uid = %request.uid,
                operation = ?request.operation,
                rollout = %request.name,
                namespace = ?request.namespace,
                reason = %message,
                "Rejected Rollout"
            );
            response.deny(message)
        }
    }
}

/// Answer a full AdmissionReview
///
/// A review without a request is answered as invalid rather than dropped, so
/// the API server always gets a well-formed reply.
pub fn review_rollout(review: AdmissionReview<Rollout>) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<Rollout> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Invalid AdmissionReview");
            return AdmissionResponse::invalid(e.to_string()).into_review();
        }
    };

    admit_rollout(&request).into_review()
}

/// Axum handler for the /validate endpoint
pub async fn handle_validate(Json(review): Json<AdmissionReview<Rollout>>) -> impl IntoResponse {
    (StatusCode::OK, Json(review_rollout(review)))
}

#[cfg(test)]
#[path = "webhook_test.rs"]
mod tests;
