use crate::controller::clock::parse_timestamp;
use crate::controller::events::RolloutEvent;
use crate::controller::workload::{DriverError, ObservedReplicas};
use crate::crd::rollout::{RollingState, RolloutCondition, RolloutStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Condition type maintained on every Rollout
pub const PROGRESSING: &str = "Progressing";

/// Condition reasons
pub mod reason {
    pub const SOURCE_NOT_FOUND: &str = "SourceNotFound";
    pub const SOURCE_NOT_PAUSED: &str = "SourceNotPaused";
    pub const TARGET_NOT_FOUND: &str = "TargetNotFound";
    pub const PRECONDITION_FAILED: &str = "PreconditionFailed";
    pub const API_ERROR: &str = "ApiError";
    pub const INVALID_PLAN: &str = "InvalidPlan";
    pub const INITIALIZING: &str = "Initializing";
    pub const ROLLING: &str = "Rolling";
    pub const BATCH_VERIFYING: &str = "BatchVerifying";
    pub const PARTITION_HOLD: &str = "PartitionHold";
    pub const PAUSED: &str = "Paused";
    pub const FINALIZING: &str = "Finalizing";
    pub const BATCH_TIMEOUT: &str = "BatchReadyTimeout";
    pub const SUCCEEDED: &str = "RolloutSucceeded";
}

/// Upsert the Progressing condition
///
/// `lastTransitionTime` only moves when the condition's status flips, so a
/// rollout holding in the same place does not produce a new status write
/// every tick.
pub fn set_progressing(
    status: &mut RolloutStatus,
    progressing: bool,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let value = if progressing { "True" } else { "False" };
    let message = Some(message.into());

    match status.conditions.iter_mut().find(|c| c.type_ == PROGRESSING) {
        Some(condition) => {
            if condition.status != value {
                condition.status = value.to_string();
                condition.last_transition_time = now.to_rfc3339();
            }
            condition.reason = reason.to_string();
            condition.message = message;
        }
        None => status.conditions.push(RolloutCondition {
            type_: PROGRESSING.to_string(),
            status: value.to_string(),
            reason: reason.to_string(),
            message,
            last_transition_time: now.to_rfc3339(),
        }),
    }
}

/// The Progressing condition, if set
pub fn progressing_condition(status: &RolloutStatus) -> Option<&RolloutCondition> {
    status.conditions.iter().find(|c| c.type_ == PROGRESSING)
}

/// Copy live workload counts into the status
pub fn record_counts(status: &mut RolloutStatus, observed: &ObservedReplicas) {
    status.upgraded_replicas = observed.updated;
    status.ready_replicas = observed.ready;
}

/// Surface a driver error: `lastError` plus a non-progressing condition
pub fn record_driver_error(status: &mut RolloutStatus, err: &DriverError, now: DateTime<Utc>) {
    let reason = match err {
        DriverError::Precondition(_) if status.rolling_state == RollingState::Verifying => {
            reason::SOURCE_NOT_PAUSED
        }
        DriverError::Precondition(_) => reason::PRECONDITION_FAILED,
        _ => reason::API_ERROR,
    };
    status.last_error = Some(err.to_string());
    set_progressing(status, false, reason, err.to_string(), now);
}

/// Move the rollout to the terminal Failed state
pub fn mark_failed(status: &mut RolloutStatus, reason: &str, message: String, now: DateTime<Utc>) {
    status.rolling_state = RollingState::Failed;
    status.batch_started_at = None;
    status.last_error = Some(message.clone());
    set_progressing(status, false, reason, message, now);
}

/// Whether anything but `lastUpdateTime` differs
pub fn status_changed(current: Option<&RolloutStatus>, desired: &RolloutStatus) -> bool {
    match current {
        None => true,
        Some(current) => {
            let mut current = current.clone();
            current.last_update_time = desired.last_update_time.clone();
            &current != desired
        }
    }
}

/// Events describing the transition from `old` to `new`
///
/// Emitted after the new status is persisted, so a replayed tick that
/// produces no status change produces no duplicate events.
pub fn transition_events(old: Option<&RolloutStatus>, new: &RolloutStatus) -> Vec<RolloutEvent> {
    let old_state = old.map(|s| s.rolling_state).unwrap_or_default();
    let old_batch = old.map(|s| s.current_batch).unwrap_or(0);
    let mut events = Vec::new();

    if new.current_batch > old_batch {
        events.push(RolloutEvent::normal(
            "BatchAdvanced",
            "Rollout",
            format!(
                "Batch {} is ready, advancing to batch {}",
                old_batch, new.current_batch
            ),
        ));
    }

    if new.rolling_state != old_state {
        match new.rolling_state {
            RollingState::Succeeded => events.push(RolloutEvent::normal(
                "RolloutSucceeded",
                "Rollout",
                format!(
                    "Rollout completed with {} ready replicas",
                    new.ready_replicas
                ),
            )),
            RollingState::Failed => events.push(RolloutEvent::warning(
                "RolloutFailed",
                "Rollout",
                new.last_error
                    .clone()
                    .unwrap_or_else(|| "Rollout failed".to_string()),
            )),
            _ => {}
        }
    }

    events
}

/// Requeue interval after a successful tick
///
/// Owned Deployments are watched, so workload status changes trigger a tick
/// on their own; the requeue is the fallback poll. While a batch is being
/// verified the poll is pulled in to land right after the wait expires.
pub fn requeue_interval(
    status: &RolloutStatus,
    batch_timeout: Duration,
    paused: bool,
    now: DateTime<Utc>,
) -> Duration {
    const MIN_REQUEUE: Duration = Duration::from_secs(5);
    const MAX_REQUEUE: Duration = Duration::from_secs(300);
    const ACTIVE_REQUEUE: Duration = Duration::from_secs(10);
    const IDLE_REQUEUE: Duration = Duration::from_secs(30);

    if status.rolling_state.is_terminal() {
        return MAX_REQUEUE;
    }
    if paused {
        return IDLE_REQUEUE;
    }

    match status.rolling_state {
        RollingState::BatchVerifying => {
            let started = status.batch_started_at.as_deref().and_then(parse_timestamp);
            match started {
                Some(started) => {
                    let elapsed = now.signed_duration_since(started).num_seconds().max(0) as u64;
                    let remaining = batch_timeout.as_secs().saturating_sub(elapsed) + 1;
                    Duration::from_secs(remaining).clamp(MIN_REQUEUE, IDLE_REQUEUE)
                }
                None => MIN_REQUEUE,
            }
        }
        RollingState::Initializing | RollingState::Rolling | RollingState::Finalizing => {
            MIN_REQUEUE
        }
        _ => ACTIVE_REQUEUE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        parse_timestamp("2026-10-19T12:00:00Z").unwrap()
    }

    #[test]
    fn test_set_progressing_keeps_transition_time_without_flip() {
        let mut status = RolloutStatus::default();
        set_progressing(&mut status, true, reason::ROLLING, "batch 0", now());
        let later = now() + chrono::Duration::seconds(30);

        set_progressing(&mut status, true, reason::BATCH_VERIFYING, "batch 0", later);

        let condition = progressing_condition(&status).unwrap();
        assert_eq!(condition.reason, reason::BATCH_VERIFYING);
        assert_eq!(condition.last_transition_time, now().to_rfc3339());

        set_progressing(&mut status, false, reason::PAUSED, "paused", later);
        let condition = progressing_condition(&status).unwrap();
        assert_eq!(condition.status, "False");
        assert_eq!(condition.last_transition_time, later.to_rfc3339());
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn test_status_changed_ignores_update_time() {
        let current = RolloutStatus {
            last_update_time: Some("2026-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        let mut desired = current.clone();
        desired.last_update_time = Some(now().to_rfc3339());
        assert!(!status_changed(Some(&current), &desired));

        desired.ready_replicas = 2;
        assert!(status_changed(Some(&current), &desired));
        assert!(status_changed(None, &desired));
    }

    #[test]
    fn test_record_driver_error_classifies_reason() {
        let mut status = RolloutStatus::default();
        let err = DriverError::Precondition("not paused".to_string());
        record_driver_error(&mut status, &err, now());
        assert_eq!(status.last_error.as_deref(), Some("not paused"));
        assert_eq!(
            progressing_condition(&status).unwrap().reason,
            reason::SOURCE_NOT_PAUSED
        );

        status.rolling_state = RollingState::Initializing;
        record_driver_error(&mut status, &err, now());
        assert_eq!(
            progressing_condition(&status).unwrap().reason,
            reason::PRECONDITION_FAILED
        );
    }

    #[test]
    fn test_transition_events() {
        let old = RolloutStatus {
            rolling_state: RollingState::BatchVerifying,
            current_batch: 0,
            ..Default::default()
        };
        let advanced = RolloutStatus {
            rolling_state: RollingState::Rolling,
            current_batch: 1,
            ..Default::default()
        };
        let events = transition_events(Some(&old), &advanced);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "BatchAdvanced");

        let failed = RolloutStatus {
            rolling_state: RollingState::Failed,
            last_error: Some("timed out".to_string()),
            ..old.clone()
        };
        let events = transition_events(Some(&old), &failed);
        assert_eq!(events[0].reason, "RolloutFailed");
        assert_eq!(events[0].note, "timed out");

        // Replaying an identical status emits nothing
        assert!(transition_events(Some(&failed), &failed).is_empty());
    }

    #[test]
    fn test_requeue_interval_tracks_batch_deadline() {
        let timeout = Duration::from_secs(600);
        let status = RolloutStatus {
            rolling_state: RollingState::BatchVerifying,
            batch_started_at: Some((now() - chrono::Duration::seconds(597)).to_rfc3339()),
            ..Default::default()
        };
        assert_eq!(
            requeue_interval(&status, timeout, false, now()),
            Duration::from_secs(5)
        );

        let status = RolloutStatus {
            batch_started_at: Some(now().to_rfc3339()),
            ..status
        };
        assert_eq!(
            requeue_interval(&status, timeout, false, now()),
            Duration::from_secs(30)
        );
        assert_eq!(
            requeue_interval(&status, timeout, true, now()),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_requeue_interval_terminal_is_slow() {
        let status = RolloutStatus {
            rolling_state: RollingState::Succeeded,
            ..Default::default()
        };
        assert_eq!(
            requeue_interval(&status, Duration::from_secs(600), false, now()),
            Duration::from_secs(300)
        );
    }
}
