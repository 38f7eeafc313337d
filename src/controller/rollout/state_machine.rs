//! One reconciliation pass of the rollout engine
//!
//! `RolloutStateMachine::tick` reads the persisted status, decides the next
//! step, invokes the workload driver, and returns the status to persist. It
//! holds no state between ticks: everything it needs is re-derived from the
//! status, the plan, and the live workload, so a tick that crashes before its
//! status is persisted is simply replayed.

use super::status::{
    mark_failed, reason, record_counts, record_driver_error, set_progressing,
};
use crate::controller::clock::parse_timestamp;
use crate::controller::planner;
use crate::controller::workload::{DriverError, ObservedReplicas, WorkloadDriver};
use crate::crd::rollout::{RollingState, RolloutPlan, RolloutStatus};
use crate::server::SharedMetrics;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one tick
#[derive(Debug)]
pub struct TickOutcome {
    /// Status to persist
    pub status: RolloutStatus,
    /// Transient failure to report to the scheduler after persisting
    pub error: Option<DriverError>,
}

pub struct RolloutStateMachine<'a, D: WorkloadDriver> {
    pub name: &'a str,
    pub driver: &'a D,
    pub plan: &'a RolloutPlan,
    /// Rollout generation the tick runs against
    pub generation: Option<i64>,
    /// Bounded wait of BatchVerifying
    pub batch_timeout: Duration,
    pub now: DateTime<Utc>,
    pub metrics: Option<&'a SharedMetrics>,
}

impl<D: WorkloadDriver> RolloutStateMachine<'_, D> {
    pub async fn tick(&self, current: Option<&RolloutStatus>) -> TickOutcome {
        let mut status = current.cloned().unwrap_or_default();

        if status.rolling_state == RollingState::Failed
            && self.generation.is_some()
            && status.observed_generation != self.generation
        {
            info!(
                rollout = ?self.name,
                observed_generation = ?status.observed_generation,
                generation = ?self.generation,
                "Rollout spec changed after failure, restarting from verification"
            );
            // The total was resolved before any scaling; the live size may
            // now be a partial batch
            status = RolloutStatus {
                rollout_target_size: self.plan.target_size.or(status.rollout_target_size),
                conditions: status.conditions,
                ..Default::default()
            };
        }
        status.observed_generation = self.generation;

        let result = if self.plan.paused && !status.rolling_state.is_terminal() {
            self.hold_paused(&mut status).await
        } else {
            match status.rolling_state {
                RollingState::Verifying => self.verify(&mut status).await,
                RollingState::Initializing => self.initialize(&mut status).await,
                RollingState::Rolling => self.roll(&mut status).await,
                RollingState::BatchVerifying => self.verify_batch(&mut status).await,
                RollingState::Finalizing => self.finalize(&mut status).await,
                RollingState::Succeeded | RollingState::Failed => {
                    self.refresh_counts(&mut status).await
                }
            }
        };

        let error = match result {
            Ok(()) => None,
            Err(err) => {
                record_driver_error(&mut status, &err, self.now);
                if err.is_conflict() {
                    info!(
                        rollout = ?self.name,
                        state = %status.rolling_state,
                        error = %err,
                        "Workload changed concurrently, will retry on fresh state"
                    );
                    Some(err)
                } else if err.is_transient() {
                    warn!(
                        rollout = ?self.name,
                        state = %status.rolling_state,
                        error = %err,
                        "Rollout step failed, will retry"
                    );
                    Some(err)
                } else {
                    info!(
                        rollout = ?self.name,
                        state = %status.rolling_state,
                        error = %err,
                        "Rollout blocked on precondition"
                    );
                    None
                }
            }
        };

        TickOutcome { status, error }
    }

    async fn verify(&self, status: &mut RolloutStatus) -> Result<(), DriverError> {
        // Only a restarted rollout reaches Verifying with the workload held
        if let Some(workload) = self.driver.fetch_target().await? {
            if self.driver.held_by_owner(&workload) {
                let observed = self.driver.observe(&workload);
                record_counts(status, &observed);
                self.resume(status, &observed);
                return Ok(());
            }
        }

        if !self.driver.verify_spec().await? {
            status.last_error = None;
            set_progressing(
                status,
                false,
                reason::SOURCE_NOT_FOUND,
                format!("Waiting for the source {} to exist", self.driver.kind()),
                self.now,
            );
            return Ok(());
        }

        let Some((_, observed)) = self.live_target(status).await? else {
            return Ok(());
        };

        let total = self
            .plan
            .target_size
            .or(status.rollout_target_size)
            .unwrap_or(observed.desired);
        if let Err(e) = planner::plan(&self.plan.rollout_batches, total) {
            warn!(rollout = ?self.name, error = %e, total = total, "Rollout plan rejected");
            mark_failed(status, reason::INVALID_PLAN, e.to_string(), self.now);
            return Ok(());
        }

        status.rollout_target_size = Some(total);
        status.current_batch = 0;
        status.batch_started_at = None;
        status.last_error = None;
        status.rolling_state = RollingState::Initializing;
        set_progressing(
            status,
            true,
            reason::INITIALIZING,
            format!(
                "Source verified, rolling {} replicas in {} batches",
                total,
                self.plan.rollout_batches.len()
            ),
            self.now,
        );
        info!(rollout = ?self.name, total = total, "Source workload verified");
        Ok(())
    }

    /// Pick up a workload this rollout already holds
    ///
    /// The workload stays unpaused and keeps its size. Rolling restarts at the
    /// first batch whose target is not below the live size, so nothing is
    /// scaled down.
    fn resume(&self, status: &mut RolloutStatus, observed: &ObservedReplicas) {
        let total = self
            .plan
            .target_size
            .or(status.rollout_target_size)
            .unwrap_or(observed.desired);
        let targets = match planner::plan(&self.plan.rollout_batches, total) {
            Ok(targets) => targets,
            Err(e) => {
                warn!(rollout = ?self.name, error = %e, total = total, "Rollout plan rejected");
                mark_failed(status, reason::INVALID_PLAN, e.to_string(), self.now);
                return;
            }
        };
        let batch = targets
            .iter()
            .position(|target| *target >= observed.desired)
            .unwrap_or(targets.len().saturating_sub(1));

        status.rollout_target_size = Some(total);
        status.current_batch = batch as i32;
        status.batch_started_at = None;
        status.last_error = None;
        status.rolling_state = RollingState::Rolling;
        set_progressing(
            status,
            true,
            reason::ROLLING,
            format!(
                "Resuming the held {} at batch {} of {} replicas",
                self.driver.kind(),
                batch,
                total
            ),
            self.now,
        );
        info!(
            rollout = ?self.name,
            batch = batch,
            total = total,
            live_replicas = observed.desired,
            "Resuming rollout of held workload"
        );
    }

    async fn initialize(&self, status: &mut RolloutStatus) -> Result<(), DriverError> {
        let Some(targets) = self.targets(status) else {
            return Ok(());
        };
        let Some(first) = targets.first().copied() else {
            mark_failed(
                status,
                reason::INVALID_PLAN,
                "rollout plan has no batches".to_string(),
                self.now,
            );
            return Ok(());
        };
        let Some((workload, _)) = self.live_target(status).await? else {
            return Ok(());
        };

        let already_owned = self.driver.claim_ownership(&workload, Some(first)).await?;

        status.rolling_state = RollingState::Rolling;
        status.current_batch = 0;
        status.last_error = None;
        set_progressing(
            status,
            true,
            reason::ROLLING,
            format!("Rolling batch 0 to {} replicas", first),
            self.now,
        );
        info!(
            rollout = ?self.name,
            kind = self.driver.kind(),
            already_owned = already_owned,
            initial_size = first,
            "Workload claimed"
        );
        Ok(())
    }

    async fn roll(&self, status: &mut RolloutStatus) -> Result<(), DriverError> {
        let batch = status.current_batch;
        if self.beyond_partition(batch) {
            if self.live_target(status).await?.is_some() {
                self.hold_partition(status, batch);
            }
            return Ok(());
        }

        let Some(target_replicas) = self.current_target(status) else {
            return Ok(());
        };
        let Some((workload, observed)) = self.live_target(status).await? else {
            return Ok(());
        };

        if observed.desired != target_replicas {
            let result = self.driver.scale(&workload, target_replicas).await;
            if let Some(metrics) = self.metrics {
                metrics.record_scale(result.is_ok());
            }
            result?;
        } else {
            debug!(
                rollout = ?self.name,
                batch = batch,
                target_replicas = target_replicas,
                "Workload already at batch target"
            );
        }

        status.rolling_state = RollingState::BatchVerifying;
        status.batch_started_at = Some(self.now.to_rfc3339());
        status.last_error = None;
        set_progressing(
            status,
            true,
            reason::BATCH_VERIFYING,
            format!(
                "Waiting for batch {} to reach {} ready replicas",
                batch, target_replicas
            ),
            self.now,
        );
        Ok(())
    }

    async fn verify_batch(&self, status: &mut RolloutStatus) -> Result<(), DriverError> {
        let batch = status.current_batch;
        let Some(targets) = self.targets(status) else {
            return Ok(());
        };
        let Some(target_replicas) = self.index_target(status, &targets, batch) else {
            return Ok(());
        };
        let Some((_, observed)) = self.live_target(status).await? else {
            return Ok(());
        };

        if !batch_ready(&observed, target_replicas) {
            let started = status.batch_started_at.as_deref().and_then(parse_timestamp);
            match started {
                None => status.batch_started_at = Some(self.now.to_rfc3339()),
                Some(started) => {
                    let waited = self.now.signed_duration_since(started).num_seconds();
                    if waited > self.batch_timeout.as_secs() as i64 {
                        warn!(
                            rollout = ?self.name,
                            batch = batch,
                            ready = observed.ready,
                            target = target_replicas,
                            "Batch did not become ready in time"
                        );
                        mark_failed(
                            status,
                            reason::BATCH_TIMEOUT,
                            format!(
                                "batch {} did not reach {} ready replicas within {}s ({} ready)",
                                batch,
                                target_replicas,
                                self.batch_timeout.as_secs(),
                                observed.ready
                            ),
                            self.now,
                        );
                        return Ok(());
                    }
                }
            }
            set_progressing(
                status,
                true,
                reason::BATCH_VERIFYING,
                format!(
                    "Waiting for batch {} to reach {} ready replicas",
                    batch, target_replicas
                ),
                self.now,
            );
            return Ok(());
        }

        status.last_error = None;
        let last_batch = targets.len() as i32 - 1;
        if batch >= last_batch {
            status.rolling_state = RollingState::Finalizing;
            status.batch_started_at = None;
            set_progressing(
                status,
                true,
                reason::FINALIZING,
                "All batches are ready, releasing the workload",
                self.now,
            );
            info!(rollout = ?self.name, batch = batch, "Final batch ready");
        } else if self.beyond_partition(batch + 1) {
            self.hold_partition(status, batch + 1);
        } else {
            status.current_batch = batch + 1;
            status.rolling_state = RollingState::Rolling;
            status.batch_started_at = None;
            set_progressing(
                status,
                true,
                reason::ROLLING,
                format!("Batch {} ready, rolling batch {}", batch, batch + 1),
                self.now,
            );
            info!(rollout = ?self.name, batch = batch + 1, "Advancing to next batch");
        }
        Ok(())
    }

    async fn finalize(&self, status: &mut RolloutStatus) -> Result<(), DriverError> {
        match self.driver.fetch_target().await? {
            Some(workload) => {
                record_counts(status, &self.driver.observe(&workload));
                self.driver.finalize(&workload).await?;
            }
            None => warn!(
                rollout = ?self.name,
                kind = self.driver.kind(),
                "Target workload gone before release"
            ),
        }

        status.rolling_state = RollingState::Succeeded;
        status.batch_started_at = None;
        status.last_error = None;
        set_progressing(status, true, reason::SUCCEEDED, "Rollout completed", self.now);
        info!(rollout = ?self.name, "Rollout succeeded");
        Ok(())
    }

    async fn hold_paused(&self, status: &mut RolloutStatus) -> Result<(), DriverError> {
        self.refresh_counts(status).await?;
        set_progressing(status, false, reason::PAUSED, "Rollout is paused", self.now);
        debug!(rollout = ?self.name, state = %status.rolling_state, "Rollout paused");
        Ok(())
    }

    fn hold_partition(&self, status: &mut RolloutStatus, batch: i32) {
        set_progressing(
            status,
            false,
            reason::PARTITION_HOLD,
            format!(
                "Holding before batch {} until batchPartition is raised",
                batch
            ),
            self.now,
        );
        debug!(rollout = ?self.name, batch = batch, "Rollout held at partition");
    }

    /// Refresh counts without touching `lastError` if the workload is missing
    async fn refresh_counts(&self, status: &mut RolloutStatus) -> Result<(), DriverError> {
        if let Some(workload) = self.driver.fetch_target().await? {
            record_counts(status, &self.driver.observe(&workload));
        }
        Ok(())
    }

    /// Read the target and refresh counts; a missing target is reported, not an error
    async fn live_target(
        &self,
        status: &mut RolloutStatus,
    ) -> Result<Option<(D::Workload, ObservedReplicas)>, DriverError> {
        match self.driver.fetch_target().await? {
            Some(workload) => {
                let observed = self.driver.observe(&workload);
                record_counts(status, &observed);
                Ok(Some((workload, observed)))
            }
            None => {
                let message = format!("the target {} was not found", self.driver.kind());
                status.last_error = Some(message.clone());
                set_progressing(status, false, reason::TARGET_NOT_FOUND, message, self.now);
                Ok(None)
            }
        }
    }

    /// Total recorded when the source was verified; fails the rollout if missing
    fn total(&self, status: &mut RolloutStatus) -> Option<i32> {
        let total = status.rollout_target_size.or(self.plan.target_size);
        if total.is_none() {
            mark_failed(
                status,
                reason::INVALID_PLAN,
                "rollout target size was never resolved".to_string(),
                self.now,
            );
        }
        total
    }

    /// Cumulative targets for the recorded total; fails the rollout if they cannot be derived
    fn targets(&self, status: &mut RolloutStatus) -> Option<Vec<i32>> {
        let total = self.total(status)?;
        match planner::plan(&self.plan.rollout_batches, total) {
            Ok(targets) => Some(targets),
            Err(e) => {
                mark_failed(status, reason::INVALID_PLAN, e.to_string(), self.now);
                None
            }
        }
    }

    fn current_target(&self, status: &mut RolloutStatus) -> Option<i32> {
        let batch = status.current_batch;
        let total = self.total(status)?;
        match planner::batch_target(&self.plan.rollout_batches, total, batch) {
            Ok(Some(target)) => Some(target),
            Ok(None) => {
                self.outside_plan(status, batch);
                None
            }
            Err(e) => {
                mark_failed(status, reason::INVALID_PLAN, e.to_string(), self.now);
                None
            }
        }
    }

    fn index_target(&self, status: &mut RolloutStatus, targets: &[i32], batch: i32) -> Option<i32> {
        let target = usize::try_from(batch)
            .ok()
            .and_then(|i| targets.get(i).copied());
        if target.is_none() {
            self.outside_plan(status, batch);
        }
        target
    }

    fn outside_plan(&self, status: &mut RolloutStatus, batch: i32) {
        mark_failed(
            status,
            reason::INVALID_PLAN,
            format!(
                "batch {} is outside the plan of {} batches",
                batch,
                self.plan.rollout_batches.len()
            ),
            self.now,
        );
    }

    fn beyond_partition(&self, batch: i32) -> bool {
        self.plan
            .batch_partition
            .is_some_and(|partition| batch > partition)
    }
}

/// A batch is ready once the workload reports on its latest spec and enough
/// replicas are ready
pub fn batch_ready(observed: &ObservedReplicas, target_replicas: i32) -> bool {
    !observed.stale && observed.ready >= target_replicas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_ready_requires_fresh_status() {
        let observed = ObservedReplicas {
            desired: 3,
            updated: 3,
            ready: 3,
            stale: true,
        };
        assert!(!batch_ready(&observed, 3));
        assert!(batch_ready(
            &ObservedReplicas {
                stale: false,
                ..observed
            },
            3
        ));
        assert!(!batch_ready(
            &ObservedReplicas {
                stale: false,
                ready: 2,
                ..observed
            },
            3
        ));
    }
}
