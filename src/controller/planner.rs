//! Batch planner
//!
//! Turns the ordered batch descriptors of a `RolloutPlan` into concrete
//! cumulative replica targets. Pure and deterministic so every tick can
//! re-derive "what is batch i's target" instead of caching it.

use crate::crd::rollout::RolloutBatch;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("rolloutBatches must have at least one batch")]
    Empty,

    #[error("rolloutBatches[{index}].replicas invalid '{value}': must be a non-negative count or a percentage between 0% and 100%")]
    InvalidValue { index: usize, value: String },

    #[error("rolloutBatches[{index}].replicas {target} exceeds the total desired replicas {total}")]
    ExceedsTotal { index: usize, target: i32, total: i32 },

    #[error("rolloutBatches[{index}] cumulative target {target} is lower than the previous batch target {previous}")]
    NotMonotonic {
        index: usize,
        target: i32,
        previous: i32,
    },

    #[error("total desired replicas must be >= 0, got {0}")]
    NegativeTotal(i32),
}

/// A batch descriptor after parsing, before it is scaled against a total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSize {
    Absolute(i32),
    Percent(i32),
}

impl BatchSize {
    /// Resolve against the total, flooring percentages
    fn resolve(self, total: i32) -> i32 {
        match self {
            BatchSize::Absolute(count) => count,
            BatchSize::Percent(percent) => {
                ((total as i64 * percent as i64) / 100) as i32
            }
        }
    }
}

/// Parse one batch descriptor
pub fn parse_batch_size(index: usize, value: &IntOrString) -> Result<BatchSize, PlanError> {
    let invalid = |value: String| PlanError::InvalidValue { index, value };

    match value {
        IntOrString::Int(count) if *count >= 0 => Ok(BatchSize::Absolute(*count)),
        IntOrString::Int(count) => Err(invalid(count.to_string())),
        IntOrString::String(s) => {
            let percent = s
                .trim()
                .strip_suffix('%')
                .and_then(|p| p.parse::<i32>().ok())
                .filter(|p| (0..=100).contains(p))
                .ok_or_else(|| invalid(s.clone()))?;
            Ok(BatchSize::Percent(percent))
        }
    }
}

/// Validate the shape of a plan without knowing the total
///
/// Runs at admission and at the start of every tick. Rejects empty plans,
/// malformed values, and plans whose cumulative targets already decrease
/// between two batches of the same unit (absolute after absolute, percent
/// after percent). Mixed-unit ordering can only be judged against a total,
/// which `plan` does.
pub fn validate_batches(batches: &[RolloutBatch]) -> Result<Vec<BatchSize>, PlanError> {
    if batches.is_empty() {
        return Err(PlanError::Empty);
    }

    let sizes = batches
        .iter()
        .enumerate()
        .map(|(i, batch)| parse_batch_size(i, &batch.replicas))
        .collect::<Result<Vec<_>, _>>()?;

    let mut last_absolute: Option<i32> = None;
    let mut last_percent: Option<i32> = None;
    // The final batch is forced to the total, so it never breaks ordering
    for (index, size) in sizes.iter().enumerate().take(sizes.len() - 1) {
        let (previous, target) = match size {
            BatchSize::Absolute(count) => (last_absolute.replace(*count), *count),
            BatchSize::Percent(percent) => (last_percent.replace(*percent), *percent),
        };
        if let Some(previous) = previous {
            if target < previous {
                return Err(PlanError::NotMonotonic {
                    index,
                    target,
                    previous,
                });
            }
        }
    }

    Ok(sizes)
}

/// Compute cumulative replica targets per batch index
///
/// Percentages floor for every batch but the last, which is always exactly
/// `total_desired` so the rollout terminates at the true desired count.
///
/// # Examples
/// ```ignore
/// // [10%, 30%, 100%] of 7 replicas
/// assert_eq!(plan(&batches, 7)?, vec![0, 2, 7]);
/// ```
pub fn plan(batches: &[RolloutBatch], total_desired: i32) -> Result<Vec<i32>, PlanError> {
    if total_desired < 0 {
        return Err(PlanError::NegativeTotal(total_desired));
    }

    let sizes = validate_batches(batches)?;
    let last = sizes.len() - 1;

    let mut targets = Vec::with_capacity(sizes.len());
    let mut previous = 0;
    for (index, size) in sizes.into_iter().enumerate() {
        let target = if index == last {
            total_desired
        } else {
            size.resolve(total_desired)
        };

        if target > total_desired {
            return Err(PlanError::ExceedsTotal {
                index,
                target,
                total: total_desired,
            });
        }
        if target < previous {
            return Err(PlanError::NotMonotonic {
                index,
                target,
                previous,
            });
        }

        targets.push(target);
        previous = target;
    }

    Ok(targets)
}

/// Target of one batch, re-derived from the plan
pub fn batch_target(
    batches: &[RolloutBatch],
    total_desired: i32,
    batch: i32,
) -> Result<Option<i32>, PlanError> {
    let targets = plan(batches, total_desired)?;
    Ok(usize::try_from(batch)
        .ok()
        .and_then(|i| targets.get(i).copied()))
}
