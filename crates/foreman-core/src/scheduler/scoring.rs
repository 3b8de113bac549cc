//! Priority scoring.
//!
//! `priority = status_weight + complexity_bias * (10 - complexity)
//!           + staleness_bias * min(10, days_since_created) + reason_boost`

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerWeights;
use crate::domain::{Task, TaskStatus};

const MAX_STALENESS_DAYS: f64 = 10.0;

/// Why the task is in the queue. Mirrors the store's scheduling buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleReason {
    RequiresReview,
    RequiresFollowUp,
    DependenciesCleared,
}

pub fn status_weight(status: TaskStatus, weights: &SchedulerWeights) -> f64 {
    match status {
        TaskStatus::NeedsReview => weights.review,
        TaskStatus::NeedsImprovement => weights.improvement,
        TaskStatus::Pending => weights.pending,
        _ => 0.0,
    }
}

pub fn reason_boost(reason: ScheduleReason, weights: &SchedulerWeights) -> f64 {
    match reason {
        ScheduleReason::RequiresReview => weights.review_boost,
        ScheduleReason::RequiresFollowUp => weights.follow_up_boost,
        ScheduleReason::DependenciesCleared => weights.dependencies_cleared_boost,
    }
}

pub fn priority(
    task: &Task,
    reason: ScheduleReason,
    weights: &SchedulerWeights,
    now: DateTime<Utc>,
) -> f64 {
    let complexity = f64::from(task.estimated_complexity.min(10));
    let staleness = task.days_since_created(now).min(MAX_STALENESS_DAYS);
    status_weight(task.status, weights)
        + weights.complexity_bias * (10.0 - complexity)
        + weights.staleness_bias * staleness
        + reason_boost(reason, weights)
}

/// Queue order: highest priority first, then oldest, then id.
pub fn queue_order(a: (&Task, f64), b: (&Task, f64)) -> Ordering {
    b.1.total_cmp(&a.1)
        .then_with(|| a.0.created_at.cmp(&b.0.created_at))
        .then_with(|| a.0.id.cmp(&b.0.id))
}
