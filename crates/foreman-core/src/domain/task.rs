//! Task model and its status state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// Metadata keys the kernel itself reads or writes.
pub mod meta {
    pub const RESOURCE_PROFILE: &str = "resource_profile";
    pub const EXPECTED_RUNTIME_MINUTES: &str = "expected_runtime_minutes";
    pub const FAILURE_COUNT: &str = "failure_count";
    pub const PHASE: &str = "phase";
}

/// Task status.
///
/// Allowed edges:
/// - Pending -> InProgress
/// - InProgress -> NeedsReview | NeedsImprovement | Blocked | Done
/// - NeedsReview -> InProgress | Done
/// - NeedsImprovement -> InProgress
/// - Blocked -> Pending
///
/// Done is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    NeedsReview,
    NeedsImprovement,
    Blocked,
    Done,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::NeedsReview,
        TaskStatus::NeedsImprovement,
        TaskStatus::Blocked,
        TaskStatus::Done,
    ];

    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::{Blocked, Done, InProgress, NeedsImprovement, NeedsReview, Pending};
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, NeedsReview)
                | (InProgress, NeedsImprovement)
                | (InProgress, Blocked)
                | (InProgress, Done)
                | (NeedsReview, InProgress)
                | (NeedsReview, Done)
                | (NeedsImprovement, InProgress)
                | (Blocked, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::NeedsReview => "needs_review",
            TaskStatus::NeedsImprovement => "needs_improvement",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of orchestrated work.
///
/// Only the store mutates a `Task`; everything else works on clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    pub estimated_complexity: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Task {
    pub fn failure_count(&self) -> u32 {
        self.metadata
            .get(meta::FAILURE_COUNT)
            .and_then(serde_json::Value::as_u64)
            .map(|n| n.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(0)
    }

    pub fn resource_hint(&self) -> Option<&str> {
        self.metadata
            .get(meta::RESOURCE_PROFILE)
            .and_then(serde_json::Value::as_str)
    }

    pub fn expected_runtime_minutes(&self) -> Option<f64> {
        self.metadata
            .get(meta::EXPECTED_RUNTIME_MINUTES)
            .and_then(serde_json::Value::as_f64)
    }

    /// Last phase accepted for this task, as recorded by the gate.
    pub fn current_phase(&self) -> Option<&str> {
        self.metadata.get(meta::PHASE).and_then(serde_json::Value::as_str)
    }

    pub fn days_since_created(&self, now: DateTime<Utc>) -> f64 {
        let secs = (now - self.created_at).num_seconds().max(0) as f64;
        secs / 86_400.0
    }
}

/// A normalized task as produced by the planner, before the store owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default = "default_complexity")]
    pub estimated_complexity: u8,
    /// Planner-supplied creation time; the store clock is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn default_complexity() -> u8 {
    5
}

impl NewTask {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            title: title.into(),
            description: String::new(),
            dependencies: BTreeSet::new(),
            estimated_complexity: default_complexity(),
            created_at: None,
            set_id: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(TaskId::new(id));
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.estimated_complexity = complexity;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn in_set(mut self, set_id: impl Into<String>) -> Self {
        self.set_id = Some(set_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::start(TaskStatus::Pending, TaskStatus::InProgress)]
    #[case::review(TaskStatus::InProgress, TaskStatus::NeedsReview)]
    #[case::improve(TaskStatus::InProgress, TaskStatus::NeedsImprovement)]
    #[case::block(TaskStatus::InProgress, TaskStatus::Blocked)]
    #[case::finish(TaskStatus::InProgress, TaskStatus::Done)]
    #[case::rework(TaskStatus::NeedsReview, TaskStatus::InProgress)]
    #[case::approve(TaskStatus::NeedsReview, TaskStatus::Done)]
    #[case::fix(TaskStatus::NeedsImprovement, TaskStatus::InProgress)]
    #[case::unblock(TaskStatus::Blocked, TaskStatus::Pending)]
    fn allowed_edges(#[case] from: TaskStatus, #[case] to: TaskStatus) {
        assert!(from.can_transition_to(to));
    }

    #[test]
    fn every_other_edge_is_rejected() {
        let allowed = 9;
        let mut count = 0;
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                if from.can_transition_to(to) {
                    count += 1;
                }
            }
        }
        assert_eq!(count, allowed);
        for to in TaskStatus::ALL {
            assert!(!TaskStatus::Done.can_transition_to(to));
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&TaskStatus::NeedsImprovement).unwrap();
        assert_eq!(s, "\"needs_improvement\"");
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn metadata_helpers_read_kernel_keys() {
        let new = NewTask::new("a", "A")
            .with_metadata(meta::FAILURE_COUNT, serde_json::json!(2))
            .with_metadata(meta::RESOURCE_PROFILE, serde_json::json!("heavy"));
        let task = Task {
            id: new.id,
            title: new.title,
            description: new.description,
            status: TaskStatus::Pending,
            dependencies: new.dependencies,
            estimated_complexity: new.estimated_complexity,
            created_at: Utc::now(),
            set_id: None,
            metadata: new.metadata,
        };
        assert_eq!(task.failure_count(), 2);
        assert_eq!(task.resource_hint(), Some("heavy"));
        assert_eq!(task.current_phase(), None);
    }
}
