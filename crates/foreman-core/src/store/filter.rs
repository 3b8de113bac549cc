//! Query shapes: list filters and the combined scheduling buckets.

use serde::{Deserialize, Serialize};

use crate::domain::{Task, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Any of these statuses; empty means all.
    #[serde(default)]
    pub statuses: Vec<TaskStatus>,
    #[serde(default)]
    pub set_id: Option<String>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn status(status: TaskStatus) -> Self {
        Self {
            statuses: vec![status],
            set_id: None,
        }
    }

    pub fn in_set(mut self, set_id: impl Into<String>) -> Self {
        self.set_id = Some(set_id.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        let status_ok = self.statuses.is_empty() || self.statuses.contains(&task.status);
        let set_ok = match &self.set_id {
            Some(set_id) => task.set_id.as_deref() == Some(set_id.as_str()),
            None => true,
        };
        status_ok && set_ok
    }
}

/// Live tasks grouped by why they are schedulable. Each list is in creation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulingBuckets {
    /// `needs_review`
    pub review: Vec<Task>,
    /// `needs_improvement`
    pub fixup: Vec<Task>,
    /// `pending` with every dependency `done`
    pub ready: Vec<Task>,
}

impl SchedulingBuckets {
    pub fn len(&self) -> usize {
        self.review.len() + self.fixup.len() + self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
