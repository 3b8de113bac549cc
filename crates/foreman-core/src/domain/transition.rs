//! Transition history: the append-only audit trail of status changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, TransitionId};
use super::task::TaskStatus;

/// One status change. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub id: TransitionId,
    pub task_id: TaskId,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}
