//! Loop signatures: fingerprints of kernel state used to spot repetition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// What the loop detector looks at after a scheduling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopSnapshot {
    pub completed: Vec<TaskId>,
    pub in_progress: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
    /// Free-text blocker descriptions (e.g. the reason of the blocking transition).
    pub blockers: Vec<String>,
}

impl LoopSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "completed={} in_progress={} blocked={} blockers={}",
            self.completed.len(),
            self.in_progress.len(),
            self.blocked.len(),
            self.blockers.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopSignature {
    pub hash: String,
    pub snapshot_summary: String,
    pub timestamp: DateTime<Utc>,
}
