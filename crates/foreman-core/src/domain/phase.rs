//! Phase model: the strictly ordered lifecycle a task walks through.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ExecutionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Strategize,
    Spec,
    Plan,
    Think,
    Implement,
    Verify,
    Review,
}

impl Phase {
    /// Phases in execution order.
    pub const SEQUENCE: [Phase; 7] = [
        Phase::Strategize,
        Phase::Spec,
        Phase::Plan,
        Phase::Think,
        Phase::Implement,
        Phase::Verify,
        Phase::Review,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Every phase that must have an accepted record before this one runs.
    pub fn predecessors(self) -> &'static [Phase] {
        &Self::SEQUENCE[..self.index()]
    }

    pub fn next(self) -> Option<Phase> {
        Self::SEQUENCE.get(self.index() + 1).copied()
    }

    pub fn first() -> Phase {
        Phase::Strategize
    }

    /// Phases that touch the workspace run the blocking guardrails first.
    pub fn mutates_workspace(self) -> bool {
        matches!(self, Phase::Implement | Phase::Verify)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Strategize => "strategize",
            Phase::Spec => "spec",
            Phase::Plan => "plan",
            Phase::Think => "think",
            Phase::Implement => "implement",
            Phase::Verify => "verify",
            Phase::Review => "review",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::SEQUENCE
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase: {s}"))
    }
}

/// One phase attempt, as recorded for idempotence checks and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseExecutionRecord {
    pub execution_id: ExecutionId,
    pub task_id: TaskId,
    pub phase: Phase,
    pub content_hash: String,
    pub provider_id: String,
    pub template_score: f64,
    pub accepted: bool,
    pub recorded_at: DateTime<Utc>,
    /// Short excerpt handed to later phases as context.
    #[serde(default)]
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predecessors_follow_sequence() {
        assert!(Phase::Strategize.predecessors().is_empty());
        assert_eq!(
            Phase::Plan.predecessors(),
            &[Phase::Strategize, Phase::Spec]
        );
        assert_eq!(Phase::Review.predecessors().len(), 6);
    }

    #[test]
    fn next_walks_to_review_then_stops() {
        let mut phase = Phase::first();
        let mut walked = vec![phase];
        while let Some(next) = phase.next() {
            walked.push(next);
            phase = next;
        }
        assert_eq!(walked, Phase::SEQUENCE.to_vec());
        assert_eq!(phase, Phase::Review);
    }

    #[test]
    fn parses_from_its_display_form() {
        for phase in Phase::SEQUENCE {
            assert_eq!(phase.to_string().parse::<Phase>().unwrap(), phase);
        }
        assert!("deploy".parse::<Phase>().is_err());
    }
}
