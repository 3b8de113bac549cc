//! Events - ドメインイベント
//!
//! Everything the kernel writes to the evidence sink. One event becomes one
//! JSON line; the `event` tag names the variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::phase::{Phase, PhaseExecutionRecord};
use super::signature::{LoopSignature, LoopSnapshot};
use super::transition::TaskTransition;
use crate::guardrail::GuardrailResult;
use crate::scheduler::ResearchSignal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskTransitioned(TaskTransition),
    GuardrailEvaluated(GuardrailResult),
    PhaseAccepted(PhaseExecutionRecord),
    PhaseRejected {
        task_id: TaskId,
        phase: Phase,
        provider_id: Option<String>,
        reason: String,
        at: DateTime<Utc>,
    },
    ResearchRecommended(ResearchSignal),
    WorkerCooledDown {
        worker_id: String,
        until: DateTime<Utc>,
    },
    LoopDetected {
        signature: LoopSignature,
        snapshot: LoopSnapshot,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TaskTransitioned(_) => "task_transitioned",
            DomainEvent::GuardrailEvaluated(_) => "guardrail_evaluated",
            DomainEvent::PhaseAccepted(_) => "phase_accepted",
            DomainEvent::PhaseRejected { .. } => "phase_rejected",
            DomainEvent::ResearchRecommended(_) => "research_recommended",
            DomainEvent::WorkerCooledDown { .. } => "worker_cooled_down",
            DomainEvent::LoopDetected { .. } => "loop_detected",
        }
    }
}
