//! Errors - エラー型と分類
//!
//! `KernelError` carries the whole taxonomy. `ErrorKind` is the operational
//! classification the dispatcher and supervisor branch on.

use std::time::Duration;

use thiserror::Error;

use super::ids::TaskId;
use super::phase::Phase;
use super::signature::{LoopSignature, LoopSnapshot};
use super::task::TaskStatus;

/// Operational classification of a failure.
///
/// - Transient: retry after releasing the task (rate limits, timeouts, crashes)
/// - Quality: the generated content was rejected; retried with feedback
/// - Structural: surfaced to the operator, never retried blindly
/// - Infrastructure: local I/O or configuration trouble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Quality,
    Structural,
    Infrastructure,
}

#[derive(Debug, Clone, Error)]
pub enum KernelError {
    #[error("invalid transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: TaskId, dependency: TaskId },

    #[error("dependency cycle: {}", format_cycle(.0))]
    DependencyCycle(Vec<TaskId>),

    #[error("task {task_id} has unfinished dependencies: {}", format_cycle(.pending))]
    DependenciesUnmet { task_id: TaskId, pending: Vec<TaskId> },

    #[error("invalid task {task_id}: {message}")]
    InvalidTask { task_id: TaskId, message: String },

    #[error("invalid resource limit {requested}; clamped to {clamped}")]
    InvalidResourceLimit { requested: i64, clamped: usize },

    #[error("worker rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("provider returned a non-answer (provider_id={provider_id})")]
    ProviderRejected { provider_id: String },

    #[error("phase {phase} of {task_id} requires accepted {missing:?}")]
    PhaseSequenceViolation {
        task_id: TaskId,
        phase: Phase,
        missing: Vec<Phase>,
    },

    #[error("template-like content rejected for {task_id}/{phase}: score {score:.3} > {threshold:.3}")]
    TemplateRejected {
        task_id: TaskId,
        phase: Phase,
        score: f64,
        threshold: f64,
    },

    #[error("content drift for {task_id}/{phase}: expected {expected}, got {actual}")]
    ContentDrift {
        task_id: TaskId,
        phase: Phase,
        expected: String,
        actual: String,
    },

    #[error("guardrail {id} blocked the action: {details}")]
    GuardrailBlocked { id: String, details: String },

    #[error("command rejected ({reason}): {command}")]
    CommandRejected { command: String, reason: String },

    #[error("loop detected: {}", describe_signature(.signature))]
    LoopDetected {
        signature: LoopSignature,
        snapshot: Box<LoopSnapshot>,
    },

    #[error("guardrail catalog: {0}")]
    CatalogLoad(String),

    #[error("duplicate guardrail check: {0}")]
    DuplicateCheck(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{context}: {message}")]
    Io { context: String, message: String },
}

impl KernelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KernelError::RateLimited { .. }
            | KernelError::Timeout { .. }
            | KernelError::ProviderError(_) => ErrorKind::Transient,
            KernelError::ProviderRejected { .. }
            | KernelError::TemplateRejected { .. }
            | KernelError::ContentDrift { .. } => ErrorKind::Quality,
            KernelError::Io { .. } | KernelError::Config(_) | KernelError::CatalogLoad(_) => {
                ErrorKind::Infrastructure
            }
            _ => ErrorKind::Structural,
        }
    }

    /// Transient and quality failures are recovered by releasing the task.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Quality)
    }

    pub fn io(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        KernelError::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

fn describe_signature(signature: &LoopSignature) -> String {
    format!(
        "signature {} repeated ({})",
        signature.hash, signature.snapshot_summary
    )
}

fn format_cycle(ids: &[TaskId]) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_quality_errors_are_recoverable() {
        let rate = KernelError::RateLimited {
            retry_after: Duration::from_secs(1),
        };
        assert_eq!(rate.kind(), ErrorKind::Transient);
        assert!(rate.is_recoverable());

        let drift = KernelError::ContentDrift {
            task_id: TaskId::new("t"),
            phase: Phase::Plan,
            expected: "a".into(),
            actual: "b".into(),
        };
        assert_eq!(drift.kind(), ErrorKind::Quality);
        assert!(drift.is_recoverable());
    }

    #[test]
    fn structural_errors_are_not_recoverable() {
        let blocked = KernelError::GuardrailBlocked {
            id: "G-1".into(),
            details: "dirty tree".into(),
        };
        assert_eq!(blocked.kind(), ErrorKind::Structural);
        assert!(!blocked.is_recoverable());
        assert!(blocked.to_string().contains("G-1"));
    }

    #[test]
    fn cycle_message_lists_path() {
        let err = KernelError::DependencyCycle(vec![
            TaskId::new("a"),
            TaskId::new("b"),
            TaskId::new("a"),
        ]);
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }
}
