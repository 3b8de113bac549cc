//! AgentDispatcher - ワーカー割り当てとフェーズ駆動
//!
//! # 責務
//! - Binds a scheduled task to a worker from the pool.
//! - Drives the task through its remaining phases via the gate.
//! - Maps failures onto the task lifecycle:
//!   - rate limit: worker cools down, task re-queued without a failure
//!   - other transient or quality errors: `failure_count` + 1, task re-queued
//!   - structural errors: surfaced to the caller
//!
//! Verify hands the task to `needs_review`; the review phase runs on a later
//! checkout and finishes it.

pub mod pool;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

pub use self::pool::{WorkerLease, WorkerPool, WorkerStatus};
use crate::domain::{DomainEvent, ErrorKind, KernelError, Phase, TaskId, TaskStatus, meta};
use crate::gate::PhaseExecutionGate;
use crate::ports::{Clock, EventSink, TaskStore};
use crate::scheduler::{ScheduledTask, TaskScheduler};

/// A checked-out task bound to a leased worker.
#[derive(Debug)]
pub struct Assignment {
    pub scheduled: ScheduledTask,
    pub lease: WorkerLease,
}

impl Assignment {
    pub fn task_id(&self) -> &TaskId {
        &self.scheduled.task.id
    }
}

#[derive(Debug)]
pub enum AssignOutcome {
    Assigned(Box<Assignment>),
    /// Nothing runnable right now.
    Idle,
    /// A task was runnable but every worker was busy or cooling down. The
    /// task went back to the scheduler.
    NoWorker {
        task_id: TaskId,
        retry_at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DriveOutcome {
    Completed { phases: usize },
    AwaitingReview { phases: usize },
    /// Released back to the scheduler after a recoverable failure.
    Requeued {
        phase: Phase,
        failure_count: Option<u32>,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveReport {
    pub task_id: TaskId,
    pub worker_id: String,
    pub outcome: DriveOutcome,
}

pub struct AgentDispatcher {
    scheduler: Arc<TaskScheduler>,
    store: Arc<dyn TaskStore>,
    gate: Arc<PhaseExecutionGate>,
    pool: Mutex<WorkerPool>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl AgentDispatcher {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        store: Arc<dyn TaskStore>,
        gate: Arc<PhaseExecutionGate>,
        pool: WorkerPool,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            scheduler,
            store,
            gate,
            pool: Mutex::new(pool),
            clock,
            events,
        }
    }

    fn with_pool<R>(&self, f: impl FnOnce(&mut WorkerPool) -> R) -> R {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut pool)
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn workers(&self) -> Vec<WorkerStatus> {
        self.with_pool(|pool| pool.status())
    }

    /// Earliest moment a cooling worker comes back, if any is cooling.
    pub fn next_worker_at(&self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.with_pool(|pool| pool.next_available_at(now))
    }

    /// Takes the next task and leases a worker for it, moving the task to
    /// `in_progress`.
    pub async fn assign(&self) -> Result<AssignOutcome, KernelError> {
        let now = self.clock.now();
        if !self.with_pool(|pool| pool.has_available(now)) {
            return Ok(match self.scheduler.plan().await.into_iter().next() {
                Some(head) => AssignOutcome::NoWorker {
                    task_id: head.task.id,
                    retry_at: self.next_worker_at(),
                },
                None => AssignOutcome::Idle,
            });
        }

        let Some(scheduled) = self.scheduler.take_next().await else {
            return Ok(AssignOutcome::Idle);
        };
        let task_id = scheduled.task.id.clone();

        let Some(lease) = self.with_pool(|pool| pool.acquire(now)) else {
            self.scheduler.release(&task_id).await;
            debug!(%task_id, "no worker available; task released");
            return Ok(AssignOutcome::NoWorker {
                task_id,
                retry_at: self.next_worker_at(),
            });
        };

        let reason = format!("assigned to {}", lease.worker_id);
        if let Err(err) = self
            .store
            .transition(&task_id, TaskStatus::InProgress, &reason)
            .await
        {
            self.with_pool(|pool| pool.release(&lease.worker_id));
            self.scheduler.release(&task_id).await;
            return Err(err);
        }

        info!(
            %task_id,
            worker = %lease.worker_id,
            provider = %lease.provider,
            reason = ?scheduled.reason,
            profile = %scheduled.resource_profile,
            "task assigned"
        );
        Ok(AssignOutcome::Assigned(Box::new(Assignment { scheduled, lease })))
    }

    /// Runs the task's remaining phases. The worker lease is always returned,
    /// and on error the task is never left checked out.
    pub async fn drive(&self, assignment: Assignment) -> Result<DriveReport, KernelError> {
        let Assignment { scheduled, lease } = assignment;
        let task_id = scheduled.task.id.clone();
        let result = self.drive_phases(&task_id, &lease).await;
        self.with_pool(|pool| pool.release(&lease.worker_id));
        if result.is_err() && self.scheduler.release(&task_id).await {
            debug!(%task_id, "task released after failed drive");
        }
        result.map(|outcome| DriveReport {
            task_id,
            worker_id: lease.worker_id,
            outcome,
        })
    }

    async fn drive_phases(
        &self,
        task_id: &TaskId,
        lease: &WorkerLease,
    ) -> Result<DriveOutcome, KernelError> {
        let task = self.store.get_task(task_id).await?;
        let mut next = match task.current_phase() {
            Some(done) => {
                let done: Phase = done.parse().map_err(|message| KernelError::InvalidTask {
                    task_id: task_id.clone(),
                    message,
                })?;
                done.next()
            }
            None => Some(Phase::first()),
        };

        let mut phases = 0;
        while let Some(phase) = next {
            if let Err(err) = self.gate.execute(&task, phase, lease.worker.as_ref()).await {
                return self.handle_failure(task_id, phase, lease, err).await;
            }
            phases += 1;
            next = phase.next();

            if next == Some(Phase::Review) {
                self.store
                    .transition(task_id, TaskStatus::NeedsReview, "verify accepted")
                    .await?;
                self.scheduler.release(task_id).await;
                return Ok(DriveOutcome::AwaitingReview { phases });
            }
        }

        self.store
            .transition(task_id, TaskStatus::Done, "all phases accepted")
            .await?;
        self.scheduler.complete(task_id).await;
        Ok(DriveOutcome::Completed { phases })
    }

    async fn handle_failure(
        &self,
        task_id: &TaskId,
        phase: Phase,
        lease: &WorkerLease,
        err: KernelError,
    ) -> Result<DriveOutcome, KernelError> {
        match &err {
            KernelError::RateLimited { retry_after } => {
                let until = self.clock.now()
                    + chrono::Duration::from_std(*retry_after)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                self.with_pool(|pool| pool.cool_down(&lease.worker_id, until));
                self.events.emit(&DomainEvent::WorkerCooledDown {
                    worker_id: lease.worker_id.clone(),
                    until,
                });
                info!(%task_id, worker = %lease.worker_id, %until, "worker cooling down");
                self.requeue(task_id, "worker rate limited").await?;
                Ok(DriveOutcome::Requeued {
                    phase,
                    failure_count: None,
                    reason: err.to_string(),
                })
            }
            _ if err.is_recoverable() => {
                let failures = self.store.record_failure(task_id).await?;
                warn!(%task_id, %phase, failures, error = %err, "phase failed; task re-queued");
                self.requeue(task_id, &format!("{phase} failed: {err}")).await?;
                Ok(DriveOutcome::Requeued {
                    phase,
                    failure_count: Some(failures),
                    reason: err.to_string(),
                })
            }
            KernelError::PhaseSequenceViolation { .. } => {
                let resume = self.gate.ledger().resume_point(task_id);
                let value = resume.map_or(serde_json::Value::Null, |p| json!(p.as_str()));
                self.store.set_metadata(task_id, meta::PHASE, value).await?;
                warn!(%task_id, %phase, resume = ?resume, "phase sequence reset");
                self.requeue(task_id, &err.to_string()).await?;
                Err(err)
            }
            _ => {
                let level = if err.kind() == ErrorKind::Structural {
                    "structural"
                } else {
                    "infrastructure"
                };
                warn!(%task_id, %phase, error = %err, level, "task blocked");
                self.store
                    .transition(task_id, TaskStatus::Blocked, &err.to_string())
                    .await?;
                self.scheduler.release(task_id).await;
                Err(err)
            }
        }
    }

    async fn requeue(&self, task_id: &TaskId, reason: &str) -> Result<(), KernelError> {
        self.store
            .transition(task_id, TaskStatus::NeedsImprovement, reason)
            .await?;
        self.scheduler.release(task_id).await;
        Ok(())
    }
}
