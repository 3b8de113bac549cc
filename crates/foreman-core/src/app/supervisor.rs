//! Supervisor - 実行ループ
//!
//! # フロー
//! 1. `AgentDispatcher::assign` で空きスロットを埋める（上限 `max_parallel`）
//! 2. drive を JoinSet で並行実行し、1 件終わるのを待つ
//! 3. 前進しなかった cycle のスナップショットを LoopDetector に渡す
//! 4. 何も動かない間は bounded polling（`max_idle_polls` 回まで）
//!
//! 停止理由は必ず `RunStop` で返す。

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::dispatch::{AgentDispatcher, AssignOutcome, DriveOutcome, DriveReport};
use crate::domain::{DomainEvent, KernelError, LoopSignature, LoopSnapshot, TaskStatus};
use crate::loop_detector::LoopDetector;
use crate::ports::{Clock, EventSink, TaskStore};
use crate::store::TaskFilter;

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stop", rename_all = "snake_case")]
pub enum RunStop {
    /// Every task is done.
    Complete,
    /// Nothing could be dispatched for `idle_polls` consecutive polls.
    Stalled { idle_polls: u32 },
    MaxCycles { max_cycles: u64 },
    LoopDetected {
        signature: LoopSignature,
        snapshot: LoopSnapshot,
    },
    /// A structural or infrastructure error surfaced from a drive.
    Halted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub cycles: u64,
    pub dispatched: u64,
    pub stop: RunStop,
}

type DriveResult = Result<DriveReport, KernelError>;

pub struct Supervisor {
    config: SupervisorConfig,
    detector: LoopDetector,
    dispatcher: Arc<AgentDispatcher>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        detector: LoopDetector,
        dispatcher: Arc<AgentDispatcher>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            detector,
            dispatcher,
            store,
            clock,
            events,
        }
    }

    pub async fn run(&mut self) -> RunOutcome {
        let watcher = self.dispatcher.scheduler().watch_transitions();
        let mut running: JoinSet<DriveResult> = JoinSet::new();
        let mut cycles = 0u64;
        let mut dispatched = 0u64;
        let mut idle_polls = 0u32;

        info!(
            max_parallel = self.config.max_parallel,
            max_cycles = self.config.max_cycles,
            "supervisor started"
        );

        let stop = loop {
            if cycles >= self.config.max_cycles {
                break RunStop::MaxCycles {
                    max_cycles: self.config.max_cycles,
                };
            }
            cycles += 1;

            let mut spawned = 0u64;
            let mut halt = None;
            while running.len() < self.config.max_parallel {
                match self.dispatcher.assign().await {
                    Ok(AssignOutcome::Assigned(assignment)) => {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        running.spawn(async move { dispatcher.drive(*assignment).await });
                        spawned += 1;
                    }
                    Ok(AssignOutcome::Idle) => break,
                    Ok(AssignOutcome::NoWorker { task_id, retry_at }) => {
                        debug!(%task_id, ?retry_at, "waiting for a worker");
                        break;
                    }
                    Err(err) => {
                        halt = Some(err.to_string());
                        break;
                    }
                }
            }
            dispatched += spawned;
            if let Some(reason) = halt {
                break RunStop::Halted { reason };
            }

            if running.is_empty() {
                if self.all_done().await {
                    break RunStop::Complete;
                }
                idle_polls += 1;
                if idle_polls > self.config.max_idle_polls {
                    break RunStop::Stalled {
                        idle_polls: idle_polls - 1,
                    };
                }
                tokio::time::sleep(self.idle_wait()).await;
                continue;
            }
            idle_polls = 0;

            let mut settled = Vec::new();
            if let Some(result) = running.join_next().await {
                settled.push(result);
            }
            while let Some(result) = running.try_join_next() {
                settled.push(result);
            }

            let mut progressed = false;
            for result in settled {
                match reap(result) {
                    Ok(report) => {
                        progressed |= !matches!(report.outcome, DriveOutcome::Requeued { .. });
                    }
                    Err(reason) => halt = Some(reason),
                }
            }
            if let Some(reason) = halt {
                break RunStop::Halted { reason };
            }
            if progressed {
                continue;
            }

            let current = self.store.loop_snapshot().await;
            if let Err(KernelError::LoopDetected { signature, snapshot }) =
                self.detector.observe(&current)
            {
                error!(
                    signature = %signature.hash,
                    summary = %signature.snapshot_summary,
                    "loop detected; halting"
                );
                self.events.emit(&DomainEvent::LoopDetected {
                    signature: signature.clone(),
                    snapshot: (*snapshot).clone(),
                });
                break RunStop::LoopDetected {
                    signature,
                    snapshot: *snapshot,
                };
            }
        };

        if !running.is_empty() {
            info!(count = running.len(), "waiting for in-flight drives to complete");
            while let Some(result) = running.join_next().await {
                if let Err(reason) = reap(result) {
                    warn!(%reason, "drive failed during drain");
                }
            }
        }
        watcher.abort();

        info!(cycles, dispatched, stop = ?stop, "supervisor stopped");
        RunOutcome {
            cycles,
            dispatched,
            stop,
        }
    }

    async fn all_done(&self) -> bool {
        self.store
            .list_tasks(&TaskFilter::all())
            .await
            .iter()
            .all(|t| t.status == TaskStatus::Done)
    }

    /// Poll interval, shortened to the next worker cooldown, plus up to 10%
    /// jitter.
    fn idle_wait(&self) -> Duration {
        let mut wait = self.config.poll_interval();
        if let Some(at) = self.dispatcher.next_worker_at()
            && let Ok(until) = (at - self.clock.now()).to_std()
        {
            wait = wait.min(until.max(Duration::from_millis(1)));
        }
        let jitter_ms = (wait.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        wait + Duration::from_millis(jitter)
    }
}

fn reap(result: Result<DriveResult, JoinError>) -> Result<DriveReport, String> {
    match result {
        Ok(Ok(report)) => {
            debug!(task_id = %report.task_id, worker = %report.worker_id, outcome = ?report.outcome, "drive settled");
            Ok(report)
        }
        Ok(Err(err)) => {
            error!(error = %err, kind = ?err.kind(), "drive surfaced an error");
            Err(err.to_string())
        }
        Err(join) => {
            error!(error = %join, "drive task failed");
            Err(format!("drive task failed: {join}"))
        }
    }
}
