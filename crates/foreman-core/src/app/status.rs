//! Status - カーネル全体の状態ビュー
//!
//! 何が動いていて、何が詰まっているかを一度に説明する。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::dispatch::{AgentDispatcher, WorkerStatus};
use crate::domain::{TaskId, TaskStatus};
use crate::ports::TaskStore;
use crate::scheduler::TaskScheduler;
use crate::store::TaskFilter;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelStatus {
    /// Every status is present, zero included.
    pub counts: BTreeMap<TaskStatus, usize>,
    pub total: usize,
    pub busy: Vec<TaskId>,
    pub heavy_in_flight: usize,
    pub heavy_limit: usize,
    /// Heavy tasks waiting for a slot, oldest first.
    pub deferred: Vec<TaskId>,
    pub workers: Vec<WorkerStatus>,
}

impl KernelStatus {
    pub async fn collect(
        store: &dyn TaskStore,
        scheduler: &TaskScheduler,
        dispatcher: &AgentDispatcher,
    ) -> Self {
        let tasks = store.list_tasks(&TaskFilter::all()).await;
        let mut counts: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for task in &tasks {
            *counts.entry(task.status).or_default() += 1;
        }
        let snapshot = scheduler.snapshot().await;
        Self {
            counts,
            total: tasks.len(),
            busy: snapshot.busy,
            heavy_in_flight: snapshot.heavy_in_flight,
            heavy_limit: snapshot.heavy_limit,
            deferred: snapshot.deferred,
            workers: dispatcher.workers(),
        }
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// All tasks done (vacuously true with no tasks).
    pub fn is_finished(&self) -> bool {
        self.count(TaskStatus::Done) == self.total
    }
}
