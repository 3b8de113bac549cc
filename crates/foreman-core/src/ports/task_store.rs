//! TaskStore port - タスク状態と遷移履歴の正本（source of truth）
//!
//! # 設計原則
//! - Status changes go through `transition` only; history is append-only.
//! - Tasks are never deleted.
//! - `scheduling_buckets` classifies every live task in one pass.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::domain::{KernelError, LoopSnapshot, NewTask, Task, TaskId, TaskStatus, TaskTransition};
use crate::store::{SchedulingBuckets, TaskFilter};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: NewTask) -> Result<Task, KernelError>;

    async fn get_task(&self, id: &TaskId) -> Result<Task, KernelError>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task>;

    /// Validates the edge, appends a `TaskTransition`, and notifies subscribers.
    async fn transition(
        &self,
        id: &TaskId,
        to: TaskStatus,
        reason: &str,
    ) -> Result<TaskTransition, KernelError>;

    async fn scheduling_buckets(&self) -> SchedulingBuckets;

    /// Sets one metadata key. Status is not metadata; use `transition`.
    async fn set_metadata(&self, id: &TaskId, key: &str, value: Value) -> Result<(), KernelError>;

    /// Increments `failure_count` and returns the new value.
    async fn record_failure(&self, id: &TaskId) -> Result<u32, KernelError>;

    async fn history(&self, id: &TaskId) -> Vec<TaskTransition>;

    async fn loop_snapshot(&self) -> LoopSnapshot;

    fn subscribe(&self) -> broadcast::Receiver<TaskTransition>;
}
