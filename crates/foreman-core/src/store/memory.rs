//! In-memory task store.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use super::dependency::DependencyGraph;
use super::filter::{SchedulingBuckets, TaskFilter};
use super::snapshot::{StoreSnapshot, write_atomic};
use crate::domain::{
    DomainEvent, KernelError, LoopSnapshot, NewTask, Task, TaskId, TaskStatus, TaskTransition,
    meta,
};
use crate::ports::{
    Clock, EventSink, IdGenerator, NoopEventSink, SystemClock, TaskStore, UlidGenerator,
};

const TRANSITION_CHANNEL_CAPACITY: usize = 1024;

/// In-memory store state.
struct StoreState {
    /// All task records (single source of truth).
    tasks: HashMap<TaskId, Task>,

    /// Creation order, used for tie-breaking and stable listing.
    order: Vec<TaskId>,

    /// Append-only transition history.
    history: Vec<TaskTransition>,

    graph: DependencyGraph,

    /// Reason of the transition that blocked each currently blocked task.
    blockers: BTreeMap<TaskId, String>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            history: Vec::new(),
            graph: DependencyGraph::new(),
            blockers: BTreeMap::new(),
        }
    }

    fn pending_dependencies(&self, task: &Task) -> Vec<TaskId> {
        task.dependencies
            .iter()
            .filter(|dep| {
                self.tasks
                    .get(*dep)
                    .is_none_or(|d| d.status != TaskStatus::Done)
            })
            .cloned()
            .collect()
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task, KernelError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| KernelError::TaskNotFound(id.clone()))
    }

    fn ordered(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    transitions: broadcast::Sender<TaskTransition>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        Self::with_state(StoreState::new(), clock, events)
    }

    fn with_state(state: StoreState, clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(state),
            transitions,
            clock,
            ids,
            events,
        }
    }

    /// Wall clock, no evidence sink.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(NoopEventSink))
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock().await;
        StoreSnapshot {
            tasks: state.ordered().cloned().collect(),
            history: state.history.clone(),
        }
    }

    /// Writes the snapshot as JSON (temp file + rename).
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), KernelError> {
        let snapshot = self.snapshot().await;
        write_atomic(path, &snapshot.to_json()?)
    }

    /// Rebuilds a store from a snapshot written by `save_snapshot`.
    pub fn load_snapshot(
        path: &Path,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, KernelError> {
        let snapshot = StoreSnapshot::read(path)?;

        let mut state = StoreState::new();
        for task in snapshot.tasks {
            for dep in &task.dependencies {
                state.graph.add_dependency(task.id.clone(), dep.clone());
            }
            state.order.push(task.id.clone());
            state.tasks.insert(task.id.clone(), task);
        }
        if let Some(cycle) = state.graph.detect_cycle() {
            return Err(KernelError::DependencyCycle(cycle));
        }
        for transition in &snapshot.history {
            if transition.to_status == TaskStatus::Blocked {
                state
                    .blockers
                    .insert(transition.task_id.clone(), transition.reason.clone());
            } else if transition.from_status == TaskStatus::Blocked {
                state.blockers.remove(&transition.task_id);
            }
        }
        state.history = snapshot.history;
        Ok(Self::with_state(state, clock, events))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, new: NewTask) -> Result<Task, KernelError> {
        if new.id.as_str().trim().is_empty() {
            return Err(KernelError::InvalidTask {
                task_id: new.id,
                message: "id must not be empty".into(),
            });
        }
        if !(1..=10).contains(&new.estimated_complexity) {
            return Err(KernelError::InvalidTask {
                task_id: new.id,
                message: format!(
                    "estimated_complexity must be within 1..=10, got {}",
                    new.estimated_complexity
                ),
            });
        }

        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&new.id) {
            return Err(KernelError::DuplicateTask(new.id));
        }
        for dep in &new.dependencies {
            if dep != &new.id && !state.tasks.contains_key(dep) {
                return Err(KernelError::UnknownDependency {
                    task_id: new.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        // Check the graph with the new edges before committing anything.
        let mut graph = state.graph.clone();
        for dep in &new.dependencies {
            graph.add_dependency(new.id.clone(), dep.clone());
        }
        if let Some(cycle) = graph.detect_cycle() {
            return Err(KernelError::DependencyCycle(cycle));
        }

        let task = Task {
            id: new.id.clone(),
            title: new.title,
            description: new.description,
            status: TaskStatus::Pending,
            dependencies: new.dependencies,
            estimated_complexity: new.estimated_complexity,
            created_at: new.created_at.unwrap_or_else(|| self.clock.now()),
            set_id: new.set_id,
            metadata: new.metadata,
        };
        state.graph = graph;
        state.order.push(task.id.clone());
        state.tasks.insert(task.id.clone(), task.clone());

        debug!(task_id = %task.id, deps = task.dependencies.len(), "task created");
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Task, KernelError> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| KernelError::TaskNotFound(id.clone()))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.state.lock().await;
        state.ordered().filter(|t| filter.matches(t)).cloned().collect()
    }

    async fn transition(
        &self,
        id: &TaskId,
        to: TaskStatus,
        reason: &str,
    ) -> Result<TaskTransition, KernelError> {
        let transition = {
            let mut state = self.state.lock().await;
            let task = state
                .tasks
                .get(id)
                .ok_or_else(|| KernelError::TaskNotFound(id.clone()))?;
            let from = task.status;
            if !from.can_transition_to(to) {
                return Err(KernelError::InvalidTransition {
                    task_id: id.clone(),
                    from,
                    to,
                });
            }
            if from == TaskStatus::Pending && to == TaskStatus::InProgress {
                let pending = state.pending_dependencies(task);
                if !pending.is_empty() {
                    return Err(KernelError::DependenciesUnmet {
                        task_id: id.clone(),
                        pending,
                    });
                }
            }

            let transition = TaskTransition {
                id: self.ids.transition_id(),
                task_id: id.clone(),
                from_status: from,
                to_status: to,
                at: self.clock.now(),
                reason: reason.to_string(),
            };
            state.task_mut(id)?.status = to;
            if to == TaskStatus::Blocked {
                state.blockers.insert(id.clone(), reason.to_string());
            } else if from == TaskStatus::Blocked {
                state.blockers.remove(id);
            }
            state.history.push(transition.clone());
            transition
        }; // Lock released here

        info!(task_id = %id, from = %transition.from_status, to = %to, reason, "transition");
        self.events
            .emit(&DomainEvent::TaskTransitioned(transition.clone()));
        // ignore send error: no subscribers is fine
        let _ = self.transitions.send(transition.clone());
        Ok(transition)
    }

    async fn scheduling_buckets(&self) -> SchedulingBuckets {
        let state = self.state.lock().await;
        let mut buckets = SchedulingBuckets::default();
        for task in state.ordered() {
            match task.status {
                TaskStatus::NeedsReview => buckets.review.push(task.clone()),
                TaskStatus::NeedsImprovement => buckets.fixup.push(task.clone()),
                TaskStatus::Pending => {
                    if state.pending_dependencies(task).is_empty() {
                        buckets.ready.push(task.clone());
                    }
                }
                TaskStatus::InProgress | TaskStatus::Blocked | TaskStatus::Done => {}
            }
        }
        buckets
    }

    async fn set_metadata(&self, id: &TaskId, key: &str, value: Value) -> Result<(), KernelError> {
        let mut state = self.state.lock().await;
        state.task_mut(id)?.metadata.insert(key.to_string(), value);
        Ok(())
    }

    async fn record_failure(&self, id: &TaskId) -> Result<u32, KernelError> {
        let mut state = self.state.lock().await;
        let task = state.task_mut(id)?;
        let count = task.failure_count().saturating_add(1);
        task.metadata
            .insert(meta::FAILURE_COUNT.to_string(), Value::from(count));
        Ok(count)
    }

    async fn history(&self, id: &TaskId) -> Vec<TaskTransition> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .filter(|t| &t.task_id == id)
            .cloned()
            .collect()
    }

    async fn loop_snapshot(&self) -> LoopSnapshot {
        let state = self.state.lock().await;
        let mut snapshot = LoopSnapshot::default();
        for task in state.ordered() {
            match task.status {
                TaskStatus::Done => snapshot.completed.push(task.id.clone()),
                TaskStatus::InProgress => snapshot.in_progress.push(task.id.clone()),
                TaskStatus::Blocked => snapshot.blocked.push(task.id.clone()),
                _ => {}
            }
        }
        snapshot.blockers = state
            .blockers
            .iter()
            .map(|(id, reason)| format!("{id}: {reason}"))
            .collect();
        snapshot
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskTransition> {
        self.transitions.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, MemoryEventSink};
    use chrono::{TimeZone, Utc};

    fn store() -> InMemoryTaskStore {
        InMemoryTaskStore::in_memory()
    }

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = store();
        let created = store
            .create_task(NewTask::new("a", "Write docs").with_complexity(2))
            .await
            .unwrap();
        assert_eq!(created.status, TaskStatus::Pending);

        let fetched = store.get_task(&TaskId::new("a")).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn duplicate_and_unknown_dependency_are_rejected() {
        let store = store();
        store.create_task(NewTask::new("a", "A")).await.unwrap();

        let dup = store.create_task(NewTask::new("a", "again")).await;
        assert!(matches!(dup, Err(KernelError::DuplicateTask(_))));

        let unknown = store
            .create_task(NewTask::new("b", "B").depends_on("ghost"))
            .await;
        assert!(matches!(unknown, Err(KernelError::UnknownDependency { .. })));
    }

    #[tokio::test]
    async fn self_dependency_is_a_cycle() {
        let store = store();
        let err = store
            .create_task(NewTask::new("a", "A").depends_on("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::DependencyCycle(_)));
        assert!(store.list_tasks(&TaskFilter::all()).await.is_empty());
    }

    #[tokio::test]
    async fn complexity_out_of_range_is_rejected() {
        let store = store();
        let err = store
            .create_task(NewTask::new("a", "A").with_complexity(11))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidTask { .. }));
    }

    #[tokio::test]
    async fn buckets_follow_dependencies() {
        let store = store();
        store.create_task(NewTask::new("a", "A")).await.unwrap();
        store
            .create_task(NewTask::new("b", "B").depends_on("a"))
            .await
            .unwrap();

        let buckets = store.scheduling_buckets().await;
        assert_eq!(ids(&buckets.ready), vec!["a"]);

        let a = TaskId::new("a");
        store.transition(&a, TaskStatus::InProgress, "start").await.unwrap();
        store.transition(&a, TaskStatus::Done, "finished").await.unwrap();

        let buckets = store.scheduling_buckets().await;
        assert_eq!(ids(&buckets.ready), vec!["b"]);
    }

    #[tokio::test]
    async fn buckets_classify_review_and_fixup() {
        let store = store();
        for id in ["r", "f", "p"] {
            store.create_task(NewTask::new(id, id)).await.unwrap();
        }
        let r = TaskId::new("r");
        let f = TaskId::new("f");
        store.transition(&r, TaskStatus::InProgress, "go").await.unwrap();
        store.transition(&r, TaskStatus::NeedsReview, "ready").await.unwrap();
        store.transition(&f, TaskStatus::InProgress, "go").await.unwrap();
        store
            .transition(&f, TaskStatus::NeedsImprovement, "tests failing")
            .await
            .unwrap();

        let buckets = store.scheduling_buckets().await;
        assert_eq!(ids(&buckets.review), vec!["r"]);
        assert_eq!(ids(&buckets.fixup), vec!["f"]);
        assert_eq!(ids(&buckets.ready), vec!["p"]);
    }

    #[tokio::test]
    async fn invalid_transition_leaves_history_untouched() {
        let store = store();
        store.create_task(NewTask::new("a", "A")).await.unwrap();
        let a = TaskId::new("a");

        let err = store
            .transition(&a, TaskStatus::Done, "skip")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Done,
                ..
            }
        ));
        assert!(store.history(&a).await.is_empty());
    }

    #[tokio::test]
    async fn starting_with_unfinished_dependency_is_rejected() {
        let store = store();
        store.create_task(NewTask::new("a", "A")).await.unwrap();
        store
            .create_task(NewTask::new("b", "B").depends_on("a"))
            .await
            .unwrap();

        let err = store
            .transition(&TaskId::new("b"), TaskStatus::InProgress, "eager")
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::DependenciesUnmet { .. }));
    }

    #[tokio::test]
    async fn transitions_are_appended_in_order_and_broadcast() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let sink = Arc::new(MemoryEventSink::new());
        let store = InMemoryTaskStore::new(clock.clone(), sink.clone());
        let mut rx = store.subscribe();

        store.create_task(NewTask::new("a", "A")).await.unwrap();
        let a = TaskId::new("a");
        store.transition(&a, TaskStatus::InProgress, "go").await.unwrap();
        clock.advance(chrono::Duration::seconds(5));
        store.transition(&a, TaskStatus::Blocked, "waiting on api key").await.unwrap();
        store.transition(&a, TaskStatus::Pending, "unblocked").await.unwrap();

        let history = store.history(&a).await;
        let path: Vec<(TaskStatus, TaskStatus)> =
            history.iter().map(|t| (t.from_status, t.to_status)).collect();
        assert_eq!(
            path,
            vec![
                (TaskStatus::Pending, TaskStatus::InProgress),
                (TaskStatus::InProgress, TaskStatus::Blocked),
                (TaskStatus::Blocked, TaskStatus::Pending),
            ]
        );
        assert_eq!(history[1].at, start + chrono::Duration::seconds(5));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.to_status, TaskStatus::InProgress);
        assert_eq!(sink.count("task_transitioned"), 3);
    }

    #[tokio::test]
    async fn loop_snapshot_reports_blockers() {
        let store = store();
        store.create_task(NewTask::new("a", "A")).await.unwrap();
        store.create_task(NewTask::new("b", "B")).await.unwrap();
        let a = TaskId::new("a");
        store.transition(&a, TaskStatus::InProgress, "go").await.unwrap();
        store.transition(&a, TaskStatus::Blocked, "needs credentials").await.unwrap();

        let snapshot = store.loop_snapshot().await;
        assert_eq!(snapshot.blocked, vec![a.clone()]);
        assert_eq!(snapshot.blockers, vec!["a: needs credentials".to_string()]);
        assert!(snapshot.in_progress.is_empty());
    }

    #[tokio::test]
    async fn record_failure_increments_metadata() {
        let store = store();
        store.create_task(NewTask::new("a", "A")).await.unwrap();
        let a = TaskId::new("a");
        assert_eq!(store.record_failure(&a).await.unwrap(), 1);
        assert_eq!(store.record_failure(&a).await.unwrap(), 2);
        assert_eq!(store.get_task(&a).await.unwrap().failure_count(), 2);
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/store.json");
        let store = store();
        store.create_task(NewTask::new("a", "A")).await.unwrap();
        store
            .create_task(NewTask::new("b", "B").depends_on("a"))
            .await
            .unwrap();
        let a = TaskId::new("a");
        store.transition(&a, TaskStatus::InProgress, "go").await.unwrap();
        store.save_snapshot(&path).await.unwrap();

        let loaded = InMemoryTaskStore::load_snapshot(
            &path,
            Arc::new(SystemClock),
            Arc::new(NoopEventSink),
        )
        .unwrap();
        assert_eq!(
            loaded.get_task(&a).await.unwrap().status,
            TaskStatus::InProgress
        );
        assert_eq!(loaded.history(&a).await.len(), 1);
        assert!(loaded.scheduling_buckets().await.ready.is_empty());
    }
}
