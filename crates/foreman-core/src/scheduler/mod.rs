//! Scheduler - 優先度付きキューとチェックアウト管理
//!
//! # 設計原則
//! - The busy set and the heavy counter live behind one mutex, so checkout,
//!   release and complete are atomic with respect to each other.
//! - The queue is recomputed from the store on every pass; nothing here is
//!   persisted.
//! - Heavy tasks over the limit are deferred in place and served first once a
//!   heavy slot frees up.

pub mod research;
pub mod resource;
pub mod scoring;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SchedulerConfig, SchedulerWeights};
use crate::domain::{DomainEvent, KernelError, Task, TaskId, TaskStatus, TaskTransition};
use crate::ports::{Clock, EventSink, TaskStore};
use crate::store::SchedulingBuckets;

pub use self::research::{ResearchAssessment, ResearchSignal, ResearchTrigger, assess};
pub use self::resource::{ClassificationSource, ResourceClassification, ResourceProfile, classify};
pub use self::scoring::{ScheduleReason, priority};

/// Position of a task among the queued members of its set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchInfo {
    pub set_id: String,
    /// 0-based, in queue order.
    pub position: usize,
    pub size: usize,
}

/// Scheduler view of a runnable task. Recomputed every pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledTask {
    pub task: Task,
    pub priority: f64,
    pub reason: ScheduleReason,
    pub resource_profile: ResourceProfile,
    pub resource_source: ClassificationSource,
    pub batch_info: Option<BatchInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    pub busy: Vec<TaskId>,
    pub heavy_in_flight: usize,
    pub heavy_limit: usize,
    pub deferred: Vec<TaskId>,
    pub completed: usize,
}

struct SchedulerState {
    busy: HashMap<TaskId, ResourceProfile>,
    heavy_in_flight: usize,
    heavy_limit: usize,
    /// Heavy tasks passed over because the limit was reached, oldest first.
    deferred: VecDeque<TaskId>,
    completed: HashSet<TaskId>,
    research: ResearchTrigger,
}

impl SchedulerState {
    fn checkout(&mut self, id: TaskId, profile: ResourceProfile) {
        if profile.is_heavy() {
            self.heavy_in_flight += 1;
        }
        self.deferred.retain(|d| d != &id);
        self.busy.insert(id, profile);
    }

    fn check_in(&mut self, id: &TaskId) -> bool {
        match self.busy.remove(id) {
            Some(profile) => {
                if profile.is_heavy() {
                    self.heavy_in_flight = self.heavy_in_flight.saturating_sub(1);
                }
                true
            }
            None => false,
        }
    }

    fn excluded(&self, id: &TaskId) -> bool {
        self.busy.contains_key(id) || self.completed.contains(id)
    }
}

fn clamp_limit(requested: i64) -> Result<usize, usize> {
    if requested <= 0 {
        Err(1)
    } else {
        Ok(usize::try_from(requested).unwrap_or(usize::MAX))
    }
}

/// Ranks the buckets into one queue, skipping excluded ids.
pub fn build_queue(
    buckets: SchedulingBuckets,
    weights: &SchedulerWeights,
    now: DateTime<Utc>,
    excluded: impl Fn(&TaskId) -> bool,
) -> Vec<ScheduledTask> {
    let SchedulingBuckets {
        review,
        fixup,
        ready,
    } = buckets;
    let grouped = [
        (review, ScheduleReason::RequiresReview),
        (fixup, ScheduleReason::RequiresFollowUp),
        (ready, ScheduleReason::DependenciesCleared),
    ];

    let mut queue: Vec<ScheduledTask> = grouped
        .into_iter()
        .flat_map(|(tasks, reason)| tasks.into_iter().map(move |t| (t, reason)))
        .filter(|(task, _)| !excluded(&task.id))
        .map(|(task, reason)| {
            let classification = classify(&task);
            ScheduledTask {
                priority: priority(&task, reason, weights, now),
                reason,
                resource_profile: classification.profile,
                resource_source: classification.source,
                batch_info: None,
                task,
            }
        })
        .collect();
    queue.sort_by(|a, b| scoring::queue_order((&a.task, a.priority), (&b.task, b.priority)));

    let mut sizes: BTreeMap<String, usize> = BTreeMap::new();
    for set_id in queue.iter().filter_map(|s| s.task.set_id.clone()) {
        *sizes.entry(set_id).or_default() += 1;
    }
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for scheduled in &mut queue {
        if let Some(set_id) = scheduled.task.set_id.clone() {
            let position = seen.entry(set_id.clone()).or_default();
            scheduled.batch_info = Some(BatchInfo {
                size: sizes.get(&set_id).copied().unwrap_or(1),
                position: *position,
                set_id,
            });
            *position += 1;
        }
    }
    queue
}

pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    weights: RwLock<SchedulerWeights>,
    state: Mutex<SchedulerState>,
}

impl TaskScheduler {
    /// A non-positive `heavy_task_limit` is clamped to 1 here; use
    /// [`set_heavy_task_limit`](Self::set_heavy_task_limit) to get the error.
    pub fn new(
        store: Arc<dyn TaskStore>,
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let heavy_limit = clamp_limit(config.heavy_task_limit).unwrap_or_else(|c| c);
        Self {
            store,
            clock,
            events,
            weights: RwLock::new(config.weights.clone()),
            state: Mutex::new(SchedulerState {
                busy: HashMap::new(),
                heavy_in_flight: 0,
                heavy_limit,
                deferred: VecDeque::new(),
                completed: HashSet::new(),
                research: ResearchTrigger::new(config.research.clone()),
            }),
        }
    }

    /// Checks out the best runnable task, or `None` when nothing can run now.
    ///
    /// The state lock is held across the store query so two concurrent
    /// callers can never receive the same task.
    pub async fn take_next(&self) -> Option<ScheduledTask> {
        let mut state = self.state.lock().await;
        let buckets = self.store.scheduling_buckets().await;
        let weights = self.weights.read().await.clone();
        let now = self.clock.now();

        let queue = build_queue(buckets, &weights, now, |id| state.excluded(id));
        self.emit_research(&mut state.research, &queue, now);

        state
            .deferred
            .retain(|id| queue.iter().any(|s| &s.task.id == id));
        let heavy_free = state.heavy_in_flight < state.heavy_limit;

        let mut pick = None;
        if heavy_free {
            pick = state
                .deferred
                .front()
                .and_then(|id| queue.iter().position(|s| &s.task.id == id));
        }
        if pick.is_none() {
            for (idx, scheduled) in queue.iter().enumerate() {
                if scheduled.resource_profile.is_heavy() && !heavy_free {
                    if !state.deferred.contains(&scheduled.task.id) {
                        debug!(
                            task_id = %scheduled.task.id,
                            heavy_in_flight = state.heavy_in_flight,
                            "heavy task deferred"
                        );
                        state.deferred.push_back(scheduled.task.id.clone());
                    }
                    continue;
                }
                pick = Some(idx);
                break;
            }
        }

        let scheduled = queue.into_iter().nth(pick?)?;
        state.checkout(scheduled.task.id.clone(), scheduled.resource_profile);
        debug!(
            task_id = %scheduled.task.id,
            priority = scheduled.priority,
            profile = %scheduled.resource_profile,
            "task checked out"
        );
        Some(scheduled)
    }

    /// Ordered queue of what could run now, without checking anything out.
    pub async fn plan(&self) -> Vec<ScheduledTask> {
        let state = self.state.lock().await;
        let buckets = self.store.scheduling_buckets().await;
        let weights = self.weights.read().await.clone();
        build_queue(buckets, &weights, self.clock.now(), |id| state.excluded(id))
    }

    /// Returns a checked-out task to the pool unchanged.
    pub async fn release(&self, id: &TaskId) -> bool {
        let released = self.state.lock().await.check_in(id);
        if released {
            debug!(task_id = %id, "task released");
        }
        released
    }

    /// Removes the task from scheduling for good.
    pub async fn complete(&self, id: &TaskId) {
        let mut state = self.state.lock().await;
        state.check_in(id);
        state.deferred.retain(|d| d != id);
        state.completed.insert(id.clone());
        debug!(task_id = %id, "task completed");
    }

    pub async fn is_checked_out(&self, id: &TaskId) -> bool {
        self.state.lock().await.busy.contains_key(id)
    }

    /// Non-positive limits are clamped to 1 and reported as an error.
    pub async fn set_heavy_task_limit(&self, limit: i64) -> Result<(), KernelError> {
        let mut state = self.state.lock().await;
        match clamp_limit(limit) {
            Ok(limit) => {
                state.heavy_limit = limit;
                info!(heavy_task_limit = limit, "heavy task limit updated");
                Ok(())
            }
            Err(clamped) => {
                state.heavy_limit = clamped;
                warn!(requested = limit, clamped, "heavy task limit clamped");
                Err(KernelError::InvalidResourceLimit {
                    requested: limit,
                    clamped,
                })
            }
        }
    }

    pub async fn update_weights(&self, weights: SchedulerWeights) {
        *self.weights.write().await = weights;
        info!("scheduler weights updated");
    }

    pub async fn weights(&self) -> SchedulerWeights {
        self.weights.read().await.clone()
    }

    /// A task that reaches `done` while checked out is completed.
    pub async fn observe_transition(&self, transition: &TaskTransition) {
        if transition.to_status == TaskStatus::Done {
            self.complete(&transition.task_id).await;
        }
    }

    /// Feeds store transitions into [`observe_transition`](Self::observe_transition)
    /// until the store goes away.
    pub fn watch_transitions(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.store.subscribe();
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(transition) => scheduler.observe_transition(&transition).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "scheduler lagged behind transitions");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock().await;
        let mut busy: Vec<TaskId> = state.busy.keys().cloned().collect();
        busy.sort();
        SchedulerSnapshot {
            busy,
            heavy_in_flight: state.heavy_in_flight,
            heavy_limit: state.heavy_limit,
            deferred: state.deferred.iter().cloned().collect(),
            completed: state.completed.len(),
        }
    }

    fn emit_research(
        &self,
        trigger: &mut ResearchTrigger,
        queue: &[ScheduledTask],
        now: DateTime<Utc>,
    ) {
        for scheduled in queue {
            if let Some(signal) = trigger.evaluate(&scheduled.task, now) {
                info!(
                    task_id = %signal.task_id,
                    confidence = signal.confidence,
                    hints = ?signal.hints,
                    "deeper investigation recommended"
                );
                self.events.emit(&DomainEvent::ResearchRecommended(signal));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, meta};
    use crate::ports::{ManualClock, MemoryEventSink};
    use crate::store::InMemoryTaskStore;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        scheduler: Arc<TaskScheduler>,
        clock: Arc<ManualClock>,
        events: Arc<MemoryEventSink>,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn fixture(heavy_task_limit: i64) -> Fixture {
        let clock = Arc::new(ManualClock::new(start()));
        let events = Arc::new(MemoryEventSink::new());
        let store = Arc::new(InMemoryTaskStore::new(clock.clone(), events.clone()));
        let config = SchedulerConfig {
            heavy_task_limit,
            ..SchedulerConfig::default()
        };
        let scheduler = Arc::new(TaskScheduler::new(
            store.clone(),
            &config,
            clock.clone(),
            events.clone(),
        ));
        Fixture {
            store,
            scheduler,
            clock,
            events,
        }
    }

    fn heavy(id: &str) -> NewTask {
        NewTask::new(id, format!("Backfill {id}"))
            .with_metadata(meta::RESOURCE_PROFILE, json!("heavy"))
            .created(start())
    }

    fn light(id: &str) -> NewTask {
        NewTask::new(id, format!("Docs {id}"))
            .with_complexity(2)
            .created(start())
    }

    #[tokio::test]
    async fn heavy_limit_defers_until_completion() {
        let f = fixture(1);
        f.store.create_task(heavy("h1")).await.unwrap();
        f.store.create_task(heavy("h2")).await.unwrap();

        let first = f.scheduler.take_next().await.expect("h1");
        assert_eq!(first.task.id.as_str(), "h1");
        assert_eq!(first.resource_profile, ResourceProfile::Heavy);
        assert!(f.scheduler.take_next().await.is_none());
        assert_eq!(f.scheduler.snapshot().await.deferred, vec![TaskId::new("h2")]);

        f.scheduler.complete(&first.task.id).await;
        let second = f.scheduler.take_next().await.expect("h2");
        assert_eq!(second.task.id.as_str(), "h2");
    }

    #[tokio::test]
    async fn lighter_tasks_flow_while_heavy_is_deferred() {
        let f = fixture(1);
        f.store.create_task(heavy("h1")).await.unwrap();
        f.store.create_task(heavy("h2")).await.unwrap();
        f.store.create_task(light("l1")).await.unwrap();

        let mut taken = Vec::new();
        while let Some(s) = f.scheduler.take_next().await {
            taken.push(s.task.id.to_string());
        }
        taken.sort();
        assert_eq!(taken, vec!["h1", "l1"]);
        assert_eq!(f.scheduler.snapshot().await.heavy_in_flight, 1);
    }

    #[tokio::test]
    async fn deferred_heavy_task_is_served_before_newer_heavy_work() {
        let f = fixture(1);
        f.store.create_task(heavy("h1")).await.unwrap();
        f.store.create_task(heavy("h2")).await.unwrap();
        let h1 = f.scheduler.take_next().await.unwrap();
        assert!(f.scheduler.take_next().await.is_none());

        // A higher-priority heavy task shows up while h2 waits.
        f.store
            .create_task(
                heavy("h0")
                    .with_complexity(1)
                    .created(start() - Duration::days(9)),
            )
            .await
            .unwrap();
        f.scheduler.release(&h1.task.id).await;
        f.scheduler.complete(&h1.task.id).await;

        let next = f.scheduler.take_next().await.unwrap();
        assert_eq!(next.task.id.as_str(), "h2");
    }

    #[tokio::test]
    async fn checked_out_task_is_invisible_until_released() {
        let f = fixture(1);
        f.store.create_task(light("a")).await.unwrap();

        let a = f.scheduler.take_next().await.unwrap();
        assert!(f.scheduler.take_next().await.is_none());
        assert!(f.scheduler.is_checked_out(&a.task.id).await);

        assert!(f.scheduler.release(&a.task.id).await);
        assert!(!f.scheduler.release(&a.task.id).await);
        assert_eq!(f.scheduler.take_next().await.unwrap().task.id, a.task.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_take_next_never_duplicates() {
        let f = fixture(8);
        for n in 0..20 {
            f.store
                .create_task(NewTask::new(format!("t{n:02}"), "Wire module"))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..32 {
            let scheduler = f.scheduler.clone();
            handles.push(tokio::spawn(async move { scheduler.take_next().await }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            if let Some(s) = handle.await.unwrap() {
                ids.push(s.task.id);
            }
        }
        assert_eq!(ids.len(), 20);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }

    #[tokio::test]
    async fn heavy_checkouts_never_exceed_limit() {
        let f = fixture(2);
        for n in 0..6 {
            f.store.create_task(heavy(&format!("h{n}"))).await.unwrap();
            f.store.create_task(light(&format!("l{n}"))).await.unwrap();
        }

        let mut held: Vec<ScheduledTask> = Vec::new();
        for round in 0..30 {
            if round % 3 == 2
                && let Some(s) = held.pop()
            {
                f.scheduler.release(&s.task.id).await;
            }
            if let Some(s) = f.scheduler.take_next().await {
                held.push(s);
            }
            let heavy_held = held
                .iter()
                .filter(|s| s.resource_profile.is_heavy())
                .count();
            assert!(heavy_held <= 2, "round {round}: {heavy_held} heavy");
            assert_eq!(f.scheduler.snapshot().await.heavy_in_flight, heavy_held);
        }
    }

    #[tokio::test]
    async fn queue_orders_review_first_and_marks_batches() {
        let f = fixture(1);
        f.store
            .create_task(NewTask::new("a", "Wire a").in_set("s1").created(start()))
            .await
            .unwrap();
        f.store
            .create_task(
                NewTask::new("b", "Wire b")
                    .in_set("s1")
                    .created(start() + Duration::minutes(1)),
            )
            .await
            .unwrap();
        f.store
            .create_task(NewTask::new("r", "Review me").created(start()))
            .await
            .unwrap();
        let r = TaskId::new("r");
        f.store.transition(&r, TaskStatus::InProgress, "start").await.unwrap();
        f.store.transition(&r, TaskStatus::NeedsReview, "ready").await.unwrap();

        let plan = f.scheduler.plan().await;
        let ids: Vec<&str> = plan.iter().map(|s| s.task.id.as_str()).collect();
        assert_eq!(ids, vec!["r", "a", "b"]);
        assert_eq!(plan[0].reason, ScheduleReason::RequiresReview);
        assert_eq!(
            plan[2].batch_info,
            Some(BatchInfo {
                set_id: "s1".into(),
                position: 1,
                size: 2
            })
        );
        assert!(f.scheduler.snapshot().await.busy.is_empty());
    }

    #[tokio::test]
    async fn weights_can_be_replaced_at_runtime() {
        let f = fixture(1);
        f.store.create_task(light("easy")).await.unwrap();
        f.store
            .create_task(
                NewTask::new("old", "Wire old")
                    .with_complexity(6)
                    .created(start() - Duration::days(2)),
            )
            .await
            .unwrap();
        assert_eq!(f.scheduler.plan().await[0].task.id.as_str(), "easy");

        f.scheduler
            .update_weights(SchedulerWeights {
                complexity_bias: 0.0,
                staleness_bias: 5.0,
                ..SchedulerWeights::default()
            })
            .await;
        assert_eq!(f.scheduler.plan().await[0].task.id.as_str(), "old");
    }

    #[tokio::test]
    async fn non_positive_limit_is_clamped_and_reported() {
        let f = fixture(3);
        let err = f.scheduler.set_heavy_task_limit(0).await.unwrap_err();
        assert!(matches!(
            err,
            KernelError::InvalidResourceLimit {
                requested: 0,
                clamped: 1
            }
        ));
        assert_eq!(f.scheduler.snapshot().await.heavy_limit, 1);
        f.scheduler.set_heavy_task_limit(4).await.unwrap();
        assert_eq!(f.scheduler.snapshot().await.heavy_limit, 4);
    }

    #[tokio::test]
    async fn done_transition_completes_checked_out_task() {
        let f = fixture(1);
        f.store.create_task(heavy("h1")).await.unwrap();
        let watcher = f.scheduler.watch_transitions();
        let h1 = f.scheduler.take_next().await.unwrap();

        let id = h1.task.id.clone();
        f.store.transition(&id, TaskStatus::InProgress, "go").await.unwrap();
        let done = f.store.transition(&id, TaskStatus::Done, "ok").await.unwrap();
        f.scheduler.observe_transition(&done).await;

        let snapshot = f.scheduler.snapshot().await;
        assert!(snapshot.busy.is_empty());
        assert_eq!(snapshot.heavy_in_flight, 0);
        assert_eq!(snapshot.completed, 1);
        watcher.abort();
    }

    #[tokio::test]
    async fn research_signal_respects_cooldown() {
        let f = fixture(1);
        f.store
            .create_task(
                NewTask::new("r1", "Investigate cache architecture").created(start()),
            )
            .await
            .unwrap();

        let s = f.scheduler.take_next().await.unwrap();
        f.scheduler.release(&s.task.id).await;
        f.scheduler.take_next().await.unwrap();
        f.scheduler.release(&s.task.id).await;
        assert_eq!(f.events.count("research_recommended"), 1);

        f.clock.advance(Duration::minutes(31));
        f.scheduler.take_next().await.unwrap();
        assert_eq!(f.events.count("research_recommended"), 2);
    }
}
