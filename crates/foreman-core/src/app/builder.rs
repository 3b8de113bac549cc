//! KernelBuilder - カーネルの構築とワイヤリング
//!
//! # ポイント
//! - Builder パターンで ports と設定を組み立てる
//! - 起動時検証（Fail-fast 設計）: 設定の検証とワーカーの対応付け
//! - 明確なエラーメッセージ

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::status::KernelStatus;
use super::supervisor::Supervisor;
use crate::config::KernelConfig;
use crate::dispatch::{AgentDispatcher, WorkerPool};
use crate::domain::{KernelError, NewTask, Task};
use crate::gate::{PhaseExecutionGate, PhaseLedger};
use crate::guardrail::{GuardrailContext, GuardrailEngine};
use crate::idempotency::IdempotencyCache;
use crate::loop_detector::LoopDetector;
use crate::ports::{
    Clock, EventSink, JsonlEventSink, NoopEventSink, SystemClock, TaskStore, UlidGenerator,
    WorkerProvider,
};
use crate::scheduler::TaskScheduler;
use crate::store::InMemoryTaskStore;

/// KernelBuilder はカーネルを構築
///
/// # 使用例
/// ```ignore
/// let kernel = KernelBuilder::new(config)
///     .worker("primary-1", Arc::new(MyProvider::new()))
///     .build()?;
/// let outcome = kernel.supervisor().run().await;
/// ```
///
/// # Fail-fast 設計
/// - `config.validate()` を build() 時に実行
/// - 設定された全ワーカー id に provider が登録されているかチェック
/// - 設定にないワーカー id の登録も拒否
pub struct KernelBuilder {
    config: KernelConfig,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventSink>>,
    store: Option<Arc<dyn TaskStore>>,
    workers: BTreeMap<String, Arc<dyn WorkerProvider>>,
    guardrails: Option<(Arc<GuardrailEngine>, GuardrailContext)>,
}

/// BuildError はカーネル構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid kernel configuration: {0}")]
    Invalid(#[from] KernelError),

    #[error("Missing worker providers: {0:?}. These workers are configured but have no provider.")]
    MissingWorkers(Vec<String>),

    #[error("Unconfigured workers: {0:?}. Providers were registered for unknown worker ids.")]
    UnconfiguredWorkers(Vec<String>),
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            clock: None,
            events: None,
            store: None,
            workers: BTreeMap::new(),
            guardrails: None,
        }
    }

    /// 既定は SystemClock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 既定は `supervisor.evidence_path` の JSONL、未設定なら Noop
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// 既定は InMemoryTaskStore
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 設定済みのワーカー id に provider を割り当てる
    pub fn worker(mut self, id: impl Into<String>, worker: Arc<dyn WorkerProvider>) -> Self {
        self.workers.insert(id.into(), worker);
        self
    }

    /// implement / verify の前に block 級 guardrail を実行する
    pub fn guardrails(mut self, engine: Arc<GuardrailEngine>, context: GuardrailContext) -> Self {
        self.guardrails = Some((engine, context));
        self
    }

    /// # 検証
    /// - 設定値の範囲チェック
    /// - 設定ワーカー集合 = 登録 provider 集合
    pub fn build(self) -> Result<Kernel, BuildError> {
        let Self {
            config,
            clock,
            events,
            store,
            mut workers,
            guardrails,
        } = self;
        config.validate()?;

        let missing: Vec<String> = config
            .dispatcher
            .workers
            .iter()
            .filter(|w| !workers.contains_key(&w.id))
            .map(|w| w.id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingWorkers(missing));
        }
        let unconfigured: Vec<String> = workers
            .keys()
            .filter(|id| !config.dispatcher.workers.iter().any(|w| &w.id == *id))
            .cloned()
            .collect();
        if !unconfigured.is_empty() {
            return Err(BuildError::UnconfiguredWorkers(unconfigured));
        }

        let clock: Arc<dyn Clock> = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events: Arc<dyn EventSink> = match events {
            Some(events) => events,
            None => match &config.supervisor.evidence_path {
                Some(path) => Arc::new(JsonlEventSink::open(path)?),
                None => Arc::new(NoopEventSink),
            },
        };
        let store: Arc<dyn TaskStore> = store.unwrap_or_else(|| {
            Arc::new(InMemoryTaskStore::new(Arc::clone(&clock), Arc::clone(&events)))
        });

        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&store),
            &config.scheduler,
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let idempotency = Arc::new(IdempotencyCache::new(
            config.idempotency.clone(),
            Arc::clone(&clock),
        ));
        let ledger = Arc::new(match &config.gate.ledger_path {
            Some(path) => PhaseLedger::open(path)?,
            None => PhaseLedger::in_memory(),
        });
        let mut gate = PhaseExecutionGate::new(
            config.gate.clone(),
            config.commands.clone(),
            Arc::clone(&store),
            Arc::clone(&idempotency),
            ledger,
            Arc::clone(&clock),
            Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            Arc::clone(&events),
        );
        if let Some((engine, context)) = guardrails {
            gate = gate.with_guardrails(engine, context);
        }
        let gate = Arc::new(gate);

        let mut pool = WorkerPool::new(config.dispatcher.provider_weights.clone());
        for worker in &config.dispatcher.workers {
            if let Some(provider) = workers.remove(&worker.id) {
                pool.add(worker, provider)?;
            }
        }
        info!(
            workers = pool.len(),
            heavy_task_limit = config.scheduler.heavy_task_limit,
            max_parallel = config.supervisor.max_parallel,
            "kernel built"
        );
        let dispatcher = Arc::new(AgentDispatcher::new(
            Arc::clone(&scheduler),
            Arc::clone(&store),
            Arc::clone(&gate),
            pool,
            Arc::clone(&clock),
            Arc::clone(&events),
        ));

        Ok(Kernel {
            config,
            clock,
            events,
            store,
            scheduler,
            idempotency,
            gate,
            dispatcher,
        })
    }
}

/// Kernel は組み立て済みのコンポーネント一式
pub struct Kernel {
    pub config: KernelConfig,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventSink>,
    pub store: Arc<dyn TaskStore>,
    pub scheduler: Arc<TaskScheduler>,
    pub idempotency: Arc<IdempotencyCache>,
    pub gate: Arc<PhaseExecutionGate>,
    pub dispatcher: Arc<AgentDispatcher>,
}

impl Kernel {
    /// Creates tasks in order; dependencies must precede their dependents.
    pub async fn submit(&self, tasks: Vec<NewTask>) -> Result<Vec<Task>, KernelError> {
        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            created.push(self.store.create_task(task).await?);
        }
        Ok(created)
    }

    /// 新しいランの supervisor（ループ検出の窓は毎回空から）
    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(
            self.config.supervisor.clone(),
            LoopDetector::new(self.config.loop_detector.clone(), Arc::clone(&self.clock)),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&self.events),
        )
    }

    pub async fn status(&self) -> KernelStatus {
        KernelStatus::collect(self.store.as_ref(), &self.scheduler, &self.dispatcher).await
    }
}
