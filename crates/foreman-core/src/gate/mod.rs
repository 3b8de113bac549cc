//! PhaseExecutionGate - フェーズ実行と受け入れ判定
//!
//! # 設計
//! - Phases run strictly in order; a phase whose predecessors lack an
//!   accepted record is refused with `PhaseSequenceViolation`.
//! - Each (task, phase) is claimed in the idempotency cache first. A retry of
//!   an accepted phase gets the stored content back without calling a worker.
//! - Rejected content is never recorded. The idempotency key is reopened so
//!   the next attempt runs fresh.

pub mod context;
pub mod ledger;
pub mod template;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub use self::ledger::PhaseLedger;
pub use self::template::{TemplateAnalysis, TemplateVerdict};
use crate::config::{CommandConfig, GateConfig};
use crate::domain::{DomainEvent, KernelError, Phase, PhaseExecutionRecord, Task, meta};
use crate::guardrail::{GuardrailContext, GuardrailEngine, ensure_allowed_command, ensure_command_safe};
use crate::idempotency::IdempotencyCache;
use crate::ports::{Clock, EventSink, IdGenerator, TaskStore, WorkerError, WorkerProvider, WorkerRequest};

/// Idempotency tool name for phase executions.
pub const PHASE_TOOL: &str = "phase_execution";

/// Guardrail id reported when a proposed command fails the command checks.
pub const COMMAND_GUARDRAIL: &str = "command_safety";

/// Line endings unified, trailing whitespace dropped, outer blank lines trimmed.
pub fn normalize_content(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(normalize_content(content).as_bytes()))
}

/// What the cache keeps for an accepted phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AcceptedContent {
    content: String,
    content_hash: String,
    provider_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub content: String,
    pub content_hash: String,
    pub provider_id: String,
    /// Served from the idempotency cache; no worker was called.
    pub replayed: bool,
    /// Present for fresh executions.
    pub record: Option<PhaseExecutionRecord>,
}

struct Preflight {
    engine: Arc<GuardrailEngine>,
    context: GuardrailContext,
}

pub struct PhaseExecutionGate {
    config: GateConfig,
    commands: CommandConfig,
    store: Arc<dyn TaskStore>,
    idempotency: Arc<IdempotencyCache>,
    ledger: Arc<PhaseLedger>,
    preflight: Option<Preflight>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
}

impl PhaseExecutionGate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GateConfig,
        commands: CommandConfig,
        store: Arc<dyn TaskStore>,
        idempotency: Arc<IdempotencyCache>,
        ledger: Arc<PhaseLedger>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            commands,
            store,
            idempotency,
            ledger,
            preflight: None,
            clock,
            ids,
            events,
        }
    }

    /// Blocking guardrails run before workspace-mutating phases.
    pub fn with_guardrails(mut self, engine: Arc<GuardrailEngine>, context: GuardrailContext) -> Self {
        self.preflight = Some(Preflight { engine, context });
        self
    }

    pub fn ledger(&self) -> &Arc<PhaseLedger> {
        &self.ledger
    }

    pub async fn execute(
        &self,
        task: &Task,
        phase: Phase,
        worker: &dyn WorkerProvider,
    ) -> Result<PhaseOutcome, KernelError> {
        let missing = self.ledger.missing_predecessors(&task.id, phase);
        if !missing.is_empty() {
            let err = KernelError::PhaseSequenceViolation {
                task_id: task.id.clone(),
                phase,
                missing,
            };
            self.rejected(task, phase, None, &err);
            return Err(err);
        }

        let input = json!({ "task_id": task.id, "phase": phase });
        let start = self.idempotency.start_request(PHASE_TOOL, &input, None).await?;
        if !start.is_new {
            return self.replay(task, phase, start.cached_response, start.cached_error);
        }

        let mut provider_id = None;
        match self.attempt(task, phase, worker, &mut provider_id).await {
            Ok(outcome) => {
                let cached = AcceptedContent {
                    content: outcome.content.clone(),
                    content_hash: outcome.content_hash.clone(),
                    provider_id: outcome.provider_id.clone(),
                };
                let response = serde_json::to_value(&cached).unwrap_or(Value::Null);
                self.idempotency
                    .record_success(PHASE_TOOL, &input, response, None)
                    .await;
                Ok(outcome)
            }
            Err(err) => {
                self.idempotency
                    .record_transient_failure(PHASE_TOOL, &input, &err.to_string(), None)
                    .await;
                self.rejected(task, phase, provider_id, &err);
                Err(err)
            }
        }
    }

    fn replay(
        &self,
        task: &Task,
        phase: Phase,
        response: Option<Value>,
        error: Option<String>,
    ) -> Result<PhaseOutcome, KernelError> {
        let Some(response) = response else {
            let message = error.unwrap_or_else(|| "no outcome".to_string());
            return Err(KernelError::ProviderError(format!(
                "concurrent {phase} attempt for {} failed: {message}",
                task.id
            )));
        };
        let cached: AcceptedContent = serde_json::from_value(response)
            .map_err(|e| KernelError::io("cached phase content", e))?;
        if let Some(expected) = self.ledger.accepted_hash(&task.id, phase)
            && expected != cached.content_hash
        {
            return Err(KernelError::ContentDrift {
                task_id: task.id.clone(),
                phase,
                expected,
                actual: cached.content_hash,
            });
        }
        debug!(task_id = %task.id, %phase, "phase replayed from cache");
        Ok(PhaseOutcome {
            phase,
            content: cached.content,
            content_hash: cached.content_hash,
            provider_id: cached.provider_id,
            replayed: true,
            record: None,
        })
    }

    async fn attempt(
        &self,
        task: &Task,
        phase: Phase,
        worker: &dyn WorkerProvider,
        provider_id: &mut Option<String>,
    ) -> Result<PhaseOutcome, KernelError> {
        if phase.mutates_workspace() {
            self.run_preflight().await?;
        }

        let request = WorkerRequest {
            prompt: context::build_prompt(task, phase),
            context: context::build_context(
                &self.ledger.records(&task.id),
                self.config.context_budget_chars,
            ),
            tools: self.config.tools.clone(),
            timeout: self.config.worker_timeout(),
        };
        let timeout = request.timeout;
        let response = match tokio::time::timeout(timeout, worker.invoke(request)).await {
            Err(_) | Ok(Err(WorkerError::Timeout)) => {
                return Err(KernelError::Timeout {
                    operation: format!("{phase} worker call"),
                    after: timeout,
                });
            }
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(response)) => response,
        };
        *provider_id = Some(response.provider_id.clone());

        let provider = response.provider_id.trim().to_lowercase();
        if self
            .config
            .disallowed_providers
            .iter()
            .any(|d| d.trim().to_lowercase() == provider)
        {
            return Err(KernelError::ProviderRejected {
                provider_id: response.provider_id,
            });
        }

        for command in &response.proposed_commands {
            ensure_allowed_command(command, &self.commands.allowed_binaries)
                .and_then(|()| ensure_command_safe(command, &self.commands.root))
                .map_err(|err| KernelError::GuardrailBlocked {
                    id: COMMAND_GUARDRAIL.to_string(),
                    details: err.to_string(),
                })?;
        }

        let verdict = template::evaluate(&response.content, &self.config);
        if !verdict.accepted() {
            return Err(KernelError::TemplateRejected {
                task_id: task.id.clone(),
                phase,
                score: verdict.analysis.score,
                threshold: verdict.threshold,
            });
        }

        let hash = content_hash(&response.content);
        if let Some(expected) = self.ledger.accepted_hash(&task.id, phase)
            && expected != hash
        {
            return Err(KernelError::ContentDrift {
                task_id: task.id.clone(),
                phase,
                expected,
                actual: hash,
            });
        }

        let record = PhaseExecutionRecord {
            execution_id: self.ids.execution_id(),
            task_id: task.id.clone(),
            phase,
            content_hash: hash.clone(),
            provider_id: response.provider_id.clone(),
            template_score: verdict.analysis.score,
            accepted: true,
            recorded_at: self.clock.now(),
            summary: context::summarize(&response.content),
        };
        self.ledger.append(record.clone())?;
        self.store
            .set_metadata(&task.id, meta::PHASE, json!(phase.as_str()))
            .await?;
        self.events.emit(&DomainEvent::PhaseAccepted(record.clone()));
        info!(
            task_id = %task.id,
            %phase,
            provider = %record.provider_id,
            score = record.template_score,
            grounded = verdict.grounded,
            "phase accepted"
        );

        Ok(PhaseOutcome {
            phase,
            content: response.content,
            content_hash: hash,
            provider_id: response.provider_id,
            replayed: false,
            record: Some(record),
        })
    }

    async fn run_preflight(&self) -> Result<(), KernelError> {
        let Some(preflight) = &self.preflight else {
            return Ok(());
        };
        let engine = Arc::clone(&preflight.engine);
        let context = preflight.context.clone();
        tokio::task::spawn_blocking(move || engine.preflight(&context))
            .await
            .map_err(|e| KernelError::io("guardrail preflight", e))??;
        Ok(())
    }

    fn rejected(&self, task: &Task, phase: Phase, provider_id: Option<String>, err: &KernelError) {
        warn!(task_id = %task.id, %phase, error = %err, "phase rejected");
        self.events.emit(&DomainEvent::PhaseRejected {
            task_id: task.id.clone(),
            phase,
            provider_id,
            reason: err.to_string(),
            at: self.clock.now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdempotencyConfig;
    use crate::domain::{NewTask, TaskId};
    use crate::guardrail::{
        CheckOutcome, CheckRegistry, Enforcement, GuardrailCatalog, GuardrailCatalogEntry,
        GuardrailCheck, RepoInspector, Severity,
    };
    use crate::ports::{ManualClock, MemoryEventSink, UlidGenerator, WorkerResponse};
    use crate::store::InMemoryTaskStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rstest::rstest;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GOOD: &str = "Split the store into a write path and a read path, keep \
        transitions append-only, and let the scheduler rebuild its queue from \
        the buckets each pass.";

    struct ScriptedWorker {
        responses: Mutex<VecDeque<Result<WorkerResponse, WorkerError>>>,
        calls: AtomicUsize,
        delay: Option<std::time::Duration>,
    }

    impl ScriptedWorker {
        fn new(responses: Vec<Result<WorkerResponse, WorkerError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn answering(content: &str) -> Self {
            Self::new(vec![Ok(WorkerResponse::new(content, "primary"))])
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkerProvider for ScriptedWorker {
        async fn invoke(&self, _request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(WorkerResponse::new(GOOD, "primary")))
        }
    }

    struct Fixture {
        gate: PhaseExecutionGate,
        store: Arc<InMemoryTaskStore>,
        clock: Arc<ManualClock>,
        events: Arc<MemoryEventSink>,
        task: Task,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    async fn fixture_with(config: GateConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(start()));
        let events = Arc::new(MemoryEventSink::new());
        let store = Arc::new(InMemoryTaskStore::new(clock.clone(), events.clone()));
        let task = store
            .create_task(NewTask::new("t-1", "Split the store"))
            .await
            .unwrap();
        let gate = PhaseExecutionGate::new(
            config,
            CommandConfig::default(),
            store.clone(),
            Arc::new(IdempotencyCache::new(IdempotencyConfig::default(), clock.clone())),
            Arc::new(PhaseLedger::in_memory()),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            events.clone(),
        );
        Fixture {
            gate,
            store,
            clock,
            events,
            task,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(GateConfig::default()).await
    }

    async fn accept_through(f: &Fixture, last: Phase) {
        for phase in Phase::SEQUENCE.iter().copied().take(last.index() + 1) {
            let worker = ScriptedWorker::answering(&format!("{GOOD} ({phase})"));
            f.gate.execute(&f.task, phase, &worker).await.unwrap();
        }
    }

    #[tokio::test]
    async fn out_of_order_phase_is_refused() {
        let f = fixture().await;
        let worker = ScriptedWorker::answering(GOOD);
        let err = f.gate.execute(&f.task, Phase::Plan, &worker).await.unwrap_err();
        match err {
            KernelError::PhaseSequenceViolation { missing, .. } => {
                assert_eq!(missing, vec![Phase::Strategize, Phase::Spec]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(worker.calls(), 0);
        assert_eq!(f.events.count("phase_rejected"), 1);
    }

    #[tokio::test]
    async fn accepted_phase_is_recorded_and_advances_task() {
        let f = fixture().await;
        let worker = ScriptedWorker::answering(GOOD);
        let outcome = f.gate.execute(&f.task, Phase::Strategize, &worker).await.unwrap();

        assert!(!outcome.replayed);
        assert_eq!(outcome.content_hash, content_hash(GOOD));
        let record = outcome.record.expect("record");
        assert!(record.accepted);
        assert_eq!(f.gate.ledger().records(&f.task.id), vec![record]);
        assert_eq!(f.events.count("phase_accepted"), 1);

        let stored = f.store.get_task(&f.task.id).await.unwrap();
        assert_eq!(stored.current_phase(), Some("strategize"));
    }

    #[tokio::test]
    async fn retry_of_accepted_phase_replays_without_worker() {
        let f = fixture().await;
        let worker = ScriptedWorker::answering(GOOD);
        f.gate.execute(&f.task, Phase::Strategize, &worker).await.unwrap();

        let again = f.gate.execute(&f.task, Phase::Strategize, &worker).await.unwrap();
        assert!(again.replayed);
        assert_eq!(again.content, GOOD);
        assert_eq!(worker.calls(), 1);
        assert_eq!(f.gate.ledger().records(&f.task.id).len(), 1);
    }

    #[tokio::test]
    async fn context_carries_prior_summaries() {
        struct Capture(Mutex<Vec<String>>);

        #[async_trait]
        impl WorkerProvider for Capture {
            async fn invoke(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
                self.0.lock().unwrap().push(request.context);
                Ok(WorkerResponse::new(format!("{GOOD} {}", request.prompt.len()), "primary"))
            }
        }

        let f = fixture().await;
        let capture = Capture(Mutex::new(Vec::new()));
        f.gate.execute(&f.task, Phase::Strategize, &capture).await.unwrap();
        f.gate.execute(&f.task, Phase::Spec, &capture).await.unwrap();

        let contexts = capture.0.lock().unwrap().clone();
        assert_eq!(contexts[0], "");
        assert!(contexts[1].starts_with("## strategize\nSplit the store"));
    }

    #[rstest]
    #[case::fallback("fallback")]
    #[case::empty("  ")]
    #[case::unknown("Unknown")]
    #[tokio::test]
    async fn sentinel_provider_is_rejected_and_key_reopened(#[case] provider: &str) {
        let f = fixture().await;
        let worker = ScriptedWorker::new(vec![Ok(WorkerResponse::new(GOOD, provider))]);
        let err = f.gate.execute(&f.task, Phase::Strategize, &worker).await.unwrap_err();
        assert!(matches!(err, KernelError::ProviderRejected { .. }));
        assert!(f.gate.ledger().records(&f.task.id).is_empty());

        let retry = f.gate.execute(&f.task, Phase::Strategize, &worker).await.unwrap();
        assert!(!retry.replayed);
        assert_eq!(worker.calls(), 2);
    }

    #[tokio::test]
    async fn template_content_is_rejected() {
        let f = fixture().await;
        let worker = ScriptedWorker::answering(&"lorem ipsum dolor sit amet ".repeat(6));
        let err = f.gate.execute(&f.task, Phase::Strategize, &worker).await.unwrap_err();
        assert!(matches!(err, KernelError::TemplateRejected { .. }), "{err}");
        assert_eq!(err.kind(), crate::domain::ErrorKind::Quality);
        assert!(f.store.get_task(&f.task.id).await.unwrap().current_phase().is_none());
    }

    #[rstest]
    #[case("TBD")]
    #[case("ok")]
    #[tokio::test]
    async fn placeholder_answer_never_reaches_the_ledger(#[case] answer: &str) {
        let f = fixture().await;
        let worker = ScriptedWorker::answering(answer);
        let err = f.gate.execute(&f.task, Phase::Strategize, &worker).await.unwrap_err();
        assert!(matches!(err, KernelError::TemplateRejected { .. }), "{err}");
        assert!(f.gate.ledger().records(&f.task.id).is_empty());
        assert_eq!(f.events.count("phase_accepted"), 0);
    }

    #[tokio::test]
    async fn rerun_with_different_content_is_drift() {
        let f = fixture().await;
        f.gate
            .execute(&f.task, Phase::Strategize, &ScriptedWorker::answering(GOOD))
            .await
            .unwrap();
        // Past the idempotency TTL the phase really runs again.
        f.clock.advance(Duration::minutes(11));

        let same = ScriptedWorker::answering(&format!("{GOOD}\n\n"));
        let outcome = f.gate.execute(&f.task, Phase::Strategize, &same).await.unwrap();
        assert!(!outcome.replayed);

        f.clock.advance(Duration::minutes(11));
        let different = ScriptedWorker::answering(&format!("{GOOD} Also rename it."));
        let err = f.gate.execute(&f.task, Phase::Strategize, &different).await.unwrap_err();
        assert!(matches!(err, KernelError::ContentDrift { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_worker_times_out_and_key_reopens() {
        let f = fixture_with(GateConfig {
            worker_timeout_secs: 5,
            ..GateConfig::default()
        })
        .await;
        let mut slow = ScriptedWorker::answering(GOOD);
        slow.delay = Some(std::time::Duration::from_secs(60));

        let err = f.gate.execute(&f.task, Phase::Strategize, &slow).await.unwrap_err();
        assert!(matches!(err, KernelError::Timeout { .. }), "{err}");

        let fast = ScriptedWorker::answering(GOOD);
        assert!(f.gate.execute(&f.task, Phase::Strategize, &fast).await.is_ok());
    }

    #[tokio::test]
    async fn unsafe_proposed_command_blocks_the_phase() {
        let f = fixture().await;
        let worker = ScriptedWorker::new(vec![Ok(
            WorkerResponse::new(GOOD, "primary").with_command("git status && rm -rf /")
        )]);
        let err = f.gate.execute(&f.task, Phase::Strategize, &worker).await.unwrap_err();
        match err {
            KernelError::GuardrailBlocked { id, .. } => assert_eq!(id, COMMAND_GUARDRAIL),
            other => panic!("unexpected {other:?}"),
        }
    }

    struct NoRepo;

    impl RepoInspector for NoRepo {
        fn status_porcelain(&self, _root: &Path) -> Result<String, KernelError> {
            Ok(String::new())
        }
    }

    struct AlwaysFails;

    impl GuardrailCheck for AlwaysFails {
        fn run(&self, _ctx: &GuardrailContext) -> Result<CheckOutcome, KernelError> {
            Ok(CheckOutcome::fail("workspace locked"))
        }
    }

    #[tokio::test]
    async fn blocking_guardrail_stops_implement_before_worker_call() {
        let f = fixture().await;
        let catalog = GuardrailCatalog::new(vec![GuardrailCatalogEntry {
            id: "G-LOCK".into(),
            suite: "workspace".into(),
            summary: "workspace is not locked".into(),
            enforcement: Enforcement::Block,
            severity: Severity::Critical,
            check_ref: "lock".into(),
        }])
        .unwrap();
        let mut registry = CheckRegistry::new();
        registry.register("lock", Arc::new(AlwaysFails)).unwrap();
        let engine = GuardrailEngine::new(catalog, registry, f.events.clone()).unwrap();
        let context = GuardrailContext {
            root: PathBuf::from("."),
            allowed_binaries: Vec::new(),
            ledger_path: None,
            required_dirs: Vec::new(),
            repo: Arc::new(NoRepo),
        };
        let f = Fixture {
            gate: f.gate.with_guardrails(Arc::new(engine), context),
            ..f
        };

        accept_through(&f, Phase::Think).await;
        let worker = ScriptedWorker::answering(GOOD);
        let err = f.gate.execute(&f.task, Phase::Implement, &worker).await.unwrap_err();
        match err {
            KernelError::GuardrailBlocked { id, details } => {
                assert_eq!(id, "G-LOCK");
                assert_eq!(details, "workspace locked");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(worker.calls(), 0);
        assert_eq!(
            f.store.get_task(&TaskId::new("t-1")).await.unwrap().current_phase(),
            Some("think")
        );
    }
}
