//! Kernel configuration loaded from TOML.
//!
//! Every section is optional; missing fields take the defaults below. A
//! missing file yields the validated defaults, a malformed one is an error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::KernelError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub scheduler: SchedulerConfig,
    pub idempotency: IdempotencyConfig,
    pub gate: GateConfig,
    pub dispatcher: DispatcherConfig,
    pub loop_detector: LoopDetectorConfig,
    pub commands: CommandConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of heavy tasks checked out at once.
    pub heavy_task_limit: i64,
    pub weights: SchedulerWeights,
    pub research: ResearchConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heavy_task_limit: 1,
            weights: SchedulerWeights::default(),
            research: ResearchConfig::default(),
        }
    }
}

/// Scoring weights. Replaceable at runtime via `TaskScheduler::update_weights`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerWeights {
    pub review: f64,
    pub improvement: f64,
    pub pending: f64,
    /// Multiplied by `10 - estimated_complexity`.
    pub complexity_bias: f64,
    /// Multiplied by `min(10, days_since_created)`.
    pub staleness_bias: f64,
    pub review_boost: f64,
    pub follow_up_boost: f64,
    pub dependencies_cleared_boost: f64,
}

impl Default for SchedulerWeights {
    fn default() -> Self {
        Self {
            review: 300.0,
            improvement: 200.0,
            pending: 100.0,
            complexity_bias: 2.0,
            staleness_bias: 1.5,
            review_boost: 20.0,
            follow_up_boost: 10.0,
            dependencies_cleared_boost: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResearchConfig {
    /// Signals at or above this confidence are emitted.
    pub threshold: f64,
    /// Minimum time between two signals for the same task.
    pub cooldown_secs: u64,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            cooldown_secs: 30 * 60,
        }
    }
}

impl ResearchConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.cooldown_secs).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
    /// How long a caller waits on another caller's `processing` entry.
    pub processing_wait_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 10 * 60,
            max_entries: 1_000,
            processing_wait_secs: 15 * 60,
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn processing_wait(&self) -> Duration {
        Duration::from_secs(self.processing_wait_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub worker_timeout_secs: u64,
    /// Template score above which content is rejected.
    pub template_threshold: f64,
    /// Threshold used instead when the content carries grounding evidence.
    pub relaxed_template_threshold: f64,
    pub min_citations: usize,
    /// Answers with fewer words than this score as template.
    pub min_tokens: usize,
    /// Upper bound on the prior-phase context handed to the worker.
    pub context_budget_chars: usize,
    pub banned_placeholders: Vec<String>,
    /// Provider ids that mean "the worker did not really answer".
    pub disallowed_providers: Vec<String>,
    /// Tool names advertised to workers.
    pub tools: Vec<String>,
    /// Hash-chained ledger of accepted phase records. Not persisted when unset.
    pub ledger_path: Option<PathBuf>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            worker_timeout_secs: 10 * 60,
            template_threshold: 0.5,
            relaxed_template_threshold: 0.8,
            min_citations: 3,
            min_tokens: 8,
            context_budget_chars: 4_000,
            banned_placeholders: [
                "lorem ipsum",
                "todo: fill in",
                "insert here",
                "placeholder",
                "tbd",
                "as an ai language model",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            disallowed_providers: ["", "none", "fallback", "unknown"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tools: Vec::new(),
            ledger_path: None,
        }
    }
}

impl GateConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    pub workers: Vec<WorkerConfig>,
    /// Target usage ratio per provider, e.g. `{ primary = 5, secondary = 1 }`.
    pub provider_weights: BTreeMap<String, u32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: vec![
                WorkerConfig::new("primary-1", "primary", 1),
                WorkerConfig::new("secondary-1", "secondary", 1),
            ],
            provider_weights: BTreeMap::from([
                ("primary".to_string(), 5),
                ("secondary".to_string(), 1),
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    pub id: String,
    pub provider: String,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
}

fn default_capacity() -> u32 {
    1
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopDetectorConfig {
    pub window: usize,
    pub threshold: usize,
    /// Blocker descriptions are cut to this many characters before hashing.
    pub blocker_chars: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            window: 5,
            threshold: 3,
            blocker_chars: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    /// Leading binaries that may be executed.
    pub allowed_binaries: Vec<String>,
    /// Working root that `cd` targets must stay inside.
    pub root: PathBuf,
    pub timeout_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            allowed_binaries: crate::guardrail::command::DEFAULT_ALLOWED_BINARIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            root: PathBuf::from("."),
            timeout_secs: 60,
        }
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Concurrent task drivers.
    pub max_parallel: usize,
    pub poll_interval_ms: u64,
    /// Consecutive polls with nothing dispatched before the run stalls.
    pub max_idle_polls: u32,
    pub max_cycles: u64,
    /// Evidence sink path (JSON lines). No sink when unset.
    pub evidence_path: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            poll_interval_ms: 500,
            max_idle_polls: 20,
            max_cycles: 10_000,
            evidence_path: None,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.scheduler.heavy_task_limit <= 0 {
            return Err(invalid("scheduler.heavy_task_limit must be > 0"));
        }
        let w = &self.scheduler.weights;
        let all_weights = [
            w.review,
            w.improvement,
            w.pending,
            w.complexity_bias,
            w.staleness_bias,
            w.review_boost,
            w.follow_up_boost,
            w.dependencies_cleared_boost,
        ];
        if all_weights.iter().any(|v| !v.is_finite()) {
            return Err(invalid("scheduler.weights must be finite"));
        }
        check_unit("scheduler.research.threshold", self.scheduler.research.threshold)?;

        if self.idempotency.ttl_secs == 0 {
            return Err(invalid("idempotency.ttl_secs must be > 0"));
        }
        if self.idempotency.max_entries == 0 {
            return Err(invalid("idempotency.max_entries must be > 0"));
        }
        if self.idempotency.processing_wait_secs == 0 {
            return Err(invalid("idempotency.processing_wait_secs must be > 0"));
        }

        if self.gate.worker_timeout_secs == 0 {
            return Err(invalid("gate.worker_timeout_secs must be > 0"));
        }
        check_unit("gate.template_threshold", self.gate.template_threshold)?;
        check_unit(
            "gate.relaxed_template_threshold",
            self.gate.relaxed_template_threshold,
        )?;
        if self.gate.relaxed_template_threshold < self.gate.template_threshold {
            return Err(invalid(
                "gate.relaxed_template_threshold must be >= gate.template_threshold",
            ));
        }
        if self.gate.context_budget_chars == 0 {
            return Err(invalid("gate.context_budget_chars must be > 0"));
        }

        if self.dispatcher.provider_weights.is_empty() {
            return Err(invalid("dispatcher.provider_weights must not be empty"));
        }
        if self.dispatcher.provider_weights.values().all(|w| *w == 0) {
            return Err(invalid("dispatcher.provider_weights must not all be zero"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for worker in &self.dispatcher.workers {
            if worker.id.trim().is_empty() || worker.provider.trim().is_empty() {
                return Err(invalid("dispatcher.workers entries need an id and a provider"));
            }
            if worker.capacity == 0 {
                return Err(invalid(format!(
                    "dispatcher worker {} must have capacity > 0",
                    worker.id
                )));
            }
            if !seen.insert(worker.id.as_str()) {
                return Err(invalid(format!("duplicate dispatcher worker {}", worker.id)));
            }
        }

        if self.loop_detector.window == 0 || self.loop_detector.threshold == 0 {
            return Err(invalid("loop_detector.window and threshold must be > 0"));
        }
        if self.loop_detector.threshold > self.loop_detector.window {
            return Err(invalid("loop_detector.threshold must be <= window"));
        }

        if self.commands.allowed_binaries.iter().any(|b| b.trim().is_empty()) {
            return Err(invalid("commands.allowed_binaries must not contain empty entries"));
        }
        if self.commands.timeout_secs == 0 {
            return Err(invalid("commands.timeout_secs must be > 0"));
        }

        if self.supervisor.max_parallel == 0 {
            return Err(invalid("supervisor.max_parallel must be > 0"));
        }
        if self.supervisor.poll_interval_ms == 0 {
            return Err(invalid("supervisor.poll_interval_ms must be > 0"));
        }
        if self.supervisor.max_cycles == 0 {
            return Err(invalid("supervisor.max_cycles must be > 0"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> KernelError {
    KernelError::Config(message.into())
}

fn check_unit(name: &str, value: f64) -> Result<(), KernelError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(format!("{name} must be within [0, 1], got {value}")));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KernelConfig::default()`.
pub fn load_config(path: &Path) -> Result<KernelConfig, KernelError> {
    if !path.exists() {
        let cfg = KernelConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| KernelError::io(format!("read {}", path.display()), e))?;
    parse_config(&contents)
        .map_err(|e| KernelError::Config(format!("{}: {e}", path.display())))
}

pub fn parse_config(contents: &str) -> Result<KernelConfig, KernelError> {
    let cfg: KernelConfig =
        toml::from_str(contents).map_err(|e| KernelError::Config(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, KernelConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg = parse_config(
            r#"
            [scheduler]
            heavy_task_limit = 3

            [scheduler.weights]
            review = 500.0

            [dispatcher]
            workers = [{ id = "a-1", provider = "a", capacity = 2 }]
            provider_weights = { a = 1 }
            "#,
        )
        .expect("parse");

        assert_eq!(cfg.scheduler.heavy_task_limit, 3);
        assert_eq!(cfg.scheduler.weights.review, 500.0);
        assert_eq!(cfg.scheduler.weights.pending, 100.0);
        assert_eq!(cfg.dispatcher.workers[0].capacity, 2);
        assert_eq!(cfg.idempotency, IdempotencyConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("foreman.toml");
        fs::write(&path, "[scheduler\nheavy_task_limit = ").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    #[rstest]
    #[case("[scheduler]\nheavy_task_limit = 0", "heavy_task_limit")]
    #[case("[idempotency]\nttl_secs = 0", "ttl_secs")]
    #[case("[gate]\ntemplate_threshold = 1.5", "template_threshold")]
    #[case("[dispatcher]\nprovider_weights = {}", "provider_weights")]
    #[case(
        "[dispatcher]\nworkers = [{ id = \"w\", provider = \"p\", capacity = 0 }]",
        "capacity"
    )]
    #[case("[loop_detector]\nwindow = 2\nthreshold = 3", "threshold")]
    #[case("[supervisor]\nmax_parallel = 0", "max_parallel")]
    fn validate_rejects(#[case] toml: &str, #[case] needle: &str) {
        let err = parse_config(toml).unwrap_err();
        assert!(
            err.to_string().contains(needle),
            "expected {needle:?} in {err}"
        );
    }
}
