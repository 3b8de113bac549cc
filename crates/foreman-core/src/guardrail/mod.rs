//! GuardrailEngine - ポリシー評価と強制
//!
//! # 設計
//! - A catalog (static, loaded once) names checks by `check_ref`.
//! - `CheckRegistry` maps `check_ref` to an implementation.
//! - `evaluate` runs every entry in isolation: an error or panic in one check
//!   becomes a `fail` result for that entry only.
//! - `enforce` turns a failed `block` entry into `GuardrailBlocked`.

pub mod catalog;
pub mod checks;
pub mod command;
pub mod ledger;

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use self::catalog::{GuardrailCatalog, load_catalog, parse_catalog};
pub use self::checks::{GitInspector, RepoInspector};
pub use self::command::{ensure_allowed_command, ensure_command_safe, run_sanctioned};
pub use self::ledger::{HashChainLedger, LedgerRecord, read_ledger, verify_ledger};
use crate::domain::{DomainEvent, KernelError};
use crate::ports::EventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enforcement {
    Audit,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for GuardrailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GuardrailStatus::Pass => "pass",
            GuardrailStatus::Warn => "warn",
            GuardrailStatus::Fail => "fail",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardrailCatalogEntry {
    pub id: String,
    pub suite: String,
    pub summary: String,
    pub enforcement: Enforcement,
    pub severity: Severity,
    pub check_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub id: String,
    pub suite: String,
    pub summary: String,
    pub enforcement: Enforcement,
    pub severity: Severity,
    pub status: GuardrailStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl GuardrailResult {
    fn from_entry(entry: &GuardrailCatalogEntry, outcome: CheckOutcome) -> Self {
        Self {
            id: entry.id.clone(),
            suite: entry.suite.clone(),
            summary: entry.summary.clone(),
            enforcement: entry.enforcement,
            severity: entry.severity,
            status: outcome.status,
            details: outcome.details,
        }
    }

    pub fn blocks(&self) -> bool {
        self.enforcement == Enforcement::Block && self.status == GuardrailStatus::Fail
    }
}

/// What a single check reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub status: GuardrailStatus,
    pub details: Option<String>,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            status: GuardrailStatus::Pass,
            details: None,
        }
    }

    pub fn warn(details: impl Into<String>) -> Self {
        Self {
            status: GuardrailStatus::Warn,
            details: Some(details.into()),
        }
    }

    pub fn fail(details: impl Into<String>) -> Self {
        Self {
            status: GuardrailStatus::Fail,
            details: Some(details.into()),
        }
    }
}

/// Inputs the built-in checks read.
#[derive(Clone)]
pub struct GuardrailContext {
    /// Working root of the repository under orchestration.
    pub root: PathBuf,
    pub allowed_binaries: Vec<String>,
    /// Hash-chained ledger to verify, if one is kept.
    pub ledger_path: Option<PathBuf>,
    /// Runtime-state directories, relative to `root`.
    pub required_dirs: Vec<PathBuf>,
    pub repo: Arc<dyn RepoInspector>,
}

pub trait GuardrailCheck: Send + Sync {
    fn run(&self, ctx: &GuardrailContext) -> Result<CheckOutcome, KernelError>;
}

/// check_ref -> implementation.
#[derive(Default, Clone)]
pub struct CheckRegistry {
    checks: HashMap<String, Arc<dyn GuardrailCheck>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in check families.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (check_ref, check) in checks::builtins() {
            registry.checks.insert(check_ref.to_string(), check);
        }
        registry
    }

    pub fn register(
        &mut self,
        check_ref: impl Into<String>,
        check: Arc<dyn GuardrailCheck>,
    ) -> Result<(), KernelError> {
        let check_ref = check_ref.into();
        if self.checks.contains_key(&check_ref) {
            return Err(KernelError::DuplicateCheck(check_ref));
        }
        self.checks.insert(check_ref, check);
        Ok(())
    }

    pub fn get(&self, check_ref: &str) -> Option<&Arc<dyn GuardrailCheck>> {
        self.checks.get(check_ref)
    }

    pub fn contains(&self, check_ref: &str) -> bool {
        self.checks.contains_key(check_ref)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

/// Runs every catalog entry; one entry's failure never stops the others.
pub fn evaluate(
    catalog: &[GuardrailCatalogEntry],
    registry: &CheckRegistry,
    ctx: &GuardrailContext,
) -> Vec<GuardrailResult> {
    catalog
        .iter()
        .map(|entry| {
            let outcome = match registry.get(&entry.check_ref) {
                None => CheckOutcome::fail(format!("unknown check_ref {}", entry.check_ref)),
                Some(check) => match catch_unwind(AssertUnwindSafe(|| check.run(ctx))) {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(err)) => CheckOutcome::fail(format!("check error: {err}")),
                    Err(panic) => CheckOutcome::fail(format!(
                        "check panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                },
            };
            GuardrailResult::from_entry(entry, outcome)
        })
        .collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// First failing `block` entry, as an error.
pub fn enforce(results: &[GuardrailResult]) -> Result<(), KernelError> {
    match results.iter().find(|r| r.blocks()) {
        Some(blocked) => Err(KernelError::GuardrailBlocked {
            id: blocked.id.clone(),
            details: blocked
                .details
                .clone()
                .unwrap_or_else(|| blocked.summary.clone()),
        }),
        None => Ok(()),
    }
}

pub struct GuardrailEngine {
    catalog: GuardrailCatalog,
    registry: CheckRegistry,
    events: Arc<dyn EventSink>,
}

impl GuardrailEngine {
    /// Fails when the catalog references a check the registry lacks.
    pub fn new(
        catalog: GuardrailCatalog,
        registry: CheckRegistry,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, KernelError> {
        let missing: Vec<&str> = catalog
            .entries()
            .iter()
            .filter(|e| !registry.contains(&e.check_ref))
            .map(|e| e.check_ref.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(KernelError::CatalogLoad(format!(
                "unknown check_ref: {}",
                missing.join(", ")
            )));
        }
        Ok(Self {
            catalog,
            registry,
            events,
        })
    }

    pub fn catalog(&self) -> &GuardrailCatalog {
        &self.catalog
    }

    /// Full audit pass over the catalog.
    pub fn evaluate(&self, ctx: &GuardrailContext) -> Vec<GuardrailResult> {
        self.run(self.catalog.entries(), ctx)
    }

    /// Runs only the `block` entries and fails on the first blocking result.
    pub fn preflight(&self, ctx: &GuardrailContext) -> Result<Vec<GuardrailResult>, KernelError> {
        let blocking: Vec<GuardrailCatalogEntry> = self
            .catalog
            .entries()
            .iter()
            .filter(|e| e.enforcement == Enforcement::Block)
            .cloned()
            .collect();
        let results = self.run(&blocking, ctx);
        enforce(&results)?;
        Ok(results)
    }

    fn run(&self, entries: &[GuardrailCatalogEntry], ctx: &GuardrailContext) -> Vec<GuardrailResult> {
        let results = evaluate(entries, &self.registry, ctx);
        for result in &results {
            match (result.status, result.enforcement) {
                (GuardrailStatus::Pass, _) => debug!(id = %result.id, "guardrail pass"),
                (status, Enforcement::Audit) => {
                    warn!(id = %result.id, %status, details = ?result.details, "guardrail audit finding")
                }
                (status, Enforcement::Block) => {
                    warn!(id = %result.id, %status, details = ?result.details, "guardrail blocking finding")
                }
            }
            self.events
                .emit(&DomainEvent::GuardrailEvaluated(result.clone()));
        }
        results
    }
}
