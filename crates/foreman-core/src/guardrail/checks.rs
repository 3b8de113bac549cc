//! Built-in check families.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use super::command::run_sanctioned;
use super::ledger::verify_ledger;
use super::{CheckOutcome, GuardrailCheck, GuardrailContext};
use crate::config::CommandConfig;
use crate::domain::KernelError;

pub const WORKTREE_CLEAN: &str = "worktree_clean";
pub const ALLOWLIST_INTEGRITY: &str = "allowlist_integrity";
pub const LEDGER_CHAIN: &str = "ledger_chain";
pub const RUNTIME_DIRS: &str = "runtime_dirs";

pub(crate) fn builtins() -> Vec<(&'static str, Arc<dyn GuardrailCheck>)> {
    vec![
        (WORKTREE_CLEAN, Arc::new(WorktreeClean) as Arc<dyn GuardrailCheck>),
        (ALLOWLIST_INTEGRITY, Arc::new(AllowlistIntegrity) as Arc<dyn GuardrailCheck>),
        (LEDGER_CHAIN, Arc::new(LedgerChain) as Arc<dyn GuardrailCheck>),
        (RUNTIME_DIRS, Arc::new(RuntimeDirs) as Arc<dyn GuardrailCheck>),
    ]
}

/// Repository signals the checks read; faked in tests.
pub trait RepoInspector: Send + Sync {
    /// `git status --porcelain` output for `root`.
    fn status_porcelain(&self, root: &Path) -> Result<String, KernelError>;
}

/// Asks git through the sanctioned command path.
pub struct GitInspector {
    config: CommandConfig,
}

impl GitInspector {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

impl RepoInspector for GitInspector {
    fn status_porcelain(&self, root: &Path) -> Result<String, KernelError> {
        let config = CommandConfig {
            root: root.to_path_buf(),
            ..self.config.clone()
        };
        let output = run_sanctioned("git status --porcelain", &config)?;
        if !output.success() {
            return Err(KernelError::io(
                "git status --porcelain",
                output.stderr.trim().to_string(),
            ));
        }
        Ok(output.stdout)
    }
}

pub struct WorktreeClean;

impl GuardrailCheck for WorktreeClean {
    fn run(&self, ctx: &GuardrailContext) -> Result<CheckOutcome, KernelError> {
        let status = ctx.repo.status_porcelain(&ctx.root)?;
        let dirty: Vec<&str> = status.lines().filter(|l| !l.trim().is_empty()).collect();
        if dirty.is_empty() {
            return Ok(CheckOutcome::pass());
        }
        let sample: Vec<&str> = dirty.iter().take(3).copied().collect();
        Ok(CheckOutcome::fail(format!(
            "{} uncommitted change(s): {}",
            dirty.len(),
            sample.join("; ")
        )))
    }
}

pub struct AllowlistIntegrity;

impl GuardrailCheck for AllowlistIntegrity {
    fn run(&self, ctx: &GuardrailContext) -> Result<CheckOutcome, KernelError> {
        if ctx.allowed_binaries.is_empty() {
            return Ok(CheckOutcome::warn("allow-list is empty; every command is rejected"));
        }
        let mut seen = BTreeSet::new();
        let mut problems = Vec::new();
        for (idx, entry) in ctx.allowed_binaries.iter().enumerate() {
            if entry.trim().is_empty() {
                problems.push(format!("empty entry at {idx}"));
            } else if entry.trim() != entry || entry.contains(char::is_whitespace) {
                problems.push(format!("whitespace in entry {entry:?}"));
            } else if !seen.insert(entry.as_str()) {
                problems.push(format!("duplicate entry {entry}"));
            }
        }
        if problems.is_empty() {
            Ok(CheckOutcome::pass())
        } else {
            Ok(CheckOutcome::fail(problems.join("; ")))
        }
    }
}

pub struct LedgerChain;

impl GuardrailCheck for LedgerChain {
    fn run(&self, ctx: &GuardrailContext) -> Result<CheckOutcome, KernelError> {
        let Some(path) = &ctx.ledger_path else {
            return Ok(CheckOutcome::warn("no ledger configured"));
        };
        match verify_ledger(path) {
            Ok(Some(last)) => Ok(CheckOutcome {
                details: Some(format!("{} record(s) verified", last.seq + 1)),
                ..CheckOutcome::pass()
            }),
            Ok(None) => Ok(CheckOutcome::pass()),
            Err(e) => Ok(CheckOutcome::fail(format!("{}: {e}", path.display()))),
        }
    }
}

pub struct RuntimeDirs;

impl GuardrailCheck for RuntimeDirs {
    fn run(&self, ctx: &GuardrailContext) -> Result<CheckOutcome, KernelError> {
        let missing: Vec<String> = ctx
            .required_dirs
            .iter()
            .filter(|dir| !ctx.root.join(dir).is_dir())
            .map(|dir| dir.display().to_string())
            .collect();
        if missing.is_empty() {
            Ok(CheckOutcome::pass())
        } else {
            Ok(CheckOutcome::fail(format!("missing: {}", missing.join(", "))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrail::GuardrailStatus;
    use crate::guardrail::ledger::HashChainLedger;
    use std::fs;
    use std::path::PathBuf;

    struct FakeRepo(&'static str);

    impl RepoInspector for FakeRepo {
        fn status_porcelain(&self, _root: &Path) -> Result<String, KernelError> {
            Ok(self.0.to_string())
        }
    }

    fn ctx(root: &Path, repo: &'static str) -> GuardrailContext {
        GuardrailContext {
            root: root.to_path_buf(),
            allowed_binaries: vec!["git".into(), "cargo".into()],
            ledger_path: None,
            required_dirs: Vec::new(),
            repo: Arc::new(FakeRepo(repo)),
        }
    }

    #[test]
    fn clean_worktree_passes() {
        let outcome = WorktreeClean.run(&ctx(Path::new("."), "")).unwrap();
        assert_eq!(outcome.status, GuardrailStatus::Pass);
    }

    #[test]
    fn dirty_worktree_fails_with_summary() {
        let outcome = WorktreeClean
            .run(&ctx(Path::new("."), " M src/lib.rs\n?? notes.txt\n"))
            .unwrap();
        assert_eq!(outcome.status, GuardrailStatus::Fail);
        assert!(outcome.details.unwrap().starts_with("2 uncommitted"));
    }

    #[test]
    fn allowlist_duplicates_and_blanks_fail() {
        let mut context = ctx(Path::new("."), "");
        context.allowed_binaries = vec!["git".into(), "".into(), "git".into(), "ls ".into()];
        let outcome = AllowlistIntegrity.run(&context).unwrap();
        assert_eq!(outcome.status, GuardrailStatus::Fail);
        let details = outcome.details.unwrap();
        assert!(details.contains("empty entry at 1"));
        assert!(details.contains("duplicate entry git"));
        assert!(details.contains("whitespace"));
    }

    #[test]
    fn allowlist_clean_passes() {
        let outcome = AllowlistIntegrity.run(&ctx(Path::new("."), "")).unwrap();
        assert_eq!(outcome.status, GuardrailStatus::Pass);
    }

    #[test]
    fn ledger_chain_reports_tampering() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ledger.jsonl");
        let ledger = HashChainLedger::open(&path).unwrap();
        ledger.append(serde_json::json!({"n": 1})).unwrap();

        let mut context = ctx(temp.path(), "");
        context.ledger_path = Some(path.clone());
        assert_eq!(LedgerChain.run(&context).unwrap().status, GuardrailStatus::Pass);

        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("\"n\":1", "\"n\":2")).unwrap();
        assert_eq!(LedgerChain.run(&context).unwrap().status, GuardrailStatus::Fail);
    }

    #[test]
    fn ledger_chain_without_ledger_warns() {
        let outcome = LedgerChain.run(&ctx(Path::new("."), "")).unwrap();
        assert_eq!(outcome.status, GuardrailStatus::Warn);
    }

    #[test]
    fn runtime_dirs_lists_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("state/runs")).unwrap();
        let mut context = ctx(temp.path(), "");
        context.required_dirs = vec![PathBuf::from("state/runs"), PathBuf::from("state/evidence")];

        let outcome = RuntimeDirs.run(&context).unwrap();
        assert_eq!(outcome.status, GuardrailStatus::Fail);
        assert_eq!(outcome.details.as_deref(), Some("missing: state/evidence"));
    }

    #[test]
    fn builtins_cover_every_family() {
        let refs: Vec<&str> = builtins().into_iter().map(|(r, _)| r).collect();
        assert_eq!(
            refs,
            vec![WORKTREE_CLEAN, ALLOWLIST_INTEGRITY, LEDGER_CHAIN, RUNTIME_DIRS]
        );
    }
}
