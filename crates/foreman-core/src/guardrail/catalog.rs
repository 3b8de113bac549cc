//! Guardrail catalog source (TOML).
//!
//! ```toml
//! version = 1
//!
//! [[guardrail]]
//! id = "G-WORKTREE"
//! suite = "repository"
//! summary = "working tree is clean before workspace-mutating phases"
//! enforcement = "block"
//! severity = "critical"
//! check_ref = "worktree_clean"
//! ```
//!
//! Loading never falls back to defaults: a missing, malformed or
//! inconsistent catalog is a `CatalogLoad` error.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::GuardrailCatalogEntry;
use crate::domain::KernelError;

pub const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    version: u32,
    #[serde(default, rename = "guardrail")]
    guardrails: Vec<GuardrailCatalogEntry>,
}

/// Validated, immutable list of catalog entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardrailCatalog {
    entries: Vec<GuardrailCatalogEntry>,
}

impl GuardrailCatalog {
    pub fn new(entries: Vec<GuardrailCatalogEntry>) -> Result<Self, KernelError> {
        let mut seen = BTreeSet::new();
        for entry in &entries {
            let fields = [
                ("id", &entry.id),
                ("suite", &entry.suite),
                ("summary", &entry.summary),
                ("check_ref", &entry.check_ref),
            ];
            if let Some((name, _)) = fields.iter().find(|(_, v)| v.trim().is_empty()) {
                return Err(KernelError::CatalogLoad(format!(
                    "guardrail {:?} has an empty {name}",
                    entry.id
                )));
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(KernelError::CatalogLoad(format!(
                    "duplicate guardrail id {}",
                    entry.id
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[GuardrailCatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn parse_catalog(contents: &str) -> Result<GuardrailCatalog, KernelError> {
    let file: CatalogFile =
        toml::from_str(contents).map_err(|e| KernelError::CatalogLoad(e.to_string()))?;
    if file.version != CATALOG_VERSION {
        return Err(KernelError::CatalogLoad(format!(
            "unsupported catalog version {} (expected {CATALOG_VERSION})",
            file.version
        )));
    }
    GuardrailCatalog::new(file.guardrails)
}

pub fn load_catalog(path: &Path) -> Result<GuardrailCatalog, KernelError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| KernelError::CatalogLoad(format!("read {}: {e}", path.display())))?;
    parse_catalog(&contents).map_err(|e| match e {
        KernelError::CatalogLoad(message) => {
            KernelError::CatalogLoad(format!("{}: {message}", path.display()))
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrail::{Enforcement, Severity};
    use rstest::rstest;

    const VALID: &str = r#"
version = 1

[[guardrail]]
id = "G-WORKTREE"
suite = "repository"
summary = "working tree is clean"
enforcement = "block"
severity = "critical"
check_ref = "worktree_clean"

[[guardrail]]
id = "G-ALLOWLIST"
suite = "commands"
summary = "allow-list has no duplicate or empty entries"
enforcement = "audit"
severity = "warn"
check_ref = "allowlist_integrity"
"#;

    #[test]
    fn parses_entries_in_order() {
        let catalog = parse_catalog(VALID).unwrap();
        assert_eq!(catalog.len(), 2);
        let first = &catalog.entries()[0];
        assert_eq!(first.id, "G-WORKTREE");
        assert_eq!(first.enforcement, Enforcement::Block);
        assert_eq!(catalog.entries()[1].severity, Severity::Warn);
    }

    #[test]
    fn missing_file_fails_loudly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_catalog(&temp.path().join("guardrails.toml")).unwrap_err();
        assert!(matches!(err, KernelError::CatalogLoad(_)));
    }

    #[rstest]
    #[case::malformed("version = 1\n[[guardrail]\n")]
    #[case::wrong_version("version = 2")]
    #[case::missing_version("[[guardrail]]\nid = \"x\"")]
    #[case::bad_enforcement(&VALID.replace("\"audit\"", "\"warn-only\""))]
    #[case::duplicate_id(&VALID.replace("G-ALLOWLIST", "G-WORKTREE"))]
    #[case::empty_check_ref(&VALID.replace("\"allowlist_integrity\"", "\"  \""))]
    #[case::unknown_field(&format!("extra = true\n{VALID}"))]
    #[case::misspelled_field(&VALID.replace("enforcement = \"block\"", "enforcment = \"block\""))]
    fn rejects_bad_catalogs(#[case] contents: &str) {
        let err = parse_catalog(contents).unwrap_err();
        assert!(matches!(err, KernelError::CatalogLoad(_)), "{err}");
    }
}
