//! Append-only phase execution records, optionally mirrored into a
//! hash-chained file so they survive restarts.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use tracing::debug;

use crate::domain::{KernelError, Phase, PhaseExecutionRecord, TaskId};
use crate::guardrail::{HashChainLedger, read_ledger};

#[derive(Default)]
pub struct PhaseLedger {
    records: Mutex<HashMap<TaskId, Vec<PhaseExecutionRecord>>>,
    chain: Option<HashChainLedger>,
}

impl PhaseLedger {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the chained file, verifies it, and replays its records.
    pub fn open(path: &Path) -> Result<Self, KernelError> {
        let chain = HashChainLedger::open(path)?;
        let stored = read_ledger(path)
            .map_err(|e| KernelError::io(format!("phase ledger {}", path.display()), e))?;

        let mut records: HashMap<TaskId, Vec<PhaseExecutionRecord>> = HashMap::new();
        for entry in stored {
            let record: PhaseExecutionRecord = serde_json::from_value(entry.payload)
                .map_err(|e| {
                    KernelError::io(format!("phase ledger {} seq {}", path.display(), entry.seq), e)
                })?;
            records.entry(record.task_id.clone()).or_default().push(record);
        }
        debug!(path = %path.display(), tasks = records.len(), "phase ledger replayed");
        Ok(Self {
            records: Mutex::new(records),
            chain: Some(chain),
        })
    }

    pub fn append(&self, record: PhaseExecutionRecord) -> Result<(), KernelError> {
        if let Some(chain) = &self.chain {
            let payload = serde_json::to_value(&record)
                .map_err(|e| KernelError::io("serialize phase record", e))?;
            chain.append(payload)?;
        }
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(record.task_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    pub fn records(&self, task_id: &TaskId) -> Vec<PhaseExecutionRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn accepted_phases(&self, task_id: &TaskId) -> BTreeSet<Phase> {
        self.records(task_id)
            .into_iter()
            .filter(|r| r.accepted)
            .map(|r| r.phase)
            .collect()
    }

    /// Hash of the most recent accepted record for the phase.
    pub fn accepted_hash(&self, task_id: &TaskId, phase: Phase) -> Option<String> {
        self.records(task_id)
            .into_iter()
            .rev()
            .find(|r| r.accepted && r.phase == phase)
            .map(|r| r.content_hash)
    }

    pub fn missing_predecessors(&self, task_id: &TaskId, phase: Phase) -> Vec<Phase> {
        let accepted = self.accepted_phases(task_id);
        phase
            .predecessors()
            .iter()
            .copied()
            .filter(|p| !accepted.contains(p))
            .collect()
    }

    /// Last phase of the unbroken accepted prefix, where a resumed task
    /// picks up again.
    pub fn resume_point(&self, task_id: &TaskId) -> Option<Phase> {
        let accepted = self.accepted_phases(task_id);
        Phase::SEQUENCE
            .iter()
            .copied()
            .take_while(|p| accepted.contains(p))
            .last()
    }
}
