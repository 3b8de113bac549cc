//! Append-only JSONL ledger with a SHA-256 hash chain.
//!
//! Each line is `{seq, prev_hash, hash, payload}` where
//! `hash = sha256(prev_hash || canonical_json(payload))` and the first
//! record links to [`GENESIS_HASH`]. Editing, dropping or reordering any line
//! breaks verification from that line on.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::KernelError;
use crate::idempotency::canonical_json;

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub seq: u64,
    pub prev_hash: String,
    pub hash: String,
    pub payload: Value,
}

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("line {line}: unreadable record: {message}")]
    Malformed { line: usize, message: String },

    #[error("line {line}: chain broken, expected prev_hash {expected}, got {actual}")]
    ChainBroken {
        line: usize,
        expected: String,
        actual: String,
    },

    #[error("line {line}: hash mismatch, expected {expected}, got {actual}")]
    HashMismatch {
        line: usize,
        expected: String,
        actual: String,
    },

    #[error("line {line}: sequence gap, expected {expected}, got {actual}")]
    SequenceGap { line: usize, expected: u64, actual: u64 },

    #[error("{0}")]
    Io(String),
}

pub fn link_hash(prev_hash: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

struct Tail {
    next_seq: u64,
    last_hash: String,
}

pub struct HashChainLedger {
    path: PathBuf,
    tail: Mutex<Tail>,
}

impl HashChainLedger {
    /// Opens (or creates) the ledger, verifying what is already there.
    pub fn open(path: &Path) -> Result<Self, KernelError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| KernelError::io(format!("create {}", parent.display()), e))?;
        }
        let tail = match verify_ledger(path) {
            Ok(Some(last)) => Tail {
                next_seq: last.seq + 1,
                last_hash: last.hash,
            },
            Ok(None) => Tail {
                next_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            },
            Err(e) => return Err(KernelError::io(format!("ledger {}", path.display()), e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            tail: Mutex::new(tail),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, payload: Value) -> Result<LedgerRecord, KernelError> {
        let mut tail = self
            .tail
            .lock()
            .map_err(|_| KernelError::io("ledger", "tail lock poisoned"))?;
        let record = LedgerRecord {
            seq: tail.next_seq,
            prev_hash: tail.last_hash.clone(),
            hash: link_hash(&tail.last_hash, &payload),
            payload,
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| KernelError::io("serialize ledger record", e))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| KernelError::io(format!("open {}", self.path.display()), e))?;
        writeln!(file, "{line}")
            .and_then(|_| file.flush())
            .map_err(|e| KernelError::io(format!("append {}", self.path.display()), e))?;

        tail.next_seq += 1;
        tail.last_hash = record.hash.clone();
        Ok(record)
    }
}

/// Verifies every line of the ledger at `path` and returns the last record.
/// A missing file is an empty, valid ledger.
pub fn verify_ledger(path: &Path) -> Result<Option<LedgerRecord>, LedgerError> {
    Ok(read_ledger(path)?.pop())
}

/// Reads and verifies every record, in order.
pub fn read_ledger(path: &Path) -> Result<Vec<LedgerRecord>, LedgerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| LedgerError::Io(e.to_string()))?;
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut records: Vec<LedgerRecord> = Vec::new();

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|e| LedgerError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LedgerRecord =
            serde_json::from_str(&line).map_err(|e| LedgerError::Malformed {
                line: line_no,
                message: e.to_string(),
            })?;

        let expected_seq = records.last().map_or(0, |r| r.seq + 1);
        if record.seq != expected_seq {
            return Err(LedgerError::SequenceGap {
                line: line_no,
                expected: expected_seq,
                actual: record.seq,
            });
        }
        if record.prev_hash != expected_prev {
            return Err(LedgerError::ChainBroken {
                line: line_no,
                expected: expected_prev,
                actual: record.prev_hash,
            });
        }
        let computed = link_hash(&record.prev_hash, &record.payload);
        if computed != record.hash {
            return Err(LedgerError::HashMismatch {
                line: line_no,
                expected: computed,
                actual: record.hash,
            });
        }
        expected_prev = record.hash.clone();
        records.push(record);
    }
    Ok(records)
}
