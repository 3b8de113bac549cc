//! LoopDetector - 非生産的な繰り返しの検出
//!
//! Fingerprints the store state after every scheduling cycle and keeps the
//! last `window` fingerprints. The same fingerprint `threshold` times inside
//! the window raises `LoopDetected`; the caller halts instead of retrying.

use std::collections::VecDeque;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::LoopDetectorConfig;
use crate::domain::{KernelError, LoopSignature, LoopSnapshot, TaskId};
use crate::ports::Clock;

/// Hash of the sorted id sets plus truncated, sorted blocker descriptions.
pub fn signature_hash(snapshot: &LoopSnapshot, blocker_chars: usize) -> String {
    fn sorted(ids: &[TaskId]) -> Vec<&str> {
        let mut ids: Vec<&str> = ids.iter().map(TaskId::as_str).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    let mut blockers: Vec<String> = snapshot
        .blockers
        .iter()
        .map(|b| b.trim().chars().take(blocker_chars).collect())
        .collect();
    blockers.sort_unstable();

    let mut hasher = Sha256::new();
    for (label, ids) in [
        ("completed", sorted(&snapshot.completed)),
        ("in_progress", sorted(&snapshot.in_progress)),
        ("blocked", sorted(&snapshot.blocked)),
    ] {
        hasher.update(label.as_bytes());
        hasher.update(b"=");
        hasher.update(ids.join(",").as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"blockers=");
    hasher.update(blockers.join("\u{1f}").as_bytes());
    hex::encode(hasher.finalize())
}

pub struct LoopDetector {
    config: LoopDetectorConfig,
    clock: Arc<dyn Clock>,
    window: VecDeque<LoopSignature>,
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window),
            config,
            clock,
        }
    }

    pub fn signature(&self, snapshot: &LoopSnapshot) -> LoopSignature {
        LoopSignature {
            hash: signature_hash(snapshot, self.config.blocker_chars),
            snapshot_summary: snapshot.summary(),
            timestamp: self.clock.now(),
        }
    }

    /// Records one cycle. Returns the signature, or `LoopDetected` on the
    /// occurrence that reaches the threshold.
    pub fn observe(&mut self, snapshot: &LoopSnapshot) -> Result<LoopSignature, KernelError> {
        let signature = self.signature(snapshot);
        self.window.push_back(signature.clone());
        while self.window.len() > self.config.window {
            self.window.pop_front();
        }

        let repeats = self
            .window
            .iter()
            .filter(|s| s.hash == signature.hash)
            .count();
        debug!(
            signature = %signature.hash,
            repeats,
            window = self.window.len(),
            "loop signature recorded"
        );
        if repeats >= self.config.threshold {
            return Err(KernelError::LoopDetected {
                signature,
                snapshot: Box::new(snapshot.clone()),
            });
        }
        Ok(signature)
    }

    pub fn window(&self) -> impl Iterator<Item = &LoopSignature> {
        self.window.iter()
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}
