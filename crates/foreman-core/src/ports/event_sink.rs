//! EventSink port - イベント記録の抽象化
//!
//! The sink is write-only from the kernel's point of view: one structured
//! record per line, appended, never rewritten.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::domain::{DomainEvent, KernelError};

/// EventSink はドメインイベントを記録
///
/// Emitting must never fail the caller; sinks log their own I/O trouble.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &DomainEvent);
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &DomainEvent) {}
}

/// Keeps events in memory (for tests and status views).
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &DomainEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlEventSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlEventSink {
    pub fn open(path: &Path) -> Result<Self, KernelError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| KernelError::io(format!("create {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| KernelError::io(format!("open {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&self, event: &DomainEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                warn!(event = event.name(), error = %err, "serialize event");
                return;
            }
        };
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            warn!(path = %self.path.display(), error = %err, "append event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoopSignature, LoopSnapshot};
    use chrono::Utc;

    fn loop_event() -> DomainEvent {
        DomainEvent::LoopDetected {
            signature: LoopSignature {
                hash: "abc".into(),
                snapshot_summary: "completed=0".into(),
                timestamp: Utc::now(),
            },
            snapshot: LoopSnapshot::default(),
        }
    }

    #[test]
    fn jsonl_sink_writes_one_record_per_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("evidence/events.jsonl");
        let sink = JsonlEventSink::open(&path).expect("open");

        sink.emit(&loop_event());
        sink.emit(&loop_event());

        let raw = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(value["event"], "loop_detected");
    }

    #[test]
    fn memory_sink_counts_by_name() {
        let sink = MemoryEventSink::new();
        sink.emit(&loop_event());
        assert_eq!(sink.count("loop_detected"), 1);
        assert_eq!(sink.count("phase_accepted"), 0);
    }
}
