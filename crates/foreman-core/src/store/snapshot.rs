//! On-disk image of the task store.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{KernelError, Task, TaskTransition};

/// Tasks in creation order plus the full transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub tasks: Vec<Task>,
    pub history: Vec<TaskTransition>,
}

impl StoreSnapshot {
    pub fn to_json(&self) -> Result<String, KernelError> {
        let mut payload = serde_json::to_string_pretty(self)
            .map_err(|e| KernelError::io("serialize store snapshot", e))?;
        payload.push('\n');
        Ok(payload)
    }

    pub fn read(path: &Path) -> Result<Self, KernelError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| KernelError::io(format!("read {}", path.display()), e))?;
        serde_json::from_str(&raw)
            .map_err(|e| KernelError::io(format!("parse {}", path.display()), e))
    }
}

/// Writes through a sibling temp file and renames it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<(), KernelError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| KernelError::io(format!("create {}", parent.display()), e))?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp_path, contents)
        .map_err(|e| KernelError::io(format!("write {}", tmp_path.display()), e))?;
    fs::rename(&tmp_path, path)
        .map_err(|e| KernelError::io(format!("replace {}", path.display()), e))?;
    Ok(())
}
