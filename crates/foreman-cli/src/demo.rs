//! Offline worker for `foreman run`.
//!
//! Answers every phase from the prompt alone, so a task file can be walked
//! end to end without a real provider.

use async_trait::async_trait;
use foreman_core::ports::{WorkerError, WorkerProvider, WorkerRequest, WorkerResponse};

pub struct EchoWorker {
    provider: String,
}

impl EchoWorker {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

#[async_trait]
impl WorkerProvider for EchoWorker {
    async fn invoke(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        let mut lines = request.prompt.lines();
        let phase = lines.next().unwrap_or_default();
        let task = lines.next().unwrap_or_default();
        let prior = request.context.lines().filter(|l| l.starts_with("## ")).count();
        Ok(WorkerResponse::new(
            format!(
                "{phase}\n{task}\n\nWork through this step using {prior} earlier \
                 result(s): restate the goal, name each file to change, and list \
                 the checks a reviewer can rerun."
            ),
            self.provider.clone(),
        ))
    }
}
