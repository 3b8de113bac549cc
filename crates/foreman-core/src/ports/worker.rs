//! Worker provider port - 外部ワーカー（LLM エージェント）の抽象化
//!
//! The kernel only assumes a request/response contract plus a cooldown
//! signal; transport and prompt format belong to the implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::KernelError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub prompt: String,
    pub context: String,
    #[serde(default)]
    pub tools: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub content: String,
    pub provider_id: String,
    /// Shell commands the worker wants to run; each must pass the command checks.
    #[serde(default)]
    pub proposed_commands: Vec<String>,
}

impl WorkerResponse {
    pub fn new(content: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            provider_id: provider_id.into(),
            proposed_commands: Vec::new(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.proposed_commands.push(command.into());
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkerError {
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("timed out")]
    Timeout,

    #[error("provider error: {0}")]
    ProviderError(String),
}

impl From<WorkerError> for KernelError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::RateLimited { retry_after } => KernelError::RateLimited { retry_after },
            WorkerError::Timeout => KernelError::Timeout {
                operation: "worker invocation".to_string(),
                after: Duration::ZERO,
            },
            WorkerError::ProviderError(message) => KernelError::ProviderError(message),
        }
    }
}

#[async_trait]
pub trait WorkerProvider: Send + Sync {
    async fn invoke(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError>;
}
