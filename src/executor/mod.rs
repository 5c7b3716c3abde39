//! Hypervisor adapter boundary.
//!
//! The manager never talks to hypervisor tooling directly. It hands a
//! [`JobDefinition`] and a [`JobContext`] to a [`JobExecutor`] and records
//! whatever comes back. The context carries the progress callback and the
//! cooperative cancellation signal.

mod command;

pub use command::CommandExecutor;

use crate::jobs::{JobDefinition, JobProgress, JobResult};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("job cancelled")]
    Cancelled,

    #[error("no executor configured")]
    Unconfigured,

    #[error("executor I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("executor exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("invalid executor output: {0}")]
    InvalidOutput(String),

    #[error("{0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Receives progress reports from running jobs
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, job_id: &str, progress: JobProgress);
}

struct DiscardProgress;

#[async_trait]
impl ProgressSink for DiscardProgress {
    async fn report(&self, _job_id: &str, _progress: JobProgress) {}
}

/// Handle given to the executing work for one job
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    cancel: CancellationToken,
    sink: Arc<dyn ProgressSink>,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, cancel: CancellationToken, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            job_id: job_id.into(),
            cancel,
            sink,
        }
    }

    /// Context with its own token and no progress consumer
    pub fn detached(job_id: impl Into<String>) -> Self {
        Self::new(job_id, CancellationToken::new(), Arc::new(DiscardProgress))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe point for cooperative cancellation
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        Ok(())
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn report(&self, progress: JobProgress) {
        self.sink.report(&self.job_id, progress).await;
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Executes one job definition. May report progress any number of times
/// before returning.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, definition: &JobDefinition, ctx: JobContext) -> Result<JobResult>;
}

/// Stand-in used when no executor program is configured
#[derive(Debug, Default)]
pub struct UnconfiguredExecutor;

#[async_trait]
impl JobExecutor for UnconfiguredExecutor {
    async fn execute(&self, _definition: &JobDefinition, _ctx: JobContext) -> Result<JobResult> {
        Err(ExecutionError::Unconfigured)
    }
}

/// Build the executor described by configuration
pub fn from_config(config: &crate::config::ExecutorConfig) -> Arc<dyn JobExecutor> {
    match &config.program {
        Some(program) => Arc::new(CommandExecutor::new(program.clone(), config.args.clone())),
        None => {
            tracing::warn!("No executor program configured, every job will fail");
            Arc::new(UnconfiguredExecutor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_observes_cancel() {
        let ctx = JobContext::detached("job-1");
        assert!(ctx.checkpoint().is_ok());

        ctx.cancellation_token().cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.checkpoint(), Err(ExecutionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_unconfigured_executor_fails() {
        let def = JobDefinition::new("vm-1", "/out");
        let err = UnconfiguredExecutor
            .execute(&def, JobContext::detached("job-1"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no executor configured");
    }
}
