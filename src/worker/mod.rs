//! Bounded job worker pool
//!
//! A fixed number of workers share one queue receiver, so at most
//! `max_concurrent_jobs` jobs execute at any moment.

pub mod runner;

use crate::jobs::Manager;
use crate::queue::JobReceiver;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

pub struct WorkerPool {
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub fn spawn(
        config: WorkerConfig,
        manager: Arc<Manager>,
        receiver: Arc<JobReceiver>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut tasks = JoinSet::new();
        for worker_id in 0..config.workers.max(1) {
            tasks.spawn(runner::run(
                worker_id,
                manager.clone(),
                receiver.clone(),
                shutdown.clone(),
            ));
        }
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every worker to exit. Returns `false` and aborts the
    /// stragglers if `timeout` elapses first.
    pub async fn join(mut self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => true,
            Err(_) => {
                warn!(remaining = self.tasks.len(), "Workers did not stop in time, aborting");
                self.tasks.abort_all();
                false
            }
        }
    }
}
