//! Worker loop - takes queued jobs and runs them to a terminal state

use crate::jobs::Manager;
use crate::queue::JobReceiver;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run jobs until shutdown is requested or the queue closes.
///
/// Shutdown stops the worker from taking new jobs; a job already running
/// is driven to completion (its own token is cancelled separately).
pub async fn run(
    worker_id: usize,
    manager: Arc<Manager>,
    receiver: Arc<JobReceiver>,
    shutdown: CancellationToken,
) {
    debug!(worker_id, "Worker started");

    loop {
        let envelope = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = receiver.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        debug!(worker_id, seq = envelope.seq, job_id = %envelope.job_id, "Worker picked job");
        manager.run_job(&envelope.job_id).await;
    }

    info!(worker_id, "Worker stopped");
}
