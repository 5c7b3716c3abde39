use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
}

/// JobEnvelope carries a queued job id with its submission sequence number
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobEnvelope {
    pub seq: u64,
    pub job_id: String,
}

/// JobBroker hands admitted jobs to the worker pool
///
/// Architecture:
/// 1. Manager records the job, then calls `broker.enqueue(envelope)`
/// 2. Envelope goes onto a single FIFO channel shared by every worker
/// 3. Whichever worker is idle takes the next envelope
///
/// Enqueueing never waits: a saturated pool only lengthens the queue.
pub struct JobBroker {
    sender: mpsc::UnboundedSender<JobEnvelope>,
    depth: Arc<AtomicUsize>,
}

/// Consumer side shared by all workers through `Arc`
pub struct JobReceiver {
    receiver: Mutex<mpsc::UnboundedReceiver<JobEnvelope>>,
    depth: Arc<AtomicUsize>,
}

impl JobBroker {
    pub fn new() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));

        let broker = Self {
            sender,
            depth: depth.clone(),
        };
        let receiver = JobReceiver {
            receiver: Mutex::new(receiver),
            depth,
        };

        (broker, receiver)
    }

    pub fn enqueue(&self, envelope: JobEnvelope) -> Result<(), QueueError> {
        let seq = envelope.seq;
        // count before sending so a fast worker never drives depth below zero
        self.depth.fetch_add(1, Ordering::AcqRel);
        match self.sender.send(envelope) {
            Ok(()) => {
                debug!(seq, "Job queued");
                Ok(())
            }
            Err(_) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                warn!(seq, "Job queue closed, job not delivered");
                Err(QueueError::Closed)
            }
        }
    }

    /// Jobs waiting for a worker
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl JobReceiver {
    /// Next queued envelope, or `None` once every broker handle is gone.
    ///
    /// Cancel safe: dropping the future never loses an envelope.
    pub async fn recv(&self) -> Option<JobEnvelope> {
        let mut receiver = self.receiver.lock().await;
        let envelope = receiver.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(envelope)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}
