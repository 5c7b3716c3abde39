//! Metrics counters and tracing setup

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber, filtered by `RUST_LOG` (default `info`)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Metrics handle for recording counters
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_submitted: AtomicU64,
    jobs_rejected: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    schedules_fired: AtomicU64,
    events_dropped: AtomicU64,
    webhook_deliveries: AtomicU64,
    webhook_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = name, "Metric incremented");
    }

    pub fn job_submitted(&self) {
        Self::bump(&self.jobs_submitted, "jobs_submitted");
    }

    /// A definition failed validation and was recorded as Failed
    pub fn job_rejected(&self) {
        Self::bump(&self.jobs_rejected, "jobs_rejected");
    }

    pub fn job_completed(&self) {
        Self::bump(&self.jobs_completed, "jobs_completed");
    }

    pub fn job_failed(&self) {
        Self::bump(&self.jobs_failed, "jobs_failed");
    }

    pub fn job_cancelled(&self) {
        Self::bump(&self.jobs_cancelled, "jobs_cancelled");
    }

    pub fn schedule_fired(&self) {
        Self::bump(&self.schedules_fired, "schedules_fired");
    }

    /// A hub or webhook queue was full and an event was discarded
    pub fn event_dropped(&self) {
        Self::bump(&self.events_dropped, "events_dropped");
    }

    pub fn webhook_delivered(&self) {
        Self::bump(&self.webhook_deliveries, "webhook_deliveries");
    }

    pub fn webhook_failed(&self) {
        Self::bump(&self.webhook_failures, "webhook_failures");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            schedules_fired: self.schedules_fired.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            webhook_deliveries: self.webhook_deliveries.load(Ordering::Relaxed),
            webhook_failures: self.webhook_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_rejected: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub schedules_fired: u64,
    pub events_dropped: u64,
    pub webhook_deliveries: u64,
    pub webhook_failures: u64,
}
