//! Job registry and executor.
//!
//! The manager owns the canonical state of every job. Each job lives behind
//! its own lock so progress writes from the executing work never tear a
//! concurrent query. Events are built from snapshots taken under that lock
//! and published after it is released.

use super::error::{CancelError, JobError, SubmitError};
use super::models::{
    BatchSubmitResponse, CancelResponse, DaemonStatus, Job, JobDefinition, JobProgress, JobQuery,
    JobResult, JobStatus, QueryResponse,
};
use super::progress::{self, EtaEstimate};
use super::validation;
use crate::config::ManagerConfig;
use crate::events::{self, Event, EventPublisher};
use crate::executor::{ExecutionError, JobContext, JobExecutor, ProgressSink};
use crate::observability::Metrics;
use crate::queue::{JobBroker, JobEnvelope, JobReceiver};
use crate::worker::{WorkerConfig, WorkerPool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SHUTDOWN_REASON: &str = "daemon shutting down";
const RESTART_REASON: &str = "interrupted by daemon restart";
const INITIAL_PHASE: &str = "connecting";

struct JobEntry {
    seq: u64,
    job: Mutex<Job>,
    cancel: CancellationToken,
}

pub struct Manager {
    config: ManagerConfig,
    jobs: RwLock<HashMap<String, Arc<JobEntry>>>,
    next_seq: AtomicU64,
    broker: JobBroker,
    receiver: Arc<JobReceiver>,
    executor: Arc<dyn JobExecutor>,
    events: EventPublisher,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    accepting: AtomicBool,
    workers: Mutex<Option<WorkerPool>>,
    started_at: DateTime<Utc>,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        executor: Arc<dyn JobExecutor>,
        events: EventPublisher,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (broker, receiver) = JobBroker::new();
        Arc::new(Self {
            config,
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            broker,
            receiver: Arc::new(receiver),
            executor,
            events,
            metrics,
            shutdown: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            workers: Mutex::new(None),
            started_at: Utc::now(),
        })
    }

    /// Spawn the worker pool. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if workers.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let config = WorkerConfig {
            workers: self.config.max_concurrent_jobs,
        };
        info!(workers = config.workers, "Starting job workers");
        *workers = Some(WorkerPool::spawn(
            config,
            self.clone(),
            self.receiver.clone(),
            self.shutdown.clone(),
        ));
    }

    /// Record a job and queue it for execution.
    ///
    /// A definition that fails validation is still recorded, as Failed, and
    /// the returned error carries its id.
    pub async fn submit_job(&self, mut def: JobDefinition) -> Result<String, SubmitError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }

        if def.id.is_empty() {
            def.id = Uuid::now_v7().to_string();
        } else {
            validation::validate_id(&def.id).map_err(SubmitError::InvalidId)?;
        }
        if def.created_at.is_none() {
            def.created_at = Some(Utc::now());
        }

        let invalid = validation::validate_definition(&def).err();
        let job_id = def.id.clone();

        let mut job = Job::new(def);
        if let Some(reason) = &invalid {
            job.status = JobStatus::Failed;
            job.error = reason.to_string();
            job.completed_at = Some(job.updated_at);
        }
        let snapshot = job.clone();

        let seq = {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job_id) {
                return Err(SubmitError::DuplicateId(job_id));
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            jobs.insert(
                job_id.clone(),
                Arc::new(JobEntry {
                    seq,
                    job: Mutex::new(job),
                    cancel: self.shutdown.child_token(),
                }),
            );
            seq
        };

        self.emit(events::JOB_CREATED, &snapshot);

        if let Some(reason) = invalid {
            warn!(job_id = %job_id, error = %reason, "Job rejected by validation");
            self.metrics.job_rejected();
            self.emit(events::JOB_FAILED, &snapshot);
            return Err(SubmitError::Invalid {
                job_id,
                source: reason,
            });
        }

        self.metrics.job_submitted();
        info!(job_id = %job_id, target = %snapshot.definition.target, "Job submitted");

        let envelope = JobEnvelope {
            seq,
            job_id: job_id.clone(),
        };
        if let Err(e) = self.broker.enqueue(envelope) {
            error!(job_id = %job_id, error = %e, "Could not queue job");
            self.finish_pending(&job_id, JobStatus::Failed, e.to_string())
                .await;
        } else if self.shutdown.is_cancelled() {
            // raced with shutdown after its pending sweep
            self.finish_pending(&job_id, JobStatus::Cancelled, SHUTDOWN_REASON.to_string())
                .await;
        }

        Ok(job_id)
    }

    /// Submit several definitions; each succeeds or fails on its own
    pub async fn submit_batch(&self, defs: Vec<JobDefinition>) -> BatchSubmitResponse {
        let mut response = BatchSubmitResponse::default();

        for (index, def) in defs.into_iter().enumerate() {
            let key = if def.id.is_empty() {
                format!("#{index}")
            } else {
                def.id.clone()
            };

            match self.submit_job(def).await {
                Ok(job_id) => {
                    response.accepted += 1;
                    response.job_ids.push(job_id);
                }
                Err(e) => {
                    response.rejected += 1;
                    let key = match e.job_id() {
                        Some(job_id) => {
                            response.job_ids.push(job_id.to_string());
                            job_id.to_string()
                        }
                        None => key,
                    };
                    response.errors.insert(key, e.to_string());
                }
            }
        }

        response
    }

    pub async fn get_job(&self, id: &str) -> Result<Job, JobError> {
        let entry = self
            .entry(id)
            .await
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let job = entry.job.lock().await;
        Ok(job.clone())
    }

    /// Jobs in submission order, filtered by `query`.
    ///
    /// Without `all`, explicit ids or explicit statuses only pending and
    /// running jobs are listed.
    pub async fn query_jobs(&self, query: &JobQuery) -> QueryResponse {
        let ids: HashSet<&str> = query.job_ids.iter().map(String::as_str).collect();
        let statuses: HashSet<JobStatus> = query.status.iter().copied().collect();
        let active_only = !query.all && ids.is_empty() && statuses.is_empty();
        let limit = query.limit.filter(|l| *l > 0).unwrap_or(usize::MAX);

        let mut jobs = Vec::new();
        for entry in self.ordered_entries().await {
            if jobs.len() >= limit {
                break;
            }
            let job = entry.job.lock().await;
            if !ids.is_empty() && !ids.contains(job.id()) {
                continue;
            }
            if !statuses.is_empty() && !statuses.contains(&job.status) {
                continue;
            }
            if active_only && job.is_terminal() {
                continue;
            }
            jobs.push(job.clone());
        }

        QueryResponse {
            total: jobs.len(),
            jobs,
            timestamp: Utc::now(),
        }
    }

    /// Cancel each id independently.
    ///
    /// Pending jobs are cancelled at once. Running jobs get their token
    /// cancelled and reach Cancelled when the executor returns.
    pub async fn cancel_jobs(&self, ids: &[String]) -> CancelResponse {
        let mut response = CancelResponse::default();

        for id in ids {
            match self.cancel_one(id).await {
                Ok(()) => response.cancelled.push(id.clone()),
                Err(e) => {
                    debug!(job_id = %id, error = %e, "Cancel refused");
                    response.errors.insert(id.clone(), e.to_string());
                    response.failed.push(id.clone());
                }
            }
        }

        response
    }

    async fn cancel_one(&self, id: &str) -> Result<(), CancelError> {
        let entry = self
            .entry(id)
            .await
            .ok_or_else(|| CancelError::NotFound(id.to_string()))?;

        let snapshot = {
            let mut job = entry.job.lock().await;
            match job.status {
                JobStatus::Pending => {
                    entry.cancel.cancel();
                    transition(&mut job, JobStatus::Cancelled);
                    job.clone()
                }
                JobStatus::Running => {
                    if entry.cancel.is_cancelled() {
                        return Err(CancelError::AlreadyRequested(id.to_string()));
                    }
                    entry.cancel.cancel();
                    info!(job_id = %id, "Cancellation requested for running job");
                    return Ok(());
                }
                status => {
                    return Err(CancelError::Terminal {
                        id: id.to_string(),
                        status,
                    });
                }
            }
        };

        info!(job_id = %id, "Pending job cancelled");
        self.metrics.job_cancelled();
        self.emit(events::JOB_CANCELLED, &snapshot);
        Ok(())
    }

    /// Completion estimate for one job
    pub async fn job_eta(&self, id: &str) -> Result<EtaEstimate, JobError> {
        let job = self.get_job(id).await?;
        Ok(progress::estimate(&job, Utc::now()))
    }

    /// Record a progress report. Ignored unless the job is running.
    pub async fn report_progress(&self, id: &str, update: JobProgress) {
        let Some(entry) = self.entry(id).await else {
            return;
        };

        let snapshot = {
            let mut job = entry.job.lock().await;
            if job.status != JobStatus::Running {
                debug!(job_id = %id, status = %job.status, "Dropping progress for inactive job");
                return;
            }
            let merged = progress::merge_progress(job.progress.as_ref(), update);
            job.progress = Some(merged.clone());
            job.updated_at = Utc::now();
            merged
        };

        self.events.publish(Event::new(events::JOB_PROGRESS).with_payload(json!({
            "job_id": id,
            "progress": snapshot,
        })));
    }

    /// Drive one queued job through execution. Called by workers.
    pub async fn run_job(self: &Arc<Self>, id: &str) {
        let Some(entry) = self.entry(id).await else {
            warn!(job_id = %id, "Queued job vanished from registry");
            return;
        };

        let (definition, started) = {
            let mut job = entry.job.lock().await;
            if job.status != JobStatus::Pending {
                debug!(job_id = %id, status = %job.status, "Skipping job that left pending");
                return;
            }
            if entry.cancel.is_cancelled() {
                drop(job);
                self.finish_pending(id, JobStatus::Cancelled, SHUTDOWN_REASON.to_string())
                    .await;
                return;
            }

            transition(&mut job, JobStatus::Running);
            job.started_at = Some(job.updated_at);
            job.progress = Some(JobProgress {
                phase: INITIAL_PHASE.to_string(),
                method: job.definition.method.clone(),
                ..Default::default()
            });
            (job.definition.clone(), job.clone())
        };

        info!(job_id = %id, target = %definition.target, "Job started");
        self.emit(events::JOB_STARTED, &started);

        let ctx = JobContext::new(id, entry.cancel.clone(), self.clone() as Arc<dyn ProgressSink>);
        let executor = self.executor.clone();
        let handle = tokio::spawn(async move { executor.execute(&definition, ctx).await });
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(ExecutionError::Failed(format!(
                "executor panicked: {join_error}"
            ))),
        };

        self.complete(&entry, outcome).await;
    }

    async fn complete(&self, entry: &JobEntry, outcome: Result<JobResult, ExecutionError>) {
        let (event_type, snapshot) = {
            let mut job = entry.job.lock().await;
            let id = job.id().to_string();

            let event_type = match outcome {
                Ok(mut result) => {
                    if result.method.is_none() {
                        result.method = job.definition.method.clone();
                    }
                    if let Some(progress) = job.progress.as_mut() {
                        progress.phase = "completed".to_string();
                        progress.percent_complete = 100.0;
                    }
                    transition(&mut job, JobStatus::Completed);
                    info!(job_id = %id, total_bytes = result.total_bytes, "Job completed");
                    job.result = Some(result);
                    self.metrics.job_completed();
                    events::JOB_COMPLETED
                }
                Err(e) if entry.cancel.is_cancelled() || matches!(e, ExecutionError::Cancelled) => {
                    transition(&mut job, JobStatus::Cancelled);
                    if self.shutdown.is_cancelled() {
                        job.error = SHUTDOWN_REASON.to_string();
                    }
                    info!(job_id = %id, "Job cancelled");
                    self.metrics.job_cancelled();
                    events::JOB_CANCELLED
                }
                Err(e) => {
                    transition(&mut job, JobStatus::Failed);
                    job.error = e.to_string();
                    warn!(job_id = %id, error = %e, "Job failed");
                    self.metrics.job_failed();
                    events::JOB_FAILED
                }
            };

            (event_type, job.clone())
        };

        self.emit(event_type, &snapshot);
    }

    /// Move a still-pending job straight to a terminal state
    async fn finish_pending(&self, id: &str, status: JobStatus, reason: String) {
        let Some(entry) = self.entry(id).await else {
            return;
        };

        let snapshot = {
            let mut job = entry.job.lock().await;
            if job.status != JobStatus::Pending {
                return;
            }
            transition(&mut job, status);
            job.error = reason;
            job.clone()
        };

        match status {
            JobStatus::Cancelled => {
                self.metrics.job_cancelled();
                self.emit(events::JOB_CANCELLED, &snapshot);
            }
            _ => {
                self.metrics.job_failed();
                self.emit(events::JOB_FAILED, &snapshot);
            }
        }
    }

    pub async fn status(&self) -> DaemonStatus {
        let mut counts: HashMap<JobStatus, usize> = HashMap::new();
        let entries = self.ordered_entries().await;
        for entry in &entries {
            let status = entry.job.lock().await.status;
            *counts.entry(status).or_default() += 1;
        }
        let count = |status: JobStatus| counts.get(&status).copied().unwrap_or(0);

        DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            total_jobs: entries.len(),
            pending_jobs: count(JobStatus::Pending),
            running_jobs: count(JobStatus::Running),
            completed_jobs: count(JobStatus::Completed),
            failed_jobs: count(JobStatus::Failed),
            cancelled_jobs: count(JobStatus::Cancelled),
            queue_depth: self.broker.depth(),
            max_concurrent_jobs: self.config.max_concurrent_jobs,
        }
    }

    /// Every job in submission order
    pub async fn snapshot(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for entry in self.ordered_entries().await {
            jobs.push(entry.job.lock().await.clone());
        }
        jobs
    }

    /// Load jobs saved by [`Manager::snapshot`]. Jobs that were still pending
    /// or running cannot resume and are recorded as Failed. Ids already
    /// present are skipped. Returns the number of jobs loaded.
    pub async fn restore(&self, saved: Vec<Job>) -> usize {
        let mut jobs = self.jobs.write().await;
        let mut restored = 0;

        for mut job in saved {
            if jobs.contains_key(job.id()) {
                warn!(job_id = %job.id(), "Skipping restore of existing job");
                continue;
            }
            if !job.is_terminal() {
                job.status = JobStatus::Failed;
                job.error = RESTART_REASON.to_string();
                job.updated_at = Utc::now();
                job.completed_at = Some(job.updated_at);
            }

            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let cancel = self.shutdown.child_token();
            jobs.insert(
                job.id().to_string(),
                Arc::new(JobEntry {
                    seq,
                    job: Mutex::new(job),
                    cancel,
                }),
            );
            restored += 1;
        }

        info!(restored, "Jobs restored");
        restored
    }

    /// Stop accepting work, cancel queued and running jobs and wait for the
    /// workers up to the configured timeout.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Job manager shutting down");
        self.shutdown.cancel();

        for entry in self.ordered_entries().await {
            let id = entry.job.lock().await.id().to_string();
            self.finish_pending(&id, JobStatus::Cancelled, SHUTDOWN_REASON.to_string())
                .await;
        }

        let workers = self.workers.lock().await.take();
        if let Some(workers) = workers {
            let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
            if !workers.join(timeout).await {
                self.fail_unfinished("shutdown timed out").await;
            }
        }
        info!("Job manager stopped");
    }

    async fn fail_unfinished(&self, reason: &str) {
        for entry in self.ordered_entries().await {
            let snapshot = {
                let mut job = entry.job.lock().await;
                if job.is_terminal() {
                    continue;
                }
                transition(&mut job, JobStatus::Failed);
                job.error = reason.to_string();
                job.clone()
            };
            self.metrics.job_failed();
            self.emit(events::JOB_FAILED, &snapshot);
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    async fn entry(&self, id: &str) -> Option<Arc<JobEntry>> {
        self.jobs.read().await.get(id).cloned()
    }

    async fn ordered_entries(&self) -> Vec<Arc<JobEntry>> {
        let mut entries: Vec<_> = self.jobs.read().await.values().cloned().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }

    fn emit(&self, event_type: &str, job: &Job) {
        let payload = serde_json::to_value(job).unwrap_or_else(|e| {
            error!(job_id = %job.id(), error = %e, "Failed to serialize job snapshot");
            json!({ "definition": { "id": job.id() } })
        });
        self.events
            .publish(Event::new(event_type).with_payload(json!({ "job_id": job.id(), "job": payload })));
    }
}

#[async_trait]
impl ProgressSink for Manager {
    async fn report(&self, job_id: &str, progress: JobProgress) {
        self.report_progress(job_id, progress).await;
    }
}

/// Apply a lifecycle edge, refusing anything the state machine forbids
fn transition(job: &mut Job, next: JobStatus) -> bool {
    if !job.status.can_transition_to(next) {
        error!(job_id = %job.id(), from = %job.status, to = %next, "Illegal job transition refused");
        return false;
    }
    let now = Utc::now();
    job.status = next;
    job.updated_at = now;
    if next.is_terminal() {
        job.completed_at = Some(now);
    }
    true
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("max_concurrent_jobs", &self.config.max_concurrent_jobs)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}
