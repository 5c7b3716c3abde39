use super::cron::{CronError, CronSchedule};
use super::models::{ScheduleStats, ScheduledJob, ScheduledJobPatch};
use crate::config::{MissedRunPolicy, SchedulerConfig};
use crate::events::{self, Event, EventPublisher};
use crate::jobs::{JobDefinition, Manager, SubmitError, ValidationError, validation};
use crate::observability::Metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on instants scanned when catching up after a stall
const MAX_CATCH_UP_SCAN: usize = 100_000;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduled job not found: {0}")]
    NotFound(String),

    #[error("scheduled job with ID {0} already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidId(#[source] ValidationError),

    #[error("scheduled job name is required")]
    MissingName,

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("invalid job template: {0}")]
    InvalidTemplate(#[source] ValidationError),

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Where fired schedules send their jobs
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, definition: JobDefinition) -> Result<String, SubmitError>;
}

#[async_trait]
impl JobSubmitter for Manager {
    async fn submit(&self, definition: JobDefinition) -> Result<String, SubmitError> {
        self.submit_job(definition).await
    }
}

/// One automatic firing produced by [`Scheduler::evaluate`]
#[derive(Debug)]
pub struct Firing {
    pub schedule_id: String,
    /// Cron instant being honored
    pub due: DateTime<Utc>,
    /// Resolves once the job has been submitted
    pub handle: JoinHandle<Result<String, SubmitError>>,
}

struct Entry {
    job: ScheduledJob,
    cron: CronSchedule,
}

/// Cron-driven job submission.
///
/// Each evaluation checks and marks due schedules under a single write lock,
/// so a cron instant is honored at most once however often evaluation runs.
pub struct Scheduler {
    config: SchedulerConfig,
    schedules: RwLock<HashMap<String, Entry>>,
    submitter: Arc<dyn JobSubmitter>,
    events: EventPublisher,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        submitter: Arc<dyn JobSubmitter>,
        events: EventPublisher,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            schedules: RwLock::new(HashMap::new()),
            submitter,
            events,
            metrics,
        })
    }

    pub async fn add(&self, mut job: ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        if job.id.is_empty() {
            job.id = Uuid::now_v7().to_string();
        } else {
            validation::validate_id(&job.id).map_err(SchedulerError::InvalidId)?;
        }
        if job.name.trim().is_empty() {
            return Err(SchedulerError::MissingName);
        }
        let cron = CronSchedule::parse(&job.schedule)?;
        validate_template(&job.job_template)?;

        let now = Utc::now();
        job.job_template.id.clear();
        job.created_at = now;
        job.updated_at = now;
        job.next_run = if job.enabled { cron.next_after(now) } else { None };
        job.last_run = None;
        job.last_job_id = None;
        job.last_fired_for = None;
        job.run_count = 0;

        {
            let mut schedules = self.schedules.write().await;
            if schedules.contains_key(&job.id) {
                return Err(SchedulerError::AlreadyExists(job.id));
            }
            schedules.insert(
                job.id.clone(),
                Entry {
                    job: job.clone(),
                    cron,
                },
            );
        }

        info!(schedule_id = %job.id, name = %job.name, schedule = %job.schedule, next_run = ?job.next_run, "Scheduled job added");
        self.emit(events::SCHEDULE_CREATED, &job);
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Result<ScheduledJob, SchedulerError> {
        self.schedules
            .read()
            .await
            .get(id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    /// All schedules, oldest first
    pub async fn list(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self
            .schedules
            .read()
            .await
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Apply a partial update. Nothing changes unless every field is valid.
    pub async fn update(
        &self,
        id: &str,
        patch: ScheduledJobPatch,
    ) -> Result<ScheduledJob, SchedulerError> {
        let cron = patch
            .schedule
            .as_deref()
            .map(CronSchedule::parse)
            .transpose()?;
        if let Some(template) = &patch.job_template {
            validate_template(template)?;
        }
        if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(SchedulerError::MissingName);
        }

        let updated = {
            let mut schedules = self.schedules.write().await;
            let entry = schedules
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

            let mut reschedule = false;
            if let Some(cron) = cron {
                entry.job.schedule = cron.expression().to_string();
                entry.cron = cron;
                reschedule = true;
            }
            if let Some(enabled) = patch.enabled {
                reschedule |= enabled != entry.job.enabled;
                entry.job.enabled = enabled;
            }
            if let Some(name) = patch.name {
                entry.job.name = name;
            }
            if let Some(description) = patch.description {
                entry.job.description = description;
            }
            if let Some(mut template) = patch.job_template {
                template.id.clear();
                entry.job.job_template = template;
            }
            if let Some(tags) = patch.tags {
                entry.job.tags = tags;
            }

            let now = Utc::now();
            if reschedule {
                entry.job.next_run = if entry.job.enabled {
                    entry.cron.next_after(now)
                } else {
                    None
                };
            }
            entry.job.updated_at = now;
            entry.job.clone()
        };

        info!(schedule_id = %id, next_run = ?updated.next_run, "Scheduled job updated");
        self.emit(events::SCHEDULE_UPDATED, &updated);
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<ScheduledJob, SchedulerError> {
        let removed = self
            .schedules
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        info!(schedule_id = %id, "Scheduled job deleted");
        self.emit(events::SCHEDULE_DELETED, &removed.job);
        Ok(removed.job)
    }

    /// Enable a schedule. Its next run is computed from now, so instants that
    /// passed while disabled never fire.
    pub async fn enable(&self, id: &str) -> Result<ScheduledJob, SchedulerError> {
        self.set_enabled(id, true).await
    }

    pub async fn disable(&self, id: &str) -> Result<ScheduledJob, SchedulerError> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<ScheduledJob, SchedulerError> {
        let (job, changed) = {
            let mut schedules = self.schedules.write().await;
            let entry = schedules
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

            let changed = entry.job.enabled != enabled;
            if changed {
                let now = Utc::now();
                entry.job.enabled = enabled;
                entry.job.next_run = if enabled {
                    entry.cron.next_after(now)
                } else {
                    None
                };
                entry.job.updated_at = now;
            }
            (entry.job.clone(), changed)
        };

        if changed {
            let event_type = if enabled {
                events::SCHEDULE_ENABLED
            } else {
                events::SCHEDULE_DISABLED
            };
            info!(schedule_id = %id, enabled, "Scheduled job toggled");
            self.emit(event_type, &job);
        }
        Ok(job)
    }

    /// Submit the schedule's job right now, outside its cron timing.
    /// Works on disabled schedules too.
    pub async fn trigger(&self, id: &str) -> Result<String, SchedulerError> {
        let (name, definition) = {
            let mut schedules = self.schedules.write().await;
            let entry = schedules
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            entry.job.run_count += 1;
            entry.job.last_run = Some(Utc::now());
            (entry.job.name.clone(), build_definition(&entry.job, None))
        };

        info!(schedule_id = %id, "Scheduled job triggered manually");
        let job_id = self
            .submit_firing(id.to_string(), name, definition, None)
            .await?;
        Ok(job_id)
    }

    pub async fn stats(&self) -> ScheduleStats {
        let schedules = self.schedules.read().await;
        let mut stats = ScheduleStats {
            total: schedules.len(),
            ..Default::default()
        };

        for entry in schedules.values() {
            let job = &entry.job;
            stats.total_runs += job.run_count;
            if !job.enabled {
                stats.disabled += 1;
                continue;
            }
            stats.enabled += 1;
            let Some(next) = job.next_run else {
                continue;
            };
            if stats.next_run.is_none_or(|current| next < current) {
                stats.next_run = Some(next);
                stats.next_schedule_id = Some(job.id.clone());
            }
        }
        stats
    }

    /// Fire every enabled schedule whose next run is at or before `now`.
    ///
    /// Several instants missed since the last evaluation collapse into one
    /// firing for the most recent of them. Under [`MissedRunPolicy::Skip`]
    /// that instant is dropped when it is older than the misfire grace.
    pub async fn evaluate(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<Firing> {
        let mut due = Vec::new();

        {
            let mut schedules = self.schedules.write().await;
            for entry in schedules.values_mut() {
                let job = &mut entry.job;
                if !job.enabled {
                    continue;
                }
                let Some(next_run) = job.next_run else {
                    continue;
                };
                if next_run > now {
                    continue;
                }

                let latest = entry
                    .cron
                    .latest_between(next_run, now, MAX_CATCH_UP_SCAN)
                    .unwrap_or(next_run);
                job.next_run = entry.cron.next_after(now);

                if job.last_fired_for.is_some_and(|fired| fired >= latest) {
                    continue;
                }
                job.last_fired_for = Some(latest);

                let age_secs = (now - latest).num_seconds();
                if age_secs > self.config.misfire_grace_secs as i64
                    && matches!(self.config.missed_runs, MissedRunPolicy::Skip)
                {
                    warn!(schedule_id = %job.id, due = %latest, age_secs, "Skipping missed schedule run");
                    continue;
                }
                if latest > next_run {
                    info!(schedule_id = %job.id, first_missed = %next_run, due = %latest, "Coalescing missed schedule runs");
                }

                job.run_count += 1;
                job.last_run = Some(now);
                due.push((
                    job.id.clone(),
                    job.name.clone(),
                    build_definition(job, Some(latest)),
                    latest,
                ));
            }
        }

        due.into_iter()
            .map(|(schedule_id, name, definition, instant)| {
                debug!(schedule_id = %schedule_id, due = %instant, "Schedule fired");
                let scheduler = self.clone();
                let id = schedule_id.clone();
                let handle = tokio::spawn(async move {
                    scheduler
                        .submit_firing(id, name, definition, Some(instant))
                        .await
                });
                Firing {
                    schedule_id,
                    due: instant,
                    handle,
                }
            })
            .collect()
    }

    async fn submit_firing(
        &self,
        schedule_id: String,
        name: String,
        definition: JobDefinition,
        due: Option<DateTime<Utc>>,
    ) -> Result<String, SubmitError> {
        let result = self.submitter.submit(definition).await;

        let job_id = match &result {
            Ok(job_id) => Some(job_id.clone()),
            Err(e) => e.job_id().map(str::to_string),
        };
        if let Some(job_id) = &job_id {
            let mut schedules = self.schedules.write().await;
            if let Some(entry) = schedules.get_mut(&schedule_id) {
                entry.job.last_job_id = Some(job_id.clone());
            }
        }

        match &result {
            Ok(job_id) => info!(schedule_id = %schedule_id, job_id = %job_id, "Scheduled job submitted"),
            Err(e) => error!(schedule_id = %schedule_id, error = %e, "Scheduled job submission failed"),
        }

        self.metrics.schedule_fired();
        self.events
            .publish(Event::new(events::SCHEDULE_TRIGGERED).with_payload(json!({
                "schedule_id": schedule_id,
                "name": name,
                "job_id": job_id,
                "due": due,
                "manual": due.is_none(),
                "error": result.as_ref().err().map(ToString::to_string),
            })));

        result
    }

    /// Evaluate on a fixed tick until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let tick = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            tick_ms = u64::try_from(tick.as_millis()).unwrap_or(u64::MAX),
            policy = ?self.config.missed_runs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let fired = self.evaluate(Utc::now()).await;
                    if !fired.is_empty() {
                        debug!(fired = fired.len(), "Scheduler tick");
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Every schedule, for persistence
    pub async fn snapshot(&self) -> Vec<ScheduledJob> {
        self.list().await
    }

    /// Load schedules saved by [`Scheduler::snapshot`]. Saved next-run times
    /// are kept, so runs missed while the daemon was down follow the missed
    /// run policy. Entries with an unparseable expression or an existing id
    /// are skipped. Returns the number loaded.
    pub async fn restore(&self, saved: Vec<ScheduledJob>) -> usize {
        let now = Utc::now();
        let mut schedules = self.schedules.write().await;
        let mut restored = 0;

        for mut job in saved {
            if schedules.contains_key(&job.id) || job.id.is_empty() {
                warn!(schedule_id = %job.id, "Skipping restore of duplicate or unnamed schedule");
                continue;
            }
            let cron = match CronSchedule::parse(&job.schedule) {
                Ok(cron) => cron,
                Err(e) => {
                    warn!(schedule_id = %job.id, error = %e, "Skipping restore of invalid schedule");
                    continue;
                }
            };

            if !job.enabled {
                job.next_run = None;
            } else if job.next_run.is_none() {
                job.next_run = cron.next_after(now);
            }

            schedules.insert(job.id.clone(), Entry { job, cron });
            restored += 1;
        }

        info!(restored, "Schedules restored");
        restored
    }

    fn emit(&self, event_type: &str, job: &ScheduledJob) {
        let snapshot = serde_json::to_value(job).unwrap_or_else(|e| {
            error!(schedule_id = %job.id, error = %e, "Failed to serialize schedule snapshot");
            json!({ "id": job.id })
        });
        self.events.publish(
            Event::new(event_type)
                .with_payload(json!({ "schedule_id": job.id, "schedule": snapshot })),
        );
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick_interval_ms", &self.config.tick_interval_ms)
            .field("missed_runs", &self.config.missed_runs)
            .finish()
    }
}

fn validate_template(template: &JobDefinition) -> Result<(), SchedulerError> {
    validation::validate_definition(template).map_err(SchedulerError::InvalidTemplate)
}

/// The definition submitted for one firing of `job`
fn build_definition(job: &ScheduledJob, due: Option<DateTime<Utc>>) -> JobDefinition {
    let mut definition = job.job_template.clone();
    definition.id.clear();
    definition.created_at = None;
    definition.name = format!("{} (scheduled)", job.name);
    definition
        .metadata
        .insert("schedule_id".to_string(), json!(job.id));
    match due {
        Some(due) => definition
            .metadata
            .insert("scheduled_for".to_string(), json!(due)),
        None => definition
            .metadata
            .insert("trigger".to_string(), json!("manual")),
    };
    definition
}
