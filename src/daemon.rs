//! Daemon assembly: builds every component from a [`Config`], wires the
//! event fan-out and owns the background tasks.

use crate::batch::{BatchExecutor, BatchOperationResult};
use crate::config::{Config, WebhookEndpoint};
use crate::events::EventPublisher;
use crate::executor::JobExecutor;
use crate::hub::Hub;
use crate::jobs::{DaemonStatus, Job, Manager};
use crate::observability::{Metrics, MetricsSnapshot};
use crate::scheduler::{ScheduleStats, ScheduledJob, Scheduler};
use crate::webhooks::{Dispatcher, WebhookError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long hub and dispatcher get to drain once the manager has stopped
const BACKGROUND_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error("{failed} configured webhook endpoint(s) rejected: {details}")]
    Endpoints { failed: usize, details: String },
}

/// Aggregate view served at `/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub daemon: DaemonStatus,
    pub schedules: ScheduleStats,
    pub hub_clients: usize,
    pub webhooks: usize,
    pub metrics: MetricsSnapshot,
}

/// In-memory state hand-off between daemon instances
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonSnapshot {
    pub jobs: Vec<Job>,
    pub schedules: Vec<ScheduledJob>,
}

pub struct Daemon {
    config: Config,
    metrics: Arc<Metrics>,
    hub: Hub,
    webhooks: Dispatcher,
    manager: Arc<Manager>,
    scheduler: Arc<Scheduler>,
    batch: BatchExecutor,
    scheduler_stop: CancellationToken,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    /// Start the hub, webhook dispatcher, job workers and scheduler.
    ///
    /// Webhook endpoints listed in the configuration are registered up
    /// front; any rejected endpoint aborts startup.
    pub async fn start(config: Config, executor: Arc<dyn JobExecutor>) -> Result<Self, DaemonError> {
        let metrics = Arc::new(Metrics::new());
        let shutdown = CancellationToken::new();

        let (hub, hub_task) = Hub::spawn(config.hub.clone(), metrics.clone(), shutdown.child_token());
        let (webhooks, webhook_task) =
            match Dispatcher::spawn(&config.webhooks, metrics.clone(), shutdown.child_token()) {
                Ok(spawned) => spawned,
                Err(e) => {
                    shutdown.cancel();
                    return Err(e.into());
                }
            };

        let batch = BatchExecutor::new(&config.batch);
        let registration =
            register_endpoints(&batch, &webhooks, config.webhooks.endpoints.clone()).await;
        if !registration.all_succeeded() {
            shutdown.cancel();
            let details = registration
                .failures()
                .map(|f| format!("{}: {}", f.target, f.error.as_deref().unwrap_or("unknown")))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DaemonError::Endpoints {
                failed: registration.failed,
                details,
            });
        }

        let events = EventPublisher::new()
            .with_sink(Arc::new(hub.clone()))
            .with_sink(Arc::new(webhooks.clone()));

        let manager = Manager::new(
            config.manager.clone(),
            executor,
            events.clone(),
            metrics.clone(),
        );
        manager.start().await;

        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            manager.clone(),
            events,
            metrics.clone(),
        );
        let scheduler_stop = shutdown.child_token();
        let scheduler_task = tokio::spawn(scheduler.clone().run(scheduler_stop.clone()));

        info!(
            workers = config.manager.max_concurrent_jobs,
            webhooks = registration.successful,
            "Daemon started"
        );

        Ok(Self {
            config,
            metrics,
            hub,
            webhooks,
            manager,
            scheduler,
            batch,
            scheduler_stop,
            shutdown,
            tasks: Mutex::new(vec![hub_task, webhook_task, scheduler_task]),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn webhooks(&self) -> &Dispatcher {
        &self.webhooks
    }

    pub fn batch(&self) -> &BatchExecutor {
        &self.batch
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            daemon: self.manager.status().await,
            schedules: self.scheduler.stats().await,
            hub_clients: self.hub.client_count().await.unwrap_or(0),
            webhooks: self.webhooks.list().await.len(),
            metrics: self.metrics.snapshot(),
        }
    }

    pub async fn snapshot(&self) -> DaemonSnapshot {
        DaemonSnapshot {
            jobs: self.manager.snapshot().await,
            schedules: self.scheduler.snapshot().await,
        }
    }

    pub async fn restore(&self, snapshot: DaemonSnapshot) {
        let jobs = self.manager.restore(snapshot.jobs).await;
        let schedules = self.scheduler.restore(snapshot.schedules).await;
        info!(jobs, schedules, "Daemon state restored");
    }

    /// Stop scheduling, drain the job manager, then stop event delivery.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Daemon shutting down");

        self.scheduler_stop.cancel();
        self.manager.shutdown().await;
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if tokio::time::timeout(BACKGROUND_STOP_TIMEOUT, task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }
        info!("Daemon stopped");
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("manager", &self.manager)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

async fn register_endpoints(
    batch: &BatchExecutor,
    webhooks: &Dispatcher,
    endpoints: Vec<WebhookEndpoint>,
) -> BatchOperationResult {
    let items = endpoints
        .into_iter()
        .enumerate()
        .map(|(index, endpoint)| (format!("webhooks.endpoints[{index}] {}", endpoint.url), endpoint))
        .collect();

    let webhooks = webhooks.clone();
    batch
        .run_items("register_webhooks", items, move |endpoint| {
            let webhooks = webhooks.clone();
            async move { webhooks.register(endpoint).await.map(|_| ()) }
        })
        .await
}
