use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Operator HTTP surface (health + status)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Job manager limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagerConfig {
    /// Number of jobs allowed to run at the same time
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// How long shutdown waits for running jobs before giving up
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

/// External program invoked for every job.
///
/// When `program` is unset the daemon still accepts work, but every job
/// fails with "no executor configured".
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecutorConfig {
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// What to do with cron instants that passed while the daemon was not ticking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedRunPolicy {
    /// Collapse any number of missed instants into a single catch-up run
    #[default]
    FireOnce,
    /// Drop instants older than the misfire grace period
    Skip,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub missed_runs: MissedRunPolicy,
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            missed_runs: MissedRunPolicy::default(),
            misfire_grace_secs: default_misfire_grace_secs(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_misfire_grace_secs() -> u64 {
    60
}

/// Real-time event hub sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    /// Per-listener mailbox size
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Disconnect a listener after this many consecutive dropped messages.
    /// Unset keeps slow listeners registered forever.
    pub disconnect_after_drops: Option<u32>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            disconnect_after_drops: None,
        }
    }
}

fn default_mailbox_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Reject endpoints resolving to private, loopback or reserved addresses
    #[serde(default = "default_true")]
    pub block_private_ips: bool,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Endpoints registered at startup
    #[serde(default)]
    pub endpoints: Vec<WebhookEndpoint>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            block_private_ips: true,
            timeout_secs: default_webhook_timeout_secs(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            queue_capacity: default_queue_capacity(),
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookEndpoint {
    pub url: String,
    #[serde(default = "default_all_events")]
    pub events: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_all_events() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent_deliveries() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_concurrency")]
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_batch_concurrency(),
        }
    }
}

fn default_batch_concurrency() -> usize {
    16
}
