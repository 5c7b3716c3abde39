//! Apply one operation to many targets concurrently.
//!
//! Every target runs to completion; one failure never stops its siblings.
//! A panicking target is recorded as a failure like any other error.

use crate::config::BatchConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    pub target: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate outcome, with per-target results in input order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperationResult {
    pub operation: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<TargetResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl BatchOperationResult {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Results for targets that failed
    pub fn failures(&self) -> impl Iterator<Item = &TargetResult> {
        self.results.iter().filter(|result| !result.success)
    }
}

#[derive(Debug, Clone)]
pub struct BatchExecutor {
    max_concurrency: usize,
}

impl BatchExecutor {
    pub fn new(config: &BatchConfig) -> Self {
        Self::with_concurrency(config.max_concurrency)
    }

    pub fn with_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run `op` once per target, at most `max_concurrency` at a time
    pub async fn run<F, Fut, E>(
        &self,
        operation: &str,
        targets: Vec<String>,
        op: F,
    ) -> BatchOperationResult
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let items = targets
            .into_iter()
            .map(|target| (target.clone(), target))
            .collect();
        self.run_items(operation, items, op).await
    }

    /// Like [`BatchExecutor::run`] for arbitrary items, each reported under
    /// its label
    pub async fn run_items<T, F, Fut, E>(
        &self,
        operation: &str,
        items: Vec<(String, T)>,
        op: F,
    ) -> BatchOperationResult
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let started_at = Utc::now();
        let clock = Instant::now();
        let total = items.len();
        let op = Arc::new(op);
        let permits = Arc::new(Semaphore::new(self.max_concurrency));

        let mut targets = Vec::with_capacity(total);
        let mut handles = Vec::with_capacity(total);
        for (label, item) in items {
            let op = op.clone();
            let permits = permits.clone();
            targets.push(label);
            handles.push(tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| e.to_string())?;
                op(item).await.map_err(|e| e.to_string())
            }));
        }

        let mut results = Vec::with_capacity(total);
        for (target, handle) in targets.into_iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(format!("target panicked: {join_error}")),
            };
            match outcome {
                Ok(()) => {
                    debug!(operation, target = %target, "Batch target succeeded");
                    results.push(TargetResult {
                        target,
                        success: true,
                        error: None,
                    });
                }
                Err(error) => {
                    warn!(operation, target = %target, error = %error, "Batch target failed");
                    results.push(TargetResult {
                        target,
                        success: false,
                        error: Some(error),
                    });
                }
            }
        }

        let successful = results.iter().filter(|result| result.success).count();
        let result = BatchOperationResult {
            operation: operation.to_string(),
            total,
            successful,
            failed: total - successful,
            results,
            started_at,
            finished_at: Utc::now(),
            duration_ms: millis(clock.elapsed()),
        };

        info!(
            operation,
            total,
            successful,
            failed = result.failed,
            duration_ms = result.duration_ms,
            "Batch operation finished"
        );
        result
    }
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self::new(&BatchConfig::default())
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn targets(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_batch_is_vacuous_success() {
        let result = BatchExecutor::default()
            .run("export", Vec::new(), |_target| async { Ok::<(), String>(()) })
            .await;

        assert_eq!(result.total, 0);
        assert_eq!(result.successful, 0);
        assert_eq!(result.failed, 0);
        assert!(result.all_succeeded());
        assert!(result.finished_at >= result.started_at);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_siblings() {
        let result = BatchExecutor::with_concurrency(2)
            .run("export", targets(&["vm-a", "vm-b", "vm-c"]), |target| async move {
                if target == "vm-b" {
                    Err(format!("{target} is locked"))
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(result.operation, "export");
        assert_eq!(result.total, 3);
        assert_eq!(result.successful, 2);
        assert_eq!(result.failed, 1);
        let names: Vec<_> = result.results.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(names, ["vm-a", "vm-b", "vm-c"]);

        let failures: Vec<_> = result.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.as_deref(), Some("vm-b is locked"));
    }

    #[tokio::test]
    async fn test_panic_recorded_as_failure() {
        let result = BatchExecutor::default()
            .run("backup", targets(&["ok", "boom"]), |target| async move {
                if target == "boom" {
                    panic!("disk on fire");
                }
                Ok::<(), String>(())
            })
            .await;

        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 1);
        assert!(result.results[1]
            .error
            .as_deref()
            .unwrap()
            .contains("panicked"));
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let names: Vec<String> = (0..12).map(|i| format!("vm-{i}")).collect();
        let (r, p) = (running.clone(), peak.clone());
        let result = BatchExecutor::with_concurrency(3)
            .run("migrate", names, move |_target| {
                let (running, peak) = (r.clone(), p.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
            })
            .await;

        assert_eq!(result.successful, 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
