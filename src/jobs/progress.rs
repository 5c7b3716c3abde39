//! Progress bookkeeping and completion estimates

use super::models::{Job, JobProgress, JobStatus};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Fold a progress report into the previous one.
///
/// The percentage is clamped to [0, 100] and never moves backwards; a NaN
/// report keeps the previous value.
pub fn merge_progress(previous: Option<&JobProgress>, mut update: JobProgress) -> JobProgress {
    let floor = previous.map(|p| p.percent_complete).unwrap_or(0.0);
    let reported = if update.percent_complete.is_nan() {
        floor
    } else {
        update.percent_complete.clamp(0.0, 100.0)
    };
    update.percent_complete = reported.max(floor);

    if update.method.is_none() {
        update.method = previous.and_then(|p| p.method.clone());
    }
    update
}

/// Average bytes per second since the job started
pub fn transfer_rate(job: &Job, now: DateTime<Utc>) -> Option<f64> {
    let progress = job.progress.as_ref()?;
    let started = job.started_at?;
    let elapsed = seconds(now - started);
    if elapsed <= 0.0 || progress.bytes_done == 0 {
        return None;
    }
    Some(progress.bytes_done as f64 / elapsed)
}

/// Byte-rate extrapolation, reported next to the percentage estimate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ByteRateEta {
    pub bytes_remaining: u64,
    pub bytes_per_second: f64,
    pub remaining_secs: f64,
    /// `None` when the extrapolation falls outside the representable range
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EtaEstimate {
    /// Still queued
    NotStarted,
    /// Running but nothing to extrapolate from yet
    Unavailable { elapsed_secs: f64 },
    Estimated {
        elapsed_secs: f64,
        percent_complete: f64,
        remaining_secs: f64,
        estimated_completion: Option<DateTime<Utc>>,
        by_bytes: Option<ByteRateEta>,
    },
    Finished {
        status: JobStatus,
        total_duration_secs: Option<f64>,
    },
}

impl EtaEstimate {
    pub fn message(&self) -> Option<String> {
        match self {
            EtaEstimate::NotStarted => Some("Job not started yet".to_string()),
            EtaEstimate::Unavailable { .. } => {
                Some("ETA calculation not available yet".to_string())
            }
            EtaEstimate::Finished { status, .. } => Some(format!("Job already {status}")),
            EtaEstimate::Estimated { .. } => None,
        }
    }
}

/// Linear extrapolation of the remaining run time at `now`
pub fn estimate(job: &Job, now: DateTime<Utc>) -> EtaEstimate {
    if job.status.is_terminal() {
        return EtaEstimate::Finished {
            status: job.status,
            total_duration_secs: job.result.as_ref().map(|r| r.duration_secs),
        };
    }

    let (Some(started), JobStatus::Running) = (job.started_at, job.status) else {
        return EtaEstimate::NotStarted;
    };

    let elapsed = seconds(now - started).max(0.0);
    let Some(progress) = job.progress.as_ref() else {
        return EtaEstimate::Unavailable {
            elapsed_secs: elapsed,
        };
    };

    let percent = progress.percent_complete;
    if !(percent > 0.0 && percent < 100.0) {
        return EtaEstimate::Unavailable {
            elapsed_secs: elapsed,
        };
    }

    let estimated_total = elapsed / (percent / 100.0);
    let remaining = (estimated_total - elapsed).max(0.0);

    EtaEstimate::Estimated {
        elapsed_secs: elapsed,
        percent_complete: percent,
        remaining_secs: remaining,
        estimated_completion: completion_at(now, remaining),
        by_bytes: byte_rate_eta(progress, elapsed, now),
    }
}

fn byte_rate_eta(progress: &JobProgress, elapsed: f64, now: DateTime<Utc>) -> Option<ByteRateEta> {
    if progress.bytes_total == 0 || progress.bytes_done == 0 || elapsed <= 0.0 {
        return None;
    }

    let bytes_per_second = progress.bytes_done as f64 / elapsed;
    let bytes_remaining = progress.bytes_total.saturating_sub(progress.bytes_done);
    let remaining_secs = bytes_remaining as f64 / bytes_per_second;

    Some(ByteRateEta {
        bytes_remaining,
        bytes_per_second,
        remaining_secs,
        estimated_completion: completion_at(now, remaining_secs),
    })
}

fn seconds(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

/// `now + secs`, or `None` if that instant cannot be represented
fn completion_at(now: DateTime<Utc>, secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let delta = Duration::try_milliseconds((secs * 1000.0) as i64)?;
    now.checked_add_signed(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobDefinition, JobResult};

    fn running_job(started_secs_ago: i64, now: DateTime<Utc>) -> Job {
        let mut job = Job::new(JobDefinition::new("vm-1", "/out").with_id("j1"));
        job.status = JobStatus::Running;
        job.started_at = Some(now - Duration::seconds(started_secs_ago));
        job
    }

    #[test]
    fn test_merge_clamps_and_never_regresses() {
        let first = merge_progress(None, JobProgress::phase("exporting").with_percent(140.0));
        assert_eq!(first.percent_complete, 100.0);

        let prev = JobProgress::phase("exporting").with_percent(40.0);
        let next = merge_progress(Some(&prev), JobProgress::phase("exporting").with_percent(10.0));
        assert_eq!(next.percent_complete, 40.0);

        let negative = merge_progress(None, JobProgress::phase("x").with_percent(-5.0));
        assert_eq!(negative.percent_complete, 0.0);

        let nan = merge_progress(Some(&prev), JobProgress::phase("x").with_percent(f64::NAN));
        assert_eq!(nan.percent_complete, 40.0);
    }

    #[test]
    fn test_merge_keeps_method_label() {
        let mut prev = JobProgress::phase("connecting");
        prev.method = Some("govc".to_string());

        let next = merge_progress(Some(&prev), JobProgress::phase("exporting"));
        assert_eq!(next.method.as_deref(), Some("govc"));
    }

    #[test]
    fn test_pending_job_not_started() {
        let job = Job::new(JobDefinition::new("vm-1", "/out"));
        let eta = estimate(&job, Utc::now());
        assert_eq!(eta, EtaEstimate::NotStarted);
        assert_eq!(eta.message().unwrap(), "Job not started yet");
    }

    #[test]
    fn test_zero_percent_is_unavailable() {
        let now = Utc::now();
        let mut job = running_job(30, now);
        job.progress = Some(JobProgress::phase("connecting"));

        let eta = estimate(&job, now);
        assert!(matches!(eta, EtaEstimate::Unavailable { elapsed_secs } if elapsed_secs == 30.0));
        assert_eq!(eta.message().unwrap(), "ETA calculation not available yet");
    }

    #[test]
    fn test_percent_extrapolation() {
        let now = Utc::now();
        let mut job = running_job(60, now);
        job.progress = Some(JobProgress::phase("exporting").with_percent(25.0));

        match estimate(&job, now) {
            EtaEstimate::Estimated {
                remaining_secs,
                by_bytes,
                ..
            } => {
                assert_eq!(remaining_secs, 180.0);
                assert!(by_bytes.is_none());
            }
            other => panic!("unexpected estimate: {other:?}"),
        }
    }

    #[test]
    fn test_byte_rate_reported_alongside_percent() {
        let now = Utc::now();
        let mut job = running_job(10, now);
        job.progress = Some(
            JobProgress::phase("exporting")
                .with_percent(50.0)
                .with_bytes(100, 1000),
        );

        let EtaEstimate::Estimated {
            remaining_secs,
            by_bytes: Some(by_bytes),
            ..
        } = estimate(&job, now)
        else {
            panic!("expected both estimates");
        };

        // percent says 10s more, bytes say 90s more; both are kept
        assert_eq!(remaining_secs, 10.0);
        assert_eq!(by_bytes.bytes_remaining, 900);
        assert_eq!(by_bytes.bytes_per_second, 10.0);
        assert_eq!(by_bytes.remaining_secs, 90.0);
        assert_eq!(transfer_rate(&job, now), Some(10.0));
    }

    #[test]
    fn test_huge_byte_total_does_not_overflow() {
        let now = Utc::now();
        let mut job = running_job(60, now);
        job.progress = Some(
            JobProgress::phase("exporting")
                .with_percent(50.0)
                .with_bytes(1, u64::MAX),
        );

        let EtaEstimate::Estimated {
            remaining_secs,
            estimated_completion,
            by_bytes: Some(by_bytes),
            ..
        } = estimate(&job, now)
        else {
            panic!("expected both estimates");
        };

        assert_eq!(remaining_secs, 60.0);
        assert_eq!(estimated_completion, Some(now + Duration::seconds(60)));
        assert_eq!(by_bytes.bytes_remaining, u64::MAX - 1);
        assert!(by_bytes.estimated_completion.is_none());
    }

    #[test]
    fn test_tiny_percent_does_not_overflow() {
        let now = Utc::now();
        let mut job = running_job(60, now);
        job.progress = Some(JobProgress::phase("exporting").with_percent(1e-300));

        let EtaEstimate::Estimated {
            estimated_completion,
            ..
        } = estimate(&job, now)
        else {
            panic!("expected an estimate");
        };
        assert!(estimated_completion.is_none());
    }

    #[test]
    fn test_finished_job_reports_duration() {
        let mut job = Job::new(JobDefinition::new("vm-1", "/out"));
        job.status = JobStatus::Completed;
        job.result = Some(JobResult {
            duration_secs: 12.5,
            ..Default::default()
        });

        let eta = estimate(&job, Utc::now());
        assert_eq!(eta.message().unwrap(), "Job already completed");
        assert!(matches!(
            eta,
            EtaEstimate::Finished {
                total_duration_secs: Some(d),
                ..
            } if d == 12.5
        ));
    }
}
