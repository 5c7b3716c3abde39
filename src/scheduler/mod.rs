//! Recurring jobs driven by cron expressions

mod cron;
mod models;
mod service;

pub use cron::{CronError, CronSchedule};
pub use models::{ScheduleStats, ScheduledJob, ScheduledJobPatch};
pub use service::{Firing, JobSubmitter, Scheduler, SchedulerError};
