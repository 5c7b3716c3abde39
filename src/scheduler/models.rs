use crate::jobs::JobDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recurring job: a cron expression plus the definition submitted each
/// time it fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Assigned when empty
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Cron expression, see [`CronSchedule`](super::CronSchedule)
    pub schedule: String,
    pub job_template: JobDefinition,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// None while disabled
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_job_id: Option<String>,
    #[serde(default)]
    pub run_count: u64,
    /// Cron instant of the most recent automatic firing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_for: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl ScheduledJob {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        job_template: JobDefinition,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            description: String::new(),
            schedule: schedule.into(),
            job_template,
            enabled: true,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            next_run: None,
            last_run: None,
            last_job_id: None,
            run_count: 0,
            last_fired_for: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledJobPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub job_template: Option<JobDefinition>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStats {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub total_runs: u64,
    /// Earliest upcoming run across enabled schedules
    pub next_run: Option<DateTime<Utc>>,
    pub next_schedule_id: Option<String>,
}
