//! Cron expression parsing.
//!
//! Accepts the classic five-field form (`min hour dom month dow`, Sunday is
//! 0 or 7), the six/seven-field form with leading seconds and optional
//! trailing year, and `@hourly`-style descriptors.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("cron expression is empty")]
    Empty,

    #[error("cron expression '{expression}' has {fields} fields, expected 5, 6 or 7")]
    FieldCount { expression: String, fields: usize },

    #[error("invalid cron expression '{expression}': {reason}")]
    Invalid { expression: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(CronError::Empty);
        }

        let normalized = normalize(expression)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| CronError::Invalid {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// The expression as the user wrote it
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First instant strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Latest instant in `(after, until]`, scanning at most `limit` instants
    pub fn latest_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after)
            .take(limit)
            .take_while(|instant| *instant <= until)
            .last()
    }
}

fn normalize(expression: &str) -> Result<String, CronError> {
    if expression.starts_with('@') {
        return Ok(expression.to_string());
    }

    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = translate_day_of_week(fields[4]);
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        count => Err(CronError::FieldCount {
            expression: expression.to_string(),
            fields: count,
        }),
    }
}

/// Shift classic day numbers (0-7, Sunday = 0 or 7) to the 1-7 numbering
/// the `cron` crate uses (Sunday = 1). Step values after `/` and day names
/// are left alone.
fn translate_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(translate_day_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn translate_day_item(item: &str) -> String {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };

    let translated = match base.split_once('-') {
        Some((start, end)) => match (classic_day(start), classic_day(end)) {
            // Sunday as 7 wraps to 1, so the range becomes an explicit list
            (Some(start), Some(7)) => return wrapping_range(start, step, item),
            _ => format!("{}-{}", shift_day(start), shift_day(end)),
        },
        None => shift_day(base),
    };

    match step {
        Some(step) => format!("{translated}/{step}"),
        None => translated,
    }
}

/// Expand `start-7[/step]` into the listed days it covers
fn wrapping_range(start: u32, step: Option<&str>, item: &str) -> String {
    let stride = match step.map(str::parse::<usize>) {
        None => 1,
        Some(Ok(stride)) if stride > 0 => stride,
        // leave malformed steps for the parser to reject
        Some(_) => return item.to_string(),
    };

    let mut days: Vec<u32> = Vec::new();
    for day in (start..=7).step_by(stride) {
        let day = day % 7 + 1;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    days.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn classic_day(token: &str) -> Option<u32> {
    token.parse::<u32>().ok().filter(|day| *day <= 7)
}

fn shift_day(token: &str) -> String {
    match classic_day(token) {
        Some(day) => (day % 7 + 1).to_string(),
        None => token.to_string(),
    }
}
