//! Lifecycle events and the fan-out seam to their consumers.
//!
//! Producers (the job manager and the scheduler) build an [`Event`] and hand
//! it to an [`EventPublisher`], which forwards a reference to every
//! registered [`EventSink`]. Sinks must never block: the hub and the webhook
//! dispatcher both hand events off to bounded queues and drop on overflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const JOB_CREATED: &str = "job.created";
pub const JOB_STARTED: &str = "job.started";
pub const JOB_PROGRESS: &str = "job.progress";
pub const JOB_COMPLETED: &str = "job.completed";
pub const JOB_FAILED: &str = "job.failed";
pub const JOB_CANCELLED: &str = "job.cancelled";

pub const SCHEDULE_CREATED: &str = "schedule.created";
pub const SCHEDULE_UPDATED: &str = "schedule.updated";
pub const SCHEDULE_DELETED: &str = "schedule.deleted";
pub const SCHEDULE_TRIGGERED: &str = "schedule.triggered";
pub const SCHEDULE_ENABLED: &str = "schedule.enabled";
pub const SCHEDULE_DISABLED: &str = "schedule.disabled";

/// Matches every event type in a webhook subscription
pub const WILDCARD: &str = "*";

/// Every event type the daemon emits
pub const ALL_EVENT_TYPES: [&str; 12] = [
    JOB_CREATED,
    JOB_STARTED,
    JOB_PROGRESS,
    JOB_COMPLETED,
    JOB_FAILED,
    JOB_CANCELLED,
    SCHEDULE_CREATED,
    SCHEDULE_UPDATED,
    SCHEDULE_DELETED,
    SCHEDULE_TRIGGERED,
    SCHEDULE_ENABLED,
    SCHEDULE_DISABLED,
];

/// A typed, timestamped state change notification.
///
/// The payload is a snapshot serialized at emission time, never a live view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Dot-separated event name, e.g. `"job.completed"`.
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Consumer of published events. Implementations must return promptly.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &Event);
}

/// Fans every event out to a fixed list of sinks
#[derive(Clone, Default)]
pub struct EventPublisher {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn publish(&self, event: Event) {
        tracing::trace!(event_type = %event.event_type, sinks = self.sinks.len(), "Publishing event");
        for sink in &self.sinks {
            sink.publish(&event);
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Sink that keeps every event in memory. Used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publisher_fans_out_to_every_sink() {
        let first = Arc::new(RecordingSink::new());
        let second = Arc::new(RecordingSink::new());
        let publisher = EventPublisher::new()
            .with_sink(first.clone())
            .with_sink(second.clone());

        publisher.publish(Event::new(JOB_CREATED).with_payload(json!({"job_id": "a"})));
        publisher.publish(Event::new(JOB_COMPLETED));

        assert_eq!(first.events().len(), 2);
        assert_eq!(second.of_type(JOB_CREATED).len(), 1);
        assert_eq!(second.of_type(JOB_CREATED)[0].payload["job_id"], "a");
    }

    #[test]
    fn test_publisher_without_sinks_is_noop() {
        EventPublisher::new().publish(Event::new(JOB_FAILED));
    }

    #[test]
    fn test_event_defaults_to_empty_object() {
        let event = Event::new(SCHEDULE_TRIGGERED);
        assert_eq!(event.payload, json!({}));
    }
}
