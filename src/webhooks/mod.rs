//! Outbound webhook notifications

mod dispatcher;
pub mod ssrf;

pub use dispatcher::Dispatcher;
pub use ssrf::{is_blocked_ip, validate_webhook_url};

use crate::events::WILDCARD;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("webhook URL scheme must be http or https, got '{0}'")]
    UnsupportedScheme(String),

    #[error("webhook host '{host}' resolves to blocked address {addr}")]
    BlockedAddress { host: String, addr: IpAddr },

    #[error("failed to resolve webhook host '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("webhook host '{0}' did not resolve to any address")]
    Unresolvable(String),

    #[error("webhook must subscribe to at least one event")]
    NoEvents,

    #[error("unknown event type '{0}'")]
    UnknownEvent(String),

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("webhook not found: {0}")]
    NotFound(String),

    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned HTTP {0}")]
    HttpStatus(u16),
}

/// A validated delivery target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub url: String,
    /// Event types to deliver; `"*"` matches all
    pub events: BTreeSet<String>,
    pub enabled: bool,
    pub headers: BTreeMap<String, String>,
}

impl Webhook {
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.contains(WILDCARD) || self.events.contains(event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_matching() {
        let hook = Webhook {
            id: "w1".to_string(),
            url: "https://example.com/".to_string(),
            events: ["job.completed".to_string()].into_iter().collect(),
            enabled: true,
            headers: BTreeMap::new(),
        };

        assert!(hook.subscribes_to("job.completed"));
        assert!(!hook.subscribes_to("job.failed"));

        let all = Webhook {
            events: [WILDCARD.to_string()].into_iter().collect(),
            ..hook
        };
        assert!(all.subscribes_to("schedule.triggered"));
    }
}
