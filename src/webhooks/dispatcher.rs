use super::ssrf::validate_webhook_url;
use super::{Webhook, WebhookError};
use crate::config::{WebhookConfig, WebhookEndpoint};
use crate::events::{self, Event, EventSink};
use crate::observability::Metrics;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue, USER_AGENT};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const USER_AGENT_VALUE: &str = concat!("vmflow-webhook/", env!("CARGO_PKG_VERSION"));
const EVENT_HEADER: &str = "x-vmflow-event";

/// Body posted to every endpoint
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'a str,
    timestamp: DateTime<Utc>,
    data: &'a serde_json::Value,
}

struct Shared {
    hooks: RwLock<Vec<Arc<Webhook>>>,
    client: reqwest::Client,
    block_private_ips: bool,
    metrics: Arc<Metrics>,
}

/// Best-effort, fire-and-forget webhook delivery.
///
/// Publishing only enqueues the event. A background task matches it against
/// registered webhooks and posts it with bounded concurrency. Failures are
/// logged and counted, never retried.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    queue: mpsc::Sender<Event>,
}

impl Dispatcher {
    pub fn spawn(
        config: &WebhookConfig,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), WebhookError> {
        // a redirect could point at an address registration never vetted
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let shared = Arc::new(Shared {
            hooks: RwLock::new(Vec::new()),
            client,
            block_private_ips: config.block_private_ips,
            metrics,
        });

        let (queue, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(run(
            shared.clone(),
            receiver,
            config.max_concurrent_deliveries.max(1),
            shutdown,
        ));

        Ok((Self { shared, queue }, handle))
    }

    /// Validate and add an endpoint. The stored webhook never changes
    /// afterwards; unregister and register again to alter it.
    pub async fn register(&self, endpoint: WebhookEndpoint) -> Result<Webhook, WebhookError> {
        let url = validate_webhook_url(&endpoint.url, self.shared.block_private_ips).await?;

        if endpoint.events.is_empty() {
            return Err(WebhookError::NoEvents);
        }
        let mut subscribed = BTreeSet::new();
        for event in endpoint.events {
            if event != events::WILDCARD && !events::ALL_EVENT_TYPES.contains(&event.as_str()) {
                return Err(WebhookError::UnknownEvent(event));
            }
            subscribed.insert(event);
        }

        for (name, value) in &endpoint.headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err()
                || HeaderValue::from_str(value).is_err()
            {
                return Err(WebhookError::InvalidHeader(name.clone()));
            }
        }

        let webhook = Webhook {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            events: subscribed,
            enabled: endpoint.enabled,
            headers: endpoint.headers,
        };

        info!(webhook_id = %webhook.id, url = %webhook.url, events = ?webhook.events, "Webhook registered");
        self.shared.hooks.write().await.push(Arc::new(webhook.clone()));
        Ok(webhook)
    }

    pub async fn unregister(&self, id: &str) -> Result<(), WebhookError> {
        let mut hooks = self.shared.hooks.write().await;
        let before = hooks.len();
        hooks.retain(|hook| hook.id != id);
        if hooks.len() == before {
            return Err(WebhookError::NotFound(id.to_string()));
        }
        info!(webhook_id = %id, "Webhook unregistered");
        Ok(())
    }

    pub async fn list(&self) -> Vec<Webhook> {
        self.shared
            .hooks
            .read()
            .await
            .iter()
            .map(|hook| hook.as_ref().clone())
            .collect()
    }

    /// Queue an event for delivery without waiting
    pub fn dispatch(&self, event: Event) {
        match self.queue.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.shared.metrics.event_dropped();
                warn!(event_type = %event.event_type, "Webhook queue full, event dropped");
            }
            Err(TrySendError::Closed(_)) => debug!("Webhook dispatcher stopped, event discarded"),
        }
    }
}

impl EventSink for Dispatcher {
    fn publish(&self, event: &Event) {
        self.dispatch(event.clone());
    }
}

async fn run(
    shared: Arc<Shared>,
    mut queue: mpsc::Receiver<Event>,
    max_concurrent: usize,
    shutdown: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent));
    let mut inflight = JoinSet::new();
    info!(max_concurrent, "Webhook dispatcher started");

    'events: loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = queue.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let targets: Vec<Arc<Webhook>> = shared
            .hooks
            .read()
            .await
            .iter()
            .filter(|hook| hook.enabled && hook.subscribes_to(&event.event_type))
            .cloned()
            .collect();
        if targets.is_empty() {
            continue;
        }

        let body = match serde_json::to_vec(&WebhookPayload {
            event: &event.event_type,
            timestamp: event.timestamp,
            data: &event.payload,
        }) {
            Ok(body) => body,
            Err(e) => {
                warn!(event_type = %event.event_type, error = %e, "Could not encode webhook payload");
                continue;
            }
        };

        for hook in targets {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'events,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'events,
                },
            };

            let shared = shared.clone();
            let body = body.clone();
            let event_type = event.event_type.clone();
            inflight.spawn(async move {
                let _permit = permit;
                match deliver(&shared.client, &hook, &event_type, body).await {
                    Ok(()) => {
                        shared.metrics.webhook_delivered();
                        debug!(webhook_id = %hook.id, %event_type, "Webhook delivered");
                    }
                    Err(e) => {
                        shared.metrics.webhook_failed();
                        warn!(webhook_id = %hook.id, url = %hook.url, %event_type, error = %e, "Webhook delivery failed");
                    }
                }
            });
        }

        while inflight.try_join_next().is_some() {}
    }

    // in-flight requests are bounded by the client timeout
    while inflight.join_next().await.is_some() {}
    info!("Webhook dispatcher stopped");
}

async fn deliver(
    client: &reqwest::Client,
    hook: &Webhook,
    event_type: &str,
    body: Vec<u8>,
) -> Result<(), WebhookError> {
    let mut request = client
        .post(&hook.url)
        .header(CONTENT_TYPE, "application/json")
        .header(USER_AGENT, USER_AGENT_VALUE)
        .header(EVENT_HEADER, event_type);
    for (name, value) in &hook.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.body(body).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(WebhookError::HttpStatus(status.as_u16()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn endpoint(url: &str, events: &[&str]) -> WebhookEndpoint {
        WebhookEndpoint {
            url: url.to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
            enabled: true,
            headers: BTreeMap::new(),
        }
    }

    fn dispatcher(block_private_ips: bool) -> Dispatcher {
        let config = WebhookConfig {
            block_private_ips,
            ..Default::default()
        };
        let (dispatcher, _handle) =
            Dispatcher::spawn(&config, Arc::new(Metrics::new()), CancellationToken::new())
                .unwrap();
        dispatcher
    }

    #[tokio::test]
    async fn test_register_blocks_metadata_address() {
        let protected = dispatcher(true);
        let err = protected
            .register(endpoint("http://169.254.169.254/", &["*"]))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::BlockedAddress { .. }));
        assert!(protected.list().await.is_empty());

        let open = dispatcher(false);
        let hook = open
            .register(endpoint("http://169.254.169.254/", &["*"]))
            .await
            .unwrap();
        assert!(hook.subscribes_to(events::JOB_FAILED));
    }

    #[tokio::test]
    async fn test_register_requires_known_events() {
        let dispatcher = dispatcher(false);

        assert!(matches!(
            dispatcher.register(endpoint("http://127.0.0.1/", &[])).await,
            Err(WebhookError::NoEvents)
        ));
        assert!(matches!(
            dispatcher
                .register(endpoint("http://127.0.0.1/", &["job.exploded"]))
                .await,
            Err(WebhookError::UnknownEvent(e)) if e == "job.exploded"
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_bad_header() {
        let dispatcher = dispatcher(false);
        let mut hook = endpoint("http://127.0.0.1/", &["job.completed"]);
        hook.headers
            .insert("bad header".to_string(), "x".to_string());

        assert!(matches!(
            dispatcher.register(hook).await,
            Err(WebhookError::InvalidHeader(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister() {
        let dispatcher = dispatcher(false);
        let hook = dispatcher
            .register(endpoint("http://127.0.0.1/", &["job.completed"]))
            .await
            .unwrap();

        assert_eq!(dispatcher.list().await.len(), 1);
        dispatcher.unregister(&hook.id).await.unwrap();
        assert!(dispatcher.list().await.is_empty());
        assert!(matches!(
            dispatcher.unregister(&hook.id).await,
            Err(WebhookError::NotFound(_))
        ));
    }
}
