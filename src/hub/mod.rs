//! Real-time event hub.
//!
//! One actor task owns the listener set. Register, unregister, broadcast
//! and count requests reach it through a single command queue, so they are
//! applied strictly in the order they were sent. The command queue is
//! unbounded so publishing never waits and never loses an event on its own;
//! the only drop point is a listener's bounded mailbox, and a full mailbox
//! loses the event for that listener only.

mod client;

pub use client::{ClientId, Subscription};

use crate::config::HubConfig;
use crate::events::{Event, EventSink};
use crate::observability::Metrics;
use client::{Client, Delivery};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("event hub is not running")]
    Stopped,
}

enum Command {
    Register {
        reply: oneshot::Sender<Subscription>,
    },
    Unregister {
        id: ClientId,
        reply: oneshot::Sender<bool>,
    },
    Broadcast(Arc<Event>),
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the hub actor
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
}

impl Hub {
    /// Start the actor. It runs until `shutdown` fires or every handle is
    /// dropped; stopping closes all listener mailboxes.
    pub fn spawn(
        config: HubConfig,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let actor = HubActor {
            clients: BTreeMap::new(),
            next_id: 0,
            mailbox_capacity: config.mailbox_capacity.max(1),
            disconnect_after_drops: config.disconnect_after_drops,
            metrics,
        };
        let handle = tokio::spawn(actor.run(receiver, shutdown));

        (Self { commands }, handle)
    }

    pub async fn register(&self) -> Result<Subscription, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Register { reply })?;
        response.await.map_err(|_| HubError::Stopped)
    }

    /// Returns whether the listener was still registered
    pub async fn unregister(&self, id: ClientId) -> Result<bool, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Unregister { id, reply })?;
        response.await.map_err(|_| HubError::Stopped)
    }

    /// Currently registered listeners
    pub async fn client_count(&self) -> Result<usize, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Count { reply })?;
        response.await.map_err(|_| HubError::Stopped)
    }

    /// Queue an event for every listener without waiting
    pub fn broadcast(&self, event: Event) {
        if self
            .commands
            .send(Command::Broadcast(Arc::new(event)))
            .is_err()
        {
            debug!("Event hub stopped, event discarded");
        }
    }

    fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).map_err(|_| HubError::Stopped)
    }
}

impl EventSink for Hub {
    fn publish(&self, event: &Event) {
        self.broadcast(event.clone());
    }
}

struct HubActor {
    clients: BTreeMap<ClientId, Client>,
    next_id: u64,
    mailbox_capacity: usize,
    disconnect_after_drops: Option<u32>,
    metrics: Arc<Metrics>,
}

impl HubActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) {
        info!(mailbox_capacity = self.mailbox_capacity, "Event hub started");

        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command);
        }

        let remaining = self.clients.len();
        self.clients.clear();
        info!(remaining, "Event hub stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { reply } => {
                let id = ClientId(self.next_id);
                self.next_id += 1;

                let (sender, receiver) = mpsc::channel(self.mailbox_capacity);
                self.clients.insert(id, Client::new(sender));
                debug!(client = %id, clients = self.clients.len(), "Listener registered");

                if reply.send(Subscription::new(id, receiver)).is_err() {
                    // caller went away before receiving its subscription
                    self.clients.remove(&id);
                }
            }
            Command::Unregister { id, reply } => {
                let removed = self.clients.remove(&id).is_some();
                debug!(client = %id, removed, "Listener unregistered");
                let _ = reply.send(removed);
            }
            Command::Broadcast(event) => self.broadcast(&event),
            Command::Count { reply } => {
                self.clients.retain(|_, client| !client.is_closed());
                let _ = reply.send(self.clients.len());
            }
        }
    }

    fn broadcast(&mut self, event: &Arc<Event>) {
        let mut gone = Vec::new();

        for (id, client) in self.clients.iter_mut() {
            match client.deliver(event) {
                Delivery::Delivered => {}
                Delivery::Dropped(consecutive) => {
                    self.metrics.event_dropped();
                    debug!(client = %id, consecutive, event_type = %event.event_type, "Mailbox full, event dropped");
                    if self
                        .disconnect_after_drops
                        .is_some_and(|limit| consecutive >= limit)
                    {
                        warn!(client = %id, consecutive, "Disconnecting slow listener");
                        gone.push(*id);
                    }
                }
                Delivery::Closed => gone.push(*id),
            }
        }

        for id in gone {
            self.clients.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{JOB_PROGRESS, SCHEDULE_TRIGGERED};
    use serde_json::json;

    fn spawn_hub(mailbox: usize, disconnect_after_drops: Option<u32>) -> (Hub, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let config = HubConfig {
            mailbox_capacity: mailbox,
            disconnect_after_drops,
        };
        let (hub, _handle) = Hub::spawn(config, metrics.clone(), CancellationToken::new());
        (hub, metrics)
    }

    fn numbered(n: usize) -> Event {
        Event::new(JOB_PROGRESS).with_payload(json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_delivers_in_emission_order() {
        let (hub, _) = spawn_hub(16, None);
        let mut sub = hub.register().await.unwrap();

        for n in 0..10 {
            hub.broadcast(numbered(n));
        }
        // count is queued behind the broadcasts, so they have all been applied
        assert_eq!(hub.client_count().await.unwrap(), 1);

        for n in 0..10 {
            let event = sub.try_recv().expect("missing event");
            assert_eq!(event.payload["n"], n);
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_but_keeps_listener() {
        let (hub, metrics) = spawn_hub(3, None);
        let mut sub = hub.register().await.unwrap();

        for n in 0..10 {
            hub.broadcast(numbered(n));
        }
        assert_eq!(hub.client_count().await.unwrap(), 1);

        let mut received = Vec::new();
        while let Some(event) = sub.try_recv() {
            received.push(event.payload["n"].as_u64().unwrap());
        }
        assert_eq!(received, vec![0, 1, 2]);
        assert_eq!(metrics.snapshot().events_dropped, 7);

        // listener still works once it catches up
        hub.broadcast(numbered(99));
        assert_eq!(hub.client_count().await.unwrap(), 1);
        assert_eq!(sub.try_recv().unwrap().payload["n"], 99);
    }

    #[tokio::test]
    async fn test_burst_reaches_listener_with_room() {
        let (hub, metrics) = spawn_hub(1024, None);
        let mut sub = hub.register().await.unwrap();

        // far more than the default mailbox size, all sent before the actor runs
        for n in 0..500 {
            hub.broadcast(numbered(n));
        }
        assert_eq!(hub.client_count().await.unwrap(), 1);

        let mut received = 0;
        while let Some(event) = sub.try_recv() {
            assert_eq!(event.payload["n"], received);
            received += 1;
        }
        assert_eq!(received, 500);
        assert_eq!(metrics.snapshot().events_dropped, 0);
    }

    #[tokio::test]
    async fn test_persistent_overflow_disconnects_when_configured() {
        let (hub, _) = spawn_hub(2, Some(3));
        let mut sub = hub.register().await.unwrap();

        for n in 0..5 {
            hub.broadcast(numbered(n));
        }
        assert_eq!(hub.client_count().await.unwrap(), 0);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_is_visible_to_next_count() {
        let (hub, _) = spawn_hub(4, None);
        let first = hub.register().await.unwrap();
        let _second = hub.register().await.unwrap();
        assert_ne!(first.id(), _second.id());
        assert_eq!(hub.client_count().await.unwrap(), 2);

        assert!(hub.unregister(first.id()).await.unwrap());
        assert_eq!(hub.client_count().await.unwrap(), 1);
        assert!(!hub.unregister(first.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let (hub, _) = spawn_hub(4, None);
        let sub = hub.register().await.unwrap();
        drop(sub);

        hub.broadcast(Event::new(SCHEDULE_TRIGGERED));
        assert_eq!(hub.client_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_mailboxes() {
        let metrics = Arc::new(Metrics::new());
        let shutdown = CancellationToken::new();
        let (hub, handle) = Hub::spawn(HubConfig::default(), metrics, shutdown.clone());
        let mut sub = hub.register().await.unwrap();

        shutdown.cancel();
        handle.await.unwrap();

        assert!(sub.recv().await.is_none());
        assert_eq!(hub.register().await.unwrap_err(), HubError::Stopped);
        // publishing after stop is silently discarded
        hub.broadcast(Event::new(SCHEDULE_TRIGGERED));
    }
}
