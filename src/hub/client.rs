use crate::events::Event;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Identifier the hub assigns to each listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub(crate) u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

pub(crate) enum Delivery {
    Delivered,
    /// Mailbox full; carries the number of drops in a row
    Dropped(u32),
    /// The subscription was dropped
    Closed,
}

/// Hub-side half of a listener
pub(crate) struct Client {
    mailbox: mpsc::Sender<Arc<Event>>,
    consecutive_drops: u32,
}

impl Client {
    pub(crate) fn new(mailbox: mpsc::Sender<Arc<Event>>) -> Self {
        Self {
            mailbox,
            consecutive_drops: 0,
        }
    }

    /// Never waits: a full mailbox loses the event for this listener only
    pub(crate) fn deliver(&mut self, event: &Arc<Event>) -> Delivery {
        match self.mailbox.try_send(event.clone()) {
            Ok(()) => {
                self.consecutive_drops = 0;
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => {
                self.consecutive_drops += 1;
                Delivery::Dropped(self.consecutive_drops)
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

/// Listener-side half: the receiving end of a bounded mailbox.
///
/// Dropping it disconnects the listener.
#[derive(Debug)]
pub struct Subscription {
    id: ClientId,
    receiver: mpsc::Receiver<Arc<Event>>,
}

impl Subscription {
    pub(crate) fn new(id: ClientId, receiver: mpsc::Receiver<Arc<Event>>) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Next event, or `None` once the hub has let go of this listener and
    /// the mailbox is drained
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.try_recv().ok()
    }
}
