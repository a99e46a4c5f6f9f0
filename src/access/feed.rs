//! Subscriptions to the account record of one identity.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{error::AccessError, record::AccountSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Snapshot(AccountSnapshot),
    Failed(AccessError),
}

/// Ordered stream of feed events for one identity.
///
/// Every event is tagged with the epoch the subscription was opened under.
/// Dropping the subscription unsubscribes synchronously.
pub struct FeedSubscription {
    epoch: u64,
    events: mpsc::UnboundedReceiver<FeedEvent>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl FeedSubscription {
    pub fn new<F>(
        epoch: u64,
        events: mpsc::UnboundedReceiver<FeedEvent>,
        cancel: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            epoch,
            events,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// `None` once the producer has gone away.
    pub async fn recv(&mut self) -> Option<(u64, FeedEvent)> {
        let event = self.events.recv().await?;
        Some((self.epoch, event))
    }

    pub fn try_recv(&mut self) -> Option<(u64, FeedEvent)> {
        let event = self.events.try_recv().ok()?;
        Some((self.epoch, event))
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.events.close();
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Read side of the account record store.
#[async_trait]
pub trait AccountFeed: Send + Sync {
    /// Opens a subscription. The first event is the record as it is now.
    fn subscribe(&self, identity: Uuid, epoch: u64) -> FeedSubscription;

    /// Single read, for callers that do not keep listening.
    async fn fetch(&self, identity: Uuid) -> Result<AccountSnapshot, AccessError>;
}

type Subscribers = HashMap<Uuid, Vec<(u64, mpsc::UnboundedSender<FeedEvent>)>>;

#[derive(Default)]
struct MemoryInner {
    records: HashMap<Uuid, AccountSnapshot>,
    subscribers: Subscribers,
    next_id: u64,
}

/// In-process account store, used by tests and local runs without Postgres.
#[derive(Clone, Default)]
pub struct MemoryAccountFeed {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryAccountFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, identity: Uuid, snapshot: AccountSnapshot) {
        let mut inner = self.inner.lock();
        inner.records.insert(identity, snapshot.clone());
        broadcast(&mut inner.subscribers, identity, FeedEvent::Snapshot(snapshot));
    }

    pub fn remove(&self, identity: Uuid) {
        let mut inner = self.inner.lock();
        inner.records.remove(&identity);
        broadcast(
            &mut inner.subscribers,
            identity,
            FeedEvent::Snapshot(AccountSnapshot::missing()),
        );
    }

    /// Delivers a transport failure to every subscriber of `identity`.
    pub fn fail(&self, identity: Uuid, reason: &str) {
        let mut inner = self.inner.lock();
        broadcast(
            &mut inner.subscribers,
            identity,
            FeedEvent::Failed(AccessError::FeedUnavailable(reason.to_string())),
        );
    }

    pub fn subscriber_count(&self, identity: Uuid) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(&identity)
            .map_or(0, Vec::len)
    }

    fn current(&self, identity: Uuid) -> AccountSnapshot {
        self.inner
            .lock()
            .records
            .get(&identity)
            .cloned()
            .unwrap_or_else(AccountSnapshot::missing)
    }
}

fn broadcast(subscribers: &mut Subscribers, identity: Uuid, event: FeedEvent) {
    if let Some(senders) = subscribers.get_mut(&identity) {
        senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl AccountFeed for MemoryAccountFeed {
    fn subscribe(&self, identity: Uuid, epoch: u64) -> FeedSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let snapshot = inner
            .records
            .get(&identity)
            .cloned()
            .unwrap_or_else(AccountSnapshot::missing);
        // receiver is alive, cannot fail
        let _ = tx.send(FeedEvent::Snapshot(snapshot));

        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.entry(identity).or_default().push((id, tx));
        drop(inner);

        let shared = Arc::downgrade(&self.inner);
        FeedSubscription::new(epoch, rx, move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut inner = shared.lock();
            if let Some(senders) = inner.subscribers.get_mut(&identity) {
                senders.retain(|(sid, _)| *sid != id);
                if senders.is_empty() {
                    inner.subscribers.remove(&identity);
                }
            }
        })
    }

    async fn fetch(&self, identity: Uuid) -> Result<AccountSnapshot, AccessError> {
        Ok(self.current(identity))
    }
}
