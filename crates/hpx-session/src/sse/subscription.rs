//! Subscriber list of the streaming service and the handles subscribers hold.
//!
//! A subscription lives until its holder calls `unsubscribe` or drops the
//! handle. The service never keeps a subscriber alive on its own.
//!
//! Each subscriber has a bounded queue. An update that finds the queue full
//! is dropped for that subscriber only; updates are hints to pull, so a
//! lagging subscriber catches up on its next pull.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use super::event::RemoteUpdate;

/// Queue length per subscriber when none is configured.
pub(crate) const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug)]
pub(crate) struct SubscriberList {
    capacity: usize,
    next_id: AtomicU64,
    senders: Mutex<Vec<(u64, mpsc::Sender<RemoteUpdate>)>>,
}

impl Default for SubscriberList {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl SubscriberList {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            senders: Mutex::new(Vec::new()),
        }
    }

    fn add(self: &Arc<Self>) -> (u64, mpsc::Receiver<RemoteUpdate>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.lock().push((id, tx));
        (id, rx)
    }

    fn remove(&self, id: u64) {
        self.senders.lock().retain(|(sid, _)| *sid != id);
    }

    /// Deliver `update` to every subscriber, in subscription order.
    ///
    /// Never waits: a full queue drops the update for that subscriber.
    pub(crate) fn publish(&self, update: &RemoteUpdate) {
        self.senders
            .lock()
            .retain(|(id, tx)| match tx.try_send(update.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = id, "Subscriber lagging, update dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription {
        let (id, rx) = self.add();
        Subscription {
            id,
            rx,
            list: Arc::clone(self),
        }
    }

    pub(crate) fn subscribe_with<F>(self: &Arc<Self>, mut handler: F) -> HandlerSubscription
    where
        F: FnMut(RemoteUpdate) + Send + 'static,
    {
        let (id, mut rx) = self.add();
        let task = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                handler(update);
            }
        });
        HandlerSubscription {
            id,
            task,
            list: Arc::clone(self),
        }
    }
}

/// Stream of [`RemoteUpdate`]s in delivery order.
///
/// Delivery is at-least-once per connection; a reconnect may repeat
/// operations, so consumers must apply them idempotently.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<RemoteUpdate>,
    list: Arc<SubscriberList>,
}

impl Subscription {
    /// Receive the next update. `None` after unsubscribing.
    pub async fn next_update(&mut self) -> Option<RemoteUpdate> {
        self.rx.recv().await
    }

    /// Stop receiving updates.
    pub fn unsubscribe(self) {}
}

impl Stream for Subscription {
    type Item = RemoteUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.list.remove(self.id);
    }
}

/// Handle for a callback registered with
/// [`StreamingService::subscribe_with`](super::StreamingService::subscribe_with).
#[derive(Debug)]
pub struct HandlerSubscription {
    id: u64,
    task: JoinHandle<()>,
    list: Arc<SubscriberList>,
}

impl HandlerSubscription {
    /// Stop calling the handler.
    pub fn unsubscribe(self) {}
}

impl Drop for HandlerSubscription {
    fn drop(&mut self) {
        self.list.remove(self.id);
        self.task.abort();
    }
}
