//! Fan-out of environment change events to streaming subscribers.
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{EnvironmentDocument, EnvironmentKey};

/// Emitted when the document of an environment changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Environment that changed.
    pub key: EnvironmentKey,
    /// The new document.
    pub document: Arc<EnvironmentDocument>,
}

/// Wire form for SSE payloads: clients are expected to refetch, so the document body is omitted.
impl Serialize for ChangeEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            environment_key: &'a EnvironmentKey,
            fingerprint: &'a str,
            fetched_at: DateTime<Utc>,
        }

        Wire {
            environment_key: &self.key,
            fingerprint: self.document.fingerprint.as_str(),
            fetched_at: self.document.fetched_at,
        }
        .serialize(serializer)
    }
}

struct Subscriber {
    id: u64,
    filter: Option<EnvironmentKey>,
    sender: mpsc::Sender<ChangeEvent>,
}

/// Publish/subscribe hub for [`ChangeEvent`]s.
///
/// Every subscriber owns a bounded queue. Publishing never waits: a subscriber whose queue is full
/// is disconnected, and one whose [`Subscription`] was dropped is pruned.
pub struct ChangeNotifier {
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl ChangeNotifier {
    /// Create a notifier with per-subscriber queues of `capacity` events.
    pub fn new(capacity: usize) -> ChangeNotifier {
        ChangeNotifier {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe to changes of all environments.
    pub fn subscribe(&self) -> Subscription {
        self.add_subscriber(None)
    }

    /// Subscribe to changes of one environment.
    pub fn subscribe_environment(&self, key: EnvironmentKey) -> Subscription {
        self.add_subscriber(Some(key))
    }

    fn add_subscriber(&self, filter: Option<EnvironmentKey>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, filter, sender });

        log::debug!(target: "edge_proxy", subscriber = id; "subscriber connected");
        Subscription { id, receiver }
    }

    /// Deliver `event` to every interested subscriber.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        subscribers.retain(|subscriber| {
            if subscriber
                .filter
                .as_ref()
                .is_some_and(|filter| *filter != event.key)
            {
                return !subscriber.sender.is_closed();
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    log::warn!(target: "edge_proxy", subscriber = subscriber.id; "subscriber is not keeping up, disconnecting");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!(target: "edge_proxy", subscriber = subscriber.id; "subscriber disconnected");
                    false
                }
            }
        });
        delivered
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A stream of [`ChangeEvent`]s created by [`ChangeNotifier::subscribe`].
///
/// Ends when the subscriber falls behind or the notifier is dropped. Dropping the subscription
/// disconnects it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    /// Identifier of this subscription, unique within its notifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event. Returns `None` once the subscription has been torn down.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Receive an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChangeEvent>> {
        self.receiver.poll_recv(cx)
    }
}
