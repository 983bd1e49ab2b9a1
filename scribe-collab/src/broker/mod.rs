//! Broker interface and the pieces shared by its implementations.
//!
//! - [`Broker`]: publish/subscribe over named topics
//! - [`local::LocalBroker`]: in-process, memory-resident topic logs
//! - [`remote::RemoteBroker`]: WebSocket client to a relay
//!
//! [`ConnectionManager`](crate::connection::ConnectionManager) picks one of
//! the two; nothing else in the crate knows which is active.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::protocol::Message;

pub mod local;
pub mod remote;

pub use local::LocalBroker;
pub use remote::RemoteBroker;

/// Subscriber callback. An `Err` (or a panic) is logged and isolated.
pub type Callback = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

/// Which implementation is serving publish/subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    Local,
    Remote,
}

/// Publish/subscribe over named topics.
#[async_trait]
pub trait Broker: Send + Sync {
    fn mode(&self) -> BrokerMode;

    /// Append a message to its topic and fan it out to subscribers.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Register a callback for one topic.
    async fn subscribe(&self, topic: &str, callback: Callback) -> Result<Subscription>;

    /// Current number of live subscriptions on a topic.
    fn subscriber_count(&self, topic: &str) -> usize;

    /// Tear down connections and forget every topic registration.
    async fn disconnect(&self);
}

/// Opaque subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by `subscribe`.
///
/// `unsubscribe` is idempotent and stays safe after the broker has been
/// disconnected or dropped. Dropping the handle does not unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    cancelled: Arc<AtomicBool>,
    cancel: Arc<dyn Fn() + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        topic: impl Into<String>,
        cancel: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(cancel),
        }
    }

    /// A subscription that was never registered anywhere.
    pub fn inert(topic: impl Into<String>) -> Self {
        let sub = Self::new(SubscriptionId::new(), topic, || {});
        sub.cancelled.store(true, Ordering::SeqCst);
        sub
    }

    /// Identifier of this subscription.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Topic subscribed to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `false` once unsubscribed, and for inert subscriptions.
    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
    }

    /// Stop delivery. Only the first call has an effect.
    pub fn unsubscribe(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            (self.cancel)();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A registered callback plus its liveness flag.
pub(crate) struct Subscriber {
    pub(crate) id: SubscriptionId,
    callback: Callback,
    active: AtomicBool,
}

impl Subscriber {
    pub(crate) fn new(callback: Callback) -> Arc<Self> {
        Arc::new(Self {
            id: SubscriptionId::new(),
            callback,
            active: AtomicBool::new(true),
        })
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Subscribers of one topic, in registration order.
#[derive(Clone, Default)]
pub(crate) struct SubscriberList(Arc<Mutex<Vec<Arc<Subscriber>>>>);

impl SubscriberList {
    pub(crate) fn add(&self, subscriber: Arc<Subscriber>) {
        lock(&self.0).push(subscriber);
    }

    /// Remove a subscriber; returns how many remain.
    pub(crate) fn remove(&self, id: SubscriptionId) -> usize {
        let mut subs = lock(&self.0);
        if let Some(idx) = subs.iter().position(|s| s.id == id) {
            subs.remove(idx).deactivate();
        }
        subs.len()
    }

    pub(crate) fn clear(&self) {
        for sub in lock(&self.0).drain(..) {
            sub.deactivate();
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        lock(&self.0).clone()
    }
}

/// Invoke every still-active subscriber with `message`.
///
/// No broker lock may be held here: callbacks are free to publish or
/// unsubscribe. Returns the number of callbacks that completed cleanly.
pub(crate) fn deliver(message: &Message, subscribers: &[Arc<Subscriber>]) -> usize {
    let mut delivered = 0;
    for sub in subscribers {
        if !sub.is_active() {
            continue;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| (sub.callback)(message))) {
            Ok(Ok(())) => delivered += 1,
            Ok(Err(e)) => {
                let err = CollabError::SubscriberCallback(e.to_string());
                log::warn!("Subscriber {} on '{}': {err}", sub.id, message.topic);
            }
            Err(_) => {
                log::error!(
                    "Subscriber {} on '{}' panicked; delivery continues",
                    sub.id,
                    message.topic
                );
            }
        }
    }
    delivered
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: Arc<AtomicUsize>) -> Callback {
        Arc::new(move |_msg: &Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_unsubscribe_runs_cancel_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = Subscription::new(SubscriptionId::new(), "t", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub.is_active());
        sub.unsubscribe();
        sub.unsubscribe();
        sub.clone().unsubscribe();

        assert!(!sub.is_active());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inert_subscription() {
        let sub = Subscription::inert("ai-outputs");
        assert!(!sub.is_active());
        assert_eq!(sub.topic(), "ai-outputs");
        sub.unsubscribe();
    }

    #[test]
    fn test_deliver_isolates_failures() {
        let ok = Arc::new(AtomicUsize::new(0));
        let failing: Callback =
            Arc::new(|_msg: &Message| Err(CollabError::Serialization("bad".into())));
        let panicking: Callback = Arc::new(|_msg: &Message| panic!("subscriber bug"));

        let subs = vec![
            Subscriber::new(failing),
            Subscriber::new(panicking),
            Subscriber::new(counting(ok.clone())),
        ];
        let msg = Message::new("t", Payload::new());

        assert_eq!(deliver(&msg, &subs), 1);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deliver_skips_inactive() {
        let hits = Arc::new(AtomicUsize::new(0));
        let list = SubscriberList::default();
        let sub = Subscriber::new(counting(hits.clone()));
        let id = sub.id;
        list.add(sub);

        let snapshot = list.snapshot();
        assert_eq!(list.remove(id), 0);
        deliver(&Message::new("t", Payload::new()), &snapshot);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
