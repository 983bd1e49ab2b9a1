//! In-process broker: one append-only log and one subscriber list per topic.
//!
//! Publishing is synchronous. The message is appended to its topic log and
//! every current subscriber is called before `publish_now` returns. Appending
//! and queueing for dispatch happen under one lock, and one thread at a time
//! drains the queue, so all subscribers observe messages in log order:
//!
//! - a publish from inside a callback (same thread as the drainer) is queued
//!   and delivered right after the message being dispatched;
//! - a publish from another thread waits until the queue, including its own
//!   message, has been delivered.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use async_trait::async_trait;

use super::{deliver, lock, Broker, BrokerMode, Callback, Subscriber, SubscriberList, Subscription};
use crate::error::Result;
use crate::protocol::Message;

#[derive(Default)]
struct TopicLog {
    messages: Vec<Message>,
    subscribers: SubscriberList,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, TopicLog>,
    pending: VecDeque<Message>,
    /// Thread currently delivering `pending`.
    drainer: Option<ThreadId>,
}

#[derive(Default)]
struct Shared {
    inner: Mutex<Inner>,
    /// Signalled when a drainer finishes.
    idle: Condvar,
}

/// Memory-resident broker used when no remote backend is available.
#[derive(Default)]
pub struct LocalBroker {
    shared: Arc<Shared>,
}

impl LocalBroker {
    /// Empty broker with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the topic log and fan out. Returns the log length.
    pub fn publish_now(&self, message: Message) -> usize {
        let me = thread::current().id();
        let mut inner = self.inner();

        let log = inner.topics.entry(message.topic.clone()).or_default();
        log.messages.push(message.clone());
        let len = log.messages.len();
        inner.pending.push_back(message);

        if inner.drainer == Some(me) {
            // Re-entrant: the outer loop delivers it next.
            return len;
        }
        while inner.drainer.is_some() {
            inner = self
                .shared
                .idle
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if inner.pending.is_empty() {
            // Another drainer delivered ours before we got the lock back.
            return len;
        }
        inner.drainer = Some(me);

        loop {
            let Some(next) = inner.pending.pop_front() else {
                inner.drainer = None;
                break;
            };
            let subscribers = inner
                .topics
                .get(&next.topic)
                .map(|log| log.subscribers.snapshot())
                .unwrap_or_default();
            drop(inner);

            let delivered = deliver(&next, &subscribers);
            log::trace!(
                "Local delivery on '{}': {delivered}/{} subscribers",
                next.topic,
                subscribers.len()
            );
            inner = self.inner();
        }
        drop(inner);
        self.shared.idle.notify_all();

        len
    }

    /// Register a callback; the topic is created if it does not exist.
    pub fn subscribe_now(&self, topic: &str, callback: Callback) -> Subscription {
        let subscriber = Subscriber::new(callback);
        let id = subscriber.id;
        self.inner()
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .add(subscriber);

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let name = topic.to_string();
        Subscription::new(id, topic, move || {
            if let Some(shared) = weak.upgrade() {
                if let Some(log) = lock(&shared.inner).topics.get(&name) {
                    log.subscribers.remove(id);
                }
            }
        })
    }

    /// Copy of a topic's log, oldest first.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.inner()
            .topics
            .get(topic)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    /// Names of every topic created so far.
    pub fn topics(&self) -> Vec<String> {
        self.inner().topics.keys().cloned().collect()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        lock(&self.shared.inner)
    }
}

#[async_trait]
impl Broker for LocalBroker {
    fn mode(&self) -> BrokerMode {
        BrokerMode::Local
    }

    async fn publish(&self, message: Message) -> Result<()> {
        self.publish_now(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, callback: Callback) -> Result<Subscription> {
        Ok(self.subscribe_now(topic, callback))
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.inner()
            .topics
            .get(topic)
            .map(|log| log.subscribers.len())
            .unwrap_or(0)
    }

    async fn disconnect(&self) {
        // Nothing to close: the local broker lives as long as its owner.
    }
}
