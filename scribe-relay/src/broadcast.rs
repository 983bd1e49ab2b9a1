//! Relay-side fan-out: one broadcast channel per topic.
//!
//! Every consumer of a topic holds a receiver on the same tokio broadcast
//! channel, so all consumers observe that topic's messages in one order.
//! Frames are encoded once and shared as `Arc<Vec<u8>>`. A receiver that
//! falls more than `capacity` frames behind loses the oldest ones.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use scribe_collab::error::Result;
use scribe_collab::protocol::{Frame, WireMessage};

/// Snapshot of one topic's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicStats {
    /// Frames handed to the broadcast channel
    pub messages_sent: u64,
    /// Frames skipped by lagging consumers
    pub messages_dropped: u64,
    /// Connections currently consuming the topic
    pub active_consumers: usize,
}

#[derive(Default)]
struct AtomicTopicStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Consumers of a single topic, keyed by relay connection id.
pub struct TopicGroup {
    topic: String,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    consumers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    atomic_stats: AtomicTopicStats,
}

impl TopicGroup {
    /// Group buffering at most `capacity` frames per consumer.
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            topic: topic.into(),
            sender,
            consumers: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicTopicStats::default(),
        }
    }

    /// Topic this group carries.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Register a connection as consumer; frames published after this call
    /// are delivered to the returned receiver.
    pub async fn add_consumer(&self, connection: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.consumers.write().await.insert(connection);
        self.sender.subscribe()
    }

    /// Drop a connection; `false` if it was not consuming.
    pub async fn remove_consumer(&self, connection: &Uuid) -> bool {
        self.consumers.write().await.remove(connection)
    }

    /// Encode `message` as a `Deliver` frame and fan it out.
    /// Returns the number of receivers it reached.
    pub fn publish(&self, message: WireMessage) -> Result<usize> {
        let encoded = Frame::Deliver(message).encode()?;
        Ok(self.publish_raw(Arc::new(encoded)))
    }

    /// Fan out an already encoded frame.
    pub fn publish_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, frames: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(frames, Ordering::Relaxed);
    }

    /// Connections currently consuming.
    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }

    /// Whether `connection` consumes this topic.
    pub async fn has_consumer(&self, connection: &Uuid) -> bool {
        self.consumers.read().await.contains(connection)
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> TopicStats {
        TopicStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_consumers: self.consumer_count().await,
        }
    }

    /// Per-consumer frame buffer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps topic names to their [`TopicGroup`].
///
/// Consumers join and leave through the manager, under the map's write
/// lock, so a topic is never removed between a consumer finding its group
/// and registering with it.
pub struct TopicManager {
    topics: RwLock<HashMap<String, Arc<TopicGroup>>>,
    default_capacity: usize,
}

impl TopicManager {
    /// Empty manager; new groups get `default_capacity`.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Register `connection` as a consumer of `topic`, creating the topic if
    /// needed.
    pub async fn add_consumer(
        &self,
        topic: &str,
        connection: Uuid,
    ) -> (Arc<TopicGroup>, broadcast::Receiver<Arc<Vec<u8>>>) {
        let mut topics = self.topics.write().await;
        let group = topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                log::debug!("Created topic '{topic}'");
                Arc::new(TopicGroup::new(topic, self.default_capacity))
            })
            .clone();
        let rx = group.add_consumer(connection).await;
        (group, rx)
    }

    /// Drop `connection` from `topic` and forget the topic once nobody
    /// consumes it. Returns whether the topic was removed.
    pub async fn remove_consumer(&self, topic: &str, connection: &Uuid) -> bool {
        let mut topics = self.topics.write().await;
        let Some(group) = topics.get(topic) else {
            return false;
        };
        group.remove_consumer(connection).await;
        if group.consumer_count().await == 0 {
            topics.remove(topic);
            return true;
        }
        false
    }

    /// Fan a message out to the topic's consumers. Topics nobody consumes
    /// have no group, and the relay keeps no history, so the message is
    /// dropped. Returns the number of consumers reached.
    pub async fn publish(&self, message: WireMessage) -> Result<usize> {
        let group = self.get(&message.topic).await;
        match group {
            Some(group) => group.publish(message),
            None => Ok(0),
        }
    }

    /// Group for `topic`, if anybody consumes it.
    pub async fn get(&self, topic: &str) -> Option<Arc<TopicGroup>> {
        self.topics.read().await.get(topic).cloned()
    }

    /// Number of topics with at least one consumer.
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Names of topics with at least one consumer.
    pub async fn active_topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }
}
