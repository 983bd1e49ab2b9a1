//! WebSocket client to a topic relay.
//!
//! One connection is shared by every topic:
//!
//! ```text
//! publish ──► outgoing mpsc ──► writer task ──► WebSocket
//!
//! WebSocket ──► reader task ──┬─► topic A feed ──► consumer task A ──► callbacks
//!                             └─► topic B feed ──► consumer task B ──► callbacks
//! ```
//!
//! A topic's consumer task starts with its first subscriber and stops when
//! the last one unsubscribes. A message whose payload cannot be decoded is
//! dropped without stopping the consumer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;

use super::{deliver, lock, Broker, BrokerMode, Callback, Subscriber, SubscriberList, Subscription};
use crate::error::{CollabError, Result};
use crate::protocol::{Frame, Message, WireMessage};

/// Consumption state for one topic.
struct TopicConsumer {
    subscribers: SubscriberList,
    feed: mpsc::UnboundedSender<WireMessage>,
    task: JoinHandle<()>,
}

impl TopicConsumer {
    fn stop(self) {
        self.subscribers.clear();
        self.task.abort();
    }
}

type Consumers = Arc<Mutex<HashMap<String, TopicConsumer>>>;

/// Remote broker over a single WebSocket connection.
pub struct RemoteBroker {
    url: String,
    outgoing: mpsc::Sender<Vec<u8>>,
    consumers: Consumers,
    alive: Arc<watch::Sender<bool>>,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteBroker {
    /// Connect to a relay and start the reader/writer tasks.
    pub async fn connect(url: &str, outgoing_capacity: usize) -> Result<Self> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(classify_connect_error)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(outgoing_capacity.max(1));
        let (alive_tx, _) = watch::channel(true);
        let alive = Arc::new(alive_tx);
        let consumers: Consumers = Arc::new(Mutex::new(HashMap::new()));

        // Writer task: forward outgoing channel to WebSocket
        let writer_alive = alive.clone();
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = ws_writer.close().await;
            writer_alive.send_replace(false);
        });

        // Reader task: route Deliver frames to topic consumers
        let reader_alive = alive.clone();
        let routes = consumers.clone();
        let reader_url = url.to_string();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tungstenite::Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(Frame::Deliver(wire)) => route(&routes, wire),
                        Ok(Frame::Pong) => log::trace!("Pong from {reader_url}"),
                        Ok(other) => log::debug!("Ignoring unexpected frame {other:?}"),
                        Err(e) => log::warn!("Dropping undecodable frame from {reader_url}: {e}"),
                    },
                    Ok(tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("Relay connection to {reader_url} closed");
            reader_alive.send_replace(false);
        });

        log::info!("Connected to relay at {url}");

        Ok(Self {
            url: url.to_string(),
            outgoing: out_tx,
            consumers,
            alive,
            io_tasks: Mutex::new(vec![writer, reader]),
        })
    }

    /// Relay this broker is connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the underlying connection is still open.
    pub fn is_connected(&self) -> bool {
        *self.alive.borrow()
    }

    /// Watch the connection's liveness (flips to `false` once, on close).
    pub fn watch_alive(&self) -> watch::Receiver<bool> {
        self.alive.subscribe()
    }

    /// Send a keepalive ping.
    pub async fn ping(&self) -> Result<()> {
        self.send_frame(&Frame::Ping).await
    }

    /// Topics with a running consumer.
    pub fn consumed_topics(&self) -> Vec<String> {
        lock(&self.consumers).keys().cloned().collect()
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(CollabError::Connectivity(format!(
                "connection to {} is closed",
                self.url
            )));
        }
        let bytes = frame.encode()?;
        self.outgoing
            .send(bytes)
            .await
            .map_err(|_| CollabError::Connectivity(format!("writer for {} stopped", self.url)))
    }

    fn shutdown(&self) {
        for (_, consumer) in lock(&self.consumers).drain() {
            consumer.stop();
        }
        for task in lock(&self.io_tasks).drain(..) {
            task.abort();
        }
        self.alive.send_replace(false);
    }
}

#[async_trait]
impl Broker for RemoteBroker {
    fn mode(&self) -> BrokerMode {
        BrokerMode::Remote
    }

    async fn publish(&self, message: Message) -> Result<()> {
        let frame = Frame::Produce(message.to_wire()?);
        self.send_frame(&frame).await
    }

    async fn subscribe(&self, topic: &str, callback: Callback) -> Result<Subscription> {
        let subscriber = Subscriber::new(callback);
        let id = subscriber.id;

        let first = {
            let mut consumers = lock(&self.consumers);
            match consumers.get(topic) {
                Some(existing) => {
                    existing.subscribers.add(subscriber);
                    false
                }
                None => {
                    let subscribers = SubscriberList::default();
                    subscribers.add(subscriber);
                    let (feed, rx) = mpsc::unbounded_channel();
                    let task = tokio::spawn(consume_topic(topic.to_string(), rx, subscribers.clone()));
                    consumers.insert(
                        topic.to_string(),
                        TopicConsumer { subscribers, feed, task },
                    );
                    true
                }
            }
        };

        if first {
            if let Err(e) = self
                .send_frame(&Frame::Subscribe { topic: topic.to_string() })
                .await
            {
                if let Some(consumer) = lock(&self.consumers).remove(topic) {
                    consumer.stop();
                }
                return Err(e);
            }
            log::debug!("Started consuming '{topic}' from {}", self.url);
        }

        let weak: Weak<Mutex<HashMap<String, TopicConsumer>>> = Arc::downgrade(&self.consumers);
        let outgoing = self.outgoing.clone();
        let name = topic.to_string();
        Ok(Subscription::new(id, topic, move || {
            let Some(consumers) = weak.upgrade() else {
                return;
            };
            let mut consumers = lock(&consumers);
            let remaining = match consumers.get(&name) {
                Some(consumer) => consumer.subscribers.remove(id),
                None => return,
            };
            if remaining == 0 {
                if let Some(consumer) = consumers.remove(&name) {
                    consumer.stop();
                }
                // Best effort: a full or closed writer just means the relay
                // keeps sending frames that no longer have a consumer.
                if let Ok(bytes) = (Frame::Unsubscribe { topic: name.clone() }).encode() {
                    let _ = outgoing.try_send(bytes);
                }
                log::debug!("Stopped consuming '{name}'");
            }
        }))
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.consumers)
            .get(topic)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    async fn disconnect(&self) {
        self.shutdown();
        log::info!("Disconnected from relay at {}", self.url);
    }
}

impl Drop for RemoteBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn route(consumers: &Consumers, wire: WireMessage) {
    let consumers = lock(consumers);
    match consumers.get(&wire.topic) {
        Some(consumer) => {
            let _ = consumer.feed.send(wire);
        }
        None => log::trace!("No consumer for '{}', dropping", wire.topic),
    }
}

async fn consume_topic(
    topic: String,
    mut feed: mpsc::UnboundedReceiver<WireMessage>,
    subscribers: SubscriberList,
) {
    while let Some(wire) = feed.recv().await {
        match wire.into_message() {
            Ok(message) => {
                deliver(&message, &subscribers.snapshot());
            }
            Err(e) => log::warn!("Skipping message on '{topic}': {e}"),
        }
    }
}

/// Map a connect failure onto the error taxonomy.
///
/// URL and handshake-format failures mean this client can never talk to
/// the configured endpoint; everything else is treated as transient.
pub fn classify_connect_error(err: tungstenite::Error) -> CollabError {
    match err {
        tungstenite::Error::Url(e) => CollabError::PlatformUnsupported(e.to_string()),
        tungstenite::Error::HttpFormat(e) => CollabError::PlatformUnsupported(e.to_string()),
        other => CollabError::Connectivity(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tungstenite::error::UrlError;

    #[test]
    fn test_classify_url_error_is_structural() {
        let err = classify_connect_error(tungstenite::Error::Url(UrlError::UnsupportedUrlScheme));
        assert!(err.is_structural());
    }

    #[test]
    fn test_classify_io_error_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = classify_connect_error(tungstenite::Error::Io(io));
        assert!(matches!(err, CollabError::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = RemoteBroker::connect(&format!("ws://127.0.0.1:{port}"), 16).await;
        assert!(matches!(result, Err(CollabError::Connectivity(_))));
    }

    #[tokio::test]
    async fn test_connect_bad_scheme() {
        let result = RemoteBroker::connect("kafka://localhost", 16).await;
        assert!(matches!(result, Err(CollabError::PlatformUnsupported(_))));
    }
}
