//! WebSocket topic relay: the remote backend [`RemoteBroker`]s talk to.
//!
//! ```text
//! Client A ──Produce──┐                     ┌──Deliver──► Client A
//!                     ├──► TopicGroup(t) ───┤
//! Client B ──Produce──┘    (broadcast)      └──Deliver──► Client B
//! ```
//!
//! Each connection runs one forwarder task per subscribed topic, feeding a
//! single outgoing queue. The relay keeps no history: a consumer sees only
//! messages produced after its `Subscribe` frame arrived. Producers that
//! also consume a topic receive their own messages back.
//!
//! [`RemoteBroker`]: scribe_collab::broker::RemoteBroker

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use scribe_collab::protocol::Frame;

use crate::broadcast::{TopicGroup, TopicManager};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per topic before slow consumers start losing them
    pub topic_capacity: usize,
    /// Frames queued per connection towards its socket
    pub outgoing_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9092".to_string(),
            topic_capacity: 1024,
            outgoing_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Connections accepted since start
    pub total_connections: u64,
    /// Connections currently open
    pub active_connections: u64,
    /// Binary frames read from clients
    pub frames_received: u64,
    /// `Produce` frames fanned out
    pub messages_relayed: u64,
    /// Topics with at least one consumer
    pub active_topics: usize,
}

/// WebSocket relay server.
pub struct RelayServer {
    config: RelayConfig,
    topics: Arc<TopicManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    /// Create a relay with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            topics: Arc::new(TopicManager::new(config.topic_capacity)),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            config,
        }
    }

    /// Create a relay with the default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let topics = self.topics.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, topics, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Current statistics.
    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_topics = self.topics.topic_count().await;
        stats
    }

    /// Configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Topic registry shared by all connections.
    pub fn topics(&self) -> &Arc<TopicManager> {
        &self.topics
    }
}

/// Per-connection consumption state.
struct Connection {
    id: Uuid,
    addr: SocketAddr,
    outgoing: mpsc::Sender<Arc<Vec<u8>>>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Connection {
    async fn subscribe(&mut self, topics: &TopicManager, topic: String) {
        if self.forwarders.contains_key(&topic) {
            return;
        }
        let (group, rx) = topics.add_consumer(&topic, self.id).await;
        let task = tokio::spawn(forward(group, rx, self.outgoing.clone()));
        log::debug!("{} consumes '{topic}'", self.addr);
        self.forwarders.insert(topic, task);
    }

    async fn unsubscribe(&mut self, topics: &TopicManager, topic: &str) {
        if let Some(task) = self.forwarders.remove(topic) {
            task.abort();
            release(topics, topic, self.id).await;
            log::debug!("{} stopped consuming '{topic}'", self.addr);
        }
    }

    async fn close(mut self, topics: &TopicManager) {
        for (topic, task) in self.forwarders.drain() {
            task.abort();
            release(topics, &topic, self.id).await;
        }
    }
}

async fn release(topics: &TopicManager, topic: &str, connection: Uuid) {
    if topics.remove_consumer(topic, &connection).await {
        log::debug!("Topic '{topic}' has no consumers left");
    }
}

/// Copy a topic's frames into one connection's outgoing queue.
async fn forward(
    group: Arc<TopicGroup>,
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    outgoing: mpsc::Sender<Arc<Vec<u8>>>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if outgoing.send(frame).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(n)) => {
                log::warn!("Consumer of '{}' lagged by {n} frames", group.topic());
                group.record_dropped(n);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    topics: Arc<TopicManager>,
    stats: Arc<RwLock<RelayStats>>,
    config: RelayConfig,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (outgoing, mut outgoing_rx) = mpsc::channel(config.outgoing_capacity.max(1));
    let mut conn = Connection {
        id: Uuid::new_v4(),
        addr,
        outgoing,
        forwarders: HashMap::new(),
    };

    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        stats.write().await.frames_received += 1;
                        match Frame::decode(&data) {
                            Ok(frame) => {
                                handle_frame(frame, &mut conn, &topics, &stats, &mut ws_sender).await?
                            }
                            Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                },
                Some(frame) = outgoing_rx.recv() => {
                    ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                }
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    conn.close(&topics).await;
    stats.write().await.active_connections -= 1;
    result
}

async fn handle_frame(
    frame: Frame,
    conn: &mut Connection,
    topics: &TopicManager,
    stats: &RwLock<RelayStats>,
    ws_sender: &mut WsSink,
) -> Result<(), BoxError> {
    match frame {
        Frame::Subscribe { topic } => conn.subscribe(topics, topic).await,
        Frame::Unsubscribe { topic } => conn.unsubscribe(topics, &topic).await,
        Frame::Produce(message) => {
            let topic = message.topic.clone();
            let reached = topics.publish(message).await?;
            stats.write().await.messages_relayed += 1;
            log::trace!("Relayed message on '{topic}' to {reached} consumers");
        }
        Frame::Ping => {
            ws_sender
                .send(Message::Binary(Frame::Pong.encode()?.into()))
                .await?;
        }
        other => log::debug!("Ignoring client frame {other:?} from {}", conn.addr),
    }
    Ok(())
}
