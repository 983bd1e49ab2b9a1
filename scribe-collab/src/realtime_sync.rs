//! Whole-document broadcast with a fail-fast connection policy.
//!
//! Independent of [`ConnectionManager`](crate::connection::ConnectionManager):
//! it owns its own transport and its own attempt counter.
//!
//! ```text
//! CheckingAvailability ──(no endpoint)──► Disabled
//!          │
//!          ▼
//!     Connecting ──► Connected ──(any transport error)──► LocalFallback
//!          │
//!          └──► ConnectionError ──(cap reached)──────────► LocalFallback
//! ```
//!
//! `LocalFallback` is terminal. Callers are told `Connected` in that state
//! so editing carries on, local only.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::broker::{Broker, RemoteBroker, Subscription};
use crate::config::{normalize_url, RealtimeConfig};
use crate::error::{CollabError, Result};
use crate::protocol::{now_millis, to_payload, BroadcastEvent, DocumentUpdate, Message};
use crate::router::Topic;

/// Realtime sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Not started
    CheckingAvailability,
    /// No endpoint configured
    Disabled,
    /// Attempt in flight
    Connecting,
    /// Updates reach peers
    Connected,
    /// Last attempt failed with attempts left
    ConnectionError,
    /// Editing stays local for the rest of the session
    LocalFallback,
}

/// An open realtime transport.
#[async_trait]
pub trait SyncChannel: Send + Sync {
    async fn send(&self, update: &DocumentUpdate) -> Result<()>;

    /// Next update from any peer. `None` or a connectivity error ends the
    /// channel; other errors drop a single update.
    async fn recv(&mut self) -> Option<Result<DocumentUpdate>>;
}

/// Opens [`SyncChannel`]s.
#[async_trait]
pub trait SyncConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn SyncChannel>>;
}

/// Connects to a relay over its own WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    outgoing_capacity: usize,
}

impl WebSocketConnector {
    /// Connector whose writer buffers `outgoing_capacity` frames.
    pub fn new(outgoing_capacity: usize) -> Self {
        Self { outgoing_capacity }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl SyncConnector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn SyncChannel>> {
        let broker = RemoteBroker::connect(endpoint, self.outgoing_capacity).await?;
        let (tx, updates) = mpsc::unbounded_channel();
        let subscription = broker
            .subscribe(
                Topic::AllEvents.as_str(),
                Arc::new(move |message: &Message| -> Result<()> {
                    // all-events also carries unrelated records
                    match message.decode::<BroadcastEvent>() {
                        Ok(BroadcastEvent::DocumentUpdate(update)) => {
                            let _ = tx.send(update);
                        }
                        Err(e) => log::trace!("Not a document update: {e}"),
                    }
                    Ok(())
                }),
            )
            .await?;
        let alive = broker.watch_alive();
        Ok(Box::new(BrokerChannel {
            broker,
            subscription,
            updates,
            alive,
        }))
    }
}

/// [`SyncChannel`] over a dedicated [`RemoteBroker`] on `all-events`.
pub struct BrokerChannel {
    broker: RemoteBroker,
    subscription: Subscription,
    updates: mpsc::UnboundedReceiver<DocumentUpdate>,
    alive: watch::Receiver<bool>,
}

impl Drop for BrokerChannel {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

#[async_trait]
impl SyncChannel for BrokerChannel {
    async fn send(&self, update: &DocumentUpdate) -> Result<()> {
        let payload = to_payload(&BroadcastEvent::DocumentUpdate(update.clone()))?;
        self.broker
            .publish(Message::new(Topic::AllEvents.as_str(), payload))
            .await
    }

    async fn recv(&mut self) -> Option<Result<DocumentUpdate>> {
        tokio::select! {
            update = self.updates.recv() => update.map(Ok),
            _ = wait_closed(&mut self.alive) => Some(Err(CollabError::Connectivity(format!(
                "connection to {} closed",
                self.broker.url()
            )))),
        }
    }
}

async fn wait_closed(alive: &mut watch::Receiver<bool>) {
    loop {
        let open = *alive.borrow_and_update();
        if !open || alive.changed().await.is_err() {
            return;
        }
    }
}

/// Realtime sync for one document and one user.
pub struct RealtimeSync {
    config: RealtimeConfig,
    connector: Arc<dyn SyncConnector>,
    document_id: String,
    user_id: String,
    attempts: u32,
    channel: Option<Box<dyn SyncChannel>>,
    status: watch::Sender<SyncStatus>,
}

impl RealtimeSync {
    /// Sync over the relay in `config.endpoint`.
    pub fn new(
        config: RealtimeConfig,
        document_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector::default()), document_id, user_id)
    }

    /// Sync over an injected transport.
    pub fn with_connector(
        config: RealtimeConfig,
        connector: Arc<dyn SyncConnector>,
        document_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::CheckingAvailability);
        Self {
            config,
            connector,
            document_id: document_id.into(),
            user_id: user_id.into(),
            attempts: 0,
            channel: None,
            status,
        }
    }

    /// Internal status; `LocalFallback` is visible here but not from
    /// [`start`](Self::start).
    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Receiver for status changes.
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Whether updates actually reach peers.
    pub fn is_live(&self) -> bool {
        self.status() == SyncStatus::Connected && self.channel.is_some()
    }

    /// Bring the channel up. Returns the status to show the user.
    pub async fn start(&mut self) -> SyncStatus {
        match self.status() {
            SyncStatus::Connected | SyncStatus::LocalFallback => return SyncStatus::Connected,
            SyncStatus::Disabled => return SyncStatus::Disabled,
            _ => {}
        }

        self.set_status(SyncStatus::CheckingAvailability);
        let Some(endpoint) = self.config.endpoint.clone().and_then(normalize_url) else {
            log::info!("No realtime endpoint configured; realtime sync disabled");
            self.set_status(SyncStatus::Disabled);
            return SyncStatus::Disabled;
        };

        let cap = self.config.max_attempts.max(1);
        while self.attempts < cap {
            self.attempts += 1;
            self.set_status(SyncStatus::Connecting);
            match self.connector.connect(&endpoint).await {
                Ok(channel) => {
                    log::info!("Realtime sync connected to {endpoint}");
                    self.channel = Some(channel);
                    self.set_status(SyncStatus::Connected);
                    return SyncStatus::Connected;
                }
                Err(e) => {
                    log::debug!(
                        "Realtime connect to {endpoint} failed ({}/{cap}): {e}",
                        self.attempts
                    );
                    self.set_status(SyncStatus::ConnectionError);
                }
            }
        }

        log::warn!("Realtime sync unavailable after {cap} attempts; editing locally");
        self.set_status(SyncStatus::LocalFallback);
        SyncStatus::Connected
    }

    /// Send the full document text. `false` when nothing went out.
    pub async fn broadcast(&mut self, content: impl Into<String>) -> bool {
        let Some(channel) = self.channel.as_ref() else {
            return false;
        };
        let update = DocumentUpdate {
            document_id: self.document_id.clone(),
            user_id: self.user_id.clone(),
            content: content.into(),
            timestamp: now_millis(),
        };
        match channel.send(&update).await {
            Ok(()) => true,
            Err(e) => {
                self.fall_back(&e);
                false
            }
        }
    }

    /// Next update from another user on this document. `None` once the
    /// channel is gone.
    pub async fn next_update(&mut self) -> Option<DocumentUpdate> {
        loop {
            let channel = self.channel.as_mut()?;
            match channel.recv().await {
                Some(Ok(update)) => {
                    if update.user_id == self.user_id || update.document_id != self.document_id {
                        continue;
                    }
                    return Some(update);
                }
                Some(Err(e @ CollabError::Serialization(_))) => {
                    log::debug!("Dropping realtime update: {e}");
                }
                Some(Err(e)) => {
                    self.fall_back(&e);
                    return None;
                }
                None => {
                    self.fall_back(&CollabError::Connectivity("channel closed".to_string()));
                    return None;
                }
            }
        }
    }

    fn fall_back(&mut self, err: &CollabError) {
        if self.channel.take().is_some() {
            log::warn!("Realtime sync lost ({err}); continuing locally");
        }
        self.set_status(SyncStatus::LocalFallback);
    }

    fn set_status(&self, next: SyncStatus) {
        let prev = self.status.send_replace(next);
        if prev != next {
            log::debug!("Realtime sync {prev:?} -> {next:?}");
        }
    }
}
