//! Chooses between the remote and the local broker and owns the remote
//! connection's lifecycle.
//!
//! ```text
//! Disconnected ──► Connecting ──┬──► Connected
//!      ▲                        └──► Error ──(retry budget left)──► Connecting
//!      │                                  └──(budget exhausted)───► UsingLocalFallback
//!      └── disconnect / new URL
//!
//! no URL ─────────────────────────────────────────────────────────► UsingLocalFallback
//! probe or handshake says "never" ────────────────────────────────► Unsupported
//! ```
//!
//! `UsingLocalFallback` and `Unsupported` are terminal for the manager's
//! lifetime; both serve publish/subscribe from the [`LocalBroker`].
//!
//! Subscriptions made through [`ConnectionManager::subscribe`] outlive the
//! broker they were first attached to. Every transition that changes the
//! active broker (fallback pin, reconnect, disconnect, re-enable) moves them
//! to the new one, so a listener registered during the retry window starts
//! hearing the local broker as soon as the manager falls back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;

use crate::broker::{lock, Broker, Callback, LocalBroker, RemoteBroker, Subscription, SubscriptionId};
use crate::config::{normalize_url, BrokerConfig};
use crate::error::CollabError;
use crate::probe::PlatformProbe;

/// Connection state as shown to the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in flight
    Disconnected,
    /// A connect attempt is running
    Connecting,
    /// Served by the remote relay
    Connected,
    /// Last attempt failed; the next publish or subscribe retries
    Error,
    /// The remote client cannot work here; served locally for good
    Unsupported,
    /// Relay absent or unreachable; served locally for good
    UsingLocalFallback,
}

impl ConnectionState {
    /// Whether publish/subscribe is being served by the local broker.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Unsupported | Self::UsingLocalFallback)
    }
}

struct Attempts {
    config: BrokerConfig,
    failed: u32,
    failure_logged: bool,
}

/// A callback registered through the manager and the broker-level
/// subscription currently carrying it, if any.
struct Registration {
    topic: String,
    callback: Callback,
    bound: Option<Subscription>,
}

/// Registrations keyed by creation order, so re-attaching keeps the
/// per-topic subscriber order.
type Registry = Arc<Mutex<BTreeMap<u64, Registration>>>;

/// Owns the remote connection, the in-process fallback and every
/// subscription made through it.
pub struct ConnectionManager {
    probe: PlatformProbe,
    local: Arc<LocalBroker>,
    remote: Mutex<Option<Arc<RemoteBroker>>>,
    /// Serializes connect attempts and (re)binding of registrations.
    attempts: tokio::sync::Mutex<Attempts>,
    enabled: AtomicBool,
    state: watch::Sender<ConnectionState>,
    registry: Registry,
    next_key: AtomicU64,
    /// Broker the registry is currently attached to.
    bound_to: Mutex<Option<Arc<dyn Broker>>>,
}

impl ConnectionManager {
    /// Manager for the current platform.
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_probe(config, PlatformProbe::detect())
    }

    /// Manager with an explicit platform probe.
    pub fn with_probe(config: BrokerConfig, probe: PlatformProbe) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            probe,
            local: Arc::new(LocalBroker::new()),
            remote: Mutex::new(None),
            enabled: AtomicBool::new(config.enabled),
            attempts: tokio::sync::Mutex::new(Attempts {
                config,
                failed: 0,
                failure_logged: false,
            }),
            state,
            registry: Arc::new(Mutex::new(BTreeMap::new())),
            next_key: AtomicU64::new(0),
            bound_to: Mutex::new(None),
        }
    }

    /// Record the relay URL.
    ///
    /// An unchanged URL is a no-op. A new URL drops the current connection
    /// and restarts the attempt cycle, unless the manager is already pinned
    /// to the local broker, in which case it is only recorded.
    pub async fn init(&self, server_url: impl Into<String>) {
        let url = normalize_url(server_url.into());
        {
            let mut attempts = self.attempts.lock().await;
            if attempts.config.server_url == url {
                return;
            }
            attempts.config.server_url = url;

            if self.state().is_local() {
                log::debug!("Server URL recorded; staying on the local broker");
                return;
            }

            self.drop_remote().await;
            attempts.failed = 0;
            attempts.failure_logged = false;
            self.set_state(ConnectionState::Disconnected);
            self.sync_registrations().await;
        }

        if self.is_enabled() {
            self.ensure_connected().await;
        }
    }

    /// Make sure some broker is ready to serve publish/subscribe.
    ///
    /// Performs at most one connect attempt per call. Returns `false` when
    /// disabled or when this attempt failed with retry budget left.
    pub async fn ensure_connected(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let mut attempts = self.attempts.lock().await;
        let ready = self.connect_step(&mut attempts).await;
        self.sync_registrations().await;
        ready
    }

    async fn connect_step(&self, attempts: &mut Attempts) -> bool {
        match self.state() {
            state if state.is_local() => return true,
            ConnectionState::Connected => {
                if self.remote_alive() {
                    return true;
                }
                log::info!("Relay connection lost; reconnecting");
                self.drop_remote().await;
                self.set_state(ConnectionState::Disconnected);
            }
            _ => {}
        }

        let Some(url) = attempts.config.server_url.clone() else {
            log::info!("No relay configured; using the in-process broker");
            self.set_state(ConnectionState::UsingLocalFallback);
            return true;
        };

        if let Err(e) = self.probe.check(&url) {
            self.pin_unsupported(&e);
            return true;
        }

        self.set_state(ConnectionState::Connecting);
        match RemoteBroker::connect(&url, attempts.config.outgoing_capacity).await {
            Ok(remote) => {
                *lock(&self.remote) = Some(Arc::new(remote));
                attempts.failed = 0;
                self.set_state(ConnectionState::Connected);
                true
            }
            Err(e) if e.is_structural() => {
                self.pin_unsupported(&e);
                true
            }
            Err(e) => {
                attempts.failed += 1;
                let max = attempts.config.max_connect_attempts.max(1);
                if attempts.failure_logged {
                    log::debug!("Relay at {url} still unreachable ({}/{max}): {e}", attempts.failed);
                } else {
                    log::warn!(
                        "Could not reach relay at {url} (attempt {}/{max}): {e}. \
                         Further failures are logged at debug level.",
                        attempts.failed
                    );
                    attempts.failure_logged = true;
                }

                if attempts.failed >= max {
                    log::info!("Relay unreachable after {max} attempts; switching to the in-process broker");
                    self.set_state(ConnectionState::UsingLocalFallback);
                    true
                } else {
                    self.set_state(ConnectionState::Error);
                    false
                }
            }
        }
    }

    /// Close the remote connection and forget its topics. No-op when local.
    pub async fn disconnect(&self) {
        let _attempts = self.attempts.lock().await;
        if self.state().is_local() {
            return;
        }
        self.drop_remote().await;
        self.set_state(ConnectionState::Disconnected);
        self.sync_registrations().await;
    }

    /// Register `callback` on `topic` on whichever broker is active now and
    /// on every broker that becomes active later.
    ///
    /// Returns an inert subscription when disabled. During the retry window
    /// the registration is kept and attached once a broker is available.
    pub async fn subscribe(&self, topic: &str, callback: Callback) -> Subscription {
        if !self.is_enabled() {
            return Subscription::inert(topic);
        }

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry).insert(
            key,
            Registration {
                topic: topic.to_string(),
                callback,
                bound: None,
            },
        );

        // Attaches the new registration if a broker is ready.
        self.ensure_connected().await;

        let registry: Weak<Mutex<BTreeMap<u64, Registration>>> = Arc::downgrade(&self.registry);
        Subscription::new(SubscriptionId::new(), topic, move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let removed = lock(&registry).remove(&key);
            if let Some(bound) = removed.and_then(|r| r.bound) {
                bound.unsubscribe();
            }
        })
    }

    /// Number of live subscriptions made through [`subscribe`](Self::subscribe).
    pub fn registration_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Disabling while connected disconnects; enabling waits for the next
    /// publish or subscribe to connect.
    pub async fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was && !enabled && self.state() == ConnectionState::Connected {
            self.disconnect().await;
        }
    }

    /// Whether publish/subscribe is allowed at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver for state changes (for connection banners).
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The broker currently serving publish/subscribe, if any.
    pub fn broker(&self) -> Option<Arc<dyn Broker>> {
        match self.state() {
            state if state.is_local() => Some(self.local.clone() as Arc<dyn Broker>),
            ConnectionState::Connected => lock(&self.remote)
                .clone()
                .map(|remote| remote as Arc<dyn Broker>),
            _ => None,
        }
    }

    /// The in-process broker, whether or not it is active.
    pub fn local_broker(&self) -> &Arc<LocalBroker> {
        &self.local
    }

    /// The recorded relay URL, if any.
    pub async fn server_url(&self) -> Option<String> {
        self.attempts.lock().await.config.server_url.clone()
    }

    fn remote_alive(&self) -> bool {
        lock(&self.remote)
            .as_ref()
            .is_some_and(|remote| remote.is_connected())
    }

    async fn drop_remote(&self) {
        let remote = lock(&self.remote).take();
        if let Some(remote) = remote {
            remote.disconnect().await;
        }
    }

    /// Move every registration onto the active broker. Registrations bound
    /// to a broker that is no longer active are detached first; unbound ones
    /// are attached if a broker is available. Caller holds `attempts`.
    async fn sync_registrations(&self) {
        let active = self.broker();
        let stale: Vec<Subscription> = {
            let mut bound_to = lock(&self.bound_to);
            if same_broker(bound_to.as_ref(), active.as_ref()) {
                Vec::new()
            } else {
                *bound_to = active.clone();
                lock(&self.registry)
                    .values_mut()
                    .filter_map(|r| r.bound.take())
                    .collect()
            }
        };
        for subscription in stale {
            subscription.unsubscribe();
        }

        let Some(broker) = active else {
            return;
        };
        let unbound: Vec<(u64, String, Callback)> = lock(&self.registry)
            .iter()
            .filter(|(_, r)| r.bound.is_none())
            .map(|(key, r)| (*key, r.topic.clone(), r.callback.clone()))
            .collect();
        if unbound.is_empty() {
            return;
        }
        log::debug!(
            "Attaching {} subscription(s) to the {:?} broker",
            unbound.len(),
            broker.mode()
        );

        for (key, topic, callback) in unbound {
            let subscription = match broker.subscribe(&topic, callback).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    log::debug!("Subscribe to '{topic}' failed: {e}");
                    continue;
                }
            };
            let orphaned = match lock(&self.registry).get_mut(&key) {
                Some(registration) => {
                    registration.bound = Some(subscription);
                    None
                }
                // Unsubscribed while we were attaching it.
                None => Some(subscription),
            };
            if let Some(subscription) = orphaned {
                subscription.unsubscribe();
            }
        }
    }

    fn pin_unsupported(&self, err: &CollabError) {
        log::warn!("Remote broker unsupported here ({err}); using the in-process broker");
        self.set_state(ConnectionState::Unsupported);
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::debug!("Connection state {prev:?} -> {next:?}");
        }
    }
}

fn same_broker(a: Option<&Arc<dyn Broker>>, b: Option<&Arc<dyn Broker>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
        (None, None) => true,
        _ => false,
    }
}
