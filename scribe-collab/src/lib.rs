//! # scribe-collab: topic pub/sub for collaborative template editing
//!
//! Publish/subscribe over a fixed set of named topics, served either by a
//! remote WebSocket relay or, when that is unreachable or unsupported, by an
//! in-process broker. Collaborative editing sessions and a whole-document
//! realtime channel are built on top.
//!
//! ## Architecture
//!
//! ```text
//!  CollaborationSession        host code
//!          │                       │
//!          └─────► TopicRouter ◄───┘
//!                       │
//!               ConnectionManager ──── PlatformProbe
//!                 │            │
//!                 ▼            ▼
//!          RemoteBroker    LocalBroker
//!                 │
//!            WebSocket (bincode Frames)
//!                 │
//!                 ▼
//!        relay (the `scribe-relay` crate)
//! ```
//!
//! `RealtimeSync` runs its own `RemoteBroker` connection on `all-events`
//! and never touches the `ConnectionManager`.
//!
//! ## Modules
//!
//! - [`protocol`]: message model, edit payloads and the binary frame codec
//! - [`broker`]: the `Broker` trait with local and remote implementations
//! - [`connection`]: remote/local selection and bounded reconnects
//! - [`router`]: fixed topics and typed publish helpers
//! - [`session`]: per-document editing session with echo suppression
//! - [`presence`]: remote cursor markers and colors
//! - [`realtime_sync`]: fail-fast whole-document broadcast

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod presence;
pub mod probe;
pub mod protocol;
pub mod realtime_sync;
pub mod router;
pub mod session;

// Re-exports for convenience
pub use broker::{Broker, BrokerMode, Callback, LocalBroker, RemoteBroker, Subscription, SubscriptionId};
pub use config::{BrokerConfig, RealtimeConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{CollabError, Result};
pub use presence::{cursor_color, CursorMarker, CursorTable, CURSOR_PALETTE};
pub use probe::PlatformProbe;
pub use protocol::{
    BroadcastEvent, DocumentUpdate, EditEnvelope, EditKind, EditOperation, Frame, Message, Payload,
    WireMessage,
};
pub use realtime_sync::{RealtimeSync, SyncChannel, SyncConnector, SyncStatus, WebSocketConnector};
pub use router::{Topic, TopicRouter};
pub use session::{apply_edit, CollaborationSession, SessionEvent};
