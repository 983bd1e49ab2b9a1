//! # scribe-relay: WebSocket topic relay for `scribe-collab` clients
//!
//! The remote backend behind `RemoteBroker`. Clients send bincode
//! [`Frame`](scribe_collab::protocol::Frame)s; the relay fans `Produce`
//! frames out to every connection consuming the topic.
//!
//! - [`server`]: accept loop and per-connection frame handling
//! - [`broadcast`]: per-topic fan-out groups and their registry

pub mod broadcast;
pub mod server;

pub use broadcast::{TopicGroup, TopicManager, TopicStats};
pub use server::{RelayConfig, RelayServer, RelayStats};
