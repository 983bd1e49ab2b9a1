//! Error taxonomy shared by the broker, router and sync layers.
//!
//! Connectivity and platform errors are absorbed by [`crate::connection`]
//! and [`crate::router`]; callers of `publish`/`subscribe` never see them.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CollabError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollabError {
    /// The remote broker could not be reached or the connection dropped.
    #[error("Broker unreachable: {0}")]
    Connectivity(String),

    /// The remote client cannot run in this runtime or against this URL.
    #[error("Remote client unsupported: {0}")]
    PlatformUnsupported(String),

    /// A payload or frame could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A subscriber callback returned an error or panicked.
    #[error("Subscriber callback failed: {0}")]
    SubscriberCallback(String),
}

impl CollabError {
    /// Whether this failure means the remote path can never work here.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::PlatformUnsupported(_))
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for CollabError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CollabError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(e.to_string())
    }
}
