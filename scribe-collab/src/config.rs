//! Client-side configuration.

/// Connection manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Relay endpoint (`ws://` or `wss://`). `None` selects the local broker.
    pub server_url: Option<String>,
    /// Master switch for publish/subscribe
    pub enabled: bool,
    /// Failed connect attempts tolerated before pinning to the local broker
    pub max_connect_attempts: u32,
    /// Frames buffered for the WebSocket writer
    pub outgoing_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            enabled: true,
            max_connect_attempts: 3,
            outgoing_capacity: 256,
        }
    }
}

impl BrokerConfig {
    /// Config pointing at a relay.
    pub fn with_server(url: impl Into<String>) -> Self {
        Self {
            server_url: normalize_url(url.into()),
            ..Self::default()
        }
    }
}

/// Realtime whole-document sync configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Relay endpoint; `None` disables realtime sync entirely.
    pub endpoint: Option<String>,
    /// Connect attempts before falling back to local-only editing
    pub max_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_attempts: 2,
        }
    }
}

/// Blank URLs count as "not configured".
pub(crate) fn normalize_url(url: String) -> Option<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_default() {
        let config = BrokerConfig::default();
        assert!(config.server_url.is_none());
        assert!(config.enabled);
        assert_eq!(config.max_connect_attempts, 3);
        assert_eq!(config.outgoing_capacity, 256);
    }

    #[test]
    fn test_with_server_normalizes_blank() {
        assert_eq!(
            BrokerConfig::with_server(" ws://relay:9092 ").server_url.as_deref(),
            Some("ws://relay:9092")
        );
        assert!(BrokerConfig::with_server("   ").server_url.is_none());
    }

    #[test]
    fn test_realtime_config_default() {
        let config = RealtimeConfig::default();
        assert!(config.endpoint.is_none());
        assert_eq!(config.max_attempts, 2);
    }
}
