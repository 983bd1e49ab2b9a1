//! Decides up front whether the remote client can work at all.
//!
//! The WebSocket client needs native sockets, so it is compiled out of the
//! picture on `wasm32`. Beyond that only `ws://` and `wss://` endpoints are
//! reachable. Neither check touches the network and neither can panic.

use crate::error::{CollabError, Result};

const SUPPORTED_SCHEMES: [&str; 2] = ["ws", "wss"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformProbe {
    remote_client_available: bool,
}

impl PlatformProbe {
    /// Probe for the current compilation target.
    pub fn detect() -> Self {
        Self {
            remote_client_available: !cfg!(target_arch = "wasm32"),
        }
    }

    /// A probe that always rejects the remote client.
    pub fn unsupported() -> Self {
        Self {
            remote_client_available: false,
        }
    }

    /// Whether this build can open WebSocket client connections.
    pub fn remote_client_available(&self) -> bool {
        self.remote_client_available
    }

    /// Check that `server_url` can be served by the remote client here.
    pub fn check(&self, server_url: &str) -> Result<()> {
        if !self.remote_client_available {
            return Err(CollabError::PlatformUnsupported(
                "remote client is not available on this target".to_string(),
            ));
        }
        let scheme = server_url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        if SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
            Ok(())
        } else {
            Err(CollabError::PlatformUnsupported(format!(
                "unsupported endpoint '{server_url}'"
            )))
        }
    }
}

impl Default for PlatformProbe {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_target_supports_ws() {
        let probe = PlatformProbe::detect();
        assert!(probe.remote_client_available());
        assert!(probe.check("ws://127.0.0.1:9092").is_ok());
        assert!(probe.check("WSS://relay.example.com/topics").is_ok());
    }

    #[test]
    fn test_rejects_other_schemes() {
        let probe = PlatformProbe::detect();
        for url in ["kafka://broker:9092", "http://relay", "relay:9092", ""] {
            assert!(
                matches!(probe.check(url), Err(CollabError::PlatformUnsupported(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_unsupported_probe_rejects_everything() {
        let probe = PlatformProbe::unsupported();
        assert!(probe.check("ws://127.0.0.1:9092").unwrap_err().is_structural());
    }
}
