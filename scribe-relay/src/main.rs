//! Standalone topic relay for `scribe-collab` clients.
//!
//! ```text
//! SCRIBE_RELAY_ADDR=0.0.0.0:9092 RUST_LOG=info scribe-relay
//! ```

use log::{error, info};
use scribe_relay::{RelayConfig, RelayServer};

const ADDR_VAR: &str = "SCRIBE_RELAY_ADDR";

fn config_from_env() -> RelayConfig {
    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var(ADDR_VAR) {
        let addr = addr.trim();
        if !addr.is_empty() {
            config.bind_addr = addr.to_string();
        }
    }
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from_env();
    info!("Starting scribe relay on {}...", config.bind_addr);

    let relay = RelayServer::new(config);
    if let Err(e) = relay.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
