//! Embedded MQTT broker (rumqttd) for running controller and simulator
//! on one machine without an external broker.

use crate::infra::config::Config as AppConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// One door, a handful of clients
const MAX_CONNECTIONS: usize = 64;
const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

fn broker_config(listen: SocketAddr) -> Config {
    let router = RouterConfig {
        max_segment_size: 1024 * 1024,
        max_segment_count: 4,
        max_connections: MAX_CONNECTIONS,
        max_outgoing_packet_count: 64,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: MAX_PAYLOAD_SIZE,
                max_inflight_count: 32,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker on its own thread if enabled in config
///
/// Returns false when disabled or the bind address is invalid.
pub fn start_embedded_broker(app_config: &AppConfig) -> bool {
    if !app_config.broker_enabled() {
        return false;
    }

    let addr_str = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen: SocketAddr = match addr_str.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, addr = %addr_str, "broker_invalid_bind_address");
            return false;
        }
    };

    let config = broker_config(listen);
    thread::spawn(move || {
        let mut broker = Broker::new(config);
        // start() blocks for the lifetime of the broker
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    // Give the listener a moment before clients connect
    thread::sleep(Duration::from_millis(100));
    info!(listen = %listen, "broker_started");
    true
}
