//! Message transport for remote control and state publication
//!
//! Two MQTT flavours share one client: a plain broker connection and a
//! managed IoT gateway reached over mutual TLS. An in-memory loopback stands
//! in when the controller runs offline and in tests.

use crate::domain::error::TransportError;
use crate::domain::types::Outcome;
use crate::infra::config::{Config, GatewayConfig, TransportMode};
use crate::infra::metrics::Metrics;
use crate::io::command::parse_control_message;
use crate::services::controller::DoorController;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Publish/subscribe capability used by the controller's adapters
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportMode;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// MQTT transport (broker or gateway)
pub struct MqttTransport {
    client: AsyncClient,
    kind: TransportMode,
    subscriptions: Arc<Mutex<Vec<String>>>,
}

/// Drives the MQTT connection and turns control messages into intents
pub struct MqttEventLoop {
    eventloop: EventLoop,
    client: AsyncClient,
    control_topic: String,
    subscriptions: Arc<Mutex<Vec<String>>>,
}

impl MqttTransport {
    /// Build the client for the configured mode; the connection is made
    /// lazily by `MqttEventLoop::run`.
    pub fn connect(config: &Config) -> (Self, MqttEventLoop) {
        let kind = config.transport_mode();
        let mqttoptions = match kind {
            TransportMode::Gateway => gateway_options(config),
            _ => broker_options(config),
        };

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));

        let transport = Self { client: client.clone(), kind, subscriptions: subscriptions.clone() };
        let event_loop = MqttEventLoop {
            eventloop,
            client,
            control_topic: config.control_topic().to_string(),
            subscriptions,
        };
        (transport, event_loop)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn kind(&self) -> TransportMode {
        self.kind
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        {
            let mut subs = self.subscriptions.lock();
            if !subs.iter().any(|t| t == topic) {
                subs.push(topic.to_string());
            }
        }
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        // Retained so late subscribers (the simulator) see the current state
        self.client.publish(topic, QoS::AtLeastOnce, true, payload).await?;
        Ok(())
    }
}

fn broker_options(config: &Config) -> MqttOptions {
    let mut mqttoptions =
        MqttOptions::new(config.client_id(), config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(config.keep_alive());
    mqttoptions.set_clean_session(true);

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }
    mqttoptions
}

fn gateway_options(config: &Config) -> MqttOptions {
    let gateway = config.gateway();
    let mut mqttoptions = MqttOptions::new(config.client_id(), &gateway.endpoint, gateway.port);
    mqttoptions.set_keep_alive(config.keep_alive());
    mqttoptions.set_clean_session(true);

    match gateway_tls(gateway) {
        Some(tls) => {
            mqttoptions.set_transport(rumqttc::Transport::tls_with_config(tls));
            info!(endpoint = %gateway.endpoint, port = %gateway.port, "gateway_tls_configured");
        }
        None => {
            warn!(endpoint = %gateway.endpoint, "gateway_connecting_without_tls");
        }
    }
    mqttoptions
}

/// Load the CA and client certificate; `None` if any file is missing
fn gateway_tls(gateway: &GatewayConfig) -> Option<TlsConfiguration> {
    let files = [&gateway.ca_path, &gateway.cert_path, &gateway.key_path];
    let missing: Vec<&str> =
        files.iter().filter(|p| !Path::new(p.as_str()).is_file()).map(|p| p.as_str()).collect();
    if !missing.is_empty() {
        warn!(missing = %missing.join(", "), "gateway_certificates_missing");
        return None;
    }

    let read = |path: &str| match std::fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(path = %path, error = %e, "gateway_certificate_unreadable");
            None
        }
    };

    let ca = read(&gateway.ca_path)?;
    let cert = read(&gateway.cert_path)?;
    let key = read(&gateway.key_path)?;
    Some(TlsConfiguration::Simple { ca, alpn: None, client_auth: Some((cert, key)) })
}

impl MqttEventLoop {
    /// Poll the connection until shutdown
    ///
    /// Subscriptions are re-issued on every ConnAck since sessions are clean.
    pub async fn run(
        mut self,
        controller: Arc<DoorController>,
        metrics: Arc<Metrics>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Rate-limit drop warnings to 1 per second
        let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_shutdown");
                        return;
                    }
                }
                result = self.eventloop.poll() => {
                    match result {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!(control_topic = %self.control_topic, "mqtt_connected");
                            self.resubscribe();
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if publish.topic != self.control_topic {
                                debug!(topic = %publish.topic, "mqtt_unexpected_topic");
                            } else if dispatch_control(&controller, &metrics, &publish.payload)
                                .is_none()
                                && last_drop_warn.elapsed() > Duration::from_secs(1)
                            {
                                warn!(dropped_total = %metrics.commands_dropped(), "command_dropped");
                                last_drop_warn = Instant::now();
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "mqtt_error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    fn resubscribe(&self) {
        let mut topics = self.subscriptions.lock().clone();
        if !topics.iter().any(|t| *t == self.control_topic) {
            topics.push(self.control_topic.clone());
        }
        for topic in topics {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                warn!(topic = %topic, error = %e, "mqtt_subscribe_failed");
            }
        }
    }
}

/// Parse one control payload and submit it
///
/// Returns `None` when the payload was dropped without producing an intent.
pub fn dispatch_control(
    controller: &DoorController,
    metrics: &Metrics,
    payload: &[u8],
) -> Option<Outcome> {
    match parse_control_message(payload) {
        Ok(Some(intent)) => Some(controller.submit(intent)),
        Ok(None) => {
            metrics.record_command_dropped();
            debug!("control_unknown_command");
            None
        }
        Err(e) => {
            metrics.record_command_dropped();
            debug!(error = %e, "control_payload_invalid");
            None
        }
    }
}

/// Retained publishes per loopback instance
const LOOPBACK_HISTORY: usize = 256;

/// In-memory transport for offline operation and tests
pub struct LoopbackTransport {
    kind: TransportMode,
    connected: Mutex<bool>,
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<VecDeque<(String, Vec<u8>)>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            kind: TransportMode::Offline,
            connected: Mutex::new(true),
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(VecDeque::with_capacity(LOOPBACK_HISTORY)),
        }
    }

    /// Simulate losing (or regaining) the link
    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock() = connected;
    }

    /// Most recent publishes, oldest first
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().iter().cloned().collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportMode {
        self.kind
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !*self.connected.lock() {
            return Err(TransportError::Offline);
        }
        let mut published = self.published.lock();
        if published.len() == LOOPBACK_HISTORY {
            published.pop_front();
        }
        published.push_back((topic.to_string(), payload));
        Ok(())
    }
}
