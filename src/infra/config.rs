//! Configuration loading from TOML files
//!
//! Config file is selected via `--config <path>` (default: config/dev.toml).
//! A missing or unparsable file falls back to defaults with a warning.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which transport carries commands and state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Plain MQTT connection to a broker
    Broker,
    /// Managed IoT gateway over mutual TLS
    Gateway,
    /// No network transport; state stays in-process
    Offline,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Broker => "broker",
            TransportMode::Gateway => "gateway",
            TransportMode::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "garage".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Auto-close delay after the door reaches open (0 disables)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Time spent in Opening/Closing (0 = instantaneous actuator)
    #[serde(default)]
    pub actuation_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { idle_timeout_secs: default_idle_timeout_secs(), actuation_ms: 0 }
    }
}

fn default_idle_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub secret_token: Option<String>,
    #[serde(default)]
    pub authorized_plates: Vec<String>,
    /// One plate per line, `#` starts a comment. Relative to the config file.
    #[serde(default)]
    pub plates_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_mode")]
    pub mode: TransportMode,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_control_topic")]
    pub control_topic: String,
    #[serde(default = "default_state_topic")]
    pub state_topic: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: default_transport_mode(),
            client_id: default_client_id(),
            control_topic: default_control_topic(),
            state_topic: default_state_topic(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

fn default_transport_mode() -> TransportMode {
    TransportMode::Broker
}

fn default_client_id() -> String {
    "garage_controller".to_string()
}

fn default_control_topic() -> String {
    "garage/control".to_string()
}

fn default_state_topic() -> String {
    "garage/state".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { host: "localhost".to_string(), port: 1883, username: None, password: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default = "default_ca_path")]
    pub ca_path: String,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: default_gateway_endpoint(),
            port: default_gateway_port(),
            ca_path: default_ca_path(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

fn default_gateway_endpoint() -> String {
    "iot-endpoint.amazonaws.com".to_string()
}

fn default_gateway_port() -> u16 {
    8883
}

fn default_ca_path() -> String {
    "root-CA.crt".to_string()
}

fn default_cert_path() -> String {
    "certificate.pem.crt".to_string()
}

fn default_key_path() -> String {
    "private.pem.key".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_broker_bind_address(),
            port: default_broker_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub enabled: bool,
    /// HTTP endpoint returning a JPEG snapshot
    #[serde(default)]
    pub snapshot_url: String,
    /// Text-detection endpoint receiving the snapshot
    #[serde(default)]
    pub recognition_url: String,
    #[serde(default = "default_camera_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause after an authorized plate before recognizing again
    #[serde(default = "default_camera_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Minimum detection confidence (percent)
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_camera_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            snapshot_url: String::new(),
            recognition_url: String::new(),
            poll_interval_ms: default_camera_poll_interval_ms(),
            cooldown_secs: default_camera_cooldown_secs(),
            min_confidence: default_min_confidence(),
            timeout_ms: default_camera_timeout_ms(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

fn default_camera_poll_interval_ms() -> u64 {
    500
}

fn default_camera_cooldown_secs() -> u64 {
    30
}

fn default_min_confidence() -> f64 {
    80.0
}

fn default_camera_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_delay_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// TCP port the speech-to-text engine pushes transcripts to
    /// Interface the transcript listener binds to
    #[serde(default = "default_local_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_voice_listen_port")]
    pub listen_port: u16,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_local_bind_address(),
            listen_port: default_voice_listen_port(),
        }
    }
}

fn default_voice_listen_port() -> u16 {
    25900
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Interface the manual control server binds to
    #[serde(default = "default_local_bind_address")]
    pub bind_address: String,
    /// Manual control and metrics port (0 to disable)
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind_address: default_local_bind_address(), port: default_http_port() }
    }
}

fn default_local_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    idle_timeout_secs: u64,
    actuation_ms: u64,
    secret_token: Option<String>,
    authorized_plates: Vec<String>,
    transport_mode: TransportMode,
    client_id: String,
    control_topic: String,
    state_topic: String,
    keep_alive_secs: u64,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    gateway: GatewayConfig,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    camera: CameraConfig,
    voice_enabled: bool,
    voice_bind_address: String,
    voice_listen_port: u16,
    http_bind_address: String,
    http_port: u16,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), Vec::new(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, file_plates: Vec<String>, config_file: String) -> Self {
        let mut authorized_plates = toml_config.auth.authorized_plates;
        authorized_plates.extend(file_plates);

        Self {
            site_id: toml_config.site.id,
            idle_timeout_secs: toml_config.controller.idle_timeout_secs,
            actuation_ms: toml_config.controller.actuation_ms,
            secret_token: toml_config.auth.secret_token.filter(|t| !t.is_empty()),
            authorized_plates,
            transport_mode: toml_config.transport.mode,
            client_id: toml_config.transport.client_id,
            control_topic: toml_config.transport.control_topic,
            state_topic: toml_config.transport.state_topic,
            keep_alive_secs: toml_config.transport.keep_alive_secs,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            gateway: toml_config.gateway,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            camera: toml_config.camera,
            voice_enabled: toml_config.voice.enabled,
            voice_bind_address: toml_config.voice.bind_address,
            voice_listen_port: toml_config.voice.listen_port,
            http_bind_address: toml_config.http.bind_address,
            http_port: toml_config.http.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        // An unreadable plates file keeps the rest of the config; inline plates still apply
        let file_plates = match toml_config.auth.plates_file.as_deref() {
            Some(plates_file) => {
                let plates_path = resolve_relative(path, plates_file);
                match read_plates_file(&plates_path) {
                    Ok(plates) => plates,
                    Err(e) => {
                        eprintln!("Warning: {:#}. Using inline authorized_plates only.", e);
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        Ok(Self::from_toml(toml_config, file_plates, path.display().to_string()))
    }

    /// Load configuration from path, falling back to defaults on error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Idle auto-close delay, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn actuation(&self) -> Duration {
        Duration::from_millis(self.actuation_ms)
    }

    pub fn secret_token(&self) -> Option<&str> {
        self.secret_token.as_deref()
    }

    pub fn authorized_plates(&self) -> &[String] {
        &self.authorized_plates
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.transport_mode
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn control_topic(&self) -> &str {
        &self.control_topic
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn gateway(&self) -> &GatewayConfig {
        &self.gateway
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn voice_enabled(&self) -> bool {
        self.voice_enabled
    }

    pub fn voice_listen_port(&self) -> u16 {
        self.voice_listen_port
    }

    /// Transcript listener socket address
    pub fn voice_listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        listen_addr(&self.voice_bind_address, self.voice_listen_port)
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Manual control / metrics socket address
    pub fn http_listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        listen_addr(&self.http_bind_address, self.http_port)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the shared secret
    #[cfg(test)]
    pub fn with_secret_token(mut self, token: &str) -> Self {
        self.secret_token = Some(token.to_string());
        self
    }

    /// Builder method for tests to set the authorized plates
    #[cfg(test)]
    pub fn with_authorized_plates(mut self, plates: &[&str]) -> Self {
        self.authorized_plates = plates.iter().map(|p| p.to_string()).collect();
        self
    }
}

fn listen_addr(bind_address: &str, port: u16) -> Result<SocketAddr, AddrParseError> {
    let ip: IpAddr = bind_address.parse()?;
    Ok(SocketAddr::new(ip, port))
}

fn resolve_relative(config_path: &Path, file: &str) -> PathBuf {
    let file_path = Path::new(file);
    if file_path.is_absolute() {
        return file_path.to_path_buf();
    }
    match config_path.parent() {
        Some(dir) => dir.join(file_path),
        None => file_path.to_path_buf(),
    }
}

/// Read plate list: one per line, blank lines and `#` comments skipped
fn read_plates_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read plates file {}", path.display()))?;
    Ok(parse_plate_lines(&content))
}

fn parse_plate_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
