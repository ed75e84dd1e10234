//! Garage door controller
//!
//! Arbitrates open/close intents from a camera, voice transcripts, remote
//! MQTT commands and a manual HTTP surface into one door state, publishing
//! every committed transition to the state topic.
//!
//! Module structure:
//! - `domain/` - Core types (DoorState, Intent, Outcome, errors)
//! - `services/` - Controller, auth gate, idle timer
//! - `io/` - Transports and intent producers
//! - `infra/` - Config, metrics, embedded broker

use anyhow::Context;
use clap::Parser;
use garage_door::domain::types::Source;
use garage_door::infra::{Config, Metrics, TransportMode};
use garage_door::io::{
    start_http_server, start_voice_listener, CameraMonitor, CameraSettings, HttpContext,
    HttpPlateRecognizer, HttpSnapshotSource, LoopbackTransport, MqttTransport, StatePublisher,
    Transport,
};
use garage_door::services::controller::describe_sources;
use garage_door::services::{AuthGate, ControllerSettings, DoorController, StaticPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Garage door controller daemon
#[derive(Parser, Debug)]
#[command(name = "garage-door", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

/// Grace period for the state publisher to drain on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for ignored intents and payloads
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git = %env!("GIT_HASH"), "garage-door starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    garage_door::infra::broker::start_embedded_broker(&config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        transport = %config.transport_mode().as_str(),
        control_topic = %config.control_topic(),
        state_topic = %config.state_topic(),
        idle_timeout_secs = ?config.idle_timeout().map(|d| d.as_secs()),
        actuation_ms = %config.actuation().as_millis(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let policy = StaticPolicy::from_config(&config);
    if !policy.has_secret() {
        warn!("auth_no_secret_configured: remote commands will be rejected");
    }
    info!(plates = %policy.plate_count(), "auth_policy_loaded");

    let controller = DoorController::new(
        ControllerSettings::from_config(&config),
        AuthGate::new(Arc::new(policy)),
        metrics.clone(),
    );

    // State publisher subscribes before any producer can submit
    let updates = controller.subscribe();
    let transport: Arc<dyn Transport> = match config.transport_mode() {
        TransportMode::Broker | TransportMode::Gateway => {
            let (mqtt, event_loop) = MqttTransport::connect(&config);
            if let Err(e) = mqtt.subscribe(config.control_topic()).await {
                warn!(error = %e, topic = %config.control_topic(), "control_subscribe_deferred");
            }
            let loop_controller = controller.clone();
            let loop_metrics = metrics.clone();
            let loop_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                event_loop.run(loop_controller, loop_metrics, loop_shutdown).await;
            });
            Arc::new(mqtt)
        }
        TransportMode::Offline => {
            warn!("transport_offline: state updates stay in-process");
            Arc::new(LoopbackTransport::new())
        }
    };

    let publisher =
        StatePublisher::new(transport, updates, config.state_topic(), metrics.clone());
    let publisher_shutdown = shutdown_rx.clone();
    let publisher_task = tokio::spawn(async move {
        publisher.run(publisher_shutdown).await;
    });

    // Camera
    let camera_config = config.camera();
    let mut camera_enabled = false;
    if camera_config.enabled {
        match (HttpSnapshotSource::new(camera_config), HttpPlateRecognizer::new(camera_config)) {
            (Ok(source), Ok(recognizer)) => {
                let monitor = CameraMonitor::new(
                    Arc::new(source),
                    Arc::new(recognizer),
                    controller.clone(),
                    metrics.clone(),
                    CameraSettings::from_config(camera_config),
                );
                let camera_shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    monitor.run(camera_shutdown).await;
                });
                camera_enabled = true;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "camera_disabled");
            }
        }
    }

    // Voice
    let voice_addr = match config.voice_listen_addr() {
        Ok(addr) => config.voice_enabled().then_some(addr),
        Err(e) => {
            warn!(error = %e, "voice_invalid_bind_address");
            None
        }
    };
    if let Some(addr) = voice_addr {
        let voice_controller = controller.clone();
        let voice_metrics = metrics.clone();
        let voice_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                start_voice_listener(addr, voice_controller, voice_metrics, voice_shutdown).await
            {
                error!(error = %e, addr = %addr, "voice_listener_error");
            }
        });
    }

    // Manual control + metrics (if port > 0)
    let http_addr = match config.http_listen_addr() {
        Ok(addr) => (addr.port() > 0).then_some(addr),
        Err(e) => {
            warn!(error = %e, "http_invalid_bind_address");
            None
        }
    };
    if let Some(addr) = http_addr {
        let ctx = HttpContext {
            controller: controller.clone(),
            metrics: metrics.clone(),
            site_id: Arc::new(config.site_id().to_string()),
        };
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_http_server(addr, ctx, http_shutdown).await {
                error!(error = %e, addr = %addr, "http_server_error");
            }
        });
    }

    // Periodic metrics summary
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            reporter_metrics.report().log();
        }
    });

    info!(
        sources = %describe_sources(&[
            (Source::Camera, camera_enabled),
            (Source::Voice, voice_addr.is_some()),
            (Source::Remote, config.transport_mode() != TransportMode::Offline),
            (Source::Manual, http_addr.is_some()),
        ]),
        state = %controller.current_state(),
        "controller_started"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(SHUTDOWN_GRACE, publisher_task).await.is_err() {
        warn!("state_publisher_drain_timeout");
    }

    info!("garage-door shutdown complete");
    Ok(())
}
