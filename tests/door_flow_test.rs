//! End-to-end flow: control payload -> controller -> state topic

use garage_door::domain::types::{
    Action, DoorState, Intent, Outcome, PlateId, RejectReason, Source, Token,
};
use garage_door::infra::Metrics;
use garage_door::io::transport::dispatch_control;
use garage_door::io::{LoopbackTransport, StatePublisher};
use garage_door::services::{AuthGate, ControllerSettings, DoorController, StaticPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Harness {
    controller: Arc<DoorController>,
    transport: Arc<LoopbackTransport>,
    metrics: Arc<Metrics>,
    _shutdown: watch::Sender<bool>,
}

fn start(settings: ControllerSettings) -> Harness {
    let metrics = Arc::new(Metrics::new());
    let policy = StaticPolicy::new(Some("T"), ["ABC123"]);
    let controller = DoorController::new(settings, AuthGate::new(Arc::new(policy)), metrics.clone());

    let transport = Arc::new(LoopbackTransport::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher =
        StatePublisher::new(transport.clone(), controller.subscribe(), "garage/state", metrics.clone());
    tokio::spawn(publisher.run(shutdown_rx));

    Harness { controller, transport, metrics, _shutdown: shutdown_tx }
}

fn published_states(transport: &LoopbackTransport) -> Vec<bool> {
    transport
        .published()
        .iter()
        .map(|(topic, payload)| {
            assert_eq!(topic, "garage/state");
            let json: serde_json::Value = serde_json::from_slice(payload).unwrap();
            assert!(json["timestamp"].is_string());
            json["door_open"].as_bool().unwrap()
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_remote_open_then_idle_close() {
    let h = start(ControllerSettings::default());

    let outcome = dispatch_control(&h.controller, &h.metrics, br#"{"command":"open","token":"T"}"#);
    assert_eq!(outcome, Some(Outcome::Executed));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(published_states(&h.transport), vec![true]);

    // t = 119s
    tokio::time::sleep(Duration::from_secs(118)).await;
    assert_eq!(h.controller.current_state(), DoorState::Open);
    assert_eq!(published_states(&h.transport), vec![true]);

    // t = 121s
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.controller.current_state(), DoorState::Closed);
    assert_eq!(published_states(&h.transport), vec![true, false]);
    assert_eq!(h.metrics.auto_closes_total(), 1);
    assert_eq!(h.metrics.intents_from(Source::System), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_token_publishes_nothing() {
    let h = start(ControllerSettings::default());

    let outcome = dispatch_control(&h.controller, &h.metrics, br#"{"command":"open","token":"guess"}"#);
    assert_eq!(outcome, Some(Outcome::Rejected(RejectReason::InvalidToken)));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.transport.published().is_empty());
    assert_eq!(h.controller.current_state(), DoorState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_producers_single_walk() {
    let h = start(ControllerSettings::default());

    let outcomes = [
        h.controller.submit(Intent::voice(Action::Open)),
        h.controller.submit(Intent::remote(Action::Open, Some(Token::new("T")))),
        h.controller.submit(Intent::camera(PlateId::normalize("abc 123").unwrap())),
        h.controller.submit(Intent::manual(Action::Close)),
    ];
    let executed = outcomes.iter().filter(|o| o.is_executed()).count();
    assert_eq!(executed, 2);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(published_states(&h.transport), vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_offline_transport_does_not_block_controller() {
    let h = start(ControllerSettings::default());
    h.transport.set_connected(false);

    assert!(h.controller.submit(Intent::manual(Action::Open)).is_executed());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.controller.submit(Intent::manual(Action::Close)).is_executed());
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.controller.current_state(), DoorState::Closed);
    assert!(h.transport.published().is_empty());
    assert_eq!(h.metrics.report().state_publish_failures, 2);

    h.transport.set_connected(true);
    assert!(h.controller.submit(Intent::manual(Action::Open)).is_executed());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(published_states(&h.transport), vec![true]);
}

#[tokio::test(start_paused = true)]
async fn test_actuation_publishes_terminal_states_only() {
    let h = start(ControllerSettings {
        idle_timeout: Some(Duration::from_secs(120)),
        actuation: Duration::from_secs(12),
    });

    assert!(h.controller.submit(Intent::manual(Action::Open)).is_executed());
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.controller.current_state(), DoorState::Opening);
    assert!(h.transport.published().is_empty());

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(h.controller.current_state(), DoorState::Open);
    assert_eq!(published_states(&h.transport), vec![true]);
}
