//! Door state controller - the single writer of the door state
//!
//! Every producer (camera loop, voice listener, transport event loop, manual
//! HTTP handler, idle timer, actuation completion) funnels through `submit`.
//! One mutex covers the state read-check-write together with the idle timer
//! arm/disarm, so a transition and its timer side effect are never observed
//! half-applied. Nothing inside the lock does I/O: state updates go onto an
//! in-memory broadcast channel in commit order and are published to the
//! network by a separate task.
//!
//! State machine:
//! ```text
//! Closed --open--> Opening --actuation--> Open
//! Open  --close--> Closing --actuation--> Closed
//! ```
//! Requests that oppose an in-flight transition are ignored until it resolves.

use crate::domain::types::{
    Action, AuthDecision, DoorState, IgnoreReason, Intent, Outcome, Source, StateUpdate,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::auth::AuthGate;
use crate::services::idle_timer::IdleTimer;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Buffered state updates per subscriber before it starts lagging
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Timing parameters fixed at startup
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// Auto-close delay once the door is open (`None` disables)
    pub idle_timeout: Option<Duration>,
    /// Time spent in Opening/Closing; zero resolves transitions immediately
    pub actuation: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self { idle_timeout: config.idle_timeout(), actuation: config.actuation() }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self { idle_timeout: Some(Duration::from_secs(120)), actuation: Duration::ZERO }
    }
}

/// State guarded by the controller lock
struct DoorCore {
    state: DoorState,
    idle_timer: IdleTimer,
    actuation_epoch: u64,
}

pub struct DoorController {
    core: Mutex<DoorCore>,
    auth: AuthGate,
    settings: ControllerSettings,
    updates: broadcast::Sender<StateUpdate>,
    metrics: Arc<Metrics>,
    runtime: Handle,
    this: Weak<DoorController>,
}

impl DoorController {
    /// Create the controller in its conservative start state (`Closed`).
    ///
    /// Must be called from within a Tokio runtime; timers and actuation
    /// completions are spawned onto it.
    pub fn new(settings: ControllerSettings, auth: AuthGate, metrics: Arc<Metrics>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        metrics.set_door_state(DoorState::Closed);
        Arc::new_cyclic(|this| Self {
            core: Mutex::new(DoorCore {
                state: DoorState::Closed,
                idle_timer: IdleTimer::new(settings.idle_timeout),
                actuation_epoch: 0,
            }),
            auth,
            settings,
            updates,
            metrics,
            runtime: Handle::current(),
            this: this.clone(),
        })
    }

    /// Receive every committed terminal state, in commit order
    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.updates.subscribe()
    }

    /// Snapshot of the current door state
    pub fn current_state(&self) -> DoorState {
        self.core.lock().state
    }

    pub fn settings(&self) -> ControllerSettings {
        self.settings
    }

    /// Arbitrate one intent. Safe to call concurrently from any producer.
    pub fn submit(&self, intent: Intent) -> Outcome {
        self.arbitrate(intent, None)
    }

    fn arbitrate(&self, intent: Intent, timer_epoch: Option<u64>) -> Outcome {
        let started = Instant::now();

        let (outcome, from, to) = match self.auth.authorize(&intent) {
            AuthDecision::Deny(reason) => {
                let state = self.current_state();
                (Outcome::Rejected(reason), state, state)
            }
            AuthDecision::Allow => {
                let mut core = self.core.lock();
                let from = core.state;
                let outcome = match timer_epoch {
                    Some(epoch) if !core.idle_timer.is_current(epoch) => {
                        Outcome::Ignored(IgnoreReason::StaleTimer)
                    }
                    _ => self.apply(&mut core, intent.action),
                };
                (outcome, from, core.state)
            }
        };

        let latency_us = started.elapsed().as_micros() as u64;
        self.metrics.record_intent(intent.source, outcome, latency_us);

        match outcome {
            Outcome::Executed => info!(
                intent_id = %intent.id,
                source = %intent.source,
                action = %intent.action,
                from = %from,
                to = %to,
                "door_transition"
            ),
            Outcome::Ignored(reason) => debug!(
                intent_id = %intent.id,
                source = %intent.source,
                action = %intent.action,
                state = %from,
                reason = %reason.as_str(),
                "intent_ignored"
            ),
            Outcome::Rejected(reason) => warn!(
                intent_id = %intent.id,
                source = %intent.source,
                action = %intent.action,
                plate = ?intent.identifier.as_ref().map(|p| p.as_str()),
                reason = %reason.as_str(),
                "intent_rejected"
            ),
        }

        outcome
    }

    /// Transition rules; caller holds the lock
    fn apply(&self, core: &mut DoorCore, action: Action) -> Outcome {
        match (core.state, action) {
            (DoorState::Closed, Action::Open) => {
                self.begin(core, DoorState::Opening);
                Outcome::Executed
            }
            (DoorState::Open, Action::Close) => {
                self.begin(core, DoorState::Closing);
                Outcome::Executed
            }
            (DoorState::Open, Action::Open) => Outcome::Ignored(IgnoreReason::AlreadyOpen),
            (DoorState::Opening, Action::Open) => Outcome::Ignored(IgnoreReason::AlreadyOpening),
            (DoorState::Closed, Action::Close) => Outcome::Ignored(IgnoreReason::AlreadyClosed),
            (DoorState::Closing, Action::Close) => Outcome::Ignored(IgnoreReason::AlreadyClosing),
            (DoorState::Opening, Action::Close) | (DoorState::Closing, Action::Open) => {
                Outcome::Ignored(IgnoreReason::InTransit)
            }
        }
    }

    /// Enter a transient state and schedule (or perform) its resolution
    fn begin(&self, core: &mut DoorCore, transient: DoorState) {
        core.idle_timer.disarm();
        core.state = transient;
        self.metrics.set_door_state(transient);

        if self.settings.actuation.is_zero() {
            self.finish(core);
            return;
        }

        core.actuation_epoch = core.actuation_epoch.wrapping_add(1);
        let epoch = core.actuation_epoch;
        let actuation = self.settings.actuation;
        let this = self.this.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(actuation).await;
            if let Some(controller) = this.upgrade() {
                controller.complete_actuation(epoch);
            }
        });
    }

    fn complete_actuation(&self, epoch: u64) {
        let terminal = {
            let mut core = self.core.lock();
            if core.actuation_epoch != epoch || !core.state.is_transient() {
                return;
            }
            self.finish(&mut core)
        };
        info!(state = %terminal, "door_actuation_complete");
    }

    /// Resolve the transient state, apply the timer side effect and
    /// enqueue the state update. Caller holds the lock.
    fn finish(&self, core: &mut DoorCore) -> DoorState {
        let terminal = match core.state {
            DoorState::Opening => DoorState::Open,
            DoorState::Closing => DoorState::Closed,
            settled => settled,
        };
        core.state = terminal;

        if terminal == DoorState::Open {
            let this = self.this.clone();
            core.idle_timer.arm(&self.runtime, move |epoch| {
                if let Some(controller) = this.upgrade() {
                    controller.on_idle_timeout(epoch);
                }
            });
        } else {
            core.idle_timer.disarm();
        }

        self.metrics.set_door_state(terminal);
        self.metrics.record_transition();
        // No receivers is fine (offline, no sinks yet)
        let _ = self.updates.send(StateUpdate::now(terminal.is_open()));
        terminal
    }

    fn on_idle_timeout(&self, epoch: u64) {
        info!(
            timeout_secs = ?self.settings.idle_timeout.map(|d| d.as_secs()),
            "idle_timeout_fired"
        );
        let outcome = self.arbitrate(Intent::system_close(), Some(epoch));
        if outcome.is_executed() {
            self.metrics.record_auto_close();
        }
    }

    #[cfg(test)]
    fn idle_timer_armed(&self) -> bool {
        self.core.lock().idle_timer.is_armed()
    }
}

/// Identify which producers are wired, for the startup log
pub fn describe_sources(enabled: &[(Source, bool)]) -> String {
    enabled
        .iter()
        .filter(|(_, on)| *on)
        .map(|(source, _)| source.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{PlateId, RejectReason, Token};
    use crate::services::auth::StaticPolicy;
    use tokio::sync::broadcast::error::TryRecvError;

    const TOKEN: &str = "T";

    fn controller_with(settings: ControllerSettings) -> Arc<DoorController> {
        let policy = StaticPolicy::new(Some(TOKEN), ["ABC123"]);
        DoorController::new(settings, AuthGate::new(Arc::new(policy)), Arc::new(Metrics::new()))
    }

    fn controller() -> Arc<DoorController> {
        controller_with(ControllerSettings::default())
    }

    fn drain(rx: &mut broadcast::Receiver<StateUpdate>) -> Vec<bool> {
        let mut seen = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(update) => seen.push(update.door_open),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return seen,
                Err(TryRecvError::Lagged(n)) => panic!("lagged by {n}"),
            }
        }
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let controller = controller();
        assert_eq!(controller.current_state(), DoorState::Closed);
        assert!(!controller.idle_timer_armed());
    }

    #[tokio::test]
    async fn test_open_executes_and_arms_timer() {
        let controller = controller();
        let mut rx = controller.subscribe();

        let outcome = controller.submit(Intent::manual(Action::Open));

        assert_eq!(outcome, Outcome::Executed);
        assert_eq!(controller.current_state(), DoorState::Open);
        assert!(controller.idle_timer_armed());
        assert_eq!(drain(&mut rx), vec![true]);
    }

    #[tokio::test]
    async fn test_close_disarms_timer() {
        let controller = controller();
        let mut rx = controller.subscribe();

        controller.submit(Intent::manual(Action::Open));
        let outcome = controller.submit(Intent::voice(Action::Close));

        assert_eq!(outcome, Outcome::Executed);
        assert_eq!(controller.current_state(), DoorState::Closed);
        assert!(!controller.idle_timer_armed());
        assert_eq!(drain(&mut rx), vec![true, false]);
    }

    #[tokio::test]
    async fn test_repeated_open_is_idempotent() {
        let controller = controller();
        let mut rx = controller.subscribe();

        let outcomes: Vec<Outcome> =
            (0..4).map(|_| controller.submit(Intent::voice(Action::Open))).collect();

        assert_eq!(outcomes[0], Outcome::Executed);
        for outcome in &outcomes[1..] {
            assert_eq!(*outcome, Outcome::Ignored(IgnoreReason::AlreadyOpen));
        }
        assert_eq!(drain(&mut rx), vec![true]);
    }

    #[tokio::test]
    async fn test_close_while_closed_ignored() {
        let controller = controller();
        let mut rx = controller.subscribe();
        assert_eq!(
            controller.submit(Intent::manual(Action::Close)),
            Outcome::Ignored(IgnoreReason::AlreadyClosed)
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_wrong_token_rejected_without_update() {
        let controller = controller();
        let mut rx = controller.subscribe();

        let outcome = controller.submit(Intent::remote(Action::Open, Some(Token::new("nope"))));

        assert_eq!(outcome, Outcome::Rejected(RejectReason::InvalidToken));
        assert_eq!(controller.current_state(), DoorState::Closed);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let controller = controller();
        assert_eq!(
            controller.submit(Intent::remote(Action::Open, None)),
            Outcome::Rejected(RejectReason::InvalidToken)
        );
    }

    #[tokio::test]
    async fn test_unauthorized_plate_rejected() {
        let controller = controller();
        let mut rx = controller.subscribe();

        let plate = PlateId::normalize("ZZZ999").unwrap();
        let outcome = controller.submit(Intent::camera(plate));

        assert_eq!(outcome, Outcome::Rejected(RejectReason::UnauthorizedPlate));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_authorized_plate_opens() {
        let controller = controller();
        let plate = PlateId::normalize("abc 123").unwrap();
        assert_eq!(controller.submit(Intent::camera(plate)), Outcome::Executed);
        assert_eq!(controller.current_state(), DoorState::Open);
    }

    #[tokio::test]
    async fn test_rejection_wins_over_noop() {
        // Auth is decided before state; a bad token is rejected even when
        // the action would have been a no-op
        let controller = controller();
        controller.submit(Intent::manual(Action::Open));
        assert_eq!(
            controller.submit(Intent::remote(Action::Open, Some(Token::new("bad")))),
            Outcome::Rejected(RejectReason::InvalidToken)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_exactly_once() {
        let controller = controller();
        let mut rx = controller.subscribe();

        controller.submit(Intent::remote(Action::Open, Some(Token::new(TOKEN))));
        tokio::time::sleep(Duration::from_secs(119)).await;
        assert_eq!(controller.current_state(), DoorState::Open);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.current_state(), DoorState::Closed);
        assert_eq!(controller.metrics.auto_closes_total(), 1);
        assert_eq!(controller.metrics.intents_from(Source::System), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(drain(&mut rx), vec![true, false]);
        assert_eq!(controller.metrics.intents_from(Source::System), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_restarts_countdown() {
        let controller = controller();

        controller.submit(Intent::manual(Action::Open));
        tokio::time::sleep(Duration::from_secs(100)).await;
        controller.submit(Intent::manual(Action::Close));
        tokio::time::sleep(Duration::from_secs(10)).await;
        controller.submit(Intent::manual(Action::Open));

        // 90s into the new open period, 200s since the first open
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(controller.current_state(), DoorState::Open);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(controller.current_state(), DoorState::Closed);
        assert_eq!(controller.metrics.auto_closes_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_disabled() {
        let controller =
            controller_with(ControllerSettings { idle_timeout: None, actuation: Duration::ZERO });
        controller.submit(Intent::manual(Action::Open));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(controller.current_state(), DoorState::Open);
    }

    #[tokio::test]
    async fn test_stale_timer_expiry_ignored() {
        let controller = controller();
        controller.submit(Intent::manual(Action::Open));

        let stale_epoch = {
            let core = controller.core.lock();
            core.idle_timer.epoch().wrapping_sub(1)
        };
        let outcome = controller.arbitrate(Intent::system_close(), Some(stale_epoch));

        assert_eq!(outcome, Outcome::Ignored(IgnoreReason::StaleTimer));
        assert_eq!(controller.current_state(), DoorState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_actuation_transient_states() {
        let controller = controller_with(ControllerSettings {
            idle_timeout: Some(Duration::from_secs(120)),
            actuation: Duration::from_secs(5),
        });
        let mut rx = controller.subscribe();

        assert_eq!(controller.submit(Intent::manual(Action::Open)), Outcome::Executed);
        assert_eq!(controller.current_state(), DoorState::Opening);
        assert_eq!(
            controller.submit(Intent::voice(Action::Open)),
            Outcome::Ignored(IgnoreReason::AlreadyOpening)
        );
        assert_eq!(
            controller.submit(Intent::voice(Action::Close)),
            Outcome::Ignored(IgnoreReason::InTransit)
        );
        assert!(drain(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(controller.current_state(), DoorState::Open);
        assert!(controller.idle_timer_armed());
        assert_eq!(drain(&mut rx), vec![true]);

        assert_eq!(controller.submit(Intent::manual(Action::Close)), Outcome::Executed);
        assert_eq!(controller.current_state(), DoorState::Closing);
        assert!(!controller.idle_timer_armed());
        assert_eq!(
            controller.submit(Intent::manual(Action::Open)),
            Outcome::Ignored(IgnoreReason::InTransit)
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(controller.current_state(), DoorState::Closed);
        assert_eq!(drain(&mut rx), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_close_waits_for_actuation() {
        let controller = controller_with(ControllerSettings {
            idle_timeout: Some(Duration::from_secs(120)),
            actuation: Duration::from_secs(5),
        });

        controller.submit(Intent::manual(Action::Open));
        // Countdown starts only once Open is reached (t=5s)
        tokio::time::sleep(Duration::from_secs(124)).await;
        assert_eq!(controller.current_state(), DoorState::Open);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.current_state(), DoorState::Closing);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(controller.current_state(), DoorState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_open_race_single_winner() {
        let controller = controller();
        let mut rx = controller.subscribe();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let voice = {
            let (controller, barrier) = (controller.clone(), barrier.clone());
            tokio::spawn(async move {
                barrier.wait().await;
                controller.submit(Intent::voice(Action::Open))
            })
        };
        let remote = {
            let (controller, barrier) = (controller.clone(), barrier.clone());
            tokio::spawn(async move {
                barrier.wait().await;
                controller.submit(Intent::remote(Action::Open, Some(Token::new(TOKEN))))
            })
        };

        let outcomes = [voice.await.unwrap(), remote.await.unwrap()];
        let executed = outcomes.iter().filter(|o| o.is_executed()).count();
        let ignored = outcomes
            .iter()
            .filter(|o| **o == Outcome::Ignored(IgnoreReason::AlreadyOpen))
            .count();

        assert_eq!(executed, 1);
        assert_eq!(ignored, 1);
        assert_eq!(controller.current_state(), DoorState::Open);
        assert_eq!(drain(&mut rx), vec![true]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_form_valid_walk() {
        let controller = controller();
        let mut rx = controller.subscribe();

        let mut tasks = Vec::new();
        for worker in 0..4u32 {
            let controller = controller.clone();
            tasks.push(tokio::spawn(async move {
                let mut executed = 0usize;
                for i in 0..10u32 {
                    let action = if (worker + i) % 2 == 0 { Action::Open } else { Action::Close };
                    let intent = match worker {
                        0 => Intent::voice(action),
                        1 => Intent::manual(action),
                        2 => Intent::remote(action, Some(Token::new(TOKEN))),
                        _ => Intent::manual(action),
                    };
                    if controller.submit(intent).is_executed() {
                        executed += 1;
                    }
                    tokio::task::yield_now().await;
                }
                executed
            }));
        }

        let mut executed = 0;
        for task in tasks {
            executed += task.await.unwrap();
        }

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), executed);
        for (i, door_open) in updates.iter().enumerate() {
            // Closed start: open, closed, open, ...
            assert_eq!(*door_open, i % 2 == 0, "invalid walk at step {i}: {updates:?}");
        }
        let expected = if updates.len() % 2 == 1 { DoorState::Open } else { DoorState::Closed };
        assert_eq!(controller.current_state(), expected);
    }

    #[test]
    fn test_describe_sources() {
        let described = describe_sources(&[
            (Source::Camera, false),
            (Source::Voice, true),
            (Source::Remote, true),
        ]);
        assert_eq!(described, "voice,remote");
    }
}
