//! State publisher actor
//!
//! Forwards committed state updates from the controller's broadcast channel
//! to the state topic. Runs outside the controller lock, so a slow or
//! disconnected transport never delays arbitration.

use crate::domain::types::StateUpdate;
use crate::infra::metrics::Metrics;
use crate::io::transport::Transport;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub struct StatePublisher {
    transport: Arc<dyn Transport>,
    rx: broadcast::Receiver<StateUpdate>,
    topic: String,
    metrics: Arc<Metrics>,
}

impl StatePublisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        rx: broadcast::Receiver<StateUpdate>,
        topic: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { transport, rx, topic: topic.into(), metrics }
    }

    /// Publish updates in commit order until shutdown or the controller is gone
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(topic = %self.topic, transport = %self.transport.kind().as_str(), "state_publisher_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Drain what was already committed
                        while let Ok(update) = self.rx.try_recv() {
                            self.publish(&update).await;
                        }
                        info!("state_publisher_shutdown");
                        return;
                    }
                }
                result = self.rx.recv() => {
                    match result {
                        Ok(update) => self.publish(&update).await,
                        Err(RecvError::Lagged(skipped)) => {
                            // Only the latest state matters to consumers; keep going
                            warn!(skipped = %skipped, "state_publisher_lagged");
                        }
                        Err(RecvError::Closed) => {
                            info!("state_publisher_channel_closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn publish(&self, update: &StateUpdate) {
        let payload = update.to_json();
        match self.transport.publish(&self.topic, payload.clone().into_bytes()).await {
            Ok(()) => debug!(topic = %self.topic, payload = %payload, "state_published"),
            Err(e) => {
                self.metrics.record_publish_failure();
                warn!(topic = %self.topic, door_open = %update.door_open, error = %e, "state_publish_failed");
            }
        }
    }
}
