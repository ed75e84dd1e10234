//! Authentication and authorization gate
//!
//! Every intent is checked here before it reaches the state machine.
//! Remote commands must carry the shared secret, camera intents must name an
//! authorized plate, and the locally present channels are trusted.

use crate::domain::types::{AuthDecision, Intent, PlateId, RejectReason, Source, Token};
use crate::infra::config::Config;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Credential and plate lookup capability
pub trait PolicyStore: Send + Sync {
    /// Unknown plates are not authorized
    fn is_plate_authorized(&self, plate: &PlateId) -> bool;

    /// Constant-time comparison against the shared secret
    fn token_matches(&self, candidate: &Token) -> bool;
}

/// In-memory policy built from configuration
pub struct StaticPolicy {
    secret: Option<Vec<u8>>,
    plates: FxHashSet<PlateId>,
}

impl StaticPolicy {
    pub fn new<I, S>(secret: Option<&str>, plates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = FxHashSet::default();
        for raw in plates {
            match PlateId::normalize(raw.as_ref()) {
                Some(plate) => {
                    set.insert(plate);
                }
                None => warn!(plate = %raw.as_ref(), "policy_plate_unusable"),
            }
        }
        Self { secret: secret.map(|s| s.as_bytes().to_vec()), plates: set }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.secret_token(), config.authorized_plates())
    }

    pub fn plate_count(&self) -> usize {
        self.plates.len()
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }
}

impl PolicyStore for StaticPolicy {
    fn is_plate_authorized(&self, plate: &PlateId) -> bool {
        self.plates.contains(plate)
    }

    fn token_matches(&self, candidate: &Token) -> bool {
        match self.secret.as_deref() {
            Some(secret) => candidate.as_bytes().ct_eq(secret).into(),
            None => false,
        }
    }
}

/// Computes the `AuthDecision` for each intent
#[derive(Clone)]
pub struct AuthGate {
    policy: Arc<dyn PolicyStore>,
}

impl AuthGate {
    pub fn new(policy: Arc<dyn PolicyStore>) -> Self {
        Self { policy }
    }

    pub fn authorize(&self, intent: &Intent) -> AuthDecision {
        match intent.source {
            Source::Remote => match intent.credential.as_ref() {
                Some(token) if self.policy.token_matches(token) => AuthDecision::Allow,
                _ => AuthDecision::Deny(RejectReason::InvalidToken),
            },
            Source::Camera => match intent.identifier.as_ref() {
                Some(plate) if self.policy.is_plate_authorized(plate) => AuthDecision::Allow,
                _ => AuthDecision::Deny(RejectReason::UnauthorizedPlate),
            },
            Source::Voice | Source::Manual | Source::System => AuthDecision::Allow,
        }
    }
}
