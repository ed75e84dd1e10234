//! Shared types for the garage door controller

use serde::Serialize;
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

/// Physical door position as tracked by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl DoorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoorState::Closed => "closed",
            DoorState::Opening => "opening",
            DoorState::Open => "open",
            DoorState::Closing => "closing",
        }
    }

    /// True while actuation is in progress
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, DoorState::Opening | DoorState::Closing)
    }

    /// Whether the door reads as open to external consumers
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, DoorState::Open)
    }
}

impl fmt::Display for DoorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested door movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Open,
    Close,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Open => "open",
            Action::Close => "close",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input channel an intent originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Camera,
    Voice,
    Remote,
    Manual,
    /// Synthesized by the controller itself (idle timeout)
    System,
}

impl Source {
    pub const ALL: [Source; 5] =
        [Source::Camera, Source::Voice, Source::Remote, Source::Manual, Source::System];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Camera => "camera",
            Source::Voice => "voice",
            Source::Remote => "remote",
            Source::Manual => "manual",
            Source::System => "system",
        }
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        match self {
            Source::Camera => 0,
            Source::Voice => 1,
            Source::Remote => 2,
            Source::Manual => 3,
            Source::System => 4,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared-secret token carried by remote commands
///
/// `Debug` is redacted so tokens never reach the logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Normalized license plate identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
pub struct PlateId(String);

impl PlateId {
    /// Normalize raw recognized text: keep ASCII alphanumerics, upper-case.
    /// Returns `None` when nothing usable remains.
    pub fn normalize(raw: &str) -> Option<Self> {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if cleaned.is_empty() {
            None
        } else {
            Some(Self(cleaned))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized open/close request from one input channel
///
/// Built by an adapter the moment it recognizes a trigger and consumed
/// exactly once by the controller.
#[derive(Debug, Clone)]
pub struct Intent {
    /// Time-ordered id for log correlation
    pub id: Uuid,
    pub action: Action,
    pub source: Source,
    pub credential: Option<Token>,
    pub identifier: Option<PlateId>,
    pub timestamp: OffsetDateTime,
}

impl Intent {
    fn new(
        action: Action,
        source: Source,
        credential: Option<Token>,
        identifier: Option<PlateId>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            action,
            source,
            credential,
            identifier,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn camera(plate: PlateId) -> Self {
        Self::new(Action::Open, Source::Camera, None, Some(plate))
    }

    pub fn voice(action: Action) -> Self {
        Self::new(action, Source::Voice, None, None)
    }

    pub fn remote(action: Action, token: Option<Token>) -> Self {
        Self::new(action, Source::Remote, token, None)
    }

    pub fn manual(action: Action) -> Self {
        Self::new(action, Source::Manual, None, None)
    }

    pub(crate) fn system_close() -> Self {
        Self::new(Action::Close, Source::System, None, None)
    }
}

/// Why the auth gate refused an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidToken,
    UnauthorizedPlate,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidToken => "invalid_token",
            RejectReason::UnauthorizedPlate => "unauthorized_plate",
        }
    }
}

/// Result of the authentication and authorization gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(RejectReason),
}

/// Why an authorized intent did not change the door
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    AlreadyOpen,
    AlreadyOpening,
    AlreadyClosed,
    AlreadyClosing,
    /// Opposite direction requested while actuating
    InTransit,
    /// Idle countdown superseded before its close was arbitrated
    StaleTimer,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::AlreadyOpen => "already_open",
            IgnoreReason::AlreadyOpening => "already_opening",
            IgnoreReason::AlreadyClosed => "already_closed",
            IgnoreReason::AlreadyClosing => "already_closing",
            IgnoreReason::InTransit => "in_transit",
            IgnoreReason::StaleTimer => "stale_timer",
        }
    }
}

/// What the controller did with a submitted intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Executed,
    Ignored(IgnoreReason),
    Rejected(RejectReason),
}

impl Outcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, Outcome::Executed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Executed => f.write_str("executed"),
            Outcome::Ignored(reason) => write!(f, "ignored:{}", reason.as_str()),
            Outcome::Rejected(reason) => write!(f, "rejected:{}", reason.as_str()),
        }
    }
}

/// Externally visible door state, published after each committed transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateUpdate {
    pub door_open: bool,
    /// RFC 3339 UTC timestamp
    pub timestamp: String,
}

impl StateUpdate {
    pub fn now(door_open: bool) -> Self {
        Self { door_open, timestamp: rfc3339_now() }
    }

    pub fn to_json(&self) -> String {
        // Two plain fields; serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Current UTC time formatted as RFC 3339
pub fn rfc3339_now() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plate_normalize() {
        assert_eq!(PlateId::normalize("ab-12 3").unwrap().as_str(), "AB123");
        assert_eq!(PlateId::normalize(" xyz·789 ").unwrap().as_str(), "XYZ789");
        assert!(PlateId::normalize(" - ").is_none());
        assert!(PlateId::normalize("").is_none());
    }

    #[test]
    fn test_token_debug_redacted() {
        let token = Token::new("hunter2");
        assert_eq!(format!("{:?}", token), "Token(***)");
    }

    #[test]
    fn test_state_update_json_shape() {
        let update = StateUpdate::now(true);
        let value: serde_json::Value = serde_json::from_str(&update.to_json()).unwrap();
        assert_eq!(value["door_open"], serde_json::Value::Bool(true));
        let ts = value["timestamp"].as_str().unwrap();
        assert!(OffsetDateTime::parse(ts, &Rfc3339).is_ok());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::Executed.to_string(), "executed");
        assert_eq!(Outcome::Ignored(IgnoreReason::InTransit).to_string(), "ignored:in_transit");
        assert_eq!(
            Outcome::Rejected(RejectReason::InvalidToken).to_string(),
            "rejected:invalid_token"
        );
    }

    #[test]
    fn test_door_state_flags() {
        assert!(DoorState::Opening.is_transient());
        assert!(DoorState::Closing.is_transient());
        assert!(!DoorState::Open.is_transient());
        assert!(DoorState::Open.is_open());
        assert!(!DoorState::Opening.is_open());
    }
}
