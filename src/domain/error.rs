//! Error types for adapter boundaries
//!
//! None of these reach the controller: a failing adapter simply produces no
//! intent and retries on its own schedule.

use thiserror::Error;

/// Inbound transport payload that could not become an intent
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid command JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Capture, recognition or transcription failure
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{stage} timed out after {timeout_ms}ms")]
    Timeout { stage: &'static str, timeout_ms: u64 },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("adapter not configured: {0}")]
    NotConfigured(&'static str),
}

/// Publish/subscribe failure on the active transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("transport offline")]
    Offline,
}
