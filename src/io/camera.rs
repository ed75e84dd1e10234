//! Camera plate recognition loop
//!
//! Polls a snapshot endpoint, sends each frame to a text-detection service
//! and submits a Camera intent for the first confident LINE detection.
//! Every stage runs under a timeout; failures never reach the controller.

use crate::domain::error::AdapterError;
use crate::domain::types::{Intent, Outcome, PlateId};
use crate::infra::config::CameraConfig;
use crate::infra::metrics::Metrics;
use crate::services::controller::DoorController;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Produces still frames from the camera
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> Result<Bytes, AdapterError>;
}

/// Extracts a plate candidate from a frame
#[async_trait]
pub trait PlateRecognizer: Send + Sync {
    async fn recognize(&self, frame: &[u8]) -> Result<Option<PlateId>, AdapterError>;
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, AdapterError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Fetches JPEG snapshots over HTTP
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSnapshotSource {
    pub fn new(config: &CameraConfig) -> Result<Self, AdapterError> {
        if config.snapshot_url.is_empty() {
            return Err(AdapterError::NotConfigured("camera.snapshot_url"));
        }
        let client = http_client(Duration::from_millis(config.timeout_ms))?;
        Ok(Self { client, url: config.snapshot_url.clone() })
    }
}

#[async_trait]
impl FrameSource for HttpSnapshotSource {
    async fn capture(&self) -> Result<Bytes, AdapterError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(AdapterError::Status(response.status().as_u16()));
        }
        Ok(response.bytes().await?)
    }
}

/// Text detection response (`TextDetections` list)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TextDetectionResponse {
    #[serde(default)]
    pub text_detections: Vec<TextDetection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TextDetection {
    pub detected_text: String,
    #[serde(rename = "Type")]
    pub kind: String,
    pub confidence: f64,
}

/// First LINE detection above `min_confidence`, normalized
pub fn extract_plate(response: &TextDetectionResponse, min_confidence: f64) -> Option<PlateId> {
    let detection = response
        .text_detections
        .iter()
        .find(|d| d.kind == "LINE" && d.confidence > min_confidence)?;
    PlateId::normalize(&detection.detected_text)
}

/// Posts frames to a text-detection endpoint as `{"image": "<base64>"}`
pub struct HttpPlateRecognizer {
    client: reqwest::Client,
    url: String,
    min_confidence: f64,
}

impl HttpPlateRecognizer {
    pub fn new(config: &CameraConfig) -> Result<Self, AdapterError> {
        if config.recognition_url.is_empty() {
            return Err(AdapterError::NotConfigured("camera.recognition_url"));
        }
        let client = http_client(Duration::from_millis(config.timeout_ms))?;
        Ok(Self {
            client,
            url: config.recognition_url.clone(),
            min_confidence: config.min_confidence,
        })
    }
}

#[async_trait]
impl PlateRecognizer for HttpPlateRecognizer {
    async fn recognize(&self, frame: &[u8]) -> Result<Option<PlateId>, AdapterError> {
        let body = serde_json::json!({ "image": STANDARD.encode(frame) });
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AdapterError::Status(response.status().as_u16()));
        }
        let raw = response.bytes().await?;
        let detections: TextDetectionResponse = serde_json::from_slice(&raw)?;
        debug!(detections = %detections.text_detections.len(), "camera_text_detected");
        Ok(extract_plate(&detections, self.min_confidence))
    }
}

/// Loop timing
#[derive(Debug, Clone, Copy)]
pub struct CameraSettings {
    pub poll_interval: Duration,
    pub cooldown: Duration,
    pub stage_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl CameraSettings {
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            cooldown: Duration::from_secs(config.cooldown_secs),
            stage_timeout: Duration::from_millis(config.timeout_ms),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
        }
    }
}

/// What one poll did, and how long to wait before the next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    CoolingDown,
    CaptureFailed,
    RecognitionFailed,
    NoPlate,
    Submitted(Outcome),
}

pub struct CameraMonitor {
    source: Arc<dyn FrameSource>,
    recognizer: Arc<dyn PlateRecognizer>,
    controller: Arc<DoorController>,
    metrics: Arc<Metrics>,
    settings: CameraSettings,
    cooldown_until: Option<Instant>,
}

impl CameraMonitor {
    pub fn new(
        source: Arc<dyn FrameSource>,
        recognizer: Arc<dyn PlateRecognizer>,
        controller: Arc<DoorController>,
        metrics: Arc<Metrics>,
        settings: CameraSettings,
    ) -> Self {
        Self { source, recognizer, controller, metrics, settings, cooldown_until: None }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_ms = %self.settings.poll_interval.as_millis(),
            cooldown_secs = %self.settings.cooldown.as_secs(),
            "camera_monitor_started"
        );

        loop {
            let delay = match self.poll_once().await {
                PollResult::CaptureFailed => self.settings.reconnect_delay,
                _ => self.settings.poll_interval,
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("camera_monitor_shutdown");
                        return;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Capture, recognize and submit one frame
    pub async fn poll_once(&mut self) -> PollResult {
        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                return PollResult::CoolingDown;
            }
            self.cooldown_until = None;
        }

        let timeout = self.settings.stage_timeout;
        let frame = match with_timeout("capture", timeout, self.source.capture()).await {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.record_adapter_error();
                warn!(error = %e, retry_secs = %self.settings.reconnect_delay.as_secs(), "camera_capture_failed");
                return PollResult::CaptureFailed;
            }
        };

        let plate = match with_timeout("recognition", timeout, self.recognizer.recognize(&frame)).await
        {
            Ok(Some(plate)) => plate,
            Ok(None) => return PollResult::NoPlate,
            Err(e) => {
                self.metrics.record_adapter_error();
                warn!(error = %e, "camera_recognition_failed");
                return PollResult::RecognitionFailed;
            }
        };

        info!(plate = %plate, "camera_plate_recognized");
        let outcome = self.controller.submit(Intent::camera(plate));
        if !matches!(outcome, Outcome::Rejected(_)) {
            self.cooldown_until = Some(Instant::now() + self.settings.cooldown);
        }
        PollResult::Submitted(outcome)
    }
}

async fn with_timeout<T, F>(stage: &'static str, limit: Duration, fut: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout { stage, timeout_ms: limit.as_millis() as u64 }),
    }
}
