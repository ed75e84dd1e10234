//! IO modules - intent producers and state sinks
//!
//! - `command` - Remote control payload decoding
//! - `transport` - MQTT broker/gateway transport and in-memory loopback
//! - `state_publisher` - Forwards committed state to the state topic
//! - `camera` - Snapshot polling and plate recognition
//! - `voice` - TCP transcript listener with keyword matching
//! - `http` - Manual control and Prometheus metrics endpoint

pub mod camera;
pub mod command;
pub mod http;
pub mod state_publisher;
pub mod transport;
pub mod voice;

pub use camera::{CameraMonitor, CameraSettings, HttpPlateRecognizer, HttpSnapshotSource};
pub use http::{start_http_server, HttpContext};
pub use state_publisher::StatePublisher;
pub use transport::{LoopbackTransport, MqttEventLoop, MqttTransport, Transport};
pub use voice::start_voice_listener;
