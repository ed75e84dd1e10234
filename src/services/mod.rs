//! Services - arbitration and policy
//!
//! - `controller` - Door state machine, the single arbitration point
//! - `auth` - Token and plate authorization
//! - `idle_timer` - Auto-close countdown owned by the controller

pub mod auth;
pub mod controller;
pub(crate) mod idle_timer;

pub use auth::{AuthGate, PolicyStore, StaticPolicy};
pub use controller::{ControllerSettings, DoorController};
