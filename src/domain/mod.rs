//! Domain models - core types shared by the controller and its adapters
//!
//! - `DoorState` - the canonical door position
//! - `Intent` - a normalized open/close request from one input channel
//! - `Outcome` - what the controller did with an intent
//! - `StateUpdate` - the externally published door state

pub mod error;
pub mod types;

pub use error::{AdapterError, CommandError, TransportError};
pub use types::{
    Action, AuthDecision, DoorState, IgnoreReason, Intent, Outcome, PlateId, RejectReason,
    Source, StateUpdate, Token,
};
