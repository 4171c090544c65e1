//! Domain models - wire messages and core coordinator types
//!
//! This module contains the canonical data types used throughout the system:
//! - `DeviceKey` / `DeviceRecord` - registry identity and reachable address
//! - `Selector` - which devices a broadcast targets
//! - `LightColor` / `LightState` / `BarrierState` - device state as seen by the coordinator
//! - `LogEntry` - audit trail line
//! - `messages` - RPC request/response bodies
//! - `error` - coordinator error taxonomy

pub mod error;
pub mod messages;
pub mod types;

// Re-export commonly used types at module level
pub use error::{CoordinatorError, DeviceError};
pub use types::{
    BarrierState, DeviceKey, DeviceRecord, LightColor, LightState, LogEntry, Selector,
};
