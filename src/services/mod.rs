//! Services - coordinator state and business logic
//!
//! This module contains the core coordinator services:
//! - `registry` - Device registry keyed by (role, id)
//! - `audit_log` - Append-only audit trail
//! - `dispatcher` - Ordered, parallel status broadcast to devices
//! - `schedule` - Crossing schedule engine
//! - `interlock` - Sensor/barrier safety state machine
//! - `auth` - Dashboard credential store
//! - `coordinator` - One handler per RPC call

pub mod audit_log;
pub mod auth;
pub mod coordinator;
pub mod dispatcher;
pub mod interlock;
pub mod registry;
pub mod schedule;

// Re-export commonly used types
pub use audit_log::AuditLog;
pub use auth::CredentialStore;
pub use coordinator::{Coordinator, CoordinatorDeps};
pub use dispatcher::{create_dispatcher, DispatchWorker, Dispatcher};
pub use interlock::{BarrierInterlock, InterlockOutcome};
pub use registry::DeviceRegistry;
pub use schedule::{ConfirmationSink, ScheduleEngine};
