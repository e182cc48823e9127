//! deviceplane Device Agent Library
//!
//! The agent runs on each device. It registers the device with the
//! controller, polls for the desired bundle and keeps the controller's
//! stored observations consistent with that bundle.
//!
//! ## Architecture
//!
//! ```text
//! Agent
//! ├── bundle poller          (GetBundle -> BundleSnapshot -> Supervisor)
//! ├── application_status     (orphaned application status GC)
//! ├── service_status         (orphaned service status GC)
//! ├── service_state          (orphaned service state GC)
//! ├── info reporter          (SetDeviceInfo on change)
//! └── reverse tunnel         (optional, dial-back connections)
//! ```
//!
//! ## Modules
//!
//! - `transport`: HTTP and WebSocket primitives scoped by a request context
//! - `client`: Typed controller API
//! - `identity`: On-disk device identity
//! - `snapshot`: Latest bundle shared between tasks
//! - `reconciler`: Observation garbage collection loops
//! - `supervisor`: Supervisor and status reporting interfaces
//! - `agent`: Task lifecycle

pub mod agent;
pub mod client;
pub mod config;
pub mod identity;
pub mod info;
pub mod models;
pub mod reconciler;
pub mod snapshot;
pub mod supervisor;
pub mod transport;
pub mod tunnel;

// Re-export commonly used types
pub use agent::{Agent, AgentError, ShutdownSignal};
pub use client::{ClientError, ControllerClient};
pub use config::{Cli, Config, ConfigError};
pub use identity::{Identity, IdentityStore};
pub use models::Bundle;
pub use snapshot::BundleSnapshot;
pub use supervisor::{LoggingSupervisor, ObservationReporter, Supervisor};
pub use transport::{RequestContext, Transport, TransportError};
