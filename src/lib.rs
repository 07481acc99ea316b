//! snap-executor: host-side execution service for isolated snaps
//!
//! Manages isolated, untrusted code units ("snaps"), dispatches structured
//! remote calls into them over an asynchronous duplex message channel, and
//! tracks outbound calls those units make back to the host. Units run
//! fully concurrently while each unit serves at most one request at a
//! time; crashes are detected off channel closure and never disturb other
//! units.
//!
//! # Modules
//!
//! - **transport**: wire envelope and the per-unit message channel adapter
//! - **correlation**: pairing of outbound commands with their responses
//! - **lifecycle**: unit state machine and the table of active units
//! - **endowments**: host-mediated capabilities with outbound interception
//! - **events**: broadcast bus for crash/termination/outbound events
//! - **isolation**: provider boundary plus an in-process reference provider
//! - **controller**: the execution service facade
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use snap_executor::{ExecutionServiceBuilder, InProcessProvider, StartOptions};
//!
//! let service = ExecutionServiceBuilder::new(InProcessProvider::new())
//!     .startup_timeout(Duration::from_secs(5))
//!     .build()?;
//!
//! service
//!     .execute_snap("hello", "snap source", &[], StartOptions::default())
//!     .await?;
//! let reply = service
//!     .handle_rpc_request("hello", serde_json::json!({"method": "ping"}))
//!     .await?;
//! service.terminate("hello").await?;
//! ```

// Core modules
pub mod errors;
pub mod events;
pub mod transport;

// Layered modules
pub mod correlation;
pub mod endowments;
pub mod isolation;
pub mod lifecycle;

// Main facade
pub mod controller;

// Public API
pub use controller::{ExecutionService, ExecutionServiceBuilder, ServiceConfig, StartOptions};
pub use endowments::{ConsoleEndowment, Endowment, EndowmentRegistry, Endowments};
pub use errors::{Result, SnapError};
pub use events::{EventBus, UnitEvent};
pub use isolation::{InProcessProvider, IsolationProvider, UnitSpec};
pub use lifecycle::UnitStatus;
pub use transport::{Channel, Envelope, EnvelopeKind, SandboxChannel};
