//! Shared types for the proclet runtime: identifiers, the process-wide
//! status table, the error taxonomy, resource accounting, and startup
//! configuration. Every other crate in the workspace depends on this one.

pub mod config;
pub mod error;
pub mod ids;
pub mod resource;
pub mod status;

pub use config::NodeConfig;
pub use error::{CallError, ControllerError, MigrationOutcome, WireStatus};
pub use ids::{CapacityClass, LpId, NodeId, ProcletId};
pub use resource::{PressureKind, Resource};
pub use status::{ProcletStatus, StatusTable};
