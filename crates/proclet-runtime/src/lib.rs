//! Proclet lifecycle, invocation, migration, and pressure-driven load
//! balancing (C6-C10).
//!
//! This crate is the node-local runtime: it turns the building blocks in
//! [`proclet_alloc`], [`proclet_stack`], [`proclet_wire`], and
//! [`proclet_rpc`], plus the controller in [`proclet_ctrl`], into the
//! behaviors a resident proclet actually needs — attach/detach under
//! migration, location-transparent calls, and relocation under pressure.

pub mod blocked_syncer;
pub mod clock;
pub mod controller_client;
pub mod coroutine;
pub mod invocation;
pub mod migrator;
pub mod pressure;
pub mod proclet;
pub mod rcu;
pub mod refcount;
pub mod resource_reporter;

pub use blocked_syncer::{BlockReason, BlockedSyncer};
pub use clock::{LogicalClock, TimerEntry};
pub use controller_client::{ControllerCallError, ControllerClient};
pub use coroutine::{ProcletCoroutine, StepOutcome};
pub use invocation::{InvocationEngine, MethodId, MethodTable};
pub use migrator::{
    AlwaysAdmit, DestinationAdmission, MigrationError, MigrationListener, MigrationReceiver, MigrationReport, Migrator,
};
pub use pressure::{AuxTask, AuxiliaryPool, PressureHandler, PressureParams};
pub use proclet::{CpuLoadEstimator, Proclet, ProcletInfo, ProcletManager};
pub use rcu::RcuLock;
pub use refcount::ManagerRefCounter;
pub use resource_reporter::{ResourceReporter, ResourceSource};
