//! Error taxonomy (§7).
//!
//! `WrongClient` and `Timeout` are routine, retried transparently by the
//! caller. `SkipProclet` and `DestinationDenied` are migration-scope
//! protocol markers, not failures. `Fatal` means a protocol invariant broke
//! (image-hash mismatch, impossible state transition); it is never caught,
//! only logged and propagated to the LP's abort path.

use thiserror::Error;

/// The one-byte wire-level error code a proclet-call reply carries in place
/// of a serialized result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum WireStatus {
    Ok = 0,
    Timeout = -1,
    WrongClient = -2,
}

impl WireStatus {
    pub fn from_byte(b: i8) -> Option<Self> {
        match b {
            0 => Some(WireStatus::Ok),
            -1 => Some(WireStatus::Timeout),
            -2 => Some(WireStatus::WrongClient),
            _ => None,
        }
    }
}

/// Error surfaced by the invocation engine to a caller.
#[derive(Debug, Error, Clone)]
pub enum CallError {
    /// The callee's location cache was stale; the caller must invalidate it
    /// and re-resolve through the controller before retrying.
    #[error("wrong client for {0}: location cache is stale")]
    WrongClient(crate::ids::ProcletId),

    /// Network-level heuristic timeout; safe to retry.
    #[error("rpc to {0} timed out")]
    Timeout(crate::ids::NodeId),

    /// A protocol invariant was violated (image-hash mismatch, an
    /// impossible proclet state transition, a malformed frame). The caller
    /// LP does not attempt to continue.
    #[error("fatal protocol error: {0}")]
    Fatal(String),

    /// The retry budget for `WrongClient`/`Timeout` was exhausted.
    #[error("exhausted {0} retries calling {1}")]
    RetriesExhausted(u32, crate::ids::ProcletId),
}

/// Non-error migration-scope markers (§7). Kept separate from
/// [`CallError`] because they are expected protocol outcomes, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Moved,
    /// Source decided not to move this proclet in this batch (refcount hit
    /// zero, or it was no longer Present).
    SkipProclet,
    /// Destination aborted the remainder of the batch under new pressure.
    DestinationDenied,
}

/// Error returned by controller operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("lp {0} is unknown")]
    UnknownLp(crate::ids::LpId),

    #[error("lp {0} is being destroyed, registration refused")]
    LpDestroying(crate::ids::LpId),

    #[error("image hash mismatch on re-registration for node {0}")]
    ImageHashMismatch(crate::ids::NodeId),

    #[error("node {0} is not registered with lp {1}")]
    UnknownNode(crate::ids::NodeId, crate::ids::LpId),

    #[error("no heap-segment bucket available for capacity {0}")]
    OutOfSegments(u64),

    #[error("node {0} is already acquired by another migration")]
    NodeAlreadyAcquired(crate::ids::NodeId),

    #[error("lp {0} has no eligible (registered, non-isolated) node to place a proclet on")]
    NoEligibleNode(crate::ids::LpId),
}
