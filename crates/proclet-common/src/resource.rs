//! Free-resource accounting shared by the pressure handler, the resource
//! reporter, and the controller's destination selector.

use serde::{Deserialize, Serialize};

/// A node's free-resource snapshot, as reported by the resource reporter and
/// consumed by `acquire_migration_dest`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub cores: u32,
    pub mem_mbs: u64,
}

impl Resource {
    pub fn new(cores: u32, mem_mbs: u64) -> Self {
        Resource { cores, mem_mbs }
    }

    /// Whether this snapshot can absorb a deficit of `need` without going
    /// negative on either axis.
    pub fn covers(&self, need: Resource) -> bool {
        self.cores >= need.cores && self.mem_mbs >= need.mem_mbs
    }

    pub fn saturating_sub(&self, other: Resource) -> Resource {
        Resource {
            cores: self.cores.saturating_sub(other.cores),
            mem_mbs: self.mem_mbs.saturating_sub(other.mem_mbs),
        }
    }
}

/// Which resource(s) triggered a pressure episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureKind {
    Cpu,
    Mem,
    Both,
}

impl PressureKind {
    pub fn has_mem_pressure(self) -> bool {
        matches!(self, PressureKind::Mem | PressureKind::Both)
    }

    pub fn has_cpu_pressure(self) -> bool {
        matches!(self, PressureKind::Cpu | PressureKind::Both)
    }
}
