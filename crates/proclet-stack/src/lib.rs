//! Per-node stack clusters and the cross-node stack manager (§4.5).

pub mod cluster;
pub mod manager;

pub use cluster::{StackCluster, StackHandle, StackSlot};
pub use manager::StackManager;
