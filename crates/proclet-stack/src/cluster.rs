//! Per-node stack cluster (§4.5): a contiguous span of fixed-size proclet
//! thread stacks, carved out of the address planner's stack-cluster region
//! and assigned one-per-node by the controller at registration time.

use std::collections::VecDeque;

use parking_lot::Mutex;
use proclet_common::ids::NodeId;

/// Index of a single stack slot within a [`StackCluster`].
pub type StackSlot = u32;

/// Identifies a stack wherever it currently lives: the node whose cluster
/// it was carved from, and the slot within that cluster. A thread that has
/// migrated keeps using a handle whose `node` is the *source* until it
/// next needs a fresh stack, at which point it draws from its new node's
/// cluster instead (§4.5 "uses its destination's cluster for *future*
/// stacks").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackHandle {
    pub node: NodeId,
    pub slot: StackSlot,
}

/// A fixed-size arena of proclet-thread stacks local to one node.
pub struct StackCluster {
    node: NodeId,
    base: u64,
    stack_len: u64,
    capacity: u32,
    free: Mutex<VecDeque<StackSlot>>,
}

impl StackCluster {
    pub fn new(node: NodeId, base: u64, region_len: u64, stack_len: u64) -> Self {
        let capacity = (region_len / stack_len) as u32;
        StackCluster {
            node,
            base,
            stack_len,
            capacity,
            free: Mutex::new((0..capacity).collect()),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Size in bytes of one stack slot, the figure a [`crate::manager::StackManager`]
    /// client sizes its actual native stack allocation to match (§4.5).
    pub fn stack_len(&self) -> u64 {
        self.stack_len
    }

    pub fn in_use(&self) -> u32 {
        self.capacity - self.free.lock().len() as u32
    }

    /// Base virtual address of `slot`'s stack span.
    pub fn slot_addr(&self, slot: StackSlot) -> u64 {
        self.base + slot as u64 * self.stack_len
    }

    pub fn allocate(&self) -> Option<StackHandle> {
        let slot = self.free.lock().pop_front()?;
        Some(StackHandle { node: self.node, slot })
    }

    /// Return a slot to this cluster. Panics if `handle` belongs to a
    /// different node's cluster; callers are expected to route foreign
    /// handles through [`crate::manager::StackManager`] instead.
    pub fn reclaim(&self, handle: StackHandle) {
        assert_eq!(handle.node, self.node, "stack handle belongs to a different cluster");
        self.free.lock().push_back(handle.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn node() -> NodeId {
        NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9000)
    }

    #[test]
    fn allocate_and_reclaim_round_trips() {
        let cluster = StackCluster::new(node(), 0x2_0000_0000, 64 << 20, 64 << 10);
        let h = cluster.allocate().unwrap();
        assert_eq!(cluster.in_use(), 1);
        cluster.reclaim(h);
        assert_eq!(cluster.in_use(), 0);
    }

    #[test]
    fn exhausts_capacity() {
        let cluster = StackCluster::new(node(), 0, 4 * 1024, 1024);
        assert_eq!(cluster.capacity(), 4);
        for _ in 0..4 {
            assert!(cluster.allocate().is_some());
        }
        assert!(cluster.allocate().is_none());
    }

    #[test]
    #[should_panic(expected = "different cluster")]
    fn reclaim_rejects_foreign_handle() {
        let cluster = StackCluster::new(node(), 0, 4096, 1024);
        let other = NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 9000);
        cluster.reclaim(StackHandle { node: other, slot: 0 });
    }

    #[test]
    fn slot_addr_is_stride_aligned() {
        let cluster = StackCluster::new(node(), 0x1000, 4096, 1024);
        assert_eq!(cluster.slot_addr(0), 0x1000);
        assert_eq!(cluster.slot_addr(2), 0x1000 + 2048);
    }
}
