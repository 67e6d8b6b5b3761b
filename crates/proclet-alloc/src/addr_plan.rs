//! Address planner (C1, §4.5, §6, §8 "Address plan stability").
//!
//! The three regions are laid out once, at process start, from a single
//! set of parameters; every node of an LP constructs the same `AddressPlan`
//! from the same parameters, so the layout is byte-identical everywhere
//! without any node-to-node negotiation. This is the invariant that lets a
//! `ProcletId` mean the same thing on every node: it is a base address
//! inside a region every node agrees on.
//!
//! We do not actually `mmap` these ranges (no OS layer is in scope, §1);
//! `AddressPlan` only hands out the arithmetic. The real heap bytes live in
//! [`crate::slab`], addressed by the ids this module mints.

use proclet_common::status::StatusTable;

/// Parameters fixed at process start and identical on every node of an LP.
#[derive(Debug, Clone, Copy)]
pub struct AddressPlanParams {
    pub proclet_heap_base: u64,
    pub proclet_heap_len: u64,
    pub min_proclet_heap_shift: u8,
    pub max_proclet_heap_shift: u8,
    pub stack_cluster_base: u64,
    pub stack_cluster_len_per_node: u64,
    pub runtime_heap_base: u64,
    pub runtime_heap_len: u64,
}

impl Default for AddressPlanParams {
    /// A layout sized for a development cluster: 1 GiB of proclet-heap
    /// space, 64 MiB of per-node stack cluster, 256 MiB of runtime heap.
    fn default() -> Self {
        AddressPlanParams {
            proclet_heap_base: 0x1_0000_0000,
            proclet_heap_len: 1 << 30,
            min_proclet_heap_shift: 16, // 64 KiB
            max_proclet_heap_shift: 26, // 64 MiB
            stack_cluster_base: 0x2_0000_0000,
            stack_cluster_len_per_node: 64 << 20,
            runtime_heap_base: 0x3_0000_0000,
            runtime_heap_len: 256 << 20,
        }
    }
}

/// The fixed, cross-node-identical virtual layout (§6).
pub struct AddressPlan {
    params: AddressPlanParams,
    status: StatusTable,
}

impl AddressPlan {
    pub fn new(params: AddressPlanParams) -> Self {
        let status = StatusTable::new(
            params.proclet_heap_base,
            1u64 << params.min_proclet_heap_shift,
            params.proclet_heap_len,
        );
        AddressPlan { params, status }
    }

    pub fn params(&self) -> AddressPlanParams {
        self.params
    }

    pub fn status_table(&self) -> &StatusTable {
        &self.status
    }

    pub fn min_segment_shift(&self) -> u8 {
        self.params.min_proclet_heap_shift
    }

    pub fn max_segment_shift(&self) -> u8 {
        self.params.max_proclet_heap_shift
    }

    /// Whether `id` falls within the proclet-heap region at all (cheap
    /// sanity check used before trusting any remote-supplied id).
    pub fn in_heap_region(&self, id: u64) -> bool {
        id >= self.params.proclet_heap_base
            && id < self.params.proclet_heap_base + self.params.proclet_heap_len
    }

    /// The stack-cluster span assigned to the `index`-th node registered
    /// with this LP (§4.5: "one cluster per node, assigned by controller
    /// at register time").
    pub fn stack_cluster_for_node(&self, index: u32) -> (u64, u64) {
        let base = self.params.stack_cluster_base + index as u64 * self.params.stack_cluster_len_per_node;
        (base, self.params.stack_cluster_len_per_node)
    }

    pub fn runtime_heap_span(&self) -> (u64, u64) {
        (self.params.runtime_heap_base, self.params.runtime_heap_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_nodes_derive_identical_regions() {
        let a = AddressPlan::new(AddressPlanParams::default());
        let b = AddressPlan::new(AddressPlanParams::default());
        assert_eq!(a.params().proclet_heap_base, b.params().proclet_heap_base);
        assert_eq!(a.params().proclet_heap_len, b.params().proclet_heap_len);
        assert_eq!(a.stack_cluster_for_node(3), b.stack_cluster_for_node(3));
        assert_eq!(a.runtime_heap_span(), b.runtime_heap_span());
    }

    #[test]
    fn stack_clusters_do_not_overlap() {
        let plan = AddressPlan::new(AddressPlanParams::default());
        let (base0, len0) = plan.stack_cluster_for_node(0);
        let (base1, _) = plan.stack_cluster_for_node(1);
        assert_eq!(base1, base0 + len0);
    }

    #[test]
    fn in_heap_region_bounds() {
        let plan = AddressPlan::new(AddressPlanParams::default());
        let p = plan.params();
        assert!(plan.in_heap_region(p.proclet_heap_base));
        assert!(!plan.in_heap_region(p.proclet_heap_base + p.proclet_heap_len));
        assert!(!plan.in_heap_region(p.proclet_heap_base - 1));
    }
}
