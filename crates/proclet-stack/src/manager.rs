//! Stack manager (§4.5): the per-node entry point proclet threads use to
//! obtain and give back stacks. Allocation always draws from the local
//! cluster. Reclaiming a stack whose home is a *different* node (because
//! its owning thread migrated here) cannot free it locally — there is
//! nothing to free, the memory lives on the source — so the handle is
//! queued for a return RPC instead, one queue per remote node, which the
//! RPC layer drains on a timer or on proclet scope exit.

use parking_lot::Mutex;
use proclet_common::ids::NodeId;
use rustc_hash::FxHashMap;

use crate::cluster::{StackCluster, StackHandle};

pub struct StackManager {
    local: StackCluster,
    /// Handles whose home cluster is a remote node, waiting to be shipped
    /// back via `MigrateThreadAndRetVal`-style return traffic.
    pending_returns: Mutex<FxHashMap<NodeId, Vec<StackHandle>>>,
}

impl StackManager {
    pub fn new(local: StackCluster) -> Self {
        StackManager {
            local,
            pending_returns: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local.node()
    }

    pub fn local_cluster(&self) -> &StackCluster {
        &self.local
    }

    /// Hand out a fresh stack from this node's cluster. A thread that
    /// migrates here and needs a new stack calls this, not the cluster it
    /// used to run on (§4.5).
    pub fn allocate(&self) -> Option<StackHandle> {
        self.local.allocate()
    }

    /// Release a stack on scope exit. Local handles are reclaimed
    /// immediately; foreign handles are queued for a return RPC to their
    /// owning node.
    pub fn release(&self, handle: StackHandle) {
        if handle.node == self.local.node() {
            self.local.reclaim(handle);
        } else {
            self.pending_returns.lock().entry(handle.node).or_default().push(handle);
        }
    }

    /// Drain queued returns destined for `node`, handing ownership to the
    /// RPC layer to ship back and reclaim remotely.
    pub fn drain_pending_returns(&self, node: NodeId) -> Vec<StackHandle> {
        self.pending_returns.lock().remove(&node).unwrap_or_default()
    }

    /// Total handles queued for return, across all remote nodes (used by
    /// tests and by the resource reporter to size its backlog warning).
    pub fn pending_return_count(&self) -> usize {
        self.pending_returns.lock().values().map(Vec::len).sum()
    }
}
