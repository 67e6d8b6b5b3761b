//! Glue that installs this node's live proclet table and controller
//! client behind [`proclet_wire::ProcletRefCounter`] (§3 invariant 3), so
//! [`proclet_wire::ProcletHandle`]'s encode/decode/drop paths reach a
//! real proclet rather than being wired to nothing.

use std::sync::Arc;

use proclet_common::ids::{LpId, NodeId, ProcletId};
use proclet_wire::ProcletRefCounter;

use crate::controller_client::ControllerClient;
use crate::proclet::ProcletManager;

/// Increments/decrements a locally resident proclet's count, and once a
/// decrement reaches zero on a quiescent proclet, drives it through
/// destruction (`Present -> Destructing -> Absent`) and reports that to
/// the controller the same way a migration's cleanup step does.
///
/// A [`ProcletId`] that isn't resident on this node is a no-op: ref
/// counting a handle held by a remote node would need its own
/// `update_ref_cnt` RPC, which this simplification doesn't implement
/// (see DESIGN.md).
pub struct ManagerRefCounter {
    manager: Arc<ProcletManager>,
    controller: Arc<ControllerClient>,
    local_node: NodeId,
    lpid: LpId,
}

impl ManagerRefCounter {
    pub fn new(manager: Arc<ProcletManager>, controller: Arc<ControllerClient>, local_node: NodeId, lpid: LpId) -> Self {
        ManagerRefCounter {
            manager,
            controller,
            local_node,
            lpid,
        }
    }
}

impl ProcletRefCounter for ManagerRefCounter {
    fn incref(&self, id: ProcletId) {
        if let Some(proclet) = self.manager.get(id) {
            proclet.incref();
        }
    }

    fn decref(&self, id: ProcletId) {
        let Some(proclet) = self.manager.get(id) else {
            return;
        };
        if proclet.decref() > 0 {
            return;
        }
        if !proclet.is_quiescent() {
            // Still has a thread inside it; whatever dropped this
            // reference wasn't the last thing holding the proclet busy.
            return;
        }
        if self.manager.remove_for_destruction(id).is_none() {
            return;
        }
        self.manager.finish_destruction(id);
        if let Err(err) = self.controller.destroy_proclet(self.lpid, id, self.local_node) {
            tracing::warn!(proclet = ?id, error = %err, "failed to notify controller of proclet destruction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proclet::Proclet;
    use proclet_alloc::slab::Slab;
    use proclet_common::StatusTable;
    use proclet_rpc::RpcClient;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn node(n: u8) -> NodeId {
        NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 9000)
    }

    fn counter_with_proclet(id: ProcletId) -> (ManagerRefCounter, Arc<ProcletManager>) {
        let manager = Arc::new(ProcletManager::new(Arc::new(StatusTable::new(0x1000, 0x1000, 0x100_0000))));
        manager.setup(Arc::new(Proclet::new(id, 16, Arc::new(Slab::new(id.0, 4096, 4)))));
        let controller = Arc::new(ControllerClient::new(Arc::new(RpcClient::new(Duration::from_millis(20))), node(9)));
        let counter = ManagerRefCounter::new(Arc::clone(&manager), controller, node(1), LpId(1));
        (counter, manager)
    }

    #[test]
    fn decref_above_zero_leaves_proclet_present() {
        let id = ProcletId(0x2000);
        let (counter, manager) = counter_with_proclet(id);
        counter.incref(id);
        counter.incref(id);
        counter.decref(id);
        assert!(manager.contains(id));
    }

    #[test]
    fn decref_to_zero_on_quiescent_proclet_destroys_it() {
        let id = ProcletId(0x3000);
        let (counter, manager) = counter_with_proclet(id);
        counter.incref(id);
        counter.decref(id);
        assert!(!manager.contains(id));
        assert_eq!(manager.status_of(id), proclet_common::ProcletStatus::Absent);
    }

    #[test]
    fn decref_to_zero_with_thread_still_attached_keeps_proclet_present() {
        let id = ProcletId(0x4000);
        let (counter, manager) = counter_with_proclet(id);
        let proclet = manager.get(id).unwrap();
        proclet.enter_thread();

        counter.incref(id);
        counter.decref(id);
        assert!(manager.contains(id), "a thread is still inside the proclet; it must not be destroyed out from under it");

        proclet.exit_thread();
    }

    #[test]
    fn unknown_id_is_a_no_op() {
        let manager = Arc::new(ProcletManager::new(Arc::new(StatusTable::new(0x1000, 0x1000, 0x100_0000))));
        let controller = Arc::new(ControllerClient::new(Arc::new(RpcClient::new(Duration::from_millis(20))), node(9)));
        let counter = ManagerRefCounter::new(Arc::clone(&manager), controller, node(1), LpId(1));
        counter.incref(ProcletId(0x9999));
        counter.decref(ProcletId(0x9999));
    }
}
