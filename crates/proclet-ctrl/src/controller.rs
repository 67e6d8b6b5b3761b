//! Controller service (§4.4): LP membership, heap-segment allocation,
//! migration-destination selection, and the location directory.
//!
//! Grounded in the same shape as a replicated process registry (a single
//! lock guarding a handful of maps kept in sync with each other), except
//! here there is exactly one copy — the controller, not every node, owns
//! this state — so there is no broadcast/merge-snapshot story to carry
//! over, only the lock discipline.

use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::Mutex;
use proclet_alloc::{AddressPlan, AddressPlanParams, FreedSegment, SegmentPool};
use proclet_common::error::ControllerError;
use proclet_common::ids::{LpId, NodeId, ProcletId};
use proclet_common::resource::Resource;
use rustc_hash::FxHashMap;

/// Per-node bookkeeping the controller keeps for one LP.
struct NodeRecord {
    resource: Resource,
    isolated: bool,
    acquired: bool,
}

/// A live view of every node's last-reported free resource, handed back
/// from `acquire_migration_dest` and `report_free_resource` for local
/// caching by the caller (§4.4, §4.6).
pub type GlobalView = Vec<(NodeId, Resource)>;

struct LpState {
    image_hash: u64,
    plan: AddressPlan,
    segments: SegmentPool,
    nodes: FxHashMap<NodeId, NodeRecord>,
    /// Stable registration order, so a node's stack-cluster index never
    /// changes once assigned.
    node_order: Vec<NodeId>,
    round_robin: usize,
    location: FxHashMap<ProcletId, NodeId>,
    segment_shift: FxHashMap<ProcletId, u8>,
    destroying: bool,
}

impl LpState {
    fn new(plan_params: AddressPlanParams, image_hash: u64) -> Self {
        let plan = AddressPlan::new(plan_params);
        let segments = SegmentPool::new(&plan);
        LpState {
            image_hash,
            plan,
            segments,
            nodes: FxHashMap::default(),
            node_order: Vec::new(),
            round_robin: 0,
            location: FxHashMap::default(),
            segment_shift: FxHashMap::default(),
            destroying: false,
        }
    }

    fn eligible(&self, node: &NodeId) -> bool {
        self.nodes.get(node).is_some_and(|n| !n.isolated)
    }

    fn global_view(&self) -> GlobalView {
        self.nodes.iter().map(|(ip, rec)| (*ip, rec.resource)).collect()
    }
}

pub struct Controller {
    lps: Mutex<FxHashMap<LpId, LpState>>,
    next_lpid: AtomicU16,
    plan_params: AddressPlanParams,
}

impl Controller {
    pub fn new(plan_params: AddressPlanParams) -> Self {
        Controller {
            lps: Mutex::new(FxHashMap::default()),
            next_lpid: AtomicU16::new(1),
            plan_params,
        }
    }

    pub fn register_node(
        &self,
        ip: NodeId,
        lpid: LpId,
        image_hash: u64,
        isolated: bool,
    ) -> Result<(LpId, (u64, u64)), ControllerError> {
        let mut lps = self.lps.lock();

        let lpid = if lpid.is_auto() {
            LpId(self.next_lpid.fetch_add(1, Ordering::Relaxed))
        } else {
            lpid
        };

        let lp = lps
            .entry(lpid)
            .or_insert_with(|| LpState::new(self.plan_params, image_hash));

        if lp.destroying {
            return Err(ControllerError::LpDestroying(lpid));
        }
        if lp.image_hash != image_hash {
            return Err(ControllerError::ImageHashMismatch(ip));
        }

        if !lp.nodes.contains_key(&ip) {
            lp.node_order.push(ip);
        }
        lp.nodes.insert(
            ip,
            NodeRecord {
                resource: Resource::default(),
                isolated,
                acquired: false,
            },
        );

        let idx = lp.node_order.iter().position(|n| *n == ip).unwrap() as u32;
        let span = lp.plan.stack_cluster_for_node(idx);
        Ok((lpid, span))
    }

    pub fn allocate_proclet(
        &self,
        lpid: LpId,
        capacity_bytes: u64,
        ip_hint: Option<NodeId>,
    ) -> Result<(ProcletId, NodeId), ControllerError> {
        let mut lps = self.lps.lock();
        let lp = lps.get_mut(&lpid).ok_or(ControllerError::UnknownLp(lpid))?;
        if lp.destroying {
            return Err(ControllerError::LpDestroying(lpid));
        }

        let hint = ip_hint.filter(|h| lp.eligible(h));
        let (base, shift, origin) = lp
            .segments
            .allocate_with_origin(capacity_bytes, hint)
            .ok_or(ControllerError::OutOfSegments(capacity_bytes))?;

        let chosen = if let Some(h) = hint {
            h
        } else if let Some(origin_host) = origin.filter(|h| lp.eligible(h)) {
            origin_host
        } else {
            let eligible: Vec<NodeId> = lp
                .node_order
                .iter()
                .copied()
                .filter(|n| lp.eligible(n))
                .collect();
            if eligible.is_empty() {
                return Err(ControllerError::NoEligibleNode(lpid));
            }
            let pick = eligible[lp.round_robin % eligible.len()];
            lp.round_robin = lp.round_robin.wrapping_add(1);
            pick
        };

        let proclet_id = ProcletId(base);
        lp.location.insert(proclet_id, chosen);
        lp.segment_shift.insert(proclet_id, shift);
        Ok((proclet_id, chosen))
    }

    pub fn destroy_proclet(
        &self,
        lpid: LpId,
        proclet_id: ProcletId,
        last_host: NodeId,
    ) -> Result<(), ControllerError> {
        let mut lps = self.lps.lock();
        let lp = lps.get_mut(&lpid).ok_or(ControllerError::UnknownLp(lpid))?;
        lp.location.remove(&proclet_id);
        if let Some(shift) = lp.segment_shift.remove(&proclet_id) {
            lp.segments.free(FreedSegment {
                base: proclet_id.0,
                shift,
                prev_host: last_host,
            });
        }
        Ok(())
    }

    pub fn resolve_proclet(&self, lpid: LpId, proclet_id: ProcletId) -> Option<NodeId> {
        let lps = self.lps.lock();
        lps.get(&lpid)?.location.get(&proclet_id).copied()
    }

    /// Two-pass migration-destination search (§4.4): pass 1 requires both
    /// cpu and mem headroom; pass 2, entered only under memory pressure,
    /// drops the cpu requirement.
    pub fn acquire_migration_dest(
        &self,
        lpid: LpId,
        src: NodeId,
        has_mem_pressure: bool,
        need: Resource,
    ) -> Result<Option<(NodeId, GlobalView)>, ControllerError> {
        let mut lps = self.lps.lock();
        let lp = lps.get_mut(&lpid).ok_or(ControllerError::UnknownLp(lpid))?;

        let candidate = lp
            .node_order
            .iter()
            .copied()
            .find(|ip| {
                *ip != src
                    && lp.nodes.get(ip).is_some_and(|n| !n.isolated && !n.acquired && n.resource.covers(need))
            })
            .or_else(|| {
                if !has_mem_pressure {
                    return None;
                }
                lp.node_order.iter().copied().find(|ip| {
                    *ip != src
                        && lp
                            .nodes
                            .get(ip)
                            .is_some_and(|n| !n.isolated && !n.acquired && n.resource.mem_mbs >= need.mem_mbs)
                })
            });

        let Some(chosen) = candidate else {
            return Ok(None);
        };
        lp.nodes.get_mut(&chosen).unwrap().acquired = true;
        Ok(Some((chosen, lp.global_view())))
    }

    pub fn acquire_node(&self, lpid: LpId, ip: NodeId) -> Result<bool, ControllerError> {
        let mut lps = self.lps.lock();
        let lp = lps.get_mut(&lpid).ok_or(ControllerError::UnknownLp(lpid))?;
        let rec = lp.nodes.get_mut(&ip).ok_or(ControllerError::UnknownNode(ip, lpid))?;
        if rec.acquired {
            Ok(false)
        } else {
            rec.acquired = true;
            Ok(true)
        }
    }

    pub fn release_node(&self, lpid: LpId, ip: NodeId) -> Result<(), ControllerError> {
        let mut lps = self.lps.lock();
        let lp = lps.get_mut(&lpid).ok_or(ControllerError::UnknownLp(lpid))?;
        let rec = lp.nodes.get_mut(&ip).ok_or(ControllerError::UnknownNode(ip, lpid))?;
        rec.acquired = false;
        Ok(())
    }

    pub fn update_location(
        &self,
        lpid: LpId,
        proclet_id: ProcletId,
        node: NodeId,
    ) -> Result<(), ControllerError> {
        let mut lps = self.lps.lock();
        let lp = lps.get_mut(&lpid).ok_or(ControllerError::UnknownLp(lpid))?;
        lp.location.insert(proclet_id, node);
        Ok(())
    }

    pub fn report_free_resource(
        &self,
        lpid: LpId,
        ip: NodeId,
        resource: Resource,
    ) -> Result<GlobalView, ControllerError> {
        let mut lps = self.lps.lock();
        let lp = lps.get_mut(&lpid).ok_or(ControllerError::UnknownLp(lpid))?;
        let rec = lp.nodes.get_mut(&ip).ok_or(ControllerError::UnknownNode(ip, lpid))?;
        rec.resource = resource;
        Ok(lp.global_view())
    }

    /// Returns the set of other nodes to notify once every node's
    /// `acquired` flag has cleared, or an error naming a node still
    /// mid-migration so the caller can retry (§4.4: "waits until every
    /// node's acquired=false").
    pub fn destroy_lp(&self, lpid: LpId, requester: NodeId) -> Result<Vec<NodeId>, ControllerError> {
        let mut lps = self.lps.lock();
        {
            let lp = lps.get_mut(&lpid).ok_or(ControllerError::UnknownLp(lpid))?;
            if let Some((busy, _)) = lp.nodes.iter().find(|(_, rec)| rec.acquired) {
                return Err(ControllerError::NodeAlreadyAcquired(*busy));
            }
            lp.destroying = true;
        }
        let lp = lps.remove(&lpid).expect("checked present above");
        Ok(lp
            .node_order
            .into_iter()
            .filter(|ip| *ip != requester)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn node(n: u8) -> NodeId {
        NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 9000)
    }

    fn ctrl() -> Controller {
        Controller::new(AddressPlanParams::default())
    }

    #[test]
    fn register_node_auto_allocates_lpid() {
        let c = ctrl();
        let (lpid, _) = c.register_node(node(1), LpId::AUTO, 42, false).unwrap();
        assert!(!lpid.is_auto());
        let (lpid2, _) = c.register_node(node(2), LpId::AUTO, 42, false).unwrap();
        assert_ne!(lpid, lpid2);
    }

    #[test]
    fn reregistration_checks_image_hash() {
        let c = ctrl();
        let (lpid, _) = c.register_node(node(1), LpId::AUTO, 42, false).unwrap();
        let err = c.register_node(node(2), lpid, 99, false).unwrap_err();
        assert_eq!(err, ControllerError::ImageHashMismatch(node(2)));
        assert!(c.register_node(node(2), lpid, 42, false).is_ok());
    }

    #[test]
    fn stack_cluster_index_is_stable_per_node() {
        let c = ctrl();
        let (lpid, span0) = c.register_node(node(1), LpId::AUTO, 1, false).unwrap();
        let (_, span1) = c.register_node(node(2), lpid, 1, false).unwrap();
        assert_ne!(span0, span1);
        // Re-registering node 1 must return the same cluster span.
        let (_, span0_again) = c.register_node(node(1), lpid, 1, false).unwrap();
        assert_eq!(span0, span0_again);
    }

    #[test]
    fn allocate_then_resolve_then_destroy() {
        let c = ctrl();
        let (lpid, _) = c.register_node(node(1), LpId::AUTO, 1, false).unwrap();
        let (pid, owner) = c.allocate_proclet(lpid, 4096, None).unwrap();
        assert_eq!(c.resolve_proclet(lpid, pid), Some(owner));
        c.destroy_proclet(lpid, pid, owner).unwrap();
        assert_eq!(c.resolve_proclet(lpid, pid), None);
    }

    #[test]
    fn allocate_honors_ip_hint_over_round_robin() {
        let c = ctrl();
        let (lpid, _) = c.register_node(node(1), LpId::AUTO, 1, false).unwrap();
        c.register_node(node(2), lpid, 1, false).unwrap();
        let (_, owner) = c.allocate_proclet(lpid, 4096, Some(node(2))).unwrap();
        assert_eq!(owner, node(2));
    }

    #[test]
    fn allocate_skips_isolated_nodes() {
        let c = ctrl();
        let (lpid, _) = c.register_node(node(1), LpId::AUTO, 1, true).unwrap();
        c.register_node(node(2), lpid, 1, false).unwrap();
        let (_, owner) = c.allocate_proclet(lpid, 4096, None).unwrap();
        assert_eq!(owner, node(2));
    }

    #[test]
    fn acquire_migration_dest_two_pass() {
        let c = ctrl();
        let (lpid, _) = c.register_node(node(1), LpId::AUTO, 1, false).unwrap();
        c.register_node(node(2), lpid, 1, false).unwrap();
        c.report_free_resource(lpid, node(2), Resource::new(1, 100)).unwrap();

        // Needs more cpu than node(2) has, no memory pressure: pass 1 fails.
        let need = Resource::new(4, 50);
        let result = c.acquire_migration_dest(lpid, node(1), false, need).unwrap();
        assert!(result.is_none());

        // Under memory pressure, pass 2 relaxes the cpu check.
        let (dest, _) = c
            .acquire_migration_dest(lpid, node(1), true, need)
            .unwrap()
            .unwrap();
        assert_eq!(dest, node(2));
    }

    #[test]
    fn acquire_node_is_exclusive() {
        let c = ctrl();
        let (lpid, _) = c.register_node(node(1), LpId::AUTO, 1, false).unwrap();
        assert!(c.acquire_node(lpid, node(1)).unwrap());
        assert!(!c.acquire_node(lpid, node(1)).unwrap());
        c.release_node(lpid, node(1)).unwrap();
        assert!(c.acquire_node(lpid, node(1)).unwrap());
    }

    #[test]
    fn destroy_lp_rejects_while_a_node_is_acquired() {
        let c = ctrl();
        let (lpid, _) = c.register_node(node(1), LpId::AUTO, 1, false).unwrap();
        c.register_node(node(2), lpid, 1, false).unwrap();
        c.acquire_node(lpid, node(2)).unwrap();

        let err = c.destroy_lp(lpid, node(1)).unwrap_err();
        assert_eq!(err, ControllerError::NodeAlreadyAcquired(node(2)));

        c.release_node(lpid, node(2)).unwrap();
        let others = c.destroy_lp(lpid, node(1)).unwrap();
        assert_eq!(others, vec![node(2)]);

        // The lpid is reclaimed: further ops see it as unknown.
        assert!(matches!(
            c.resolve_proclet(lpid, ProcletId(1)),
            None
        ));
        assert!(matches!(
            c.allocate_proclet(lpid, 4096, None).unwrap_err(),
            ControllerError::UnknownLp(_)
        ));
    }
}
