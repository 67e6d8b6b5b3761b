//! Pressure handler (§4.6, C10): ranks resident proclets by migration
//! utility when the node comes under CPU or memory pressure, picks a
//! batch to evict, and works with [`crate::controller_client::ControllerClient`]
//! to find it a destination.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_deque::Injector;
use parking_lot::Mutex;
use proclet_common::ids::{LpId, NodeId, ProcletId};
use proclet_common::resource::{PressureKind, Resource};

use crate::controller_client::{ControllerCallError, ControllerClient};
use crate::migrator::Migrator;
use crate::proclet::{ProcletInfo, ProcletManager};
use crate::resource_reporter::ResourceSource;

/// `fixed_cost` and `line_rate` calibrate how heavily a proclet's transfer
/// size discounts its utility score (§4.6): a proclet that is cheap to
/// move relative to its benefit ranks above one that costs more to move
/// than it is worth evicting.
#[derive(Debug, Clone, Copy)]
pub struct PressureParams {
    pub fixed_cost_nanos: f64,
    pub line_rate_bytes_per_nanos: f64,
}

impl Default for PressureParams {
    fn default() -> Self {
        // ~1us fixed per-proclet transfer overhead, ~10 GB/s line rate.
        PressureParams {
            fixed_cost_nanos: 1_000.0,
            line_rate_bytes_per_nanos: 10.0,
        }
    }
}

impl PressureParams {
    fn transfer_cost(&self, bytes: u64) -> f64 {
        self.fixed_cost_nanos + bytes as f64 / self.line_rate_bytes_per_nanos
    }

    pub fn mem_utility(&self, bytes: u64) -> f64 {
        bytes as f64 / self.transfer_cost(bytes)
    }

    pub fn cpu_utility(&self, cpu_load: f64, bytes: u64) -> f64 {
        cpu_load / self.transfer_cost(bytes)
    }
}

/// One task an auxiliary handler thread can be dispatched: stream a heap
/// chunk to the destination, or pause the proclet threads scheduled on
/// its core while the source quiesces them for a heap copy (§4.6).
pub enum AuxTask {
    SendChunk { proclet_id: ProcletId, chunk: Vec<u8> },
    PauseCore { core: u32 },
}

/// Shared dispatch queue for the N auxiliary handler threads the pressure
/// handler spawns during a migration batch, mirroring the
/// injector/stealer split the proclet-thread scheduler uses for
/// cross-thread work (just without per-worker local deques, since aux
/// handlers don't themselves spawn nested work).
pub struct AuxiliaryPool {
    injector: Arc<Injector<AuxTask>>,
}

impl AuxiliaryPool {
    pub fn new() -> Self {
        AuxiliaryPool {
            injector: Arc::new(Injector::new()),
        }
    }

    pub fn dispatch(&self, task: AuxTask) {
        self.injector.push(task);
    }

    pub fn injector(&self) -> Arc<Injector<AuxTask>> {
        Arc::clone(&self.injector)
    }
}

impl Default for AuxiliaryPool {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PressureHandler {
    manager: Arc<ProcletManager>,
    controller: Arc<ControllerClient>,
    params: PressureParams,
    blacklist: Mutex<HashSet<NodeId>>,
    stop: AtomicBool,
}

impl PressureHandler {
    pub fn new(manager: Arc<ProcletManager>, controller: Arc<ControllerClient>, params: PressureParams) -> Self {
        PressureHandler {
            manager,
            controller,
            params,
            blacklist: Mutex::new(HashSet::new()),
            stop: AtomicBool::new(false),
        }
    }

    /// Candidates ranked best-to-worst to evict for the given pressure
    /// kind. Non-migratable proclets never appear.
    pub fn rank(&self, kind: PressureKind) -> Vec<(ProcletInfo, f64)> {
        let mut ranked: Vec<(ProcletInfo, f64)> = self
            .manager
            .all_info()
            .into_iter()
            .filter(|info| info.migratable)
            .map(|info| {
                let score = match kind {
                    PressureKind::Mem => self.params.mem_utility(info.capacity_bytes),
                    PressureKind::Cpu => self.params.cpu_utility(info.cpu_load, info.capacity_bytes),
                    PressureKind::Both => {
                        self.params.mem_utility(info.capacity_bytes) + self.params.cpu_utility(info.cpu_load, info.capacity_bytes)
                    }
                };
                (info, score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    /// Walk the ranked list, accumulating proclets until their summed
    /// footprint covers `deficit` (or the ranking runs out).
    pub fn choose_batch(&self, ranked: &[(ProcletInfo, f64)], deficit: Resource) -> Vec<ProcletId> {
        let mut batch = Vec::new();
        let mut acc = Resource::default();
        for (info, _score) in ranked {
            if acc.covers(deficit) {
                break;
            }
            batch.push(info.id);
            acc.mem_mbs += info.capacity_bytes / (1024 * 1024);
            acc.cores += 1;
        }
        batch
    }

    pub fn blacklist_destination(&self, node: NodeId) {
        self.blacklist.lock().insert(node);
    }

    pub fn is_blacklisted(&self, node: NodeId) -> bool {
        self.blacklist.lock().contains(&node)
    }

    pub fn clear_blacklist(&self) {
        self.blacklist.lock().clear();
    }

    /// Ask the controller for a migration destination, skipping over (and
    /// releasing) any candidate this episode already blacklisted. The
    /// controller itself has no notion of exclusion lists, so this is a
    /// client-side retry loop bounded by `max_attempts`.
    pub fn acquire_destination(
        &self,
        lpid: proclet_common::ids::LpId,
        src: NodeId,
        has_mem_pressure: bool,
        need: Resource,
        max_attempts: u32,
    ) -> Result<Option<(NodeId, proclet_ctrl::GlobalView)>, ControllerCallError> {
        for _ in 0..max_attempts {
            match self.controller.acquire_migration_dest(lpid, src, has_mem_pressure, need)? {
                None => return Ok(None),
                Some((node, view)) if self.is_blacklisted(node) => {
                    self.controller.release_node(lpid, node)?;
                    continue;
                }
                found => return Ok(found),
            }
        }
        Ok(None)
    }

    pub fn signal_interval() -> Duration {
        Duration::from_millis(500)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Classify the current free-resource snapshot against `low_water`, and
    /// the resource this node still needs to shed to get back above it
    /// (§4.6: "classify as cpu/mem/both").
    fn classify(free: Resource, low_water: Resource) -> Option<(PressureKind, Resource)> {
        let short_mem = free.mem_mbs < low_water.mem_mbs;
        let short_cpu = free.cores < low_water.cores;
        let kind = match (short_cpu, short_mem) {
            (true, true) => PressureKind::Both,
            (true, false) => PressureKind::Cpu,
            (false, true) => PressureKind::Mem,
            (false, false) => return None,
        };
        let deficit = Resource::new(
            low_water.cores.saturating_sub(free.cores),
            low_water.mem_mbs.saturating_sub(free.mem_mbs),
        );
        Some((kind, deficit))
    }

    /// One pressure-relief episode: sample free resource via `source`, and
    /// if it is short of `low_water` on either axis, rank, pick a batch,
    /// find a destination, and migrate it (§4.6, §4.10). A no-op when the
    /// node isn't actually under pressure.
    pub fn relieve_once(
        &self,
        lpid: LpId,
        local_node: NodeId,
        source: &dyn ResourceSource,
        low_water: Resource,
        migrator: &Migrator,
        max_dest_attempts: u32,
    ) -> Result<(), ControllerCallError> {
        let Some((kind, deficit)) = Self::classify(source.sample(), low_water) else {
            return Ok(());
        };

        let ranked = self.rank(kind);
        let batch = self.choose_batch(&ranked, deficit);
        if batch.is_empty() {
            return Ok(());
        }

        let Some((dest, _view)) =
            self.acquire_destination(lpid, local_node, kind.has_mem_pressure(), deficit, max_dest_attempts)?
        else {
            tracing::warn!(?kind, "no migration destination available to relieve pressure");
            return Ok(());
        };

        match migrator.migrate_batch(lpid, &batch, dest, kind.has_mem_pressure()) {
            Ok(report) => {
                if report.moved_count() < batch.len() {
                    tracing::warn!(%dest, requested = batch.len(), moved = report.moved_count(), "destination denied part of the batch, blacklisting for this episode");
                    self.blacklist_destination(dest);
                }
                self.controller.release_node(lpid, dest)?;
            }
            Err(err) => {
                tracing::warn!(error = %err, %dest, "migration batch failed");
                self.blacklist_destination(dest);
                self.controller.release_node(lpid, dest)?;
            }
        }
        Ok(())
    }

    /// Runs [`Self::relieve_once`] on `interval` until [`Self::stop`] is
    /// called, clearing the episode blacklist whenever a poll finds no
    /// pressure (that is what ends an episode, per §4.6).
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        self: &Arc<Self>,
        lpid: LpId,
        local_node: NodeId,
        source: Arc<dyn ResourceSource>,
        low_water: Resource,
        migrator: Arc<Migrator>,
        max_dest_attempts: u32,
        interval: Duration,
    ) {
        while !self.stop.load(Ordering::Acquire) {
            let was_under_pressure = Self::classify(source.sample(), low_water).is_some();
            if let Err(err) = self.relieve_once(lpid, local_node, source.as_ref(), low_water, &migrator, max_dest_attempts) {
                tracing::warn!(error = %err, "pressure relief episode failed");
            }
            if !was_under_pressure {
                self.clear_blacklist();
            }
            std::thread::sleep(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proclet_alloc::slab::Slab;
    use proclet_common::StatusTable;
    use proclet_rpc::RpcClient;
    use std::net::{IpAddr, Ipv4Addr};

    fn controller_client() -> Arc<ControllerClient> {
        let node = NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 9000);
        Arc::new(ControllerClient::new(Arc::new(RpcClient::new(Duration::from_millis(50))), node))
    }

    fn manager_with(capacities: &[(u64, u64)]) -> Arc<ProcletManager> {
        let mgr = Arc::new(ProcletManager::new(Arc::new(StatusTable::new(0x1000, 0x1000, 0x100_0000))));
        for (id, capacity) in capacities {
            let proclet = Arc::new(crate::proclet::Proclet::new(
                ProcletId(*id),
                16,
                Arc::new(Slab::new(*id, *capacity, 4)),
            ));
            mgr.setup(proclet);
        }
        mgr
    }

    #[test]
    fn mem_utility_favors_large_cheap_to_move_proclets() {
        let params = PressureParams::default();
        let small = params.mem_utility(4096);
        let large = params.mem_utility(4096 * 1024);
        assert!(large > small);
    }

    #[test]
    fn rank_excludes_non_migratable_proclets() {
        let mgr = manager_with(&[(0x1000, 4096), (0x2000, 8192)]);
        mgr.get(ProcletId(0x2000)).unwrap().set_migratable(false);

        let handler = PressureHandler::new(mgr, controller_client(), PressureParams::default());
        let ranked = handler.rank(PressureKind::Mem);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].0.id, ProcletId(0x1000));
    }

    #[test]
    fn choose_batch_stops_once_deficit_covered() {
        let mgr = manager_with(&[(0x1000, 8 * 1024 * 1024), (0x2000, 8 * 1024 * 1024), (0x3000, 8 * 1024 * 1024)]);
        let handler = PressureHandler::new(mgr, controller_client(), PressureParams::default());
        let ranked = handler.rank(PressureKind::Mem);
        let batch = handler.choose_batch(&ranked, Resource::new(0, 10));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn blacklist_roundtrip() {
        let mgr = manager_with(&[]);
        let handler = PressureHandler::new(mgr, controller_client(), PressureParams::default());
        let node = NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 9000);
        assert!(!handler.is_blacklisted(node));
        handler.blacklist_destination(node);
        assert!(handler.is_blacklisted(node));
        handler.clear_blacklist();
        assert!(!handler.is_blacklisted(node));
    }

    #[test]
    fn classify_reports_which_axis_is_short() {
        let low_water = Resource::new(4, 1024);
        assert!(PressureHandler::classify(Resource::new(8, 2048), low_water).is_none());
        let (kind, deficit) = PressureHandler::classify(Resource::new(8, 512), low_water).unwrap();
        assert_eq!(kind, PressureKind::Mem);
        assert_eq!(deficit, Resource::new(0, 512));
        let (kind, _) = PressureHandler::classify(Resource::new(1, 512), low_water).unwrap();
        assert_eq!(kind, PressureKind::Both);
    }

    #[test]
    fn relieve_once_is_a_noop_when_resource_is_plentiful() {
        struct PlentifulSource;
        impl ResourceSource for PlentifulSource {
            fn sample(&self) -> Resource {
                Resource::new(64, 65536)
            }
        }

        let mgr = manager_with(&[(0x1000, 8 * 1024 * 1024)]);
        let controller = controller_client();
        let local_node = NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 9000);
        let migrator = Migrator::new(local_node, Arc::clone(&mgr), Arc::clone(&controller));
        let handler = PressureHandler::new(mgr, controller, PressureParams::default());

        handler
            .relieve_once(LpId(1), local_node, &PlentifulSource, Resource::new(4, 1024), &migrator, 3)
            .expect("no pressure means no controller call is even attempted");
    }

    #[test]
    fn auxiliary_pool_dispatches_tasks() {
        let pool = AuxiliaryPool::new();
        pool.dispatch(AuxTask::PauseCore { core: 2 });
        pool.dispatch(AuxTask::SendChunk { proclet_id: ProcletId(1), chunk: vec![1, 2, 3] });
        let injector = pool.injector();
        let mut drained = 0;
        while let crossbeam_deque::Steal::Success(_) = injector.steal() {
            drained += 1;
        }
        assert_eq!(drained, 2);
    }
}
