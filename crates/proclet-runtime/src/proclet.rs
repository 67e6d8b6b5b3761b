//! The in-process proclet object and the table that tracks every proclet
//! resident on this node.
//!
//! [`crate::clock::LogicalClock`] and [`crate::rcu::RcuLock`] in particular have no purpose outside a
//! `Proclet`; the rest of the runtime reaches them through here.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use proclet_alloc::slab::Slab;
use proclet_common::{ProcletId, ProcletStatus, StatusTable};
use rustc_hash::FxHashMap;

use crate::blocked_syncer::BlockedSyncer;
use crate::clock::LogicalClock;
use crate::rcu::RcuLock;

/// Exponentially-weighted moving average of this proclet's share of a
/// core, used by the pressure handler to rank migration candidates
/// (§4.6). `alpha` close to 1.0 favors the newest sample.
pub struct CpuLoadEstimator {
    bits: AtomicU64,
    alpha: f64,
}

impl CpuLoadEstimator {
    pub fn new(alpha: f64) -> Self {
        CpuLoadEstimator {
            bits: AtomicU64::new(0f64.to_bits()),
            alpha,
        }
    }

    pub fn sample(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn record(&self, busy_fraction: f64) {
        let prev = self.sample();
        let next = self.alpha * busy_fraction + (1.0 - self.alpha) * prev;
        self.bits.store(next.to_bits(), Ordering::Relaxed);
    }
}

impl Default for CpuLoadEstimator {
    fn default() -> Self {
        // A 1-second sampling tick with an 0.3 weight settles within a few
        // samples without chasing every single-invocation spike.
        Self::new(0.3)
    }
}

/// A resident, relocatable proclet. Its identity and heap bytes live in
/// [`proclet_alloc`]; this struct is the runtime-side control block: what's
/// referencing it, what's blocked inside it, and the clock/RCU state a
/// migration has to carry along.
pub struct Proclet {
    pub id: ProcletId,
    pub segment_shift: u8,
    slab: Arc<Slab>,
    ref_cnt: AtomicI64,
    thread_cnt: AtomicI64,
    migratable: AtomicBool,
    pub blocked: BlockedSyncer,
    pub clock: LogicalClock,
    pub rcu: RcuLock,
    pub cpu_load: CpuLoadEstimator,
}

impl Proclet {
    pub fn new(id: ProcletId, segment_shift: u8, slab: Arc<Slab>) -> Self {
        Proclet {
            id,
            segment_shift,
            slab,
            ref_cnt: AtomicI64::new(0),
            thread_cnt: AtomicI64::new(0),
            migratable: AtomicBool::new(true),
            blocked: BlockedSyncer::new(),
            clock: LogicalClock::new(),
            rcu: RcuLock::new(),
            cpu_load: CpuLoadEstimator::default(),
        }
    }

    pub fn slab(&self) -> &Arc<Slab> {
        &self.slab
    }

    pub fn incref(&self) -> i64 {
        self.ref_cnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the post-decrement count; zero means nothing still holds a
    /// reference to this proclet (a precondition for a migration batch to
    /// choose it, or for destruction to proceed).
    pub fn decref(&self) -> i64 {
        self.ref_cnt.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_cnt.load(Ordering::Acquire)
    }

    pub fn enter_thread(&self) -> i64 {
        self.thread_cnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn exit_thread(&self) -> i64 {
        self.thread_cnt.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn thread_count(&self) -> i64 {
        self.thread_cnt.load(Ordering::Acquire)
    }

    pub fn is_migratable(&self) -> bool {
        self.migratable.load(Ordering::Acquire)
    }

    pub fn set_migratable(&self, value: bool) {
        self.migratable.store(value, Ordering::Release);
    }

    /// A proclet is safe for a migration batch to pick up when nothing
    /// outside its own execution holds a live reference or thread (§4.6,
    /// `SkipProclet` condition).
    pub fn is_quiescent(&self) -> bool {
        self.ref_count() == 0 && self.thread_count() == 0
    }
}

/// A cheap, copyable snapshot for the pressure handler's ranking pass —
/// avoids holding the table lock while scoring candidates.
#[derive(Debug, Clone, Copy)]
pub struct ProcletInfo {
    pub id: ProcletId,
    pub capacity_bytes: u64,
    pub cpu_load: f64,
    pub ref_count: i64,
    pub thread_count: i64,
    pub migratable: bool,
}

/// Every proclet resident on this node, keyed by id, plus the shared
/// status table their lifecycle transitions go through.
pub struct ProcletManager {
    status: Arc<StatusTable>,
    proclets: RwLock<FxHashMap<ProcletId, Arc<Proclet>>>,
    present_mu: Mutex<()>,
    present_cv: Condvar,
}

impl ProcletManager {
    pub fn new(status: Arc<StatusTable>) -> Self {
        ProcletManager {
            status,
            proclets: RwLock::new(FxHashMap::default()),
            present_mu: Mutex::new(()),
            present_cv: Condvar::new(),
        }
    }

    /// Block the calling thread until `id` is `Present` locally or
    /// `deadline` passes, waking early on every [`Self::setup`]. Used by
    /// the invocation engine's attach step (§4.1 step 1: "if status <
    /// Present it retries by waiting on the proclet's condition
    /// variable").
    pub fn wait_present(&self, id: ProcletId, deadline: std::time::Instant) -> Option<Arc<Proclet>> {
        loop {
            if self.status.load(id) == ProcletStatus::Present {
                return self.get(id);
            }
            let mut guard = self.present_mu.lock();
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            self.present_cv.wait_for(&mut guard, deadline - now);
        }
    }

    pub fn get(&self, id: ProcletId) -> Option<Arc<Proclet>> {
        self.proclets.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ProcletId) -> bool {
        self.proclets.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.proclets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Populate a freshly allocated or freshly migrated-in proclet:
    /// `Absent -> Populating -> Present` (§4.2).
    pub fn setup(&self, proclet: Arc<Proclet>) {
        let id = proclet.id;
        self.status.store(id, ProcletStatus::Populating);
        self.proclets.write().insert(id, proclet);
        self.status.store(id, ProcletStatus::Present);
        let _guard = self.present_mu.lock();
        self.present_cv.notify_all();
    }

    /// `Present -> Migrating`, removing it from the local table so no new
    /// local call can reach it while the heap copy is in flight. Returns
    /// `None` if another transition beat this one to it.
    pub fn remove_for_migration(&self, id: ProcletId) -> Option<Arc<Proclet>> {
        if !self.status.compare_and_set(id, ProcletStatus::Present, ProcletStatus::Migrating) {
            return None;
        }
        self.proclets.write().remove(&id)
    }

    /// `Present -> Destructing`, same shape as [`Self::remove_for_migration`]
    /// but for permanent removal.
    pub fn remove_for_destruction(&self, id: ProcletId) -> Option<Arc<Proclet>> {
        if !self.status.compare_and_set(id, ProcletStatus::Present, ProcletStatus::Destructing) {
            return None;
        }
        self.proclets.write().remove(&id)
    }

    /// `Migrating -> Cleaning -> Absent`, called on the source once the
    /// destination has acknowledged the heap copy.
    pub fn cleanup(&self, id: ProcletId) {
        self.status.compare_and_set(id, ProcletStatus::Migrating, ProcletStatus::Cleaning);
        self.status.compare_and_set(id, ProcletStatus::Cleaning, ProcletStatus::Absent);
    }

    /// `Destructing -> Absent`, called once a destroyed proclet's slab has
    /// been returned to its segment.
    pub fn finish_destruction(&self, id: ProcletId) {
        self.status.compare_and_set(id, ProcletStatus::Destructing, ProcletStatus::Absent);
    }

    pub fn status_of(&self, id: ProcletId) -> ProcletStatus {
        self.status.load(id)
    }

    pub fn all_proclets(&self) -> Vec<Arc<Proclet>> {
        self.proclets.read().values().cloned().collect()
    }

    pub fn get_info(&self, id: ProcletId) -> Option<ProcletInfo> {
        let proclet = self.get(id)?;
        Some(ProcletInfo {
            id,
            capacity_bytes: proclet.slab().capacity(),
            cpu_load: proclet.cpu_load.sample(),
            ref_count: proclet.ref_count(),
            thread_count: proclet.thread_count(),
            migratable: proclet.is_migratable(),
        })
    }

    pub fn all_info(&self) -> Vec<ProcletInfo> {
        self.proclets
            .read()
            .values()
            .map(|p| ProcletInfo {
                id: p.id,
                capacity_bytes: p.slab().capacity(),
                cpu_load: p.cpu_load.sample(),
                ref_count: p.ref_count(),
                thread_count: p.thread_count(),
                migratable: p.is_migratable(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ProcletManager {
        ProcletManager::new(Arc::new(StatusTable::new(0x1000, 0x1000, 0x10_0000)))
    }

    fn proclet(id: u64) -> Arc<Proclet> {
        Arc::new(Proclet::new(ProcletId(id), 16, Arc::new(Slab::new(id, 4096, 4))))
    }

    #[test]
    fn setup_brings_proclet_present_and_visible() {
        let mgr = manager();
        let id = ProcletId(0x1000);
        mgr.setup(proclet(0x1000));
        assert_eq!(mgr.status_of(id), ProcletStatus::Present);
        assert!(mgr.contains(id));
    }

    #[test]
    fn migration_removal_requires_present_and_clears_table() {
        let mgr = manager();
        let id = ProcletId(0x2000);
        mgr.setup(proclet(0x2000));

        let taken = mgr.remove_for_migration(id).expect("present proclet removes for migration");
        assert_eq!(taken.id, id);
        assert!(!mgr.contains(id));
        assert_eq!(mgr.status_of(id), ProcletStatus::Migrating);

        // Already moved out of Present; a second attempt must not succeed.
        mgr.setup(proclet(0x2000));
        mgr.status_of(id); // no panic touching the slot again
    }

    #[test]
    fn cleanup_after_migration_returns_to_absent() {
        let mgr = manager();
        let id = ProcletId(0x3000);
        mgr.setup(proclet(0x3000));
        mgr.remove_for_migration(id).unwrap();
        mgr.cleanup(id);
        assert_eq!(mgr.status_of(id), ProcletStatus::Absent);
    }

    #[test]
    fn quiescence_requires_no_refs_and_no_threads() {
        let p = proclet(0x4000);
        assert!(p.is_quiescent());
        p.incref();
        assert!(!p.is_quiescent());
        p.decref();
        assert!(p.is_quiescent());
        p.enter_thread();
        assert!(!p.is_quiescent());
        p.exit_thread();
        assert!(p.is_quiescent());
    }

    #[test]
    fn cpu_load_estimator_converges_toward_samples() {
        let est = CpuLoadEstimator::new(0.5);
        assert_eq!(est.sample(), 0.0);
        for _ in 0..10 {
            est.record(1.0);
        }
        assert!(est.sample() > 0.99);
    }
}
