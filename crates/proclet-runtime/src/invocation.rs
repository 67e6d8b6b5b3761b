//! Invocation engine (§4.1, C8): routes a proclet method call to its
//! local object under a migration guard, or serializes it over the RPC
//! fabric to whichever node the controller client's cache says owns it.
//!
//! In-flight reply forwarding during a migrating-out call (§4.3 "in-flight
//! call forwarding") is subsumed here rather than implemented as a
//! separate path: the migrator's RCU writer-sync cannot proceed while
//! this engine's reader guard is held, so a method that is already
//! running always finishes and replies over the connection it arrived on
//! before the proclet's heap is ever copied. The forwarding step in the
//! protocol exists to handle a race this implementation serializes away.

use std::cell::RefCell;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use proclet_common::error::{CallError, WireStatus};
use proclet_common::ids::{LpId, NodeId, ProcletId};
use proclet_rpc::RpcClient;
use proclet_stack::StackManager;
use proclet_wire::{ProcletHandle, RequestKind};
use rustc_hash::FxHashMap;

use crate::controller_client::ControllerClient;
use crate::coroutine::{ProcletCoroutine, StepOutcome};
use crate::proclet::{Proclet, ProcletManager};

pub type MethodId = u32;

/// A registered proclet method body. Application-level proclet types are
/// out of scope here (§1); this is just the seam the runtime calls
/// through, keyed by a small integer id carried on the wire.
pub type MethodFn = dyn Fn(&Proclet, &[u8]) -> Vec<u8> + Send + Sync;

#[derive(Default)]
pub struct MethodTable {
    methods: FxHashMap<MethodId, Box<MethodFn>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: MethodId, f: F)
    where
        F: Fn(&Proclet, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.methods.insert(id, Box::new(f));
    }

    fn invoke(&self, proclet: &Proclet, id: MethodId, args: &[u8]) -> Result<Vec<u8>, CallError> {
        let f = self
            .methods
            .get(&id)
            .ok_or_else(|| CallError::Fatal(format!("no method registered for id {id}")))?;
        Ok(f(proclet, args))
    }
}

thread_local! {
    /// The proclet this OS thread is currently attached to, if any (§3
    /// "Thread", §4.1 step 1). `None` means it is running as a plain
    /// runtime thread. Held as the actual `Arc` (not just the id) so a
    /// nested call to a *different* proclet can detach it -- release its
    /// thread count and RCU reader section -- and reattach once that
    /// nested call returns (§4.1 step 2, §3 invariant 5: a thread is
    /// attached to at most one proclet at a time).
    static OWNER: RefCell<Option<Arc<Proclet>>> = const { RefCell::new(None) };
}

fn owner_is(target: ProcletId) -> bool {
    OWNER.with(|o| o.borrow().as_ref().map(|p| p.id) == Some(target))
}

/// Releases this thread's attachment to whatever proclet it's currently
/// running inside, if any, so a call about to be dispatched to a
/// *different* proclet never finds two proclets simultaneously counting
/// the thread as attached. Paired with [`reattach_current`] once that
/// call returns.
fn detach_current() -> Option<Arc<Proclet>> {
    let current = OWNER.with(|o| o.borrow().clone())?;
    current.exit_thread();
    current.rcu.manual_exit();
    Some(current)
}

fn reattach_current(detached: Option<Arc<Proclet>>) {
    if let Some(proclet) = detached {
        proclet.rcu.manual_enter();
        proclet.enter_thread();
    }
}

/// A quantum used to turn a method's wall-clock duration into a busy
/// fraction for [`crate::proclet::CpuLoadEstimator`] (§4.1 "CPU-load
/// accounting starts/stops around each method body").
const CPU_SAMPLE_WINDOW_NANOS: f64 = 10_000_000.0; // 10ms

/// Backoff before retrying a call that just timed out, so a congested link
/// doesn't see every caller retry in lockstep. Capped at ~200ms regardless
/// of how many attempts have elapsed.
fn jittered_backoff(attempt: u32) -> Duration {
    let base_millis = 10u64.saturating_mul(1u64 << attempt.min(4));
    let jitter_millis = rand::random::<u64>() % (base_millis + 1);
    Duration::from_millis((base_millis + jitter_millis).min(200))
}

fn encode_call_request(target: ProcletId, method: MethodId, args: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + args.len());
    buf.extend_from_slice(&target.0.to_le_bytes());
    buf.extend_from_slice(&method.to_le_bytes());
    buf.extend_from_slice(args);
    buf
}

fn decode_call_request(bytes: &[u8]) -> Option<(ProcletId, MethodId, &[u8])> {
    if bytes.len() < 12 {
        return None;
    }
    let mut cur = Cursor::new(bytes);
    let mut id_buf = [0u8; 8];
    cur.read_exact(&mut id_buf).ok()?;
    let mut method_buf = [0u8; 4];
    cur.read_exact(&mut method_buf).ok()?;
    let pos = cur.position() as usize;
    Some((ProcletId(u64::from_le_bytes(id_buf)), u32::from_le_bytes(method_buf), &bytes[pos..]))
}

pub struct InvocationEngine {
    local_node: NodeId,
    lpid: LpId,
    manager: Arc<ProcletManager>,
    controller: Arc<ControllerClient>,
    rpc: Arc<RpcClient>,
    methods: Arc<MethodTable>,
    stack: Arc<StackManager>,
    max_retries: u32,
    attach_timeout: Duration,
}

impl InvocationEngine {
    pub fn new(
        local_node: NodeId,
        lpid: LpId,
        manager: Arc<ProcletManager>,
        controller: Arc<ControllerClient>,
        rpc: Arc<RpcClient>,
        methods: Arc<MethodTable>,
        stack: Arc<StackManager>,
    ) -> Self {
        InvocationEngine {
            local_node,
            lpid,
            manager,
            controller,
            rpc,
            methods,
            stack,
            max_retries: 8,
            attach_timeout: Duration::from_millis(500),
        }
    }

    pub fn with_retry_budget(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Mints a counted reference to `target` (§3 invariant 3) for a
    /// method body that wants to hold onto another proclet -- as opposed
    /// to just dispatching a call to it by id -- across a nested call or
    /// past the lifetime of the current invocation's arguments. Dropping
    /// the returned handle releases the reference.
    pub fn handle_for(&self, target: ProcletId) -> ProcletHandle {
        ProcletHandle::new(target)
    }

    /// `call(proclet_id, method, args) -> result` (§4.1). Retries
    /// transparently on `WrongClient`/`Timeout` up to the configured
    /// budget, invalidating the location cache each time so the retry
    /// re-resolves instead of hammering the same stale node.
    pub fn call(&self, target: ProcletId, method: MethodId, args: &[u8]) -> Result<Vec<u8>, CallError> {
        let mut attempts = 0u32;
        loop {
            match self.try_call(target, method, args) {
                Err(CallError::Timeout(_)) if attempts < self.max_retries => {
                    attempts += 1;
                    self.controller.invalidate_location(target);
                    std::thread::sleep(jittered_backoff(attempts));
                    continue;
                }
                Err(CallError::WrongClient(_)) if attempts < self.max_retries => {
                    attempts += 1;
                    self.controller.invalidate_location(target);
                    continue;
                }
                Err(CallError::WrongClient(_)) | Err(CallError::Timeout(_)) => {
                    return Err(CallError::RetriesExhausted(self.max_retries, target));
                }
                other => return other,
            }
        }
    }

    /// Fire-and-forget: dispatched on its own thread, result discarded
    /// (errors logged, never surfaced — §4.1 variant).
    pub fn call_fire_and_forget(self: &Arc<Self>, target: ProcletId, method: MethodId, args: Vec<u8>) {
        let engine = Arc::clone(self);
        std::thread::spawn(move || {
            if let Err(err) = engine.call(target, method, &args) {
                tracing::warn!(proclet = ?target, method, error = %err, "fire-and-forget call failed");
            }
        });
    }

    /// Asynchronous completion: dispatched on its own thread, joinable
    /// for the result (§4.1 variant).
    pub fn call_async(self: &Arc<Self>, target: ProcletId, method: MethodId, args: Vec<u8>) -> std::thread::JoinHandle<Result<Vec<u8>, CallError>> {
        let engine = Arc::clone(self);
        std::thread::spawn(move || engine.call(target, method, &args))
    }

    fn try_call(&self, target: ProcletId, method: MethodId, args: &[u8]) -> Result<Vec<u8>, CallError> {
        if owner_is(target) {
            // §4.1 tie-break: self-call skips the detach/reattach dance.
            let proclet = self.manager.get(target).ok_or(CallError::WrongClient(target))?;
            return self.run_attached(&proclet, method, args);
        }

        // Calling out to a different proclet: detach from whatever this
        // thread is currently attached to first (§4.1 step 2), so the
        // outer proclet is never counted as attached while this thread is
        // actually running inside `target`.
        let detached = detach_current();
        let result = self.dispatch(target, method, args);
        reattach_current(detached);
        result
    }

    fn dispatch(&self, target: ProcletId, method: MethodId, args: &[u8]) -> Result<Vec<u8>, CallError> {
        let node = self
            .controller
            .resolve_proclet(self.lpid, target)
            .map_err(|_| CallError::Timeout(self.controller.controller_node()))?
            .ok_or(CallError::WrongClient(target))?;

        if node == self.local_node {
            self.call_local(target, method, args)
        } else {
            self.call_remote(node, target, method, args)
        }
    }

    fn call_local(&self, target: ProcletId, method: MethodId, args: &[u8]) -> Result<Vec<u8>, CallError> {
        let deadline = Instant::now() + self.attach_timeout;
        let proclet = self.manager.wait_present(target, deadline).ok_or(CallError::WrongClient(target))?;
        self.run_attached(&proclet, method, args)
    }

    /// Runs the method with the migration guard held: thread-count and
    /// RCU reader section bracket the call (§4.1 step 1-3). Any call the
    /// method body makes back into a *different* proclet goes through
    /// [`Self::try_call`]'s detach/reattach dance around this attachment;
    /// a call back into this same proclet (`owner_is(proclet.id)`) just
    /// recurses straight back into `run_attached` with the attachment
    /// left exactly as it is.
    fn run_attached(&self, proclet: &Arc<Proclet>, method: MethodId, args: &[u8]) -> Result<Vec<u8>, CallError> {
        proclet.enter_thread();
        let _reader = proclet.rcu.enter();
        let previous = OWNER.with(|o| o.borrow_mut().replace(Arc::clone(proclet)));

        let start = Instant::now();
        let result = self.invoke_on_stack(proclet, method, args);
        let elapsed_nanos = start.elapsed().as_nanos() as f64;
        proclet.cpu_load.record((elapsed_nanos / CPU_SAMPLE_WINDOW_NANOS).min(1.0));

        OWNER.with(|o| *o.borrow_mut() = previous);
        proclet.exit_thread();
        result
    }

    /// Runs the method body on a stack drawn from this node's cluster
    /// (§4.5), inside a [`ProcletCoroutine`] so a checkpoint the body
    /// hits mid-call (via [`crate::coroutine::yield_current`]) parks it
    /// instead of only ever being able to run to completion. Nothing
    /// currently checkpoints mid-method, so today every call resumes
    /// straight through to [`StepOutcome::Done`] on the first resume;
    /// the loop exists so a future checkpointing method body is already
    /// handled correctly.
    fn invoke_on_stack(&self, proclet: &Arc<Proclet>, method: MethodId, args: &[u8]) -> Result<Vec<u8>, CallError> {
        let stack_handle = self.stack.allocate();
        let stack_bytes = self.stack.local_cluster().stack_len() as usize;

        let methods = Arc::clone(&self.methods);
        let proclet = Arc::clone(proclet);
        let args = args.to_vec();
        let outcome: Arc<Mutex<Option<Result<Vec<u8>, CallError>>>> = Arc::new(Mutex::new(None));
        let outcome_for_body = Arc::clone(&outcome);

        let mut co = ProcletCoroutine::spawn(stack_bytes, move || {
            let result = methods.invoke(&proclet, method, &args);
            *outcome_for_body.lock() = Some(result);
        })
        .expect("allocating a native coroutine stack");

        loop {
            match co.resume() {
                StepOutcome::Checkpoint => continue,
                StepOutcome::Done => break,
            }
        }

        if let Some(handle) = stack_handle {
            self.stack.release(handle);
        }

        outcome
            .lock()
            .take()
            .expect("coroutine body always records an outcome before returning")
    }

    fn call_remote(&self, node: NodeId, target: ProcletId, method: MethodId, args: &[u8]) -> Result<Vec<u8>, CallError> {
        let payload = encode_call_request(target, method, args);
        match self.rpc.call(node, RequestKind::ProcletCall, &payload) {
            Ok(bytes) => Ok(bytes),
            Err(CallError::WrongClient(_)) => Err(CallError::WrongClient(target)),
            Err(other) => Err(other),
        }
    }

    /// Server-side handler for `RequestKind::ProcletCall`, wired into a
    /// [`proclet_rpc::RpcServer`] via the blanket `RequestHandler` impl
    /// for closures.
    pub fn handle_proclet_call(&self, body: &[u8]) -> (WireStatus, Vec<u8>) {
        let Some((target, method, args)) = decode_call_request(body) else {
            return (WireStatus::WrongClient, Vec::new());
        };
        match self.call_local(target, method, args) {
            Ok(bytes) => (WireStatus::Ok, bytes),
            Err(CallError::WrongClient(_)) => (WireStatus::WrongClient, Vec::new()),
            Err(_) => (WireStatus::Timeout, Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proclet_alloc::slab::Slab;
    use proclet_common::StatusTable;
    use proclet_stack::StackCluster;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn node(n: u8) -> NodeId {
        NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 9000)
    }

    fn test_stack_manager(local: NodeId) -> Arc<StackManager> {
        Arc::new(StackManager::new(StackCluster::new(local, 0x2_0000_0000, 64 << 10, 4 << 10)))
    }

    #[test]
    fn jittered_backoff_grows_with_attempt_and_stays_capped() {
        for attempt in 0..10 {
            let d = jittered_backoff(attempt);
            assert!(d.as_millis() <= 200);
        }
        // A later attempt's upper bound should never be tighter than an earlier one's.
        assert!(jittered_backoff(0).as_millis() <= jittered_backoff(4).as_millis() + 1);
    }

    fn engine_with_proclet(local: NodeId, id: ProcletId) -> (Arc<InvocationEngine>, Arc<ProcletManager>) {
        let manager = Arc::new(ProcletManager::new(Arc::new(StatusTable::new(0x1000, 0x1000, 0x100_0000))));
        manager.setup(Arc::new(Proclet::new(id, 16, Arc::new(Slab::new(id.0, 4096, 4)))));

        let controller = Arc::new(ControllerClient::new(Arc::new(RpcClient::new(Duration::from_millis(50))), node(9)));
        controller.note_location(id, local);

        let mut methods = MethodTable::new();
        let counter = Arc::new(AtomicI64::new(0));
        let counter2 = Arc::clone(&counter);
        methods.register(1, move |_p, _args| {
            counter2.fetch_add(1, Ordering::SeqCst);
            vec![7u8]
        });

        let engine = Arc::new(InvocationEngine::new(
            local,
            LpId(1),
            Arc::clone(&manager),
            controller,
            Arc::new(RpcClient::new(Duration::from_millis(50))),
            Arc::new(methods),
            test_stack_manager(local),
        ));
        (engine, manager)
    }

    #[test]
    fn local_call_runs_under_attach_detach() {
        let id = ProcletId(0x1000);
        let (engine, _mgr) = engine_with_proclet(node(1), id);
        let result = engine.call(id, 1, &[]).unwrap();
        assert_eq!(result, vec![7]);
    }

    #[test]
    fn self_call_skips_detach_reattach_without_deadlocking() {
        let id = ProcletId(0x1000);
        let (engine, mgr) = engine_with_proclet(node(1), id);
        OWNER.with(|o| *o.borrow_mut() = Some(mgr.get(id).unwrap()));
        let result = engine.call(id, 1, &[]);
        OWNER.with(|o| *o.borrow_mut() = None);
        assert_eq!(result.unwrap(), vec![7]);
    }

    #[test]
    fn nested_call_to_different_proclet_detaches_outer_first() {
        use std::sync::OnceLock;

        let local = node(1);
        let manager = Arc::new(ProcletManager::new(Arc::new(StatusTable::new(0x1000, 0x1000, 0x100_0000))));
        let id_a = ProcletId(0x1000);
        let id_b = ProcletId(0x2000);
        manager.setup(Arc::new(Proclet::new(id_a, 16, Arc::new(Slab::new(id_a.0, 4096, 4)))));
        manager.setup(Arc::new(Proclet::new(id_b, 16, Arc::new(Slab::new(id_b.0, 4096, 4)))));

        let controller = Arc::new(ControllerClient::new(Arc::new(RpcClient::new(Duration::from_millis(50))), node(9)));
        controller.note_location(id_a, local);
        controller.note_location(id_b, local);

        // Recorded from inside B's method body, i.e. while the thread is
        // actually running nested inside B's call.
        let a_thread_count_during_b = Arc::new(AtomicI64::new(-1));
        let manager_for_b = Arc::clone(&manager);
        let observed = Arc::clone(&a_thread_count_during_b);
        let mut methods = MethodTable::new();
        methods.register(2, move |_p, _args| {
            observed.store(manager_for_b.get(id_a).unwrap().thread_count(), Ordering::SeqCst);
            vec![9u8]
        });

        let engine_cell: Arc<OnceLock<Arc<InvocationEngine>>> = Arc::new(OnceLock::new());
        let engine_cell_for_a = Arc::clone(&engine_cell);
        methods.register(1, move |_p, _args| {
            engine_cell_for_a.get().unwrap().call(id_b, 2, &[]).unwrap();
            vec![1u8]
        });

        let engine = Arc::new(InvocationEngine::new(
            local,
            LpId(1),
            Arc::clone(&manager),
            controller,
            Arc::new(RpcClient::new(Duration::from_millis(50))),
            Arc::new(methods),
            test_stack_manager(local),
        ));
        engine_cell.set(Arc::clone(&engine)).ok().unwrap();

        let result = engine.call(id_a, 1, &[]).unwrap();
        assert_eq!(result, vec![1]);
        assert_eq!(
            a_thread_count_during_b.load(Ordering::SeqCst),
            0,
            "A must be detached (thread count back to zero) while the nested call into B is running"
        );
        assert_eq!(manager.get(id_a).unwrap().thread_count(), 0, "A is reattached once the nested call returns");
        assert!(OWNER.with(|o| o.borrow().is_none()), "thread ends fully detached once the outer call returns");
    }

    #[test]
    fn handle_for_mints_a_handle_carrying_the_right_id() {
        let id = ProcletId(0x1000);
        let (engine, _mgr) = engine_with_proclet(node(1), id);
        let handle = engine.handle_for(id);
        assert_eq!(handle.id(), id);
    }

    #[test]
    fn unresolved_proclet_surfaces_wrong_client_after_retries() {
        let manager = Arc::new(ProcletManager::new(Arc::new(StatusTable::new(0x1000, 0x1000, 0x100_0000))));
        let controller = Arc::new(ControllerClient::new(Arc::new(RpcClient::new(Duration::from_millis(20))), node(9)));
        let engine = InvocationEngine::new(
            node(1),
            LpId(1),
            manager,
            controller,
            Arc::new(RpcClient::new(Duration::from_millis(20))),
            Arc::new(MethodTable::new()),
            test_stack_manager(node(1)),
        )
        .with_retry_budget(1);

        let err = engine.call(ProcletId(0x5000), 1, &[]).unwrap_err();
        assert!(matches!(err, CallError::RetriesExhausted(_, _)));
    }

    #[test]
    fn request_envelope_roundtrips() {
        let encoded = encode_call_request(ProcletId(42), 9, b"hello");
        let (id, method, args) = decode_call_request(&encoded).unwrap();
        assert_eq!(id, ProcletId(42));
        assert_eq!(method, 9);
        assert_eq!(args, b"hello");
    }

    #[test]
    fn server_handler_returns_wrong_client_for_absent_proclet() {
        let id = ProcletId(0x1000);
        let (engine, manager) = engine_with_proclet(node(1), id);
        manager.remove_for_destruction(id);

        let body = encode_call_request(id, 1, &[]);
        let (status, _) = engine.handle_proclet_call(&body);
        assert_eq!(status, WireStatus::WrongClient);
    }
}
