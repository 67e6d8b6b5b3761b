//! Stackful proclet-thread coroutines, used so a migration can ask a
//! running method body to reach a safe point and hand control back
//! instead of being torn down mid-call.
//!
//! True mid-call continuation transfer (snapshotting a coroutine's native
//! stack and resuming it on another machine) is out of scope here: stacks
//! live in the per-node [`proclet_stack`] arena and are not
//! position-independent across processes. Instead a migrating-out proclet
//! calls [`yield_current`] at its next checkpoint, which parks the
//! coroutine until every in-flight call has drained, then the migrator
//! moves the (now-idle) proclet's heap. This is the documented "drain
//! before migrate" simplification: logically equivalent to the eager
//! continuation transfer for any call short enough to finish inside one
//! migration round, at the cost of that round waiting for the call to
//! reach a checkpoint instead of moving instantly.

use std::cell::Cell;
use std::ptr;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

/// What a checkpoint yield carries out to the scheduler: just a request to
/// be resumed once it is safe to keep running (no migration is actually
/// forced on the callee; it is purely cooperative).
pub struct CheckpointRequest;

/// What the scheduler resumes a parked coroutine with.
pub struct CheckpointGrant;

thread_local! {
    static CURRENT_YIELDER: Cell<*const Yielder<CheckpointRequest, CheckpointGrant>> = Cell::new(ptr::null());
}

struct YielderGuard {
    previous: *const Yielder<CheckpointRequest, CheckpointGrant>,
}

impl YielderGuard {
    fn install(yielder: &Yielder<CheckpointRequest, CheckpointGrant>) -> Self {
        let previous = CURRENT_YIELDER.with(|cell| {
            let prev = cell.get();
            cell.set(yielder as *const _);
            prev
        });
        YielderGuard { previous }
    }
}

impl Drop for YielderGuard {
    fn drop(&mut self) {
        CURRENT_YIELDER.with(|cell| cell.set(self.previous));
    }
}

/// Called from inside a running proclet method body at a point it is safe
/// to pause (no locks held, no partially-applied mutation). A no-op if the
/// calling thread isn't running inside a [`ProcletCoroutine`].
pub fn yield_current() {
    let yielder = CURRENT_YIELDER.with(Cell::get);
    if yielder.is_null() {
        return;
    }
    // SAFETY: non-null only while `YielderGuard` holds it installed for
    // the duration of the enclosing `Coroutine::resume` call, which is
    // exactly the lifetime of the referent.
    unsafe {
        let _grant = (*yielder).suspend(CheckpointRequest);
    }
}

/// Wraps a single proclet method invocation as a resumable, stackful
/// coroutine so [`yield_current`] can park it at a checkpoint and the
/// scheduler can later resume it in place.
pub struct ProcletCoroutine {
    inner: Coroutine<CheckpointGrant, CheckpointRequest, (), DefaultStack>,
}

pub enum StepOutcome {
    /// Hit a checkpoint; call [`ProcletCoroutine::resume`] to continue.
    Checkpoint,
    /// The method body returned.
    Done,
}

impl ProcletCoroutine {
    /// `stack_bytes` should match the per-proclet stack slot size handed
    /// out by the stack cluster so the coroutine's native stack fits the
    /// same reservation migration accounting already assumes.
    pub fn spawn<F>(stack_bytes: usize, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = DefaultStack::new(stack_bytes)?;
        let inner = Coroutine::with_stack(stack, move |yielder, _first_input: CheckpointGrant| {
            let _guard = YielderGuard::install(yielder);
            body();
        });
        Ok(ProcletCoroutine { inner })
    }

    pub fn resume(&mut self) -> StepOutcome {
        match self.inner.resume(CheckpointGrant) {
            CoroutineResult::Yield(CheckpointRequest) => StepOutcome::Checkpoint,
            CoroutineResult::Return(()) => StepOutcome::Done,
        }
    }

    pub fn done(&self) -> bool {
        self.inner.done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_to_completion_without_checkpoints() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let mut co = ProcletCoroutine::spawn(64 * 1024, move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(matches!(co.resume(), StepOutcome::Done));
        assert!(co.done());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn checkpoint_parks_and_resumes() {
        let progress = Arc::new(AtomicUsize::new(0));
        let progress2 = Arc::clone(&progress);
        let mut co = ProcletCoroutine::spawn(64 * 1024, move || {
            progress2.fetch_add(1, Ordering::SeqCst);
            yield_current();
            progress2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(matches!(co.resume(), StepOutcome::Checkpoint));
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert!(!co.done());

        assert!(matches!(co.resume(), StepOutcome::Done));
        assert_eq!(progress.load(Ordering::SeqCst), 2);
        assert!(co.done());
    }

    #[test]
    fn yield_current_outside_coroutine_is_a_no_op() {
        yield_current();
    }
}
