//! Registry of a proclet's blocked threads.
//!
//! A proclet method can block its coroutine on a proclet-local mutex or
//! condvar. Migration has to carry that fact along: the destination needs
//! to know which logical threads were parked, on what, so it can re-arm
//! the same wait once the heap lands instead of losing the wakeup.

use rustc_hash::FxHashMap;
use parking_lot::Mutex;

/// What a parked thread is waiting for, identified by the id of the
/// proclet-local mutex/condvar/channel it is blocked on. Opaque past that:
/// the invocation engine on the destination re-associates it with the
/// live object once the heap copy finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Mutex { resource_id: u64 },
    Condvar { resource_id: u64 },
    /// Parked on a logical-clock timer; see [`crate::clock::TimerEntry`].
    Timer,
}

pub struct BlockedSyncer {
    blocked: Mutex<FxHashMap<u64, BlockReason>>,
}

impl BlockedSyncer {
    pub fn new() -> Self {
        BlockedSyncer {
            blocked: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn park(&self, thread_token: u64, reason: BlockReason) {
        self.blocked.lock().insert(thread_token, reason);
    }

    /// Called when a thread actually wakes up on its own (lock acquired,
    /// condvar signalled, timer fired) rather than via migration transfer.
    pub fn unpark(&self, thread_token: u64) -> Option<BlockReason> {
        self.blocked.lock().remove(&thread_token)
    }

    pub fn is_blocked(&self, thread_token: u64) -> bool {
        self.blocked.lock().contains_key(&thread_token)
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.lock().len()
    }

    /// Drain the whole table for migration hand-off. The destination's
    /// [`BlockedSyncer`] is repopulated with these entries via
    /// [`Self::restore`] once the heap copy lands.
    pub fn drain_for_migration(&self) -> Vec<(u64, BlockReason)> {
        self.blocked.lock().drain().collect()
    }

    pub fn restore(&self, entries: Vec<(u64, BlockReason)>) {
        let mut blocked = self.blocked.lock();
        for (token, reason) in entries {
            blocked.insert(token, reason);
        }
    }
}

impl Default for BlockedSyncer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn park_and_unpark_roundtrip() {
        let syncer = BlockedSyncer::new();
        syncer.park(1, BlockReason::Mutex { resource_id: 9 });
        assert!(syncer.is_blocked(1));
        assert_eq!(syncer.unpark(1), Some(BlockReason::Mutex { resource_id: 9 }));
        assert!(!syncer.is_blocked(1));
    }

    #[test]
    fn migration_drain_and_restore_preserves_entries() {
        let src = BlockedSyncer::new();
        src.park(1, BlockReason::Condvar { resource_id: 3 });
        src.park(2, BlockReason::Timer);
        assert_eq!(src.blocked_count(), 2);

        let carried = src.drain_for_migration();
        assert_eq!(src.blocked_count(), 0);

        let dest = BlockedSyncer::new();
        dest.restore(carried);
        assert_eq!(dest.blocked_count(), 2);
        assert!(dest.is_blocked(1));
        assert!(dest.is_blocked(2));
    }
}
