//! Per-proclet RCU-style execution lock.
//!
//! Every invocation of a proclet method takes a reader section for its
//! whole duration. Migration's heap-copy step needs a moment where no
//! reader is inside the proclet so copying its slab-backed state is safe;
//! it takes a writer section to get that moment, blocking new readers
//! until the copy completes rather than reference-counting individual
//! objects.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Condvar, Mutex};

pub struct RcuLock {
    readers: AtomicI64,
    quiescing: Mutex<bool>,
    quiesced: Condvar,
    resumed: Condvar,
}

/// Held for the duration of one method invocation.
pub struct ReaderGuard<'a> {
    lock: &'a RcuLock,
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.lock.manual_exit();
    }
}

/// Held by the migrator while it copies a proclet's heap; while held, no
/// new reader section can begin.
pub struct WriterGuard<'a> {
    lock: &'a RcuLock,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        *self.lock.quiescing.lock() = false;
        self.lock.resumed.notify_all();
    }
}

impl RcuLock {
    pub fn new() -> Self {
        RcuLock {
            readers: AtomicI64::new(0),
            quiescing: Mutex::new(false),
            quiesced: Condvar::new(),
            resumed: Condvar::new(),
        }
    }

    /// Enter a reader section, blocking while a writer is quiescing the
    /// proclet for migration.
    pub fn enter(&self) -> ReaderGuard<'_> {
        self.manual_enter();
        ReaderGuard { lock: self }
    }

    /// Same reader-section entry as [`Self::enter`], without a guard to
    /// drop it for you. Paired with [`Self::manual_exit`] for the
    /// detach/reattach dance around a nested cross-proclet call (§4.1
    /// step 2), where the reader section has to be released and
    /// re-acquired within the same stack frame that's still holding a
    /// live [`ReaderGuard`] for the outer call.
    pub fn manual_enter(&self) {
        loop {
            let mut quiescing = self.quiescing.lock();
            if !*quiescing {
                self.readers.fetch_add(1, Ordering::AcqRel);
                return;
            }
            self.resumed.wait(&mut quiescing);
        }
    }

    /// The other half of [`Self::manual_enter`].
    pub fn manual_exit(&self) {
        let prev = self.readers.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.quiesced.notify_all();
        }
    }

    pub fn reader_count(&self) -> i64 {
        self.readers.load(Ordering::Acquire)
    }

    /// Block new readers and wait for in-flight ones to finish. Returns a
    /// guard that, once dropped, lets blocked readers back in.
    pub fn sync(&self) -> WriterGuard<'_> {
        let mut quiescing = self.quiescing.lock();
        *quiescing = true;
        while self.readers.load(Ordering::Acquire) > 0 {
            self.quiesced.wait(&mut quiescing);
        }
        WriterGuard { lock: self }
    }
}

impl Default for RcuLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_do_not_block_each_other() {
        let lock = RcuLock::new();
        let g1 = lock.enter();
        let g2 = lock.enter();
        assert_eq!(lock.reader_count(), 2);
        drop(g1);
        drop(g2);
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn sync_waits_for_in_flight_reader() {
        let lock = Arc::new(RcuLock::new());
        let reader_lock = Arc::clone(&lock);
        let guard = reader_lock.enter();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let writer_lock = Arc::clone(&lock);
        thread::spawn(move || {
            let _w = writer_lock.sync();
            done_tx.send(()).unwrap();
        });

        // Writer should still be blocked a moment later.
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(guard);
        done_rx.recv_timeout(Duration::from_millis(500)).expect("writer unblocks once reader leaves");
    }

    #[test]
    fn new_reader_blocks_while_quiescing() {
        let lock = Arc::new(RcuLock::new());
        let writer_lock = Arc::clone(&lock);
        let w = writer_lock.sync();

        let reader_lock = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let _g = reader_lock.enter();
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());
        drop(w);
        handle.join().unwrap();
    }
}
