//! Per-proclet logical clock (§4.7).
//!
//! `rdtsc()`/`microtime()` observed inside a proclet return `physical +
//! offset`. Migration rewrites `offset` on the destination so the series of
//! logical timestamps a proclet observes never jumps or runs backwards,
//! even though the underlying physical clock it now runs on started at a
//! different point.
//!
//! There is no real `rdtsc` to read in portable Rust, so "physical" here is
//! nanoseconds since this process's epoch — a monotonic `Instant` fixed the
//! first time any clock is constructed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::Mutex;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn physical_now_nanos() -> i64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as i64
}

/// A timer a proclet thread is sleeping on, carried whole across a
/// migration so the thread (identified opaquely by `thread_token`) wakes
/// at the same logical instant on the destination (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    pub logical_deadline_nanos: i64,
    pub thread_token: u64,
}

pub struct LogicalClock {
    offset_nanos: AtomicI64,
    timers: Mutex<Vec<TimerEntry>>,
}

impl LogicalClock {
    pub fn new() -> Self {
        LogicalClock {
            offset_nanos: AtomicI64::new(0),
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn logical_now_nanos(&self) -> i64 {
        physical_now_nanos() + self.offset_nanos.load(Ordering::Relaxed)
    }

    /// Rebase this clock so that `observed_logical_now` remains the value
    /// this proclet just saw, even though physical time on the new host is
    /// unrelated to physical time on the old one. Call once, right after
    /// migration lands (§4.7).
    pub fn rebase(&self, observed_logical_now_nanos: i64) {
        let new_offset = observed_logical_now_nanos - physical_now_nanos();
        self.offset_nanos.store(new_offset, Ordering::Relaxed);
    }

    pub fn schedule_timer(&self, thread_token: u64, delay_nanos: i64) {
        let deadline = self.logical_now_nanos() + delay_nanos;
        self.timers.lock().push(TimerEntry {
            logical_deadline_nanos: deadline,
            thread_token,
        });
    }

    pub fn cancel_timer(&self, thread_token: u64) -> Option<TimerEntry> {
        let mut timers = self.timers.lock();
        let pos = timers.iter().position(|t| t.thread_token == thread_token)?;
        Some(timers.remove(pos))
    }

    /// Re-insert a timer entry carried over from a migrated-in thread. Its
    /// `logical_deadline_nanos` is preserved verbatim; because this clock's
    /// offset has already been rebased, comparing against `logical_now_nanos`
    /// reproduces the source's "physical_now + (deadline - logical_now)"
    /// re-arm rule without any extra arithmetic here.
    pub fn carry_timer(&self, entry: TimerEntry) {
        self.timers.lock().push(entry);
    }

    /// Drain and return every timer whose logical deadline has passed.
    pub fn take_due_timers(&self) -> Vec<TimerEntry> {
        let mut timers = self.timers.lock();
        let now = self.logical_now_nanos();
        let (due, pending): (Vec<_>, Vec<_>) = timers.drain(..).partition(|t| t.logical_deadline_nanos <= now);
        *timers = pending;
        due
    }

    pub fn pending_timer_count(&self) -> usize {
        self.timers.lock().len()
    }

    /// Drain every timer regardless of whether it is due yet, for transfer
    /// to a migration destination (§4.7 "scheduled timers are cancelled on
    /// source, carried as `{logical_deadline, thread}` pairs").
    pub fn drain_all_timers(&self) -> Vec<TimerEntry> {
        std::mem::take(&mut self.timers.lock())
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_clock_tracks_physical_time() {
        let clock = LogicalClock::new();
        let t0 = clock.logical_now_nanos();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t1 = clock.logical_now_nanos();
        assert!(t1 > t0);
    }

    #[test]
    fn rebase_preserves_observed_value() {
        let clock = LogicalClock::new();
        let observed = clock.logical_now_nanos() + 1_000_000_000;
        clock.rebase(observed);
        let after = clock.logical_now_nanos();
        assert!((after - observed).abs() < 5_000_000, "rebase should land within a few ms of the observed value");
    }

    #[test]
    fn timer_due_after_delay_elapses() {
        let clock = LogicalClock::new();
        clock.schedule_timer(7, 1_000_000); // 1ms
        assert!(clock.take_due_timers().is_empty());
        std::thread::sleep(std::time::Duration::from_millis(5));
        let due = clock.take_due_timers();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].thread_token, 7);
    }

    #[test]
    fn drain_all_timers_takes_pending_and_due_alike() {
        let clock = LogicalClock::new();
        clock.schedule_timer(1, 1_000_000_000);
        clock.schedule_timer(2, -1);
        let drained = clock.drain_all_timers();
        assert_eq!(drained.len(), 2);
        assert_eq!(clock.pending_timer_count(), 0);
    }

    #[test]
    fn carried_timer_respects_rebased_offset() {
        let source = LogicalClock::new();
        source.schedule_timer(1, 10_000_000); // 10ms out, logical
        let entry = source.cancel_timer(1).unwrap();

        let dest = LogicalClock::new();
        // Destination rebases so its logical_now matches source's at hand-off time.
        dest.rebase(source.logical_now_nanos());
        dest.carry_timer(entry);

        assert!(dest.take_due_timers().is_empty());
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert_eq!(dest.take_due_timers().len(), 1);
    }
}
