use std::sync::atomic::{AtomicI64, Ordering};

use crate::time::Timestamp;

/// A callback scheduled on a loop's timer service. Runs on the owning
/// loop's thread regardless of which thread scheduled it, so it must be
/// safe to hand off across threads. `FnMut` (not `FnOnce`) because a
/// repeating timer invokes the same callback on every firing.
pub type TimerCallback = Box<dyn FnMut() + Send>;

static NEXT_SEQUENCE: AtomicI64 = AtomicI64::new(1);

fn next_sequence() -> i64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) fn created_count() -> i64 {
    NEXT_SEQUENCE.load(Ordering::Relaxed) - 1
}

/// An internal timer event: a callback plus its expiration and, for
/// repeating timers, the interval it's restarted with.
pub(crate) struct Timer {
    callback: TimerCallback,
    expiration: Timestamp,
    interval: f64,
    repeat: bool,
    sequence: i64,
}

impl Timer {
    pub(crate) fn new(callback: TimerCallback, when: Timestamp, interval: f64) -> Timer {
        Timer {
            callback,
            expiration: when,
            interval,
            repeat: interval > 0.0,
            sequence: next_sequence(),
        }
    }

    pub(crate) fn run(&mut self) {
        (self.callback)();
    }

    pub(crate) fn expiration(&self) -> Timestamp {
        self.expiration
    }

    pub(crate) fn repeat(&self) -> bool {
        self.repeat
    }

    pub(crate) fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Advances expiration by `interval` for a repeating timer, or marks it
    /// invalid (so it won't be reinserted) for a one-shot one.
    pub(crate) fn restart(&mut self, now: Timestamp) {
        self.expiration = if self.repeat {
            now.add_seconds(self.interval)
        } else {
            Timestamp::invalid()
        };
    }
}

/// An opaque identifier returned by `add_timer`, usable to `cancel` it from
/// any thread. The sequence number is globally unique and monotonically
/// increasing for the process lifetime, so it alone disambiguates timers
/// without needing to compare addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) i64);

impl TimerId {
    pub(crate) fn sequence(self) -> i64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic() {
        let a = Timer::new(Box::new(|| {}), Timestamp::now(), 0.0);
        let b = Timer::new(Box::new(|| {}), Timestamp::now(), 0.0);
        assert!(b.sequence() > a.sequence());
    }

    #[test]
    fn interval_above_zero_marks_repeat() {
        let t = Timer::new(Box::new(|| {}), Timestamp::now(), 1.0);
        assert!(t.repeat());
        let t = Timer::new(Box::new(|| {}), Timestamp::now(), 0.0);
        assert!(!t.repeat());
    }

    #[test]
    fn restart_advances_expiration_by_interval_for_repeats() {
        let mut t = Timer::new(Box::new(|| {}), Timestamp::from_micros(0), 2.0);
        let now = Timestamp::from_micros(5_000_000);
        t.restart(now);
        assert_eq!(t.expiration(), now.add_seconds(2.0));
    }

    #[test]
    fn restart_invalidates_expiration_for_one_shot() {
        let mut t = Timer::new(Box::new(|| {}), Timestamp::from_micros(0), 0.0);
        t.restart(Timestamp::now());
        assert!(!t.expiration().is_valid());
    }

    #[test]
    fn run_invokes_callback_every_call() {
        use std::sync::atomic::{AtomicI32, Ordering};
        use std::sync::Arc;

        let count = Arc::new(AtomicI32::new(0));
        let c = count.clone();
        let mut t = Timer::new(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Timestamp::now(),
            1.0,
        );
        t.run();
        t.run();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
