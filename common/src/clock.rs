use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Source of millisecond timestamps for liveness checks.
///
/// Every comparison against a worker's heartbeat or progress timestamp goes
/// through this trait, so tests can move time by hand.
pub trait Clock: Send + Sync + Debug {
    /// Current time in milliseconds. Never goes backwards.
    fn now(&self) -> i64;

    /// Hook called at the entry of every transport callback. Does nothing
    /// unless a clock wants to pin the time seen by that callback.
    fn mark_time(&self) {}
}

/// Wall clock anchored at construction and advanced monotonically.
///
/// Anchoring at the Unix epoch keeps [`crate::DEAD`] far in the past.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
    origin_ms: i64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        Self {
            origin: Instant::now(),
            origin_ms,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> i64 {
        self.origin_ms + self.origin.elapsed().as_millis() as i64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move time forward by `millis`.
    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.mark_time();
        assert_eq!(clock.now(), 1_000);

        clock.advance(250);
        assert_eq!(clock.now(), 1_250);

        clock.set(10);
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn monotonic_clock_is_far_from_dead() {
        let clock = MonotonicClock::new();
        let first = clock.now();
        let second = clock.now();

        assert!(second >= first);
        assert!(first - crate::DEAD > 1_000_000);
    }
}
