//! Monotonic millisecond clocks, used for cache lifetimes, burst detection
//! and rate limiting.

use core::sync::atomic::{AtomicU64, Ordering};

/// A monotonic source of time in milliseconds.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// `CLOCK_MONOTONIC` through `clock_gettime(2)`.
#[cfg(all(feature = "system-backed", unix))]
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

#[cfg(all(feature = "system-backed", unix))]
impl MonotonicClock {
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(all(feature = "system-backed", unix))]
impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };

        if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
            return 0;
        }

        ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
    }
}

/// A clock that only moves when told to. Useful for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub const fn new(start_ms: u64) -> Self {
        Self(AtomicU64::new(start_ms))
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl<C: Clock> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Sentinel for "never happened".
pub(crate) const NEVER: u64 = u64::MAX;

/// Lets an action through at most once per period.
#[derive(Debug)]
pub(crate) struct RateLimit {
    last: AtomicU64,
}

impl RateLimit {
    pub const fn new() -> Self {
        Self { last: AtomicU64::new(NEVER) }
    }

    /// Returns whether the action may run at `now`, and if so records it.
    pub fn try_begin(&self, now: u64, period_ms: u64) -> bool {
        let last = self.last.load(Ordering::Relaxed);

        if last != NEVER && now.saturating_sub(last) < period_ms {
            return false;
        }

        self.last.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed).is_ok()
    }

    pub fn last(&self) -> Option<u64> {
        match self.last.load(Ordering::Relaxed) {
            NEVER => None,
            t => Some(t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_respects_period() {
        let clock = ManualClock::new(5);
        let limit = RateLimit::new();

        assert_eq!(limit.last(), None);
        assert!(limit.try_begin(clock.now_ms(), 1000));
        assert!(!limit.try_begin(clock.now_ms(), 1000));

        clock.advance(999);
        assert!(!limit.try_begin(clock.now_ms(), 1000));

        clock.advance(1);
        assert!(limit.try_begin(clock.now_ms(), 1000));
        assert_eq!(limit.last(), Some(1005));
    }

    #[cfg(all(feature = "system-backed", unix))]
    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();
        let a = clock.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now_ms() >= a + 4);
    }
}
