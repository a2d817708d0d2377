//! Time sources.
//!
//! Coordinators never read the system clock directly. They read a
//! [`TimeSource`]: [`SystemClock`] in production, [`SimClock`] under
//! simulation, where time only moves when the scheduler or a test moves it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of "now" in epoch milliseconds.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Simulated clock with nanosecond precision.
///
/// Time never moves backwards. Advancing is safe from any thread, but a
/// deterministic run should let only the scheduler advance it.
#[derive(Debug)]
pub struct SimClock {
    now_ns: AtomicU64,
}

/// Leave headroom so advances cannot overflow.
const TIME_NS_MAX: u64 = u64::MAX - 1_000_000_000_000;

impl SimClock {
    /// Create a clock at time 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_start_time_ms(0)
    }

    /// Create a clock at the given epoch millisecond.
    #[must_use]
    pub fn with_start_time_ms(start_ms: u64) -> Self {
        let start_ns = start_ms.saturating_mul(1_000_000);
        debug_assert!(start_ns <= TIME_NS_MAX, "Start time too large");
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    #[must_use]
    pub fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.now_ns() / 1_000_000
    }

    /// Advance by `delta`.
    pub fn advance(&self, delta: Duration) {
        let delta_ns = delta.as_nanos().min(u128::from(u64::MAX)) as u64;
        let current = self.now_ns.load(Ordering::Acquire);
        debug_assert!(
            current <= TIME_NS_MAX.saturating_sub(delta_ns),
            "Time advance would overflow"
        );
        self.now_ns.fetch_add(delta_ns, Ordering::AcqRel);
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.advance(Duration::from_millis(delta_ms));
    }

    /// Move time forward to `target_ns`. Earlier targets are ignored.
    pub fn advance_to_ns(&self, target_ns: u64) {
        self.now_ns.fetch_max(target_ns, Ordering::AcqRel);
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SimClock {
    fn now_ms(&self) -> u64 {
        SimClock::now_ms(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_where_told() {
        assert_eq!(SimClock::new().now_ns(), 0);
        assert_eq!(SimClock::with_start_time_ms(1_500).now_ms(), 1_500);
    }

    #[test]
    fn test_advance() {
        let clock = SimClock::new();
        clock.advance_ms(100);
        clock.advance(Duration::from_micros(500));
        assert_eq!(clock.now_ns(), 100_500_000);
        assert_eq!(clock.now_ms(), 100);
    }

    #[test]
    fn test_advance_to_never_goes_back() {
        let clock = SimClock::with_start_time_ms(10);
        clock.advance_to_ns(5_000_000);
        assert_eq!(clock.now_ms(), 10);

        clock.advance_to_ns(25_000_000);
        assert_eq!(clock.now_ms(), 25);
    }

    #[test]
    fn test_system_clock_is_past_2020() {
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}
