//! Sliding-window rate limiting for outbound sends
//!
//! Bounds how many sends a channel may attempt within any trailing time
//! window. The window is tracked in a fixed-capacity circular buffer of
//! timestamps sized to the limit, so both memory and per-acquire work stay
//! O(limit) no matter how fast the caller hammers it.

use core::time::Duration;

use crate::types::{SystemTimeSource, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Sliding-Window Rate Limiter
// ----------------------------------------------------------------------------

/// Rate limiter over a trailing time window.
///
/// A `limit` of 0 disables enforcement entirely: every acquisition is
/// permitted and nothing is recorded.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter<T: TimeSource = SystemTimeSource> {
    limit: usize,
    window: Duration,
    /// Circular buffer of acquisition timestamps, capacity == limit
    timestamps: Vec<Timestamp>,
    head: usize,
    len: usize,
    time_source: T,
}

impl SlidingWindowRateLimiter<SystemTimeSource> {
    /// Create a limiter on wall-clock time
    pub fn new(limit: usize, window: Duration) -> Self {
        Self::with_time_source(limit, window, SystemTimeSource::new())
    }
}

impl<T: TimeSource> SlidingWindowRateLimiter<T> {
    /// Create a limiter with an injected time source
    pub fn with_time_source(limit: usize, window: Duration, time_source: T) -> Self {
        Self {
            limit,
            window,
            timestamps: vec![Timestamp::default(); limit],
            head: 0,
            len: 0,
            time_source,
        }
    }

    /// Try to record one send; `false` means the window is full
    pub fn try_acquire(&mut self) -> bool {
        if self.limit == 0 {
            return true;
        }
        let now = self.time_source.now();
        self.evict_expired(now);
        if self.len == self.limit {
            return false;
        }
        let tail = (self.head + self.len) % self.limit;
        self.timestamps[tail] = now;
        self.len += 1;
        true
    }

    /// Number of sends recorded within the current window
    pub fn current_count(&mut self) -> usize {
        if self.limit == 0 {
            return 0;
        }
        let now = self.time_source.now();
        self.evict_expired(now);
        self.len
    }

    /// How many more sends the current window permits
    pub fn remaining_capacity(&mut self) -> usize {
        if self.limit == 0 {
            return usize::MAX;
        }
        self.limit - self.current_count()
    }

    /// Whether the window is currently full
    pub fn is_limited(&mut self) -> bool {
        self.limit != 0 && self.current_count() == self.limit
    }

    /// Drop all recorded sends
    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Configured limit (0 = disabled)
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Configured window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Advance the head past entries that have aged out of the window
    fn evict_expired(&mut self, now: Timestamp) {
        let window_ms = self.window.as_millis() as u64;
        while self.len > 0 {
            let age = now
                .as_millis()
                .saturating_sub(self.timestamps[self.head].as_millis());
            if age < window_ms {
                break;
            }
            self.head = (self.head + 1) % self.limit;
            self.len -= 1;
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Manually driven clock for deterministic window tests
    #[derive(Clone)]
    struct ManualTimeSource(Rc<Cell<u64>>);

    impl ManualTimeSource {
        fn new() -> Self {
            Self(Rc::new(Cell::new(0)))
        }

        fn advance(&self, millis: u64) {
            self.0.set(self.0.get() + millis);
        }
    }

    impl TimeSource for ManualTimeSource {
        fn now(&self) -> Timestamp {
            Timestamp::from_millis(self.0.get())
        }
    }

    #[test]
    fn test_limit_enforced_within_window() {
        let clock = ManualTimeSource::new();
        let mut limiter =
            SlidingWindowRateLimiter::with_time_source(3, Duration::from_millis(1000), clock);

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.current_count(), 3);
        assert_eq!(limiter.remaining_capacity(), 0);
        assert!(limiter.is_limited());
    }

    #[test]
    fn test_capacity_returns_after_window_elapses() {
        let clock = ManualTimeSource::new();
        let mut limiter = SlidingWindowRateLimiter::with_time_source(
            3,
            Duration::from_millis(1000),
            clock.clone(),
        );

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        clock.advance(1000);
        assert!(!limiter.is_limited());
        assert!(limiter.try_acquire());
        assert_eq!(limiter.current_count(), 1);
    }

    #[test]
    fn test_window_slides_rather_than_resets() {
        let clock = ManualTimeSource::new();
        let mut limiter = SlidingWindowRateLimiter::with_time_source(
            2,
            Duration::from_millis(1000),
            clock.clone(),
        );

        assert!(limiter.try_acquire()); // t=0
        clock.advance(600);
        assert!(limiter.try_acquire()); // t=600
        assert!(!limiter.try_acquire());

        // t=1100: the t=0 entry has aged out, the t=600 entry has not
        clock.advance(500);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_zero_limit_disables_enforcement() {
        let clock = ManualTimeSource::new();
        let mut limiter =
            SlidingWindowRateLimiter::with_time_source(0, Duration::from_millis(1000), clock);

        for _ in 0..10_000 {
            assert!(limiter.try_acquire());
        }
        assert_eq!(limiter.current_count(), 0);
        assert!(!limiter.is_limited());
        assert_eq!(limiter.remaining_capacity(), usize::MAX);
    }

    #[test]
    fn test_reset_clears_window() {
        let clock = ManualTimeSource::new();
        let mut limiter =
            SlidingWindowRateLimiter::with_time_source(2, Duration::from_millis(1000), clock);

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.is_limited());

        limiter.reset();
        assert_eq!(limiter.current_count(), 0);
        assert!(limiter.try_acquire());
    }
}
