//! Monotonic clock abstraction.
//!
//! All timing goes through a [`Clock`] so that the display, the audio stream
//! and the schedulers can run on the system clock in production and on a
//! deterministic [`ManualClock`] in tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use crate::core::time::Time;

/// Source of monotonic time.
///
/// # Thread Safety
///
/// Implementations are shared across the main thread, the display thread and
/// the audio callback, so they must be `Send + Sync`.
pub trait Clock: Send + Sync {
    /// Current time. Never decreases.
    fn now(&self) -> Time;

    /// Block until `now() >= deadline`.
    fn sleep_until(&self, deadline: Time);
}

/// Wall-clock backed by `std::time::Instant`.
///
/// Times are measured from the moment the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Time {
        Time::from_std(self.origin.elapsed())
    }

    fn sleep_until(&self, deadline: Time) {
        let remaining = deadline - self.now();
        if remaining > Time::ZERO {
            std::thread::sleep(remaining.to_std());
        }
    }
}

/// Deterministic clock for tests and offline runs.
///
/// Each call to [`Clock::now`] returns the current value and then advances the
/// clock by a fixed step, so code that polls in a loop always makes progress.
/// [`Clock::sleep_until`] jumps the clock forward instead of blocking.
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicI64,
    step: AtomicI64,
}

impl ManualClock {
    /// Create a clock starting at `start` that advances by `step` per read.
    pub fn new(start: Time, step: Time) -> Self {
        Self {
            nanos: AtomicI64::new(start.as_nanos()),
            step: AtomicI64::new(step.as_nanos().max(0)),
        }
    }

    /// Current value without advancing.
    pub fn peek(&self) -> Time {
        Time::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    /// Move the clock forward by `delta`. Negative deltas are ignored.
    pub fn advance(&self, delta: Time) {
        if delta > Time::ZERO {
            self.nanos.fetch_add(delta.as_nanos(), Ordering::SeqCst);
        }
    }

    /// Move the clock to `time` if that is later than the current value.
    pub fn set_at_least(&self, time: Time) {
        self.nanos.fetch_max(time.as_nanos(), Ordering::SeqCst);
    }

    pub fn set_step(&self, step: Time) {
        self.step.store(step.as_nanos().max(0), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Time::ZERO, Time::ZERO)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        let step = self.step.load(Ordering::SeqCst);
        Time::from_nanos(self.nanos.fetch_add(step, Ordering::SeqCst))
    }

    fn sleep_until(&self, deadline: Time) {
        self.set_at_least(deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t2 = clock.now();
        assert!(t2 >= t1 + Time::from_millis(1));
    }

    #[test]
    fn test_system_clock_sleep_until() {
        let clock = SystemClock::new();
        let deadline = clock.now() + Time::from_millis(3);
        clock.sleep_until(deadline);
        assert!(clock.now() >= deadline);
    }

    #[test]
    fn test_manual_clock_steps_per_read() {
        let clock = ManualClock::new(Time::from_secs(1), Time::from_micros(10));
        assert_eq!(clock.now(), Time::from_secs(1));
        assert_eq!(clock.now(), Time::from_secs(1) + Time::from_micros(10));
        assert_eq!(clock.peek(), Time::from_secs(1) + Time::from_micros(20));
    }

    #[test]
    fn test_manual_clock_sleep_never_goes_back() {
        let clock = ManualClock::new(Time::from_millis(50), Time::ZERO);
        clock.sleep_until(Time::from_millis(10));
        assert_eq!(clock.now(), Time::from_millis(50));
        clock.sleep_until(Time::from_millis(70));
        assert_eq!(clock.now(), Time::from_millis(70));
        clock.advance(Time::from_millis(5));
        assert_eq!(clock.now(), Time::from_millis(75));
    }
}
