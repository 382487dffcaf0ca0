//! Monotonic time sources for bounding compaction.

use core::cell::Cell;

/// A monotonic clock reading in nanoseconds.
///
/// Only differences between readings are meaningful.
pub trait Clock {
    fn now_nanos(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now_nanos(&self) -> u64 {
        (**self).now_nanos()
    }
}

/// [`std::time::Instant`]-backed clock.
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    pub fn new() -> Self {
        Self { origin: std::time::Instant::now() }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// A clock that only moves when told to, for deterministic budgets.
///
/// With a nonzero step, every reading advances the clock by that step
/// after it is taken.
///
/// ```
/// use rmalloc::{Clock, ManualClock};
///
/// let clock = ManualClock::stepping(10);
/// assert_eq!(clock.now_nanos(), 0);
/// assert_eq!(clock.now_nanos(), 10);
///
/// clock.advance(5);
/// assert_eq!(clock.now_nanos(), 25);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
    step: u64,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self { now: Cell::new(0), step: 0 }
    }

    pub const fn stepping(step: u64) -> Self {
        Self { now: Cell::new(0), step }
    }

    pub fn advance(&self, nanos: u64) {
        self.now.set(self.now.get().saturating_add(nanos));
    }

    pub fn set(&self, nanos: u64) {
        self.now.set(nanos);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        let now = self.now.get();
        self.now.set(now.saturating_add(self.step));
        now
    }
}
