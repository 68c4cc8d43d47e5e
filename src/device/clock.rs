//! Tick clock
//!
//! The Device Manager only needs a monotonically increasing tick counter
//! for statistics and for the wait timeout. The source is injectable so a
//! test harness can drive time explicitly.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::types::Ticks;

/// Monotonic tick source
pub trait TickSource: Send + Sync {
    /// Current tick count
    fn now(&self) -> Ticks;
}

/// Clock that advances one tick every time it is read.
///
/// Busy-wait loops always make forward progress against it, so wait
/// timeouts stay reachable without a host timer.
#[derive(Debug, Default)]
pub struct CountingTicks {
    ticks: AtomicU32,
}

impl CountingTicks {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
        }
    }
}

impl TickSource for CountingTicks {
    fn now(&self) -> Ticks {
        self.ticks.fetch_add(1, Ordering::Relaxed)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualTicks {
    ticks: AtomicU32,
}

impl ManualTicks {
    pub const fn new(start: Ticks) -> Self {
        Self {
            ticks: AtomicU32::new(start),
        }
    }

    pub fn advance(&self, by: Ticks) {
        self.ticks.fetch_add(by, Ordering::Relaxed);
    }

    pub fn set(&self, ticks: Ticks) {
        self.ticks.store(ticks, Ordering::Relaxed);
    }
}

impl TickSource for ManualTicks {
    fn now(&self) -> Ticks {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl<T: TickSource + ?Sized> TickSource for alloc::sync::Arc<T> {
    fn now(&self) -> Ticks {
        (**self).now()
    }
}

/// Host clock in sixtieths of a second since creation
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct MonotonicTicks {
    start: std::time::Instant,
}

#[cfg(feature = "std")]
impl MonotonicTicks {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for MonotonicTicks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl TickSource for MonotonicTicks {
    fn now(&self) -> Ticks {
        let elapsed = self.start.elapsed();
        (elapsed.as_millis() * 60 / 1000) as Ticks
    }
}
