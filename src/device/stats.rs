//! Device Manager counters
//!
//! Named atomic event counters, plus plain snapshot structs handed out to
//! callers.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter
// ============================================================================

/// Named event counter (atomically updated)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Raise the counter to `v` if it is currently lower
    #[inline]
    pub fn max(&self, v: u64) {
        self.value.fetch_max(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// I/O Counters
// ============================================================================

/// Aggregate I/O statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    pub opens: u64,
    pub closes: u64,
    pub reads: u64,
    pub writes: u64,
    pub controls: u64,
    pub statuses: u64,
    pub kills: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
    /// Queued requests dropped by a kill
    pub discarded: u64,
    /// Requests completed as canceled by cancel or flush
    pub canceled: u64,
}

#[derive(Debug)]
pub(crate) struct DeviceCounters {
    pub opens: Counter,
    pub closes: Counter,
    pub reads: Counter,
    pub writes: Counter,
    pub controls: Counter,
    pub statuses: Counter,
    pub kills: Counter,
    pub bytes_read: Counter,
    pub bytes_written: Counter,
    pub errors: Counter,
    pub discarded: Counter,
    pub canceled: Counter,
}

impl DeviceCounters {
    pub const fn new() -> Self {
        Self {
            opens: Counter::new("opens"),
            closes: Counter::new("closes"),
            reads: Counter::new("reads"),
            writes: Counter::new("writes"),
            controls: Counter::new("controls"),
            statuses: Counter::new("statuses"),
            kills: Counter::new("kills"),
            bytes_read: Counter::new("bytes_read"),
            bytes_written: Counter::new("bytes_written"),
            errors: Counter::new("errors"),
            discarded: Counter::new("discarded"),
            canceled: Counter::new("canceled"),
        }
    }

    pub fn snapshot(&self) -> DeviceStats {
        DeviceStats {
            opens: self.opens.get(),
            closes: self.closes.get(),
            reads: self.reads.get(),
            writes: self.writes.get(),
            controls: self.controls.get(),
            statuses: self.statuses.get(),
            kills: self.kills.get(),
            bytes_read: self.bytes_read.get(),
            bytes_written: self.bytes_written.get(),
            errors: self.errors.get(),
            discarded: self.discarded.get(),
            canceled: self.canceled.get(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.opens,
            &self.closes,
            &self.reads,
            &self.writes,
            &self.controls,
            &self.statuses,
            &self.kills,
            &self.bytes_read,
            &self.bytes_written,
            &self.errors,
            &self.discarded,
            &self.canceled,
        ] {
            counter.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new("test");
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);
        c.max(3);
        assert_eq!(c.get(), 5);
        c.max(9);
        assert_eq!(c.get(), 9);
        c.reset();
        assert_eq!(c.get(), 0);
        assert_eq!(c.name(), "test");
    }

    #[test]
    fn test_snapshot() {
        let counters = DeviceCounters::new();
        counters.reads.inc();
        counters.bytes_read.add(512);
        let snap = counters.snapshot();
        assert_eq!(snap.reads, 1);
        assert_eq!(snap.bytes_read, 512);
        counters.reset();
        assert_eq!(counters.snapshot(), DeviceStats::default());
    }
}
