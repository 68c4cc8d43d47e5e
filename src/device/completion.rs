//! Completion Queue
//!
//! Fixed-capacity circular buffer of finished requests waiting for their
//! completion routines. Entries are pushed from interrupt context and
//! drained only at nesting level zero.
//!
//! Interrupt servicing reserves a slot before it dequeues a request, so a
//! request that has already run always has somewhere to land.

use heapless::Deque;

use crate::device::async_io::RequestId;
use crate::error::{DeviceError, DeviceResult};
use crate::types::Ticks;

/// Completion queue capacity
pub const COMPLETION_QUEUE_CAPACITY: usize = 256;

/// Finished request awaiting delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    pub request: RequestId,
    pub result: DeviceResult<()>,
    pub timestamp: Ticks,
}

impl CompletionEntry {
    pub fn new(request: RequestId, result: DeviceResult<()>, timestamp: Ticks) -> Self {
        Self {
            request,
            result,
            timestamp,
        }
    }
}

/// Bounded completion queue
#[derive(Debug)]
pub struct CompletionQueue {
    entries: Deque<CompletionEntry, COMPLETION_QUEUE_CAPACITY>,
    reserved: usize,
    overflows: u64,
}

impl CompletionQueue {
    pub const fn new() -> Self {
        Self {
            entries: Deque::new(),
            reserved: 0,
            overflows: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        COMPLETION_QUEUE_CAPACITY
    }

    /// Slots neither filled nor reserved
    pub fn available(&self) -> usize {
        COMPLETION_QUEUE_CAPACITY - self.entries.len() - self.reserved
    }

    /// Pushes rejected for lack of space
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Reserve `n` slots for later `push_reserved` calls. A full queue is
    /// left untouched and the overflow recorded.
    pub fn reserve(&mut self, n: usize) -> DeviceResult<()> {
        if self.available() < n {
            self.overflows += 1;
            return Err(DeviceError::QueueOverflow);
        }
        self.reserved += n;
        Ok(())
    }

    /// Give back reserved slots that will not be used
    pub fn unreserve(&mut self, n: usize) {
        self.reserved = self.reserved.saturating_sub(n);
    }

    /// Fill a previously reserved slot
    pub fn push_reserved(&mut self, entry: CompletionEntry) -> DeviceResult<()> {
        self.reserved = self.reserved.saturating_sub(1);
        self.entries.push_back(entry).map_err(|_| {
            self.overflows += 1;
            DeviceError::QueueOverflow
        })
    }

    /// Remove the oldest entry. A popped entry is never seen again.
    pub fn pop(&mut self) -> Option<CompletionEntry> {
        self.entries.pop_front()
    }

    /// Is a completion for `request` waiting to be delivered?
    pub fn is_pending(&self, request: RequestId) -> bool {
        self.entries
            .iter()
            .any(|e| e.request == request)
    }

    /// Drop every entry and reservation, returning how many entries were dropped
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.reserved = 0;
        n
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}
