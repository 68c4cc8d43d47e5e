//! Per-device I/O queue
//!
//! FIFO of request ids hanging off a device control entry. The queue only
//! stores keys; the parameter blocks themselves live in the request arena.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::device::async_io::RequestId;
use crate::error::{DeviceError, DeviceResult};

/// Snapshot of a device queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub depth: usize,
    pub max_depth: usize,
    pub paused: bool,
}

/// Bounded FIFO of pending requests for one device
#[derive(Debug)]
pub struct IoQueue {
    entries: VecDeque<RequestId>,
    max_depth: usize,
    paused: bool,
}

impl IoQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_depth,
            paused: false,
        }
    }

    /// Append a request. A full queue or a duplicate id is rejected untouched.
    pub fn enqueue(&mut self, id: RequestId) -> DeviceResult<()> {
        if self.is_full() {
            return Err(DeviceError::QueueOverflow);
        }
        if self.contains(id) {
            return Err(DeviceError::InvalidParameter);
        }
        self.entries.push_back(id);
        Ok(())
    }

    /// Next request to service; nothing comes out of a paused queue
    pub fn dequeue(&mut self) -> Option<RequestId> {
        if self.paused {
            return None;
        }
        self.entries.pop_front()
    }

    /// Unlink a request from anywhere in the queue
    pub fn remove(&mut self, id: RequestId) -> bool {
        match self.entries.iter().position(|&e| e == id) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    /// Take every queued request, oldest first
    pub fn drain(&mut self) -> Vec<RequestId> {
        self.entries.drain(..).collect()
    }

    #[inline]
    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains(&id)
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
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            depth: self.entries.len(),
            max_depth: self.max_depth,
            paused: self.paused,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestId> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::slab::Slab;

    fn ids(n: usize) -> Vec<RequestId> {
        let mut slab = Slab::with_capacity(n);
        (0..n).map(|i| RequestId(slab.insert(i).unwrap())).collect()
    }

    #[test]
    fn test_fifo_order() {
        let ids = ids(3);
        let mut q = IoQueue::new(4);
        for &id in &ids {
            q.enqueue(id).unwrap();
        }
        assert_eq!(q.dequeue(), Some(ids[0]));
        assert_eq!(q.dequeue(), Some(ids[1]));
        assert_eq!(q.dequeue(), Some(ids[2]));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_overflow_leaves_queue_untouched() {
        let ids = ids(3);
        let mut q = IoQueue::new(2);
        q.enqueue(ids[0]).unwrap();
        q.enqueue(ids[1]).unwrap();
        assert_eq!(q.enqueue(ids[2]), Err(DeviceError::QueueOverflow));
        assert_eq!(q.len(), 2);
        assert!(!q.contains(ids[2]));
    }

    #[test]
    fn test_duplicate_rejected() {
        let ids = ids(1);
        let mut q = IoQueue::new(4);
        q.enqueue(ids[0]).unwrap();
        assert_eq!(q.enqueue(ids[0]), Err(DeviceError::InvalidParameter));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_remove_from_middle() {
        let ids = ids(3);
        let mut q = IoQueue::new(4);
        for &id in &ids {
            q.enqueue(id).unwrap();
        }
        assert!(q.remove(ids[1]));
        assert!(!q.remove(ids[1]));
        assert_eq!(q.drain(), vec![ids[0], ids[2]]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_paused_queue_holds_requests() {
        let ids = ids(1);
        let mut q = IoQueue::new(4);
        q.pause();
        q.enqueue(ids[0]).unwrap();
        assert_eq!(q.dequeue(), None);
        assert!(q.status().paused);
        q.resume();
        assert_eq!(q.dequeue(), Some(ids[0]));
    }
}
