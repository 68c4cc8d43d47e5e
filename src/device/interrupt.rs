//! Interrupt Simulator
//!
//! Priority-ordered handler chains, a nesting counter, and an explicit
//! queue of posted interrupts driven by the host or a test harness.
//!
//! Raising an interrupt walks priorities 7 down to 0. Each enabled handler
//! of the raised class services one pending request on its device and
//! queues the completion. Completions are delivered only when the nesting
//! level returns to zero.
//!
//! Periodic handlers each keep their own deadline. A periodic trigger
//! services only the handlers that are due; timer handlers registered
//! without a period run only when the timer class is raised explicitly.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use heapless::Deque;
use log::{trace, warn};
use spin::Mutex;

use crate::device::slab::{Slab, SlabKey};
use crate::device::stats::Counter;
use crate::device::DeviceManager;
use crate::error::{DeviceError, DeviceResult};
use crate::types::{RefNum, Ticks};

/// Number of priority levels
pub const PRIORITY_LEVELS: usize = 8;

/// Highest priority; larger requests are clamped
pub const MAX_PRIORITY: u8 = (PRIORITY_LEVELS - 1) as u8;

/// Interrupts that can be posted but not yet delivered
pub const POSTED_INTERRUPT_CAPACITY: usize = 64;

// ============================================================================
// Interrupt Classes
// ============================================================================

/// Interrupt source class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InterruptClass {
    Disk = 1,
    Network = 2,
    Serial = 3,
    Timer = 4,
    Via = 5,
    Scc = 6,
    Scsi = 7,
    Custom = 8,
}

impl InterruptClass {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Disk),
            2 => Some(Self::Network),
            3 => Some(Self::Serial),
            4 => Some(Self::Timer),
            5 => Some(Self::Via),
            6 => Some(Self::Scc),
            7 => Some(Self::Scsi),
            8 => Some(Self::Custom),
            _ => None,
        }
    }

    /// Priority used when a registration does not name one
    pub const fn default_priority(self) -> u8 {
        match self {
            Self::Timer => 7,
            Self::Scsi | Self::Disk => 6,
            Self::Network | Self::Serial => 5,
            Self::Via | Self::Scc => 4,
            Self::Custom => 3,
        }
    }
}

// ============================================================================
// Handler Registry
// ============================================================================

/// Interrupt handler key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(SlabKey);

/// Registered handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptHandler {
    pub ref_num: RefNum,
    pub class: InterruptClass,
    /// 0..=7, higher runs first
    pub priority: u8,
    pub enabled: bool,
    /// Interrupts delivered to this handler
    pub count: u64,
    /// Periodic interval in ticks, if the handler is timer driven
    pub period: Option<Ticks>,
    /// Tick at which the periodic handler is next due
    pub next_due: Ticks,
    next: Option<HandlerId>,
}

/// Handlers chained per priority level
#[derive(Debug)]
pub struct HandlerRegistry {
    handlers: Slab<InterruptHandler>,
    chains: [Option<HandlerId>; PRIORITY_LEVELS],
}

impl HandlerRegistry {
    pub const fn new(max_handlers: usize) -> Self {
        Self {
            handlers: Slab::with_capacity(max_handlers),
            chains: [None; PRIORITY_LEVELS],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Add a handler at the head of its priority chain. One handler per device.
    pub fn register(&mut self, ref_num: RefNum, class: InterruptClass, priority: u8) -> DeviceResult<HandlerId> {
        if self.find(ref_num).is_some() {
            return Err(DeviceError::DuplicateHandler);
        }
        let priority = priority.min(MAX_PRIORITY);
        let level = priority as usize;
        let handler = InterruptHandler {
            ref_num,
            class,
            priority,
            enabled: true,
            count: 0,
            period: None,
            next_due: 0,
            next: self.chains[level],
        };
        let key = self
            .handlers
            .insert(handler)
            .map_err(|_| DeviceError::OutOfMemory)?;
        let id = HandlerId(key);
        self.chains[level] = Some(id);
        Ok(id)
    }

    pub fn find(&self, ref_num: RefNum) -> Option<HandlerId> {
        self.handlers
            .iter()
            .find(|(_, h)| h.ref_num == ref_num)
            .map(|(key, _)| HandlerId(key))
    }

    pub fn get(&self, ref_num: RefNum) -> Option<&InterruptHandler> {
        self.handlers.get(self.find(ref_num)?.0)
    }

    fn get_mut(&mut self, ref_num: RefNum) -> Option<&mut InterruptHandler> {
        let id = self.find(ref_num)?;
        self.handlers.get_mut(id.0)
    }

    /// Unlink and drop the handler for `ref_num`
    pub fn unregister(&mut self, ref_num: RefNum) -> DeviceResult<InterruptHandler> {
        let id = self.find(ref_num).ok_or(DeviceError::HandlerNotFound)?;
        let (level, next) = match self.handlers.get(id.0) {
            Some(h) => (h.priority as usize, h.next),
            None => return Err(DeviceError::HandlerNotFound),
        };

        if self.chains[level] == Some(id) {
            self.chains[level] = next;
        } else {
            let mut cursor = self.chains[level];
            while let Some(at) = cursor {
                let Some(h) = self.handlers.get_mut(at.0) else {
                    break;
                };
                if h.next == Some(id) {
                    h.next = next;
                    break;
                }
                cursor = h.next;
            }
        }

        self.handlers.remove(id.0).ok_or(DeviceError::HandlerNotFound)
    }

    pub fn set_enabled(&mut self, ref_num: RefNum, enabled: bool) -> DeviceResult<()> {
        let h = self.get_mut(ref_num).ok_or(DeviceError::HandlerNotFound)?;
        h.enabled = enabled;
        Ok(())
    }

    /// Set or clear a handler's period, counting the first deadline from `now`
    pub fn set_period(&mut self, ref_num: RefNum, period: Option<Ticks>, now: Ticks) -> DeviceResult<()> {
        let h = self.get_mut(ref_num).ok_or(DeviceError::HandlerNotFound)?;
        h.period = period;
        h.next_due = period.map_or(0, |p| now.wrapping_add(p));
        Ok(())
    }

    /// Devices whose enabled handlers match `class`, in delivery order.
    /// Each matching handler's count is bumped.
    pub fn fire(&mut self, class: InterruptClass) -> Vec<RefNum> {
        let mut hits = Vec::new();
        for level in (0..PRIORITY_LEVELS).rev() {
            let mut cursor = self.chains[level];
            while let Some(id) = cursor {
                let Some(h) = self.handlers.get_mut(id.0) else {
                    break;
                };
                if h.enabled && h.class == class {
                    h.count += 1;
                    hits.push(h.ref_num);
                }
                cursor = h.next;
            }
        }
        hits
    }

    /// Devices whose enabled periodic handlers are due at `now`, in delivery
    /// order. Each one is counted and its deadline pushed out by its period.
    pub fn fire_due(&mut self, now: Ticks) -> Vec<RefNum> {
        let mut hits = Vec::new();
        for level in (0..PRIORITY_LEVELS).rev() {
            let mut cursor = self.chains[level];
            while let Some(id) = cursor {
                let Some(h) = self.handlers.get_mut(id.0) else {
                    break;
                };
                if let Some(period) = h.period {
                    if h.enabled && now.wrapping_sub(h.next_due) as i32 >= 0 {
                        h.count += 1;
                        h.next_due = now.wrapping_add(period);
                        hits.push(h.ref_num);
                    }
                }
                cursor = h.next;
            }
        }
        hits
    }

    /// Devices chained at one priority level, head first
    pub fn chain(&self, priority: u8) -> Vec<RefNum> {
        let mut out = Vec::new();
        let mut cursor = self.chains[priority.min(MAX_PRIORITY) as usize];
        while let Some(id) = cursor {
            let Some(h) = self.handlers.get(id.0) else {
                break;
            };
            out.push(h.ref_num);
            cursor = h.next;
        }
        out
    }

    pub fn clear(&mut self) -> usize {
        self.chains = [None; PRIORITY_LEVELS];
        self.handlers.clear().len()
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Interrupt statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptStats {
    pub total: u64,
    /// Handler invocations
    pub handled: u64,
    /// Interrupts no enabled handler claimed
    pub spurious: u64,
    pub completions_queued: u64,
    pub completions_delivered: u64,
    pub queue_overflows: u64,
    pub max_nesting: u64,
}

#[derive(Debug)]
pub(crate) struct InterruptCounters {
    pub total: Counter,
    pub handled: Counter,
    pub spurious: Counter,
    pub completions_queued: Counter,
    pub completions_delivered: Counter,
    pub queue_overflows: Counter,
    pub max_nesting: Counter,
}

/// Interrupt state owned by a device manager
#[derive(Debug)]
pub struct InterruptController {
    registry: Mutex<HandlerRegistry>,
    posted: Mutex<Deque<InterruptClass, POSTED_INTERRUPT_CAPACITY>>,
    enabled: AtomicBool,
    nesting: AtomicU32,
    pub(crate) counters: InterruptCounters,
}

impl InterruptController {
    pub fn new(max_handlers: usize) -> Self {
        Self {
            registry: Mutex::new(HandlerRegistry::new(max_handlers)),
            posted: Mutex::new(Deque::new()),
            enabled: AtomicBool::new(false),
            nesting: AtomicU32::new(0),
            counters: InterruptCounters {
                total: Counter::new("total"),
                handled: Counter::new("handled"),
                spurious: Counter::new("spurious"),
                completions_queued: Counter::new("completions_queued"),
                completions_delivered: Counter::new("completions_delivered"),
                queue_overflows: Counter::new("queue_overflows"),
                max_nesting: Counter::new("max_nesting"),
            },
        }
    }

    #[inline]
    pub fn nesting(&self) -> u32 {
        self.nesting.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Enter interrupt context, returning the new nesting level
    pub(crate) fn enter(&self) -> u32 {
        let level = self.nesting.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.max_nesting.max(u64::from(level));
        level
    }

    /// Leave interrupt context, returning the new nesting level
    pub(crate) fn exit(&self) -> u32 {
        let prev = self.nesting.fetch_sub(1, Ordering::AcqRel);
        prev.saturating_sub(1)
    }

    pub(crate) fn registry(&self) -> spin::MutexGuard<'_, HandlerRegistry> {
        self.registry.lock()
    }

    pub fn stats(&self) -> InterruptStats {
        let c = &self.counters;
        InterruptStats {
            total: c.total.get(),
            handled: c.handled.get(),
            spurious: c.spurious.get(),
            completions_queued: c.completions_queued.get(),
            completions_delivered: c.completions_delivered.get(),
            queue_overflows: c.queue_overflows.get(),
            max_nesting: c.max_nesting.get(),
        }
    }

    /// Drop handlers and posted interrupts
    pub(crate) fn reset(&self) {
        self.registry.lock().clear();
        self.posted.lock().clear();
    }
}

/// Nested interrupt context. Dropping the outermost scope delivers any
/// completions queued inside it.
pub struct InterruptScope<'a> {
    manager: &'a DeviceManager,
}

impl Drop for InterruptScope<'_> {
    fn drop(&mut self) {
        if self.manager.interrupts.exit() == 0 {
            self.manager.process_completions();
        }
    }
}

// ============================================================================
// Device Manager Interrupt Interface
// ============================================================================

impl DeviceManager {
    /// Register a handler for an installed device. `None` picks the class default priority.
    pub fn register_interrupt(
        &self,
        ref_num: RefNum,
        class: InterruptClass,
        priority: Option<u8>,
    ) -> DeviceResult<HandlerId> {
        self.ensure_initialized()?;
        if !self.units.lock().is_allocated(ref_num) {
            return Err(DeviceError::BadRefNum);
        }
        let priority = priority.unwrap_or_else(|| class.default_priority());
        let id = self.interrupts.registry().register(ref_num, class, priority)?;
        trace!("interrupt handler {} class {:?} priority {}", ref_num, class, priority.min(MAX_PRIORITY));
        Ok(id)
    }

    pub fn unregister_interrupt(&self, ref_num: RefNum) -> DeviceResult<()> {
        self.ensure_initialized()?;
        self.interrupts.registry().unregister(ref_num)?;
        Ok(())
    }

    pub fn enable_interrupt(&self, ref_num: RefNum, enabled: bool) -> DeviceResult<()> {
        self.ensure_initialized()?;
        self.interrupts.registry().set_enabled(ref_num, enabled)
    }

    /// Handler registered for a device
    pub fn interrupt_handler(&self, ref_num: RefNum) -> Option<InterruptHandler> {
        self.interrupts.registry().get(ref_num).cloned()
    }

    /// Interrupts delivered to a device's handler
    pub fn interrupt_count(&self, ref_num: RefNum) -> u64 {
        self.interrupts
            .registry()
            .get(ref_num)
            .map_or(0, |h| h.count)
    }

    /// Devices chained at a priority level, head first
    pub fn interrupt_chain(&self, priority: u8) -> Vec<RefNum> {
        self.interrupts.registry().chain(priority)
    }

    pub fn set_interrupts_enabled(&self, enabled: bool) {
        self.interrupts.set_enabled(enabled);
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.is_enabled()
    }

    #[inline]
    pub fn interrupt_nesting(&self) -> u32 {
        self.interrupts.nesting()
    }

    #[inline]
    pub fn in_interrupt(&self) -> bool {
        self.interrupts.nesting() > 0
    }

    pub fn interrupt_stats(&self) -> InterruptStats {
        self.interrupts.stats()
    }

    /// Run `raise_interrupt` semantics for one class.
    ///
    /// Disabled interrupt processing makes this a no-op.
    pub fn raise_interrupt(&self, class: InterruptClass) -> DeviceResult<()> {
        self.ensure_initialized()?;
        if !self.interrupts.is_enabled() {
            return Ok(());
        }

        let counters = &self.interrupts.counters;
        counters.total.inc();
        let level = self.interrupts.enter();

        let targets = self.interrupts.registry().fire(class);
        if targets.is_empty() {
            counters.spurious.inc();
            warn!("spurious {:?} interrupt at level {}", class, level);
        }
        self.run_handlers(targets);
        Ok(())
    }

    /// Service each target device, then leave the level entered by the caller
    fn run_handlers(&self, targets: Vec<RefNum>) {
        for ref_num in targets {
            self.interrupts.counters.handled.inc();
            self.service_device(ref_num);
        }
        if self.interrupts.exit() == 0 {
            self.process_completions();
        }
    }

    /// Raise the class registered for a device
    pub fn inject_test_interrupt(&self, ref_num: RefNum) -> DeviceResult<()> {
        self.ensure_initialized()?;
        let class = self.interrupts.registry().get(ref_num).map(|h| h.class);
        match class {
            Some(class) => self.raise_interrupt(class),
            None => {
                self.interrupts.counters.spurious.inc();
                Err(DeviceError::HandlerNotFound)
            }
        }
    }

    /// Queue an interrupt for later delivery
    pub fn post_interrupt(&self, class: InterruptClass) -> DeviceResult<()> {
        self.ensure_initialized()?;
        self.interrupts.posted.lock().push_back(class).map_err(|_| {
            self.interrupts.counters.queue_overflows.inc();
            DeviceError::QueueOverflow
        })
    }

    pub fn pending_interrupts(&self) -> usize {
        self.interrupts.posted.lock().len()
    }

    /// Deliver the oldest posted interrupt. Returns false when nothing was
    /// delivered, including while interrupt processing is disabled.
    pub fn deliver_next_interrupt(&self) -> bool {
        if !self.is_initialized() || !self.interrupts.is_enabled() {
            return false;
        }
        let next = self.interrupts.posted.lock().pop_front();
        match next {
            Some(class) => self.raise_interrupt(class).is_ok(),
            None => false,
        }
    }

    /// Deliver all posted interrupts, then any queued completions
    pub fn yield_to_interrupts(&self) -> usize {
        let mut delivered = 0;
        while self.deliver_next_interrupt() {
            delivered += 1;
        }
        self.process_completions();
        delivered
    }

    /// Enter interrupt context explicitly
    pub fn interrupt_scope(&self) -> InterruptScope<'_> {
        self.interrupts.enter();
        InterruptScope { manager: self }
    }

    /// Register a timer handler for a device with its own period
    pub fn start_periodic_interrupt(&self, ref_num: RefNum, interval: Ticks) -> DeviceResult<()> {
        self.ensure_initialized()?;
        if interval == 0 {
            return Err(DeviceError::InvalidParameter);
        }
        let existing = self.interrupts.registry().get(ref_num).map(|h| h.class);
        match existing {
            Some(InterruptClass::Timer) => {}
            Some(_) => return Err(DeviceError::DuplicateHandler),
            None => {
                self.register_interrupt(ref_num, InterruptClass::Timer, None)?;
            }
        }
        let now = self.clock.now();
        self.interrupts.registry().set_period(ref_num, Some(interval), now)?;
        Ok(())
    }

    /// Remove a device's periodic timer handler
    pub fn stop_periodic_interrupt(&self, ref_num: RefNum) -> DeviceResult<()> {
        self.unregister_interrupt(ref_num)
    }

    /// Service every periodic handler whose deadline has passed. Returns
    /// whether any was due.
    pub fn trigger_periodic_interrupts(&self) -> DeviceResult<bool> {
        self.ensure_initialized()?;
        if !self.interrupts.is_enabled() {
            return Ok(false);
        }
        let now = self.clock.now();
        let due = self.interrupts.registry().fire_due(now);
        if due.is_empty() {
            return Ok(false);
        }
        trace!("{} periodic handlers due at {}", due.len(), now);
        self.interrupts.counters.total.inc();
        self.interrupts.enter();
        self.run_handlers(due);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_defaults() {
        assert_eq!(InterruptClass::Timer.default_priority(), 7);
        assert_eq!(InterruptClass::Disk.default_priority(), 6);
        assert_eq!(InterruptClass::Serial.default_priority(), 5);
        assert_eq!(InterruptClass::Via.default_priority(), 4);
        assert_eq!(InterruptClass::Custom.default_priority(), 3);
        assert_eq!(InterruptClass::from_raw(7), Some(InterruptClass::Scsi));
        assert_eq!(InterruptClass::from_raw(0), None);
    }

    #[test]
    fn test_register_clamps_and_chains_at_head() {
        let mut reg = HandlerRegistry::new(8);
        reg.register(RefNum(-1), InterruptClass::Disk, 99).unwrap();
        reg.register(RefNum(-2), InterruptClass::Disk, 7).unwrap();
        assert_eq!(reg.get(RefNum(-1)).unwrap().priority, 7);
        assert_eq!(reg.chain(7), vec![RefNum(-2), RefNum(-1)]);
    }

    #[test]
    fn test_duplicate_and_capacity() {
        let mut reg = HandlerRegistry::new(1);
        reg.register(RefNum(-1), InterruptClass::Disk, 1).unwrap();
        assert_eq!(
            reg.register(RefNum(-1), InterruptClass::Timer, 1),
            Err(DeviceError::DuplicateHandler)
        );
        assert_eq!(
            reg.register(RefNum(-2), InterruptClass::Timer, 1),
            Err(DeviceError::OutOfMemory)
        );
    }

    #[test]
    fn test_fire_priority_order() {
        let mut reg = HandlerRegistry::new(8);
        reg.register(RefNum(-1), InterruptClass::Serial, 2).unwrap();
        reg.register(RefNum(-2), InterruptClass::Serial, 6).unwrap();
        reg.register(RefNum(-3), InterruptClass::Disk, 7).unwrap();
        reg.register(RefNum(-4), InterruptClass::Serial, 4).unwrap();
        reg.set_enabled(RefNum(-4), false).unwrap();

        assert_eq!(reg.fire(InterruptClass::Serial), vec![RefNum(-2), RefNum(-1)]);
        assert_eq!(reg.get(RefNum(-2)).unwrap().count, 1);
        assert_eq!(reg.get(RefNum(-4)).unwrap().count, 0);
        assert!(reg.fire(InterruptClass::Timer).is_empty());
    }

    #[test]
    fn test_periodic_handlers_keep_own_deadlines() {
        let mut reg = HandlerRegistry::new(8);
        reg.register(RefNum(-1), InterruptClass::Timer, 7).unwrap();
        reg.register(RefNum(-2), InterruptClass::Timer, 7).unwrap();
        reg.register(RefNum(-3), InterruptClass::Timer, 7).unwrap();
        reg.set_period(RefNum(-1), Some(2), 0).unwrap();
        reg.set_period(RefNum(-2), Some(5), 0).unwrap();

        assert!(reg.fire_due(1).is_empty());
        assert_eq!(reg.fire_due(2), vec![RefNum(-1)]);
        assert_eq!(reg.fire_due(4), vec![RefNum(-1)]);
        assert_eq!(reg.fire_due(5), vec![RefNum(-2)]);
        assert_eq!(reg.fire_due(6), vec![RefNum(-1)]);
        assert_eq!(reg.get(RefNum(-1)).unwrap().count, 3);
        assert_eq!(reg.get(RefNum(-2)).unwrap().count, 1);
        assert_eq!(reg.get(RefNum(-3)).unwrap().count, 0);

        reg.set_enabled(RefNum(-2), false).unwrap();
        assert_eq!(reg.fire_due(100), vec![RefNum(-1)]);
    }

    #[test]
    fn test_unregister_unlinks_middle() {
        let mut reg = HandlerRegistry::new(8);
        for r in [-1, -2, -3] {
            reg.register(RefNum(r), InterruptClass::Custom, 3).unwrap();
        }
        assert_eq!(reg.chain(3), vec![RefNum(-3), RefNum(-2), RefNum(-1)]);
        reg.unregister(RefNum(-2)).unwrap();
        assert_eq!(reg.chain(3), vec![RefNum(-3), RefNum(-1)]);
        reg.unregister(RefNum(-3)).unwrap();
        assert_eq!(reg.chain(3), vec![RefNum(-1)]);
        assert_eq!(reg.unregister(RefNum(-3)), Err(DeviceError::HandlerNotFound));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.clear(), 1);
        assert!(reg.chain(3).is_empty());
    }

    #[test]
    fn test_nesting_levels() {
        let ctl = InterruptController::new(4);
        assert_eq!(ctl.enter(), 1);
        assert_eq!(ctl.enter(), 2);
        assert_eq!(ctl.exit(), 1);
        assert_eq!(ctl.exit(), 0);
        assert_eq!(ctl.stats().max_nesting, 2);
    }
}
