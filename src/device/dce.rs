//! Device Control Entry
//!
//! Per-device state tracked by the unit table. A DCE is shared as
//! `Arc<Dce>` so dispatch can run without holding the unit table lock;
//! mutable state is atomic or behind its own lock.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use crate::device::driver::{Driver, DriverContext};
use crate::device::io_queue::{IoQueue, QueueStatus};
use crate::device::memory::BlockHandle;
use crate::device::param::CS_PARAM_SIZE;
use crate::types::{RefNum, Ticks};

// ============================================================================
// DCE Flags
// ============================================================================

bitflags! {
    /// Device control entry flags (dCtlFlags)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DceFlags: u16 {
        /// Device is open
        const OPEN = 0x0020;
        /// Driver lives in RAM
        const RAM_BASED = 0x0040;
        /// Requests are queued or being serviced
        const ACTIVE = 0x0080;
        const READ_ENABLE = 0x0100;
        const WRITE_ENABLE = 0x0200;
        const CONTROL_ENABLE = 0x0400;
        const STATUS_ENABLE = 0x0800;
        /// Send a goodbye control before removal
        const NEEDS_GOODBYE = 0x1000;
        /// Driver wants periodic time
        const NEEDS_TIME = 0x2000;
        /// Keep the driver locked in memory
        const NEEDS_LOCK = 0x4000;
        /// Driver follows the modern calling rules
        const FOLLOWS_NEW_RULES = 0x8000;
    }
}

impl DceFlags {
    /// Read, write, control and status
    pub const IO_CAPABILITIES: Self = Self::READ_ENABLE
        .union(Self::WRITE_ENABLE)
        .union(Self::CONTROL_ENABLE)
        .union(Self::STATUS_ENABLE);

    /// Bits owned by the Device Manager at run time
    pub const RUNTIME: Self = Self::OPEN.union(Self::ACTIVE);
}

// ============================================================================
// Device Control Entry
// ============================================================================

/// Device control entry
#[derive(Debug)]
pub struct Dce {
    /// Unit table reference number
    ref_num: RefNum,

    /// Owning driver
    driver: Driver,

    /// dCtlFlags
    flags: AtomicU16,

    /// Current byte position
    position: AtomicI32,

    /// Polling delay in ticks
    delay: u16,

    /// Event mask
    emask: u16,

    /// Menu id
    menu: i16,

    /// Tick count of the last dispatch
    cur_ticks: AtomicU32,

    /// Pending requests
    queue: Mutex<IoQueue>,

    /// Backing memory block
    block: BlockHandle,
}

impl Dce {
    pub(crate) fn new(ref_num: RefNum, driver: Driver, queue_depth: usize, block: BlockHandle) -> Self {
        let flags = driver.install_flags();
        let (delay, emask, menu) = match &driver {
            Driver::Classic(d) => (d.delay, d.emask, d.menu),
            Driver::Modern(_) => (0, 0, 0),
        };
        Self {
            ref_num,
            driver,
            flags: AtomicU16::new(flags.bits()),
            position: AtomicI32::new(0),
            delay,
            emask,
            menu,
            cur_ticks: AtomicU32::new(0),
            queue: Mutex::new(IoQueue::new(queue_depth)),
            block,
        }
    }

    #[inline]
    pub fn ref_num(&self) -> RefNum {
        self.ref_num
    }

    #[inline]
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn name(&self) -> &[u8] {
        self.driver.name()
    }

    /// Modern driver context, downcast to its concrete type
    pub fn context<T: core::any::Any + Send + Sync>(&self) -> Option<&T> {
        self.shared_context()?.downcast_ref::<T>()
    }

    pub fn shared_context(&self) -> Option<&DriverContext> {
        match &self.driver {
            Driver::Modern(d) => d.context(),
            Driver::Classic(_) => None,
        }
    }

    #[inline]
    pub fn flags(&self) -> DceFlags {
        DceFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn has(&self, flags: DceFlags) -> bool {
        self.flags().contains(flags)
    }

    pub(crate) fn insert_flags(&self, flags: DceFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_flags(&self, flags: DceFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.has(DceFlags::OPEN)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.has(DceFlags::ACTIVE)
    }

    #[inline]
    pub fn position(&self) -> i32 {
        self.position.load(Ordering::Acquire)
    }

    /// Drivers may move the mark while servicing a request
    pub fn set_position(&self, position: i32) {
        self.position.store(position, Ordering::Release);
    }

    pub fn delay(&self) -> u16 {
        self.delay
    }

    pub fn emask(&self) -> u16 {
        self.emask
    }

    pub fn menu(&self) -> i16 {
        self.menu
    }

    pub fn cur_ticks(&self) -> Ticks {
        self.cur_ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, now: Ticks) {
        self.cur_ticks.store(now, Ordering::Relaxed);
    }

    pub(crate) fn queue(&self) -> MutexGuard<'_, IoQueue> {
        self.queue.lock()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.lock().status()
    }

    pub(crate) fn block(&self) -> BlockHandle {
        self.block
    }

    /// Owned copy of the introspectable state
    pub fn info(&self) -> DceInfo {
        DceInfo {
            ref_num: self.ref_num,
            name: self.name().to_vec(),
            flags: self.flags(),
            position: self.position(),
            delay: self.delay,
            emask: self.emask,
            menu: self.menu,
            cur_ticks: self.cur_ticks(),
            queue_depth: self.queue.lock().len(),
            modern: self.driver.is_modern(),
        }
    }

    /// Encode the entry into a status side channel
    pub(crate) fn encode_into(&self, out: &mut [u8; CS_PARAM_SIZE]) {
        out.fill(0);
        out[0..2].copy_from_slice(&self.ref_num.0.to_be_bytes());
        out[2..4].copy_from_slice(&self.flags().bits().to_be_bytes());
        out[4..8].copy_from_slice(&self.position().to_be_bytes());
        out[8..10].copy_from_slice(&self.delay.to_be_bytes());
        out[10..12].copy_from_slice(&self.emask.to_be_bytes());
        out[12..14].copy_from_slice(&self.menu.to_be_bytes());
    }
}

/// Device control entry snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DceInfo {
    pub ref_num: RefNum,
    pub name: Vec<u8>,
    pub flags: DceFlags,
    pub position: i32,
    pub delay: u16,
    pub emask: u16,
    pub menu: i16,
    pub cur_ticks: Ticks,
    pub queue_depth: usize,
    pub modern: bool,
}

impl DceInfo {
    /// Decode what a get-DCE status call wrote to the side channel
    pub fn decode(raw: &[u8; CS_PARAM_SIZE]) -> (RefNum, DceFlags, i32, u16, u16, i16) {
        let word = |at: usize| [raw[at], raw[at + 1]];
        (
            RefNum(i16::from_be_bytes(word(0))),
            DceFlags::from_bits_retain(u16::from_be_bytes(word(2))),
            i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            u16::from_be_bytes(word(8)),
            u16::from_be_bytes(word(10)),
            i16::from_be_bytes(word(12)),
        )
    }
}
