//! Device Manager
//!
//! Owns the unit table, the asynchronous request arena, the completion
//! queue and the interrupt simulator, and routes parameter-block calls to
//! installed drivers.
//!
//! Lock order, outermost first: unit table, request arena, a device's
//! I/O queue, completion queue. The interrupt registry, posted interrupts,
//! memory and resources are leaves. No lock is held while a driver entry
//! point, init/cleanup hook or completion routine runs.

pub mod async_io;
pub mod clock;
pub mod completion;
pub mod dce;
pub mod dispatch;
pub mod driver;
pub mod interrupt;
pub mod io;
pub mod io_queue;
pub mod loader;
pub mod memory;
pub mod param;
pub mod resource;
pub mod slab;
pub mod stats;
pub mod unit_table;

pub use async_io::{RequestId, SubmitError};
pub use clock::{CountingTicks, ManualTicks, TickSource};
pub use dce::{Dce, DceFlags, DceInfo};
pub use driver::{ClassicDriver, DispatchTable, Driver, DriverOp, EntryOffsets, ModernDriver};
pub use interrupt::{HandlerId, InterruptClass, InterruptHandler, InterruptStats};
pub use io_queue::QueueStatus;
pub use loader::{LoadSource, LoadedDriver, LoaderStats};
pub use memory::{BlockAllocator, BlockHandle, HeapBlocks};
pub use param::{IoResult, ParamBlock};
pub use resource::{ResourceMap, ResourceProvider};
pub use stats::DeviceStats;
pub use unit_table::UnitTableStats;

#[cfg(feature = "std")]
pub use clock::MonotonicTicks;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use spin::{Mutex, Once};

use crate::config::{DeviceManagerConfig, DCE_RECORD_SIZE};
use crate::error::{DeviceError, DeviceResult};
use crate::types::{RefNum, CS_GOODBYE};

use async_io::Request;
use completion::CompletionQueue;
use interrupt::InterruptController;
use loader::DriverLoader;
use slab::Slab;
use stats::DeviceCounters;
use unit_table::UnitTable;

// ============================================================================
// Device Manager
// ============================================================================

/// Device Manager instance
pub struct DeviceManager {
    config: DeviceManagerConfig,
    initialized: AtomicBool,

    /// Installed drivers by refnum
    pub(crate) units: Mutex<UnitTable>,

    /// Outstanding asynchronous requests
    pub(crate) requests: Mutex<Slab<Request>>,

    /// Finished requests awaiting delivery
    pub(crate) completions: Mutex<CompletionQueue>,

    pub(crate) interrupts: InterruptController,
    pub(crate) loader: DriverLoader,
    pub(crate) resources: Mutex<Box<dyn ResourceProvider>>,
    memory: Mutex<Box<dyn BlockAllocator>>,
    pub(crate) clock: Box<dyn TickSource>,
    pub(crate) counters: DeviceCounters,

    /// Completion generation for blocking waits
    #[cfg(feature = "std")]
    pub(crate) completion_signal: (std::sync::Mutex<u64>, std::sync::Condvar),
}

impl DeviceManager {
    /// Create an uninitialized manager with an empty resource map, an
    /// unbounded block allocator and a counting tick source
    pub fn new(config: DeviceManagerConfig) -> Self {
        let unit_table_size = config.unit_table_size;
        let max_requests = config.max_requests;
        let max_handlers = config.max_interrupt_handlers;
        let synthesize = config.synthesize_missing_drivers;
        Self {
            config,
            initialized: AtomicBool::new(false),
            units: Mutex::new(UnitTable::new(unit_table_size)),
            requests: Mutex::new(Slab::with_capacity(max_requests)),
            completions: Mutex::new(CompletionQueue::new()),
            interrupts: InterruptController::new(max_handlers),
            loader: DriverLoader::new(synthesize),
            resources: Mutex::new(Box::new(ResourceMap::new())),
            memory: Mutex::new(Box::new(HeapBlocks::new())),
            clock: Box::new(CountingTicks::new()),
            counters: DeviceCounters::new(),
            #[cfg(feature = "std")]
            completion_signal: (std::sync::Mutex::new(0), std::sync::Condvar::new()),
        }
    }

    pub fn with_resources<R: ResourceProvider + 'static>(mut self, resources: R) -> Self {
        self.resources = Mutex::new(Box::new(resources));
        self
    }

    pub fn with_memory<M: BlockAllocator + 'static>(mut self, memory: M) -> Self {
        self.memory = Mutex::new(Box::new(memory));
        self
    }

    pub fn with_clock<C: TickSource + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Validate the configuration and bring the subsystem up
    pub fn initialize(&self) -> DeviceResult<()> {
        self.config.validate()?;
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.interrupts.set_enabled(self.config.interrupts_enabled);
        debug!(
            "device manager up: {} units, queue depth {}",
            self.config.unit_table_size, self.config.queue_depth
        );
        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn ensure_initialized(&self) -> DeviceResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(DeviceError::NotInitialized)
        }
    }

    pub fn config(&self) -> &DeviceManagerConfig {
        &self.config
    }

    /// Current tick count
    pub fn ticks(&self) -> crate::types::Ticks {
        self.clock.now()
    }

    // ========================================================================
    // Install / Remove
    // ========================================================================

    /// Install a driver into the preferred slot or the next free one
    pub fn install_driver(&self, driver: Driver, ref_num: Option<RefNum>) -> DeviceResult<RefNum> {
        self.ensure_initialized()?;
        if let Err(e) = driver.validate() {
            warn!("rejecting driver {:?}: {}", core::str::from_utf8(driver.name()), e);
            return Err(e);
        }

        let ref_num = self.units.lock().allocate(ref_num)?;
        let block = match self.allocate_block() {
            Ok(block) => block,
            Err(e) => {
                self.release_slot(ref_num);
                return Err(e);
            }
        };

        let dce = Arc::new(Dce::new(ref_num, driver, self.config.queue_depth, block));
        if let Driver::Modern(modern) = dce.driver() {
            if let Some(init) = modern.init() {
                if let Err(e) = init(&dce) {
                    warn!("{} init failed: {}", ref_num, e);
                    self.release_block(block);
                    self.release_slot(ref_num);
                    return Err(DeviceError::InstallFailed);
                }
            }
        }

        if let Err(e) = self.units.lock().attach(ref_num, dce.clone()) {
            self.release_block(block);
            self.release_slot(ref_num);
            return Err(e);
        }
        debug!(
            "installed {:?} at {} flags {:?}",
            core::str::from_utf8(dce.name()),
            ref_num,
            dce.flags()
        );
        Ok(ref_num)
    }

    pub fn install_classic(&self, image: ClassicDriver, ref_num: Option<RefNum>) -> DeviceResult<RefNum> {
        self.install_driver(Driver::Classic(image), ref_num)
    }

    /// Parse a raw classic image and install it
    pub fn install_image(&self, image: &[u8], ref_num: Option<RefNum>) -> DeviceResult<RefNum> {
        self.ensure_initialized()?;
        let image = ClassicDriver::parse(image)?;
        self.install_classic(image, ref_num)
    }

    pub fn install_modern(&self, driver: ModernDriver, ref_num: Option<RefNum>) -> DeviceResult<RefNum> {
        self.install_driver(Driver::Modern(driver), ref_num)
    }

    /// Remove a closed driver. Queued requests complete as canceled, the
    /// driver gets its goodbye if it asked for one, and its interrupt
    /// handler is dropped.
    pub fn remove_driver(&self, ref_num: RefNum) -> DeviceResult<()> {
        self.ensure_initialized()?;
        let dce = self.lookup_dce(ref_num)?;
        if dce.is_open() {
            return Err(DeviceError::RemoveFailed);
        }

        self.flush_dce(&dce)?;
        self.send_goodbye(&dce);
        if let Driver::Modern(modern) = dce.driver() {
            if let Some(cleanup) = modern.cleanup() {
                cleanup(&dce);
            }
        }
        if self.interrupt_handler(ref_num).is_some() {
            self.unregister_interrupt(ref_num)?;
        }

        self.units.lock().deallocate(ref_num)?;
        self.release_block(dce.block());
        debug!("removed {:?} from {}", core::str::from_utf8(dce.name()), ref_num);
        Ok(())
    }

    fn send_goodbye(&self, dce: &Dce) {
        if !dce.has(DceFlags::NEEDS_GOODBYE) {
            return;
        }
        let mut pb = ParamBlock::control(dce.ref_num(), CS_GOODBYE, &[]);
        if let Err(e) = self.dispatch(DriverOp::Control, &mut pb, dce) {
            warn!("{} goodbye failed: {}", dce.ref_num(), e);
        }
    }

    fn allocate_block(&self) -> DeviceResult<BlockHandle> {
        let mut memory = self.memory.lock();
        let block = memory.allocate(DCE_RECORD_SIZE)?;
        if let Err(e) = memory.lock(block) {
            memory.dispose(block);
            return Err(e);
        }
        Ok(block)
    }

    fn release_block(&self, block: BlockHandle) {
        let mut memory = self.memory.lock();
        if memory.unlock(block).is_err() {
            warn!("releasing unknown block {:?}", block);
        }
        memory.dispose(block);
    }

    fn release_slot(&self, ref_num: RefNum) {
        if self.units.lock().deallocate(ref_num).is_err() {
            warn!("rollback of {} found no slot", ref_num);
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// DCE for an installed driver
    pub fn lookup_dce(&self, ref_num: RefNum) -> DeviceResult<Arc<Dce>> {
        let units = self.units.lock();
        if !units.is_allocated(ref_num) {
            return Err(DeviceError::BadRefNum);
        }
        units.lookup(ref_num).ok_or(DeviceError::SlotEmpty)
    }

    pub fn dce_info(&self, ref_num: RefNum) -> DeviceResult<DceInfo> {
        Ok(self.lookup_dce(ref_num)?.info())
    }

    /// Refnum of the installed driver named `name`
    pub fn find_driver(&self, name: &str) -> Option<RefNum> {
        self.units.lock().find_by_name(name.as_bytes())
    }

    /// Refnums of every installed driver
    pub fn installed(&self) -> Vec<RefNum> {
        self.units.lock().allocated()
    }

    pub fn stats(&self) -> DeviceStats {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    pub fn unit_table_stats(&self) -> UnitTableStats {
        self.units.lock().stats()
    }

    pub fn verify_unit_table(&self) -> bool {
        self.units.lock().verify_consistency()
    }

    /// Live blocks held by the block allocator
    pub fn memory_blocks(&self) -> usize {
        self.memory.lock().block_count()
    }

    /// Run `f` against the resource provider
    pub fn with_resource_provider<R>(&self, f: impl FnOnce(&mut dyn ResourceProvider) -> R) -> R {
        let mut resources = self.resources.lock();
        f(resources.as_mut())
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Close and remove every driver, deliver outstanding completions and
    /// drop all interrupt state. Operations fail with not-initialized
    /// afterwards until `initialize` is called again.
    pub fn shutdown(&self) -> DeviceResult<()> {
        self.ensure_initialized()?;
        let entries = self.units.lock().entries();

        for dce in &entries {
            let _ = self.flush_dce(dce);
        }
        self.process_completions();

        for dce in &entries {
            if dce.is_open() {
                let mut pb = ParamBlock::close(dce.ref_num());
                if let Err(e) = self.dispatch(DriverOp::Close, &mut pb, dce) {
                    warn!("{} close at shutdown failed: {}", dce.ref_num(), e);
                    dce.remove_flags(DceFlags::OPEN);
                }
            }
            if let Err(e) = self.remove_driver(dce.ref_num()) {
                warn!("{} removal at shutdown failed: {}", dce.ref_num(), e);
            }
        }

        self.interrupts.reset();
        self.completions.lock().clear();
        self.requests.lock().clear();
        self.initialized.store(false, Ordering::Release);
        debug!("device manager down");
        Ok(())
    }
}

impl core::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .field("installed", &self.units.lock().in_use())
            .field("outstanding", &self.requests.lock().len())
            .finish()
    }
}

// ============================================================================
// Global Instance
// ============================================================================

static DEVICE_MANAGER: Once<DeviceManager> = Once::new();

/// Create and initialize the process-wide Device Manager. Later calls return
/// the existing instance and ignore `config`.
pub fn init(config: DeviceManagerConfig) -> DeviceResult<&'static DeviceManager> {
    let manager = DEVICE_MANAGER.call_once(|| DeviceManager::new(config));
    manager.initialize()?;
    Ok(manager)
}

/// Process-wide Device Manager
pub fn device_manager() -> DeviceResult<&'static DeviceManager> {
    match DEVICE_MANAGER.get() {
        Some(manager) if manager.is_initialized() => Ok(manager),
        _ => Err(DeviceError::NotInitialized),
    }
}
