//! Device Manager configuration

use crate::device::completion::COMPLETION_QUEUE_CAPACITY;
use crate::error::{DeviceError, DeviceResult};
use crate::types::RefNum;

/// Default number of unit table slots
pub const DEFAULT_UNIT_TABLE_SIZE: usize = 64;

/// Default per-device I/O queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

/// Default limit on outstanding asynchronous requests
pub const MAX_ASYNC_REQUESTS: usize = 1024;

/// Default limit on registered interrupt handlers
pub const MAX_INTERRUPT_HANDLERS: usize = 64;

/// Size of the memory block reserved for each device control entry
pub const DCE_RECORD_SIZE: usize = 52;

/// Device Manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceManagerConfig {
    /// Number of unit table slots
    pub unit_table_size: usize,
    /// Maximum pending requests per device queue
    pub queue_depth: usize,
    /// Maximum requests tracked across all devices
    pub max_requests: usize,
    /// Maximum registered interrupt handlers
    pub max_interrupt_handlers: usize,
    /// Enable interrupt processing at initialization
    pub interrupts_enabled: bool,
    /// Fall back to a synthesized driver image when loading fails
    pub synthesize_missing_drivers: bool,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        Self {
            unit_table_size: DEFAULT_UNIT_TABLE_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_requests: MAX_ASYNC_REQUESTS,
            max_interrupt_handlers: MAX_INTERRUPT_HANDLERS,
            interrupts_enabled: true,
            synthesize_missing_drivers: true,
        }
    }
}

impl DeviceManagerConfig {
    pub fn with_unit_table_size(mut self, size: usize) -> Self {
        self.unit_table_size = size;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_max_requests(mut self, max: usize) -> Self {
        self.max_requests = max;
        self
    }

    pub fn with_max_interrupt_handlers(mut self, max: usize) -> Self {
        self.max_interrupt_handlers = max;
        self
    }

    pub fn with_interrupts_enabled(mut self, enabled: bool) -> Self {
        self.interrupts_enabled = enabled;
        self
    }

    pub fn with_synthesized_drivers(mut self, enabled: bool) -> Self {
        self.synthesize_missing_drivers = enabled;
        self
    }

    /// Completion queue capacity (fixed)
    pub const fn completion_queue_capacity(&self) -> usize {
        COMPLETION_QUEUE_CAPACITY
    }

    /// Check that every size is usable
    pub fn validate(&self) -> DeviceResult<()> {
        if self.unit_table_size == 0 || self.unit_table_size > RefNum::MAX_SLOT + 1 {
            return Err(DeviceError::InvalidParameter);
        }
        if self.queue_depth == 0 || self.queue_depth > self.max_requests {
            return Err(DeviceError::InvalidParameter);
        }
        if self.max_requests == 0 || self.max_requests > u32::MAX as usize {
            return Err(DeviceError::InvalidParameter);
        }
        if self.max_interrupt_handlers == 0 {
            return Err(DeviceError::InvalidParameter);
        }
        Ok(())
    }
}
