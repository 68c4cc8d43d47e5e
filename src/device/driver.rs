//! Driver Representations
//!
//! A driver is either a classic image (header plus offset-addressed code
//! blob, bit-exact with images produced by other tooling) or a modern
//! function table native to this crate.
//!
//! Classic image layout, big-endian:
//!
//! ```text
//!  0  flags   u16      8  open    i16     16  close   i16
//!  2  delay   u16     10  prime   i16     18  name    u8 length + bytes
//!  4  emask   u16     12  control i16     ..  code blob
//!  6  menu    i16     14  status  i16
//! ```

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;

use crate::device::dce::{Dce, DceFlags};
use crate::device::param::ParamBlock;
use crate::error::{DeviceError, DeviceResult};

// ============================================================================
// Operations
// ============================================================================

/// Driver entry point selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    Open,
    Prime,
    Control,
    Status,
    Close,
    Kill,
}

// ============================================================================
// Classic Driver Image
// ============================================================================

/// Fixed header bytes preceding the name
pub const DRIVER_HEADER_SIZE: usize = 18;

/// Smallest well-formed image: header plus the name length byte
pub const MIN_DRIVER_SIZE: usize = DRIVER_HEADER_SIZE + 1;

/// `moveq #0,d0; rts`
const STUB_ENTRY: [u8; 4] = [0x70, 0x00, 0x4E, 0x75];

/// Entry point offsets from the start of the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryOffsets {
    pub open: i16,
    pub prime: i16,
    pub control: i16,
    pub status: i16,
    pub close: i16,
}

impl EntryOffsets {
    fn all(&self) -> [i16; 5] {
        [self.open, self.prime, self.control, self.status, self.close]
    }
}

/// Classic offset-addressed driver image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassicDriver {
    /// Raw header flags
    pub flags: u16,
    /// Polling delay in ticks
    pub delay: u16,
    /// Desk accessory event mask
    pub emask: u16,
    /// Menu id
    pub menu: i16,
    pub offsets: EntryOffsets,
    name: Vec<u8>,
    code: Vec<u8>,
}

impl ClassicDriver {
    /// Build an image from parts
    pub fn new(name: &[u8], flags: u16, offsets: EntryOffsets, code: Vec<u8>) -> DeviceResult<Self> {
        let driver = Self {
            flags,
            delay: 0,
            emask: 0,
            menu: 0,
            offsets,
            name: name.to_vec(),
            code,
        };
        driver.validate()?;
        Ok(driver)
    }

    /// Parse and validate a raw image
    pub fn parse(image: &[u8]) -> DeviceResult<Self> {
        if image.len() < MIN_DRIVER_SIZE {
            return Err(DeviceError::InstallFailed);
        }

        let word = |at: usize| u16::from_be_bytes([image[at], image[at + 1]]);
        let name_len = image[DRIVER_HEADER_SIZE] as usize;
        let name_end = MIN_DRIVER_SIZE + name_len;
        if image.len() < name_end {
            return Err(DeviceError::InstallFailed);
        }

        let driver = Self {
            flags: word(0),
            delay: word(2),
            emask: word(4),
            menu: word(6) as i16,
            offsets: EntryOffsets {
                open: word(8) as i16,
                prime: word(10) as i16,
                control: word(12) as i16,
                status: word(14) as i16,
                close: word(16) as i16,
            },
            name: image[MIN_DRIVER_SIZE..name_end].to_vec(),
            code: image[name_end..].to_vec(),
        };
        driver.validate()?;
        Ok(driver)
    }

    /// Serialize to the on-disk layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.image_len());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.delay.to_be_bytes());
        out.extend_from_slice(&self.emask.to_be_bytes());
        out.extend_from_slice(&self.menu.to_be_bytes());
        for offset in self.offsets.all() {
            out.extend_from_slice(&offset.to_be_bytes());
        }
        out.push(self.name.len() as u8);
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&self.code);
        out
    }

    /// Structural validity: named, short enough name, no negative offsets
    pub fn validate(&self) -> DeviceResult<()> {
        if self.name.is_empty() || self.name.len() > u8::MAX as usize {
            return Err(DeviceError::InstallFailed);
        }
        if self.offsets.all().iter().any(|&o| o < 0) {
            return Err(DeviceError::InstallFailed);
        }
        Ok(())
    }

    /// Minimal image exposing read, write, control and status.
    ///
    /// Every entry point is `moveq #0,d0; rts`, so the image is executable
    /// on 68k hardware and succeeds without doing anything.
    pub fn template(name: &[u8]) -> DeviceResult<Self> {
        if name.is_empty() || name.len() > u8::MAX as usize {
            return Err(DeviceError::InvalidParameter);
        }

        // Entry points must be word aligned
        let header_len = MIN_DRIVER_SIZE + name.len();
        let pad = header_len % 2;
        let base = header_len + pad;

        let mut code = Vec::with_capacity(pad + 5 * STUB_ENTRY.len());
        code.resize(pad, 0);
        for _ in 0..5 {
            code.extend_from_slice(&STUB_ENTRY);
        }

        let at = |n: usize| (base + n * STUB_ENTRY.len()) as i16;
        let flags = DceFlags::IO_CAPABILITIES.bits();
        Self::new(
            name,
            flags,
            EntryOffsets {
                open: at(0),
                prime: at(1),
                control: at(2),
                status: at(3),
                close: at(4),
            },
            code,
        )
    }

    /// Driver name without the length prefix
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Total serialized length
    pub fn image_len(&self) -> usize {
        MIN_DRIVER_SIZE + self.name.len() + self.code.len()
    }

    /// Offset of the entry point for `op`. Classic images have no kill entry.
    pub fn entry_offset(&self, op: DriverOp) -> Option<i16> {
        match op {
            DriverOp::Open => Some(self.offsets.open),
            DriverOp::Prime => Some(self.offsets.prime),
            DriverOp::Control => Some(self.offsets.control),
            DriverOp::Status => Some(self.offsets.status),
            DriverOp::Close => Some(self.offsets.close),
            DriverOp::Kill => None,
        }
    }

    /// Header flags as installed; run-time state bits are never taken from the image
    pub fn dce_flags(&self) -> DceFlags {
        DceFlags::from_bits_truncate(self.flags) - DceFlags::RUNTIME
    }
}

// ============================================================================
// Modern Driver Interface
// ============================================================================

/// Dispatch entry: operate on a parameter block for a device
pub type DriverEntry = fn(&mut ParamBlock, &Dce) -> DeviceResult<()>;

/// Called once after the device control entry is built
pub type DriverInit = fn(&Dce) -> DeviceResult<()>;

/// Called once before the device control entry is destroyed
pub type DriverCleanup = fn(&Dce);

/// Opaque per-driver state shared with every entry point
pub type DriverContext = Arc<dyn Any + Send + Sync>;

/// Modern driver function table
#[derive(Clone, Copy, Default)]
pub struct DispatchTable {
    pub open: Option<DriverEntry>,
    pub prime: Option<DriverEntry>,
    pub control: Option<DriverEntry>,
    pub status: Option<DriverEntry>,
    pub close: Option<DriverEntry>,
    pub kill: Option<DriverEntry>,
}

impl DispatchTable {
    pub const fn new() -> Self {
        Self {
            open: None,
            prime: None,
            control: None,
            status: None,
            close: None,
            kill: None,
        }
    }

    pub fn with_open(mut self, f: DriverEntry) -> Self {
        self.open = Some(f);
        self
    }

    pub fn with_prime(mut self, f: DriverEntry) -> Self {
        self.prime = Some(f);
        self
    }

    pub fn with_control(mut self, f: DriverEntry) -> Self {
        self.control = Some(f);
        self
    }

    pub fn with_status(mut self, f: DriverEntry) -> Self {
        self.status = Some(f);
        self
    }

    pub fn with_close(mut self, f: DriverEntry) -> Self {
        self.close = Some(f);
        self
    }

    pub fn with_kill(mut self, f: DriverEntry) -> Self {
        self.kill = Some(f);
        self
    }

    pub fn entry(&self, op: DriverOp) -> Option<DriverEntry> {
        match op {
            DriverOp::Open => self.open,
            DriverOp::Prime => self.prime,
            DriverOp::Control => self.control,
            DriverOp::Status => self.status,
            DriverOp::Close => self.close,
            DriverOp::Kill => self.kill,
        }
    }

    /// Number of populated slots
    pub fn populated(&self) -> usize {
        [
            self.open,
            self.prime,
            self.control,
            self.status,
            self.close,
            self.kill,
        ]
        .iter()
        .filter(|e| e.is_some())
        .count()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("open", &self.open.is_some())
            .field("prime", &self.prime.is_some())
            .field("control", &self.control.is_some())
            .field("status", &self.status.is_some())
            .field("close", &self.close.is_some())
            .field("kill", &self.kill.is_some())
            .finish()
    }
}

/// Function-table driver
#[derive(Clone)]
pub struct ModernDriver {
    name: String,
    table: DispatchTable,
    init: Option<DriverInit>,
    cleanup: Option<DriverCleanup>,
    flags: Option<DceFlags>,
    context: Option<DriverContext>,
}

impl ModernDriver {
    pub fn new(name: &str, table: DispatchTable) -> Self {
        Self {
            name: String::from(name),
            table,
            init: None,
            cleanup: None,
            flags: None,
            context: None,
        }
    }

    pub fn with_init(mut self, init: DriverInit) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_cleanup(mut self, cleanup: DriverCleanup) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// Override the capability flags derived from the table
    pub fn with_flags(mut self, flags: DceFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn with_context<T: Any + Send + Sync>(mut self, context: T) -> Self {
        self.context = Some(Arc::new(context));
        self
    }

    pub fn with_shared_context(mut self, context: DriverContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    pub fn init(&self) -> Option<DriverInit> {
        self.init
    }

    pub fn cleanup(&self) -> Option<DriverCleanup> {
        self.cleanup
    }

    pub fn context(&self) -> Option<&DriverContext> {
        self.context.as_ref()
    }

    /// Non-empty name and at least one dispatch entry
    pub fn validate(&self) -> DeviceResult<()> {
        if self.name.is_empty() || self.table.populated() == 0 {
            return Err(DeviceError::InvalidParameter);
        }
        Ok(())
    }

    /// Capabilities at install time
    pub fn dce_flags(&self) -> DceFlags {
        let base = match self.flags {
            Some(flags) => flags - DceFlags::RUNTIME,
            None => {
                let mut flags = DceFlags::empty();
                if self.table.prime.is_some() {
                    flags |= DceFlags::READ_ENABLE | DceFlags::WRITE_ENABLE;
                }
                if self.table.control.is_some() {
                    flags |= DceFlags::CONTROL_ENABLE;
                }
                if self.table.status.is_some() {
                    flags |= DceFlags::STATUS_ENABLE;
                }
                flags
            }
        };
        base | DceFlags::FOLLOWS_NEW_RULES
    }
}

impl fmt::Debug for ModernDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModernDriver")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("init", &self.init.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .field("flags", &self.flags)
            .field("context", &self.context.is_some())
            .finish()
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Installed driver
#[derive(Debug, Clone)]
pub enum Driver {
    Classic(ClassicDriver),
    Modern(ModernDriver),
}

impl Driver {
    pub fn name(&self) -> &[u8] {
        match self {
            Self::Classic(d) => d.name(),
            Self::Modern(d) => d.name().as_bytes(),
        }
    }

    pub fn validate(&self) -> DeviceResult<()> {
        match self {
            Self::Classic(d) => d.validate(),
            Self::Modern(d) => d.validate(),
        }
    }

    /// Flags the device control entry starts with
    pub fn install_flags(&self) -> DceFlags {
        let flags = match self {
            Self::Classic(d) => d.dce_flags(),
            Self::Modern(d) => d.dce_flags(),
        };
        flags | DceFlags::RAM_BASED
    }

    #[inline]
    pub fn is_modern(&self) -> bool {
        matches!(self, Self::Modern(_))
    }
}

impl From<ClassicDriver> for Driver {
    fn from(d: ClassicDriver) -> Self {
        Self::Classic(d)
    }
}

impl From<ModernDriver> for Driver {
    fn from(d: ModernDriver) -> Self {
        Self::Modern(d)
    }
}
