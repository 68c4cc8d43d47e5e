//! Device Manager error codes
//!
//! Every error kind carries a fixed classic OSErr value so results can be
//! stored in a parameter block and handed to drivers that expect the
//! classic numeric codes.

use thiserror::Error;

// ============================================================================
// OSErr Constants
// ============================================================================

/// Numeric result codes shared with driver implementations
pub mod os_err {
    pub const NO_ERR: i16 = 0;
    /// Result field value while a request is outstanding
    pub const IO_IN_PROGRESS: i16 = 1;
    pub const Q_ERR: i16 = -1;
    pub const BAD_REQ_ERR: i16 = -2;
    pub const CONTROL_ERR: i16 = -17;
    pub const STATUS_ERR: i16 = -18;
    pub const READ_ERR: i16 = -19;
    pub const WRIT_ERR: i16 = -20;
    pub const BAD_UNIT_ERR: i16 = -21;
    pub const UNIT_EMPTY_ERR: i16 = -22;
    pub const OPEN_ERR: i16 = -23;
    pub const D_REMOV_ERR: i16 = -25;
    pub const D_INST_ERR: i16 = -26;
    pub const ABORT_ERR: i16 = -27;
    pub const NOT_OPEN_ERR: i16 = -28;
    pub const UNIT_TBL_FULL_ERR: i16 = -29;
    pub const FNF_ERR: i16 = -43;
    pub const DUP_FN_ERR: i16 = -48;
    pub const PARAM_ERR: i16 = -50;
    pub const MEM_FULL_ERR: i16 = -108;
    pub const USER_CANCELED_ERR: i16 = -128;
    pub const QUEUE_OVERFLOW: i16 = -129;
    pub const IO_TIMEOUT: i16 = -130;
    pub const RES_NOT_FOUND: i16 = -192;
    /// System error ID reported when the I/O core is used uninitialized
    pub const DS_IO_CORE_ERR: i16 = 8;
}

// ============================================================================
// Device Error
// ============================================================================

/// Device Manager error
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceError {
    #[error("invalid parameter")]
    InvalidParameter,

    #[error("bad unit reference number")]
    BadRefNum,

    #[error("unit table entry has no driver")]
    SlotEmpty,

    #[error("device is not open")]
    NotOpen,

    #[error("driver does not support read")]
    ReadUnsupported,

    #[error("driver does not support write")]
    WriteUnsupported,

    #[error("driver does not support control")]
    ControlUnsupported,

    #[error("driver does not support status")]
    StatusUnsupported,

    #[error("out of memory")]
    OutOfMemory,

    #[error("driver install failed")]
    InstallFailed,

    #[error("driver remove failed: device is open")]
    RemoveFailed,

    #[error("queue overflow")]
    QueueOverflow,

    #[error("resource not found")]
    ResourceNotFound,

    #[error("timed out waiting for I/O")]
    WaitTimeout,

    #[error("operation canceled")]
    Canceled,

    #[error("request not found")]
    RequestNotFound,

    /// Missing dispatch slot or unusable entry point
    #[error("bad driver request")]
    BadRequest,

    #[error("I/O aborted")]
    Aborted,

    #[error("unit table is full")]
    UnitTableFull,

    #[error("interrupt handler already registered")]
    DuplicateHandler,

    #[error("interrupt handler not found")]
    HandlerNotFound,

    #[error("device manager not initialized")]
    NotInitialized,

    /// Driver-specific result code with no named kind
    #[error("driver error {0}")]
    Driver(i16),
}

impl DeviceError {
    /// Classic OSErr value for this error
    pub const fn code(&self) -> i16 {
        use os_err::*;
        match self {
            Self::InvalidParameter => PARAM_ERR,
            Self::BadRefNum => BAD_UNIT_ERR,
            Self::SlotEmpty => UNIT_EMPTY_ERR,
            Self::NotOpen => NOT_OPEN_ERR,
            Self::ReadUnsupported => READ_ERR,
            Self::WriteUnsupported => WRIT_ERR,
            Self::ControlUnsupported => CONTROL_ERR,
            Self::StatusUnsupported => STATUS_ERR,
            Self::OutOfMemory => MEM_FULL_ERR,
            Self::InstallFailed => D_INST_ERR,
            Self::RemoveFailed => D_REMOV_ERR,
            Self::QueueOverflow => QUEUE_OVERFLOW,
            Self::ResourceNotFound => RES_NOT_FOUND,
            Self::WaitTimeout => IO_TIMEOUT,
            Self::Canceled => USER_CANCELED_ERR,
            Self::RequestNotFound => Q_ERR,
            Self::BadRequest => BAD_REQ_ERR,
            Self::Aborted => ABORT_ERR,
            Self::UnitTableFull => UNIT_TBL_FULL_ERR,
            Self::DuplicateHandler => DUP_FN_ERR,
            Self::HandlerNotFound => FNF_ERR,
            Self::NotInitialized => DS_IO_CORE_ERR,
            Self::Driver(code) => *code,
        }
    }

    /// Map an OSErr back to an error kind.
    ///
    /// Returns `None` for `noErr` and `ioInProgress`, which are not errors.
    pub const fn from_code(code: i16) -> Option<Self> {
        use os_err::*;
        let err = match code {
            NO_ERR | IO_IN_PROGRESS => return None,
            PARAM_ERR => Self::InvalidParameter,
            BAD_UNIT_ERR => Self::BadRefNum,
            UNIT_EMPTY_ERR => Self::SlotEmpty,
            NOT_OPEN_ERR => Self::NotOpen,
            READ_ERR => Self::ReadUnsupported,
            WRIT_ERR => Self::WriteUnsupported,
            CONTROL_ERR => Self::ControlUnsupported,
            STATUS_ERR => Self::StatusUnsupported,
            MEM_FULL_ERR => Self::OutOfMemory,
            D_INST_ERR => Self::InstallFailed,
            D_REMOV_ERR => Self::RemoveFailed,
            QUEUE_OVERFLOW => Self::QueueOverflow,
            RES_NOT_FOUND => Self::ResourceNotFound,
            IO_TIMEOUT => Self::WaitTimeout,
            USER_CANCELED_ERR => Self::Canceled,
            Q_ERR => Self::RequestNotFound,
            BAD_REQ_ERR => Self::BadRequest,
            ABORT_ERR => Self::Aborted,
            UNIT_TBL_FULL_ERR => Self::UnitTableFull,
            DUP_FN_ERR => Self::DuplicateHandler,
            FNF_ERR => Self::HandlerNotFound,
            DS_IO_CORE_ERR => Self::NotInitialized,
            other => Self::Driver(other),
        };
        Some(err)
    }
}

/// Result alias used throughout the Device Manager
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Collapse a result into the OSErr stored in a parameter block
pub fn result_code(result: &DeviceResult<()>) -> i16 {
    match result {
        Ok(()) => os_err::NO_ERR,
        Err(e) => e.code(),
    }
}
