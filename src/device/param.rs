//! Parameter Blocks
//!
//! One block per request. A block moves into the Device Manager when it is
//! submitted asynchronously and comes back to the caller once its result
//! is terminal.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{os_err, result_code, DeviceError, DeviceResult};
use crate::types::{Permission, PositionMode, RefNum, Trap};

/// Size of the control/status side channel (csParam)
pub const CS_PARAM_SIZE: usize = 22;

/// Completion routine, run exactly once when an asynchronous request
/// finishes. It receives the finished block, which is the caller's again.
pub type CompletionRoutine = Box<dyn FnOnce(ParamBlock) + Send>;

// ============================================================================
// I/O Result
// ============================================================================

/// Request result (ioResult)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoResult {
    /// Never submitted
    #[default]
    Idle,
    /// Owned by the Device Manager
    Pending,
    /// Terminal
    Done(DeviceResult<()>),
}

impl IoResult {
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    /// Terminal result, if any
    pub fn outcome(&self) -> Option<DeviceResult<()>> {
        match self {
            Self::Done(r) => Some(*r),
            _ => None,
        }
    }

    /// OSErr as stored in ioResult
    pub fn code(&self) -> i16 {
        match self {
            Self::Idle => os_err::NO_ERR,
            Self::Pending => os_err::IO_IN_PROGRESS,
            Self::Done(r) => result_code(r),
        }
    }
}

// ============================================================================
// Parameter Block
// ============================================================================

/// I/O and control parameter block
pub struct ParamBlock {
    /// Target device
    pub ref_num: RefNum,
    /// Operation
    pub trap: Trap,
    /// Transfer buffer
    pub buffer: Vec<u8>,
    /// Requested byte count
    pub req_count: u32,
    /// Bytes actually transferred
    pub act_count: u32,
    pub pos_mode: PositionMode,
    pub pos_offset: i32,
    pub permission: Permission,
    /// Control/status sub-opcode
    pub cs_code: i16,
    /// Control/status side channel
    pub cs_param: [u8; CS_PARAM_SIZE],
    result: IoResult,
    completion: Option<CompletionRoutine>,
}

impl ParamBlock {
    /// Empty block for `trap` on `ref_num`
    pub fn new(trap: Trap, ref_num: RefNum) -> Self {
        Self {
            ref_num,
            trap,
            buffer: Vec::new(),
            req_count: 0,
            act_count: 0,
            pos_mode: PositionMode::AtMark,
            pos_offset: 0,
            permission: Permission::Current,
            cs_code: 0,
            cs_param: [0; CS_PARAM_SIZE],
            result: IoResult::Idle,
            completion: None,
        }
    }

    pub fn open(ref_num: RefNum, permission: Permission) -> Self {
        let mut pb = Self::new(Trap::Open, ref_num);
        pb.permission = permission;
        pb
    }

    pub fn close(ref_num: RefNum) -> Self {
        Self::new(Trap::Close, ref_num)
    }

    /// Read `count` bytes into a zeroed buffer
    pub fn read(ref_num: RefNum, count: u32) -> Self {
        let mut pb = Self::new(Trap::Read, ref_num);
        pb.buffer = vec![0; count as usize];
        pb.req_count = count;
        pb
    }

    /// Write all of `data`
    pub fn write(ref_num: RefNum, data: &[u8]) -> Self {
        let mut pb = Self::new(Trap::Write, ref_num);
        pb.buffer = data.to_vec();
        pb.req_count = data.len() as u32;
        pb
    }

    /// Control call; `params` is truncated to the side channel size
    pub fn control(ref_num: RefNum, cs_code: i16, params: &[u8]) -> Self {
        let mut pb = Self::new(Trap::Control, ref_num);
        pb.cs_code = cs_code;
        let n = params.len().min(CS_PARAM_SIZE);
        pb.cs_param[..n].copy_from_slice(&params[..n]);
        pb
    }

    pub fn status(ref_num: RefNum, cs_code: i16) -> Self {
        let mut pb = Self::new(Trap::Status, ref_num);
        pb.cs_code = cs_code;
        pb
    }

    pub fn kill(ref_num: RefNum) -> Self {
        Self::new(Trap::KillIO, ref_num)
    }

    pub fn with_position(mut self, mode: PositionMode, offset: i32) -> Self {
        self.pos_mode = mode;
        self.pos_offset = offset;
        self
    }

    pub fn with_completion<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ParamBlock) + Send + 'static,
    {
        self.completion = Some(Box::new(f));
        self
    }

    pub fn set_completion<F>(&mut self, f: F)
    where
        F: FnOnce(ParamBlock) + Send + 'static,
    {
        self.completion = Some(Box::new(f));
    }

    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    #[inline]
    pub fn result(&self) -> IoResult {
        self.result
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.result.is_done()
    }

    /// Make a finished block reusable
    pub fn reset(&mut self) {
        self.result = IoResult::Idle;
        self.act_count = 0;
        self.completion = None;
    }

    /// Transferred bytes
    pub fn data(&self) -> &[u8] {
        let n = (self.act_count as usize).min(self.buffer.len());
        &self.buffer[..n]
    }

    pub(crate) fn mark_pending(&mut self) {
        self.result = IoResult::Pending;
    }

    /// Undo `mark_pending` for a submission that was rejected
    pub(crate) fn mark_idle(&mut self) {
        self.result = IoResult::Idle;
    }

    /// Record a terminal result. A block that is already terminal keeps its
    /// first result.
    pub(crate) fn finish(&mut self, result: DeviceResult<()>) -> bool {
        if self.result.is_done() {
            return false;
        }
        self.result = IoResult::Done(result);
        true
    }

    pub(crate) fn take_completion(&mut self) -> Option<CompletionRoutine> {
        self.completion.take()
    }

    /// Check the buffer covers the requested count
    pub(crate) fn check_transfer(&self) -> DeviceResult<()> {
        if self.req_count as usize > self.buffer.len() {
            return Err(DeviceError::InvalidParameter);
        }
        Ok(())
    }
}

impl fmt::Debug for ParamBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamBlock")
            .field("ref_num", &self.ref_num)
            .field("trap", &self.trap)
            .field("req_count", &self.req_count)
            .field("act_count", &self.act_count)
            .field("pos_mode", &self.pos_mode)
            .field("pos_offset", &self.pos_offset)
            .field("cs_code", &self.cs_code)
            .field("result", &self.result)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}
