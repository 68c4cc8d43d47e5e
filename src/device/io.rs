//! Synchronous I/O
//!
//! Parameter-block calls that run the driver to completion before
//! returning. The block's result is terminal on return, including when the
//! call is rejected before reaching the driver. Completion routines belong
//! to asynchronous requests and are not run here.

use alloc::sync::Arc;

use crate::device::dce::{Dce, DceFlags};
use crate::device::driver::DriverOp;
use crate::device::param::{ParamBlock, CS_PARAM_SIZE};
use crate::device::DeviceManager;
use crate::error::{DeviceError, DeviceResult};
use crate::types::{Permission, RefNum, Trap, CS_GOODBYE};

impl DeviceManager {
    pub fn pb_open(&self, pb: &mut ParamBlock) -> DeviceResult<()> {
        self.sync_call(DriverOp::Open, Trap::Open, pb)
    }

    pub fn pb_close(&self, pb: &mut ParamBlock) -> DeviceResult<()> {
        self.sync_call(DriverOp::Close, Trap::Close, pb)
    }

    pub fn pb_read(&self, pb: &mut ParamBlock) -> DeviceResult<()> {
        self.sync_call(DriverOp::Prime, Trap::Read, pb)
    }

    pub fn pb_write(&self, pb: &mut ParamBlock) -> DeviceResult<()> {
        self.sync_call(DriverOp::Prime, Trap::Write, pb)
    }

    pub fn pb_control(&self, pb: &mut ParamBlock) -> DeviceResult<()> {
        self.sync_call(DriverOp::Control, Trap::Control, pb)
    }

    pub fn pb_status(&self, pb: &mut ParamBlock) -> DeviceResult<()> {
        self.sync_call(DriverOp::Status, Trap::Status, pb)
    }

    /// Discard a device's queued requests and abort any in progress
    pub fn pb_kill_io(&self, pb: &mut ParamBlock) -> DeviceResult<()> {
        self.sync_call(DriverOp::Kill, Trap::KillIO, pb)
    }

    fn sync_call(&self, op: DriverOp, trap: Trap, pb: &mut ParamBlock) -> DeviceResult<()> {
        let checked = self.ensure_initialized().and_then(|()| self.precheck(op, trap, pb));
        pb.mark_pending();
        let result = match checked {
            Ok(dce) => {
                let result = self.dispatch(op, pb, &dce);
                self.complete_transfer(op, pb, &dce, result, false);
                result
            }
            Err(e) => {
                self.counters.errors.inc();
                Err(e)
            }
        };
        pb.finish(result);
        result
    }

    /// Checks made before any queue or driver is touched: the block's trap,
    /// the device's presence, and the capability the call needs.
    pub(crate) fn precheck(&self, op: DriverOp, trap: Trap, pb: &ParamBlock) -> DeviceResult<Arc<Dce>> {
        if pb.trap != trap {
            return Err(DeviceError::InvalidParameter);
        }
        let dce = self.lookup_dce(pb.ref_num)?;
        match op {
            DriverOp::Prime => {
                let (flag, unsupported) = match trap {
                    Trap::Write => (DceFlags::WRITE_ENABLE, DeviceError::WriteUnsupported),
                    _ => (DceFlags::READ_ENABLE, DeviceError::ReadUnsupported),
                };
                if !dce.has(flag) {
                    return Err(unsupported);
                }
                pb.check_transfer()?;
            }
            DriverOp::Control if pb.cs_code != CS_GOODBYE => {
                if !dce.has(DceFlags::CONTROL_ENABLE) {
                    return Err(DeviceError::ControlUnsupported);
                }
            }
            DriverOp::Status => {
                if !dce.has(DceFlags::STATUS_ENABLE) {
                    return Err(DeviceError::StatusUnsupported);
                }
            }
            _ => {}
        }
        Ok(dce)
    }

    // ========================================================================
    // Convenience Calls
    // ========================================================================

    /// Open an installed device for reading and writing
    pub fn open_device(&self, ref_num: RefNum) -> DeviceResult<()> {
        self.pb_open(&mut ParamBlock::open(ref_num, Permission::ReadWrite))
    }

    pub fn close_device(&self, ref_num: RefNum) -> DeviceResult<()> {
        self.pb_close(&mut ParamBlock::close(ref_num))
    }

    /// Read up to `count` bytes at the current mark
    pub fn read(&self, ref_num: RefNum, count: u32) -> DeviceResult<alloc::vec::Vec<u8>> {
        let mut pb = ParamBlock::read(ref_num, count);
        self.pb_read(&mut pb)?;
        let n = pb.act_count as usize;
        pb.buffer.truncate(n);
        Ok(pb.buffer)
    }

    /// Write `data` at the current mark, returning the bytes accepted
    pub fn write(&self, ref_num: RefNum, data: &[u8]) -> DeviceResult<u32> {
        let mut pb = ParamBlock::write(ref_num, data);
        self.pb_write(&mut pb)?;
        Ok(pb.act_count)
    }

    pub fn control(&self, ref_num: RefNum, cs_code: i16, params: &[u8]) -> DeviceResult<()> {
        self.pb_control(&mut ParamBlock::control(ref_num, cs_code, params))
    }

    /// Status call, returning the side channel the driver filled in
    pub fn status(&self, ref_num: RefNum, cs_code: i16) -> DeviceResult<[u8; CS_PARAM_SIZE]> {
        let mut pb = ParamBlock::status(ref_num, cs_code);
        self.pb_status(&mut pb)?;
        Ok(pb.cs_param)
    }

    pub fn kill_io(&self, ref_num: RefNum) -> DeviceResult<()> {
        self.pb_kill_io(&mut ParamBlock::kill(ref_num))
    }
}
