//! Driver Dispatch
//!
//! Routes one operation to a driver entry point, enforcing open state and
//! capability flags, and keeps the DCE's position, flags and tick stamp
//! current. Control goodbye and kill, and status get-DCE, are handled
//! here rather than by the driver.

use log::trace;

use crate::device::dce::{Dce, DceFlags};
use crate::device::driver::{Driver, DriverOp};
use crate::device::param::ParamBlock;
use crate::device::DeviceManager;
use crate::error::{DeviceError, DeviceResult};
use crate::types::{PositionMode, Trap, CS_GET_DCE, CS_GOODBYE, CS_KILL_IO};

/// Call the driver's entry point for `op`.
///
/// Classic images have no executable code: a positive offset succeeds as a
/// no-op and a missing offset is a bad request. Modern drivers without a
/// kill routine treat kill as a no-op.
fn call_entry(op: DriverOp, pb: &mut ParamBlock, dce: &Dce) -> DeviceResult<()> {
    match dce.driver() {
        Driver::Classic(image) => match image.entry_offset(op) {
            Some(offset) if offset > 0 => Ok(()),
            Some(_) => Err(DeviceError::BadRequest),
            None => Ok(()),
        },
        Driver::Modern(driver) => match driver.table().entry(op) {
            Some(entry) => entry(pb, dce),
            None if op == DriverOp::Kill => Ok(()),
            None => Err(DeviceError::BadRequest),
        },
    }
}

/// Starting byte position for a transfer
fn transfer_start(pb: &ParamBlock, dce: &Dce) -> DeviceResult<i32> {
    let start = match pb.pos_mode {
        PositionMode::FromStart => Some(pb.pos_offset),
        PositionMode::FromMark => dce.position().checked_add(pb.pos_offset),
        PositionMode::AtMark | PositionMode::FromLeof => Some(dce.position()),
    };
    match start {
        Some(p) if p >= 0 => Ok(p),
        _ => Err(DeviceError::InvalidParameter),
    }
}

impl DeviceManager {
    /// Invoke one driver operation against a device control entry.
    ///
    /// The caller owns the parameter block's result; dispatch only returns
    /// the outcome.
    pub fn dispatch(&self, op: DriverOp, pb: &mut ParamBlock, dce: &Dce) -> DeviceResult<()> {
        let result = match op {
            DriverOp::Open => self.dispatch_open(pb, dce),
            DriverOp::Prime => self.dispatch_prime(pb, dce),
            DriverOp::Control => self.dispatch_control(pb, dce),
            DriverOp::Status => self.dispatch_status(pb, dce),
            DriverOp::Close => self.dispatch_close(pb, dce),
            DriverOp::Kill => self.dispatch_kill(pb, dce),
        };

        dce.touch(self.clock.now());
        let c = &self.counters;
        match op {
            DriverOp::Open => c.opens.inc(),
            DriverOp::Close => c.closes.inc(),
            DriverOp::Prime if pb.trap == Trap::Write => c.writes.inc(),
            DriverOp::Prime => c.reads.inc(),
            DriverOp::Control => c.controls.inc(),
            DriverOp::Status => c.statuses.inc(),
            DriverOp::Kill => c.kills.inc(),
        }
        if result.is_err() {
            c.errors.inc();
        }
        trace!("{:?} {} cs={} -> {:?}", op, dce.ref_num(), pb.cs_code, result);
        result
    }

    fn dispatch_open(&self, pb: &mut ParamBlock, dce: &Dce) -> DeviceResult<()> {
        if dce.is_open() {
            return Ok(());
        }
        call_entry(DriverOp::Open, pb, dce)?;
        dce.set_position(0);
        dce.insert_flags(DceFlags::OPEN);
        Ok(())
    }

    fn dispatch_prime(&self, pb: &mut ParamBlock, dce: &Dce) -> DeviceResult<()> {
        if !dce.is_open() {
            return Err(DeviceError::NotOpen);
        }
        let (flag, unsupported) = match pb.trap {
            Trap::Read => (DceFlags::READ_ENABLE, DeviceError::ReadUnsupported),
            Trap::Write => (DceFlags::WRITE_ENABLE, DeviceError::WriteUnsupported),
            _ => return Err(DeviceError::InvalidParameter),
        };
        if !dce.has(flag) {
            return Err(unsupported);
        }
        pb.check_transfer()?;
        dce.set_position(transfer_start(pb, dce)?);
        pb.act_count = 0;
        call_entry(DriverOp::Prime, pb, dce)
    }

    fn dispatch_control(&self, pb: &mut ParamBlock, dce: &Dce) -> DeviceResult<()> {
        if pb.cs_code == CS_GOODBYE {
            if !dce.has(DceFlags::NEEDS_GOODBYE) {
                return Ok(());
            }
            return call_entry(DriverOp::Control, pb, dce);
        }
        if !dce.is_open() {
            return Err(DeviceError::NotOpen);
        }
        if !dce.has(DceFlags::CONTROL_ENABLE) {
            return Err(DeviceError::ControlUnsupported);
        }
        if pb.cs_code == CS_KILL_IO {
            return self.dispatch_kill(pb, dce);
        }
        call_entry(DriverOp::Control, pb, dce)
    }

    fn dispatch_status(&self, pb: &mut ParamBlock, dce: &Dce) -> DeviceResult<()> {
        if !dce.is_open() {
            return Err(DeviceError::NotOpen);
        }
        if !dce.has(DceFlags::STATUS_ENABLE) {
            return Err(DeviceError::StatusUnsupported);
        }
        if pb.cs_code == CS_GET_DCE {
            dce.encode_into(&mut pb.cs_param);
            return Ok(());
        }
        call_entry(DriverOp::Status, pb, dce)
    }

    fn dispatch_close(&self, pb: &mut ParamBlock, dce: &Dce) -> DeviceResult<()> {
        if !dce.is_open() {
            return Err(DeviceError::NotOpen);
        }
        call_entry(DriverOp::Close, pb, dce)?;
        dce.remove_flags(DceFlags::OPEN);
        Ok(())
    }

    /// Drop queued requests, then let the driver abort anything in progress
    fn dispatch_kill(&self, pb: &mut ParamBlock, dce: &Dce) -> DeviceResult<()> {
        self.discard_queue(dce);
        dce.remove_flags(DceFlags::ACTIVE);
        call_entry(DriverOp::Kill, pb, dce)
    }

    /// Settle a finished prime: fix up the byte count, advance the mark and
    /// count the bytes. `simulate` fills in a full transfer for drivers that
    /// report success without setting a count.
    pub(crate) fn complete_transfer(
        &self,
        op: DriverOp,
        pb: &mut ParamBlock,
        dce: &Dce,
        result: DeviceResult<()>,
        simulate: bool,
    ) {
        if op != DriverOp::Prime || result.is_err() {
            return;
        }
        if simulate && pb.act_count == 0 {
            pb.act_count = pb.req_count;
        }
        pb.act_count = pb.act_count.min(pb.req_count);

        let moved = i32::try_from(pb.act_count).unwrap_or(i32::MAX);
        dce.set_position(dce.position().saturating_add(moved));
        let bytes = u64::from(pb.act_count);
        if pb.trap == Trap::Write {
            self.counters.bytes_written.add(bytes);
        } else {
            self.counters.bytes_read.add(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceManagerConfig;
    use crate::device::driver::{ClassicDriver, DispatchTable, EntryOffsets, ModernDriver};
    use crate::device::param::CS_PARAM_SIZE;
    use crate::types::RefNum;

    fn ok_entry(_pb: &mut ParamBlock, _dce: &Dce) -> DeviceResult<()> {
        Ok(())
    }

    fn echo_prime(pb: &mut ParamBlock, dce: &Dce) -> DeviceResult<()> {
        let at = dce.position() as u8;
        let n = pb.req_count as usize;
        for b in &mut pb.buffer[..n] {
            *b = at;
        }
        pb.act_count = pb.req_count;
        Ok(())
    }

    fn setup(table: DispatchTable) -> (DeviceManager, alloc::sync::Arc<Dce>) {
        let dm = DeviceManager::new(DeviceManagerConfig::default());
        dm.initialize().unwrap();
        let r = dm.install_modern(ModernDriver::new(".Disp", table), None).unwrap();
        let dce = dm.lookup_dce(r).unwrap();
        (dm, dce)
    }

    #[test]
    fn test_open_is_idempotent() {
        let (dm, dce) = setup(DispatchTable::new().with_open(ok_entry));
        let mut pb = ParamBlock::open(dce.ref_num(), Default::default());
        dm.dispatch(DriverOp::Open, &mut pb, &dce).unwrap();
        dce.set_position(12);
        dm.dispatch(DriverOp::Open, &mut pb, &dce).unwrap();
        assert!(dce.is_open());
        assert_eq!(dce.position(), 12);
        assert_eq!(dm.stats().opens, 2);
    }

    #[test]
    fn test_prime_requires_open_and_flag() {
        let (dm, dce) = setup(DispatchTable::new().with_open(ok_entry).with_prime(echo_prime));
        let mut pb = ParamBlock::read(dce.ref_num(), 4);
        assert_eq!(dm.dispatch(DriverOp::Prime, &mut pb, &dce), Err(DeviceError::NotOpen));

        let mut open = ParamBlock::open(dce.ref_num(), Default::default());
        dm.dispatch(DriverOp::Open, &mut open, &dce).unwrap();
        dce.remove_flags(DceFlags::WRITE_ENABLE);
        let mut pb = ParamBlock::write(dce.ref_num(), b"xy");
        assert_eq!(
            dm.dispatch(DriverOp::Prime, &mut pb, &dce),
            Err(DeviceError::WriteUnsupported)
        );
        assert_eq!(dm.stats().errors, 2);
    }

    #[test]
    fn test_positioning_modes() {
        let (dm, dce) = setup(DispatchTable::new().with_open(ok_entry).with_prime(echo_prime));
        let mut open = ParamBlock::open(dce.ref_num(), Default::default());
        dm.dispatch(DriverOp::Open, &mut open, &dce).unwrap();

        let mut pb = ParamBlock::read(dce.ref_num(), 2).with_position(PositionMode::FromStart, 10);
        let r = dm.dispatch(DriverOp::Prime, &mut pb, &dce);
        assert_eq!(pb.data(), &[10, 10]);
        dm.complete_transfer(DriverOp::Prime, &mut pb, &dce, r, false);
        assert_eq!(dce.position(), 12);

        let mut pb = ParamBlock::read(dce.ref_num(), 1).with_position(PositionMode::FromMark, -20);
        assert_eq!(
            dm.dispatch(DriverOp::Prime, &mut pb, &dce),
            Err(DeviceError::InvalidParameter)
        );
        assert_eq!(dm.stats().bytes_read, 2);
    }

    #[test]
    fn test_missing_modern_entry_is_bad_request() {
        let (dm, dce) = setup(DispatchTable::new().with_open(ok_entry));
        let mut open = ParamBlock::open(dce.ref_num(), Default::default());
        dm.dispatch(DriverOp::Open, &mut open, &dce).unwrap();
        dce.insert_flags(DceFlags::CONTROL_ENABLE);
        let mut pb = ParamBlock::control(dce.ref_num(), 42, &[]);
        assert_eq!(dm.dispatch(DriverOp::Control, &mut pb, &dce), Err(DeviceError::BadRequest));
        let mut kill = ParamBlock::kill(dce.ref_num());
        assert_eq!(dm.dispatch(DriverOp::Kill, &mut kill, &dce), Ok(()));
    }

    #[test]
    fn test_goodbye_only_when_requested() {
        let (dm, dce) = setup(DispatchTable::new().with_open(ok_entry));
        let mut pb = ParamBlock::control(dce.ref_num(), CS_GOODBYE, &[]);
        assert_eq!(dm.dispatch(DriverOp::Control, &mut pb, &dce), Ok(()));
        dce.insert_flags(DceFlags::NEEDS_GOODBYE);
        assert_eq!(dm.dispatch(DriverOp::Control, &mut pb, &dce), Err(DeviceError::BadRequest));
    }

    #[test]
    fn test_get_dce_status() {
        let (dm, dce) = setup(DispatchTable::new().with_open(ok_entry).with_status(ok_entry));
        let mut open = ParamBlock::open(dce.ref_num(), Default::default());
        dm.dispatch(DriverOp::Open, &mut open, &dce).unwrap();
        let mut pb = ParamBlock::status(dce.ref_num(), CS_GET_DCE);
        dm.dispatch(DriverOp::Status, &mut pb, &dce).unwrap();
        assert_eq!(&pb.cs_param[0..2], &dce.ref_num().0.to_be_bytes());
        assert_eq!(pb.cs_param.len(), CS_PARAM_SIZE);
    }

    #[test]
    fn test_classic_offsets() {
        let dm = DeviceManager::new(DeviceManagerConfig::default());
        dm.initialize().unwrap();
        let offsets = EntryOffsets {
            open: 0x20,
            prime: 0x24,
            control: 0,
            status: 0x2C,
            close: 0x30,
        };
        let flags = (DceFlags::IO_CAPABILITIES).bits();
        let image = ClassicDriver::new(b".Old", flags, offsets, alloc::vec![0; 32]).unwrap();
        let r = dm.install_classic(image, Some(RefNum(-9))).unwrap();
        let dce = dm.lookup_dce(r).unwrap();

        let mut open = ParamBlock::open(r, Default::default());
        dm.dispatch(DriverOp::Open, &mut open, &dce).unwrap();
        let mut pb = ParamBlock::control(r, 5, &[]);
        assert_eq!(dm.dispatch(DriverOp::Control, &mut pb, &dce), Err(DeviceError::BadRequest));
        let mut pb = ParamBlock::status(r, 9);
        assert_eq!(dm.dispatch(DriverOp::Status, &mut pb, &dce), Ok(()));
    }
}
