//! End-to-end Device Manager scenarios


use devmgr::device::{
    ClassicDriver, DceFlags, DispatchTable, InterruptClass, IoResult, LoadSource, ManualTicks, ModernDriver,
    ParamBlock, QueueStatus, ResourceMap,
};
use devmgr::error::os_err;
use devmgr::types::{CS_GET_DCE, CS_KILL_IO, DRVR};
use devmgr::{device_manager, init, DeviceError, DeviceManager, DeviceManagerConfig, RefNum};
use device_strategies::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ════════════════════════════════════════════════════════════
// Concrete Scenarios
// ════════════════════════════════════════════════════════════

#[test]
fn modern_driver_full_lifecycle() {
    let dm = manager();
    let table = DispatchTable::new()
        .with_open(ok_entry)
        .with_close(ok_entry)
        .with_prime(silent_prime);
    let r = dm.install_modern(ModernDriver::new("test0", table), None).unwrap();
    let dce = dm.lookup_dce(r).unwrap();
    assert!(dce.has(DceFlags::READ_ENABLE | DceFlags::WRITE_ENABLE));

    dm.open_device(r).unwrap();
    assert!(dce.is_open());
    dm.register_interrupt(r, InterruptClass::Disk, None).unwrap();

    let recorder = Recorder::new();
    let pb = ParamBlock::read(r, 128).with_completion(recorder.routine(0));
    let id = dm.pb_read_async(pb).unwrap();
    assert_eq!(dm.request_result(id), Ok(IoResult::Pending));

    {
        let _scope = dm.interrupt_scope();
        dm.raise_interrupt(InterruptClass::Disk).unwrap();
        assert_eq!(dm.completion_queue_depth(), 1);
        assert!(dm.is_completion_pending(id));
        assert_eq!(recorder.len(), 0);
    }

    let records = recorder.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].result, IoResult::Done(Ok(())));
    assert_eq!(records[0].act_count, 128);
    assert_eq!(dm.take(id).unwrap_err(), DeviceError::RequestNotFound);
    assert_eq!(dm.outstanding_requests(), 0);

    dm.close_device(r).unwrap();
    assert!(!dce.is_open());
    dm.remove_driver(r).unwrap();
    assert!(dm.find_driver("test0").is_none());
    assert_eq!(dm.unit_table_stats().in_use, 0);
    assert_eq!(dm.lookup_dce(r).unwrap_err(), DeviceError::BadRefNum);
}

#[test]
fn read_only_device_rejects_writes() {
    let dm = manager();
    let driver = ModernDriver::new(".ROM", rw_table()).with_flags(DceFlags::READ_ENABLE);
    let r = dm.install_modern(driver, None).unwrap();
    dm.open_device(r).unwrap();

    let mut pb = ParamBlock::write(r, b"nope");
    assert_eq!(dm.pb_write(&mut pb), Err(DeviceError::WriteUnsupported));
    assert_eq!(pb.result().code(), os_err::WRIT_ERR);

    let rejected = dm.pb_write_async(ParamBlock::write(r, b"nope")).unwrap_err();
    assert_eq!(rejected.error, DeviceError::WriteUnsupported);
    assert_eq!(
        dm.queue_status(r).unwrap(),
        QueueStatus {
            depth: 0,
            max_depth: 32,
            paused: false
        }
    );
    assert!(!dm.lookup_dce(r).unwrap().is_active());
    assert_eq!(dm.read(r, 4).unwrap().len(), 0);
}

// ════════════════════════════════════════════════════════════
// Unit Table and Lifecycle
// ════════════════════════════════════════════════════════════

#[test]
fn unallocated_refnums_are_bad() {
    let dm = manager();
    for r in [RefNum(-1), RefNum(-64), RefNum(-65), RefNum(0), RefNum(12)] {
        assert_eq!(dm.open_device(r), Err(DeviceError::BadRefNum));
        let err = dm.pb_read_async(ParamBlock::read(r, 1)).unwrap_err();
        assert_eq!(err.error, DeviceError::BadRefNum);
    }
}

static OPENS: AtomicUsize = AtomicUsize::new(0);

fn counting_open(_pb: &mut ParamBlock, _dce: &devmgr::device::Dce) -> devmgr::DeviceResult<()> {
    OPENS.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

#[test]
fn double_open_reaches_driver_once() {
    let dm = manager();
    let table = DispatchTable::new().with_open(counting_open).with_close(ok_entry);
    let r = dm.install_modern(ModernDriver::new(".Once", table), None).unwrap();
    dm.open_device(r).unwrap();
    dm.open_device(r).unwrap();
    assert_eq!(OPENS.load(Ordering::SeqCst), 1);
    assert_eq!(dm.stats().opens, 2);
    assert_eq!(dm.remove_driver(r), Err(DeviceError::RemoveFailed));
}

#[test]
fn explicit_refnum_in_use_is_rejected() {
    let dm = manager();
    let r = dm
        .install_modern(ModernDriver::new(".A", rw_table()), Some(RefNum(-10)))
        .unwrap();
    assert_eq!(r, RefNum(-10));
    assert_eq!(
        dm.install_modern(ModernDriver::new(".B", rw_table()), Some(RefNum(-10))),
        Err(DeviceError::InstallFailed)
    );
    assert_eq!(dm.installed(), vec![RefNum(-10)]);
}

#[test]
fn operations_before_initialize_fail() {
    let dm = DeviceManager::new(DeviceManagerConfig::default());
    assert_eq!(dm.open_driver(".Sony"), Err(DeviceError::NotInitialized));
    assert_eq!(dm.raise_interrupt(InterruptClass::Disk), Err(DeviceError::NotInitialized));
    let err = dm.pb_read_async(ParamBlock::read(RefNum(-1), 1)).unwrap_err();
    assert_eq!(err.error, DeviceError::NotInitialized);
    assert!(!dm.deliver_next_interrupt());
}

#[test]
fn global_instance() {
    assert_eq!(device_manager().unwrap_err(), DeviceError::NotInitialized);
    let dm = init(DeviceManagerConfig::default()).unwrap();
    let again = device_manager().unwrap();
    assert!(std::ptr::eq(dm, again));
    let r = dm.install_modern(ModernDriver::new(".Global", rw_table()), None).unwrap();
    assert_eq!(again.find_driver(".Global"), Some(r));
}

// ════════════════════════════════════════════════════════════
// Dispatch
// ════════════════════════════════════════════════════════════

#[test]
fn status_get_dce_reports_entry() {
    let dm = manager();
    let table = DispatchTable::new()
        .with_open(ok_entry)
        .with_prime(fill_prime)
        .with_status(ok_entry);
    let r = dm.install_modern(ModernDriver::new(".Stat", table), None).unwrap();
    dm.open_device(r).unwrap();
    dm.write(r, b"abcdef").unwrap();

    let raw = dm.status(r, CS_GET_DCE).unwrap();
    let (ref_num, flags, position, ..) = devmgr::device::DceInfo::decode(&raw);
    assert_eq!(ref_num, r);
    assert!(flags.contains(DceFlags::OPEN | DceFlags::STATUS_ENABLE));
    assert_eq!(position, 6);
}

#[test]
fn control_kill_discards_queue_without_routines() {
    let dm = manager();
    let table = rw_table().with_control(ok_entry);
    let r = dm.install_modern(ModernDriver::new(".Kill", table), None).unwrap();
    dm.open_device(r).unwrap();

    let recorder = Recorder::new();
    let ids: Vec<_> = (0..3)
        .map(|i| {
            dm.pb_read_async(ParamBlock::read(r, 4).with_completion(recorder.routine(i)))
                .unwrap()
        })
        .collect();
    dm.control(r, CS_KILL_IO, &[]).unwrap();

    assert_eq!(dm.queue_status(r).unwrap().depth, 0);
    assert!(!dm.lookup_dce(r).unwrap().is_active());
    assert_eq!(recorder.len(), 0);
    assert_eq!(dm.stats().discarded, 3);
    for id in ids {
        assert_eq!(dm.request_result(id), Err(DeviceError::RequestNotFound));
    }
}

#[test]
fn kill_io_leaves_device_open() {
    let dm = manager();
    let r = open_device(&dm, ".K", InterruptClass::Disk, None);
    dm.pb_read_async(ParamBlock::read(r, 1)).unwrap();
    dm.kill_io(r).unwrap();
    assert!(dm.lookup_dce(r).unwrap().is_open());
    assert_eq!(dm.stats().kills, 1);
    assert_eq!(dm.outstanding_requests(), 0);
}

// ════════════════════════════════════════════════════════════
// Async Queue
// ════════════════════════════════════════════════════════════

#[test]
fn fifo_order_and_overflow() {
    let dm = manager_with(DeviceManagerConfig::default().with_queue_depth(4));
    let r = open_device(&dm, ".Fifo", InterruptClass::Scsi, None);
    let recorder = Recorder::new();
    for tag in 0..4 {
        dm.pb_read_async(ParamBlock::read(r, 8).with_completion(recorder.routine(tag)))
            .unwrap();
    }
    let overflow = dm
        .pb_read_async(ParamBlock::read(r, 8).with_completion(recorder.routine(99)))
        .unwrap_err();
    assert_eq!(overflow.error, DeviceError::QueueOverflow);
    assert_eq!(overflow.block.result(), IoResult::Idle);
    assert!(overflow.block.has_completion());
    assert_eq!(dm.queue_status(r).unwrap().depth, 4);

    for _ in 0..4 {
        dm.raise_interrupt(InterruptClass::Scsi).unwrap();
    }
    assert_eq!(recorder.tags(), vec![0, 1, 2, 3]);
}

#[test]
fn routine_only_clients_keep_submitting() {
    let dm = manager_with(
        DeviceManagerConfig::default()
            .with_max_requests(4)
            .with_queue_depth(4),
    );
    let r = open_device(&dm, ".Cb", InterruptClass::Disk, None);
    let recorder = Recorder::new();
    for tag in 0..10 {
        let id = dm
            .pb_read_async(ParamBlock::read(r, 1).with_completion(recorder.routine(tag)))
            .unwrap();
        dm.raise_interrupt(InterruptClass::Disk).unwrap();
        assert_eq!(dm.request_result(id), Err(DeviceError::RequestNotFound));
    }
    assert_eq!(recorder.tags(), (0..10).collect::<Vec<_>>());
    assert_eq!(dm.outstanding_requests(), 0);
    assert_eq!(dm.queue_status(r).unwrap().depth, 0);
}

#[test]
fn async_kill_jumps_the_queue() {
    let dm = manager();
    let r = open_device(&dm, ".AK", InterruptClass::Disk, None);
    let recorder = Recorder::new();
    for tag in 0..3 {
        dm.pb_read_async(ParamBlock::read(r, 4).with_completion(recorder.routine(tag)))
            .unwrap();
    }
    dm.pb_kill_io_async(ParamBlock::kill(r).with_completion(recorder.routine(100)))
        .unwrap();

    assert_eq!(recorder.tags(), vec![100]);
    assert_eq!(recorder.records()[0].result, IoResult::Done(Ok(())));
    assert_eq!(dm.queue_status(r).unwrap().depth, 0);
    assert_eq!(dm.stats().discarded, 3);
    assert_eq!(dm.outstanding_requests(), 0);
}

#[test]
fn wait_times_out_on_paused_queue() {
    let dm = manager();
    let r = open_device(&dm, ".Slow", InterruptClass::Disk, None);
    dm.pause_queue(r).unwrap();
    let id = dm.pb_read_async(ParamBlock::read(r, 1)).unwrap();
    assert_eq!(dm.wait(id, Some(10)), Err(DeviceError::WaitTimeout));
    assert!(dm.queue_status(r).unwrap().paused);

    dm.resume_queue(r).unwrap();
    assert_eq!(dm.wait(id, Some(10)), Ok(()));
    assert!(dm.take(id).unwrap().is_complete());
}

#[test]
fn cancel_after_completion_is_not_found() {
    let dm = manager();
    let r = open_device(&dm, ".C", InterruptClass::Disk, None);
    let id = dm.pb_read_async(ParamBlock::read(r, 1)).unwrap();
    dm.raise_interrupt(InterruptClass::Disk).unwrap();
    assert_eq!(dm.cancel(id), Err(DeviceError::RequestNotFound));
    assert_eq!(dm.take(id).unwrap().result(), IoResult::Done(Ok(())));
}

#[test]
fn take_before_completion_is_rejected() {
    let dm = manager();
    let r = open_device(&dm, ".T", InterruptClass::Disk, None);
    let id = dm.pb_read_async(ParamBlock::read(r, 1)).unwrap();
    assert_eq!(dm.take(id).unwrap_err(), DeviceError::InvalidParameter);
}

#[test]
fn remove_cancels_queued_requests() {
    let dm = manager();
    let r = open_device(&dm, ".R", InterruptClass::Disk, None);
    let recorder = Recorder::new();
    dm.pb_read_async(ParamBlock::read(r, 1).with_completion(recorder.routine(7)))
        .unwrap();
    dm.close_device(r).unwrap();
    dm.remove_driver(r).unwrap();
    assert_eq!(recorder.records()[0].result, IoResult::Done(Err(DeviceError::Canceled)));
    assert!(dm.interrupt_handler(r).is_none());
}

// ════════════════════════════════════════════════════════════
// Loader
// ════════════════════════════════════════════════════════════

#[test]
fn open_driver_loads_installs_and_reuses() {
    let image = ClassicDriver::template(b".Sony").unwrap().to_bytes();
    let dm = DeviceManager::new(DeviceManagerConfig::default())
        .with_resources(ResourceMap::new().with_resource(DRVR, 4, b".Sony", image));
    dm.initialize().unwrap();

    let r = dm.open_driver(".Sony").unwrap();
    assert!(dm.lookup_dce(r).unwrap().is_open());
    assert_eq!(dm.open_driver(".Sony"), Ok(r));
    assert_eq!(dm.loader_stats().loaded, 1);
    assert_eq!(dm.with_resource_provider(|res| res.count(DRVR)), 1);
}

#[test]
fn open_driver_falls_back_to_template() {
    let dm = manager();
    let r = dm.open_driver(".Ghost").unwrap();
    let info = dm.dce_info(r).unwrap();
    assert_eq!(info.name, b".Ghost".to_vec());
    assert!(info.flags.contains(DceFlags::IO_CAPABILITIES));
    assert_eq!(dm.load_driver(".Ghost", None).unwrap().source, LoadSource::Template);
}

#[test]
fn missing_driver_without_template() {
    let dm = manager_with(DeviceManagerConfig::default().with_synthesized_drivers(false));
    assert_eq!(dm.open_driver(".None"), Err(DeviceError::ResourceNotFound));
    assert_eq!(dm.unit_table_stats().in_use, 0);
}

#[test]
fn install_image_round_trip() {
    let dm = manager();
    let mut image = ClassicDriver::template(b".Serial").unwrap();
    image.delay = 15;
    let r = dm.install_image(&image.to_bytes(), None).unwrap();
    let info = dm.dce_info(r).unwrap();
    assert_eq!(info.delay, 15);
    assert!(info.flags.contains(DceFlags::RAM_BASED));
    assert!(!info.modern);
    assert_eq!(dm.install_image(&[0; 6], None), Err(DeviceError::InstallFailed));
}

// ════════════════════════════════════════════════════════════
// Timing
// ════════════════════════════════════════════════════════════

#[test]
fn periodic_timer_fires_when_due() {
    let clock = Arc::new(ManualTicks::new(100));
    let dm = DeviceManager::new(DeviceManagerConfig::default()).with_clock(clock.clone());
    dm.initialize().unwrap();
    let r = dm.install_modern(ModernDriver::new(".Tick", rw_table()), None).unwrap();
    dm.open_device(r).unwrap();

    dm.start_periodic_interrupt(r, 5).unwrap();
    let id = dm.pb_read_async(ParamBlock::read(r, 1)).unwrap();
    assert_eq!(dm.trigger_periodic_interrupts(), Ok(false));
    clock.advance(5);
    assert_eq!(dm.trigger_periodic_interrupts(), Ok(true));
    assert!(dm.is_complete(id));
    assert_eq!(dm.interrupt_count(r), 1);
    assert_eq!(dm.trigger_periodic_interrupts(), Ok(false));

    dm.stop_periodic_interrupt(r).unwrap();
    clock.advance(50);
    assert_eq!(dm.trigger_periodic_interrupts(), Ok(false));
    assert!(dm.lookup_dce(r).unwrap().cur_ticks() >= 100);
}

#[test]
fn periodic_handlers_run_at_their_own_rates() {
    let clock = Arc::new(ManualTicks::new(0));
    let dm = DeviceManager::new(DeviceManagerConfig::default()).with_clock(clock.clone());
    dm.initialize().unwrap();
    let fast = dm.install_modern(ModernDriver::new(".Fast", rw_table()), None).unwrap();
    let slow = dm.install_modern(ModernDriver::new(".Slow", rw_table()), None).unwrap();
    let plain = open_device(&dm, ".Plain", InterruptClass::Timer, None);
    dm.open_device(fast).unwrap();
    dm.open_device(slow).unwrap();
    dm.start_periodic_interrupt(fast, 2).unwrap();
    dm.start_periodic_interrupt(slow, 6).unwrap();

    for _ in 0..6 {
        clock.advance(2);
        dm.trigger_periodic_interrupts().unwrap();
    }
    assert_eq!(dm.interrupt_count(fast), 6);
    assert_eq!(dm.interrupt_count(slow), 2);
    assert_eq!(dm.interrupt_count(plain), 0);

    dm.raise_interrupt(InterruptClass::Timer).unwrap();
    assert_eq!(dm.interrupt_count(plain), 1);
}
