//! Asynchronous I/O
//!
//! Submitted parameter blocks move into a bounded request arena and their
//! ids join the target device's FIFO. Interrupt servicing takes one request
//! at a time, dispatches it, and queues the completion; completions are
//! delivered, and completion routines run, only at nesting level zero.
//!
//! Every request finishes exactly once: by servicing, by `cancel`, by a
//! queue flush, or by being discarded when the device is killed.
//! Discarded requests never run their completion routine.
//!
//! A request submitted with a completion routine is released from the
//! arena as soon as the routine has been handed its block, so its id reports
//! `RequestNotFound` afterwards. Requests without a routine stay `Done` until
//! the caller `take`s them.

use alloc::vec::Vec;

use log::{trace, warn};
use thiserror::Error;

use crate::device::completion::CompletionEntry;
use crate::device::dce::{Dce, DceFlags};
use crate::device::driver::DriverOp;
use crate::device::io_queue::QueueStatus;
use crate::device::param::{IoResult, ParamBlock};
use crate::device::slab::SlabKey;
use crate::device::DeviceManager;
use crate::error::{DeviceError, DeviceResult};
use crate::types::{RefNum, Ticks, Trap, CS_GOODBYE};

// ============================================================================
// Request Tracking
// ============================================================================

/// Handle to a submitted asynchronous request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub(crate) SlabKey);

impl RequestId {
    /// Arena slot backing the request
    pub fn index(&self) -> u32 {
        self.0.index()
    }
}

pub(crate) enum RequestState {
    /// Waiting in the device queue
    Queued(ParamBlock),
    /// Block lent to the driver
    InFlight,
    /// Completion queued, not yet delivered
    Finishing(ParamBlock),
    /// Result final; block without a completion routine waiting to be taken
    Done(ParamBlock),
}

pub(crate) struct Request {
    pub ref_num: RefNum,
    pub op: DriverOp,
    pub submitted: Ticks,
    pub state: RequestState,
}

impl Request {
    fn into_block(self) -> Option<ParamBlock> {
        match self.state {
            RequestState::Queued(pb) | RequestState::Finishing(pb) | RequestState::Done(pb) => Some(pb),
            RequestState::InFlight => None,
        }
    }
}

/// Rejected submission. The block comes back unchanged so it can be reused.
#[derive(Error, Debug)]
#[error("request rejected: {error}")]
pub struct SubmitError {
    pub error: DeviceError,
    pub block: ParamBlock,
}

impl SubmitError {
    pub fn into_block(self) -> ParamBlock {
        self.block
    }
}

impl From<SubmitError> for DeviceError {
    fn from(e: SubmitError) -> Self {
        e.error
    }
}

// ============================================================================
// Submission
// ============================================================================

impl DeviceManager {
    pub fn pb_open_async(&self, pb: ParamBlock) -> Result<RequestId, SubmitError> {
        self.submit(DriverOp::Open, Trap::Open, pb)
    }

    pub fn pb_close_async(&self, pb: ParamBlock) -> Result<RequestId, SubmitError> {
        self.submit(DriverOp::Close, Trap::Close, pb)
    }

    pub fn pb_read_async(&self, pb: ParamBlock) -> Result<RequestId, SubmitError> {
        self.submit(DriverOp::Prime, Trap::Read, pb)
    }

    pub fn pb_write_async(&self, pb: ParamBlock) -> Result<RequestId, SubmitError> {
        self.submit(DriverOp::Prime, Trap::Write, pb)
    }

    pub fn pb_control_async(&self, pb: ParamBlock) -> Result<RequestId, SubmitError> {
        self.submit(DriverOp::Control, Trap::Control, pb)
    }

    pub fn pb_status_async(&self, pb: ParamBlock) -> Result<RequestId, SubmitError> {
        self.submit(DriverOp::Status, Trap::Status, pb)
    }

    /// Asynchronous KillIO. It runs at once rather than queueing behind the
    /// requests it discards; only its result travels the completion path.
    pub fn pb_kill_io_async(&self, mut pb: ParamBlock) -> Result<RequestId, SubmitError> {
        let checked = self.ensure_initialized().and_then(|()| {
            if pb.result().is_pending() {
                return Err(DeviceError::InvalidParameter);
            }
            self.precheck(DriverOp::Kill, Trap::KillIO, &pb)
        });
        let dce = match checked {
            Ok(dce) => dce,
            Err(error) => {
                self.counters.errors.inc();
                return Err(SubmitError { error, block: pb });
            }
        };
        if let Err(error) = self.completions.lock().reserve(1) {
            self.interrupts.counters.queue_overflows.inc();
            self.counters.errors.inc();
            return Err(SubmitError { error, block: pb });
        }

        let ref_num = pb.ref_num;
        let request = Request {
            ref_num,
            op: DriverOp::Kill,
            submitted: self.clock.now(),
            state: RequestState::InFlight,
        };
        let inserted = self.requests.lock().insert(request);
        let Ok(key) = inserted else {
            self.completions.lock().unreserve(1);
            self.counters.errors.inc();
            return Err(SubmitError {
                error: DeviceError::OutOfMemory,
                block: pb,
            });
        };
        let id = RequestId(key);

        pb.mark_pending();
        let result = self.dispatch(DriverOp::Kill, &mut pb, &dce);
        if let Some(request) = self.requests.lock().get_mut(id.0) {
            request.state = RequestState::Finishing(pb);
        }
        let entry = CompletionEntry::new(id, result, self.clock.now());
        if self.completions.lock().push_reserved(entry).is_ok() {
            self.interrupts.counters.completions_queued.inc();
        }
        trace!("async kill on {} as {:?}: {:?}", ref_num, id, result);
        self.process_completions();
        Ok(id)
    }

    /// Validate and queue a request. Nothing is mutated on rejection.
    fn submit(&self, op: DriverOp, trap: Trap, mut pb: ParamBlock) -> Result<RequestId, SubmitError> {
        let dce = match self.validate_async(op, trap, &pb) {
            Ok(dce) => dce,
            Err(error) => {
                self.counters.errors.inc();
                trace!("async {:?} on {} rejected: {}", op, pb.ref_num, error);
                return Err(SubmitError { error, block: pb });
            }
        };

        let ref_num = pb.ref_num;
        let submitted = self.clock.now();

        let mut requests = self.requests.lock();
        let mut queue = dce.queue();
        let capacity = if queue.is_full() {
            Err(DeviceError::QueueOverflow)
        } else if requests.is_full() {
            Err(DeviceError::OutOfMemory)
        } else {
            Ok(())
        };
        if let Err(error) = capacity {
            drop(queue);
            drop(requests);
            self.counters.errors.inc();
            warn!("{} cannot accept {:?}: {}", ref_num, op, error);
            return Err(SubmitError { error, block: pb });
        }

        pb.mark_pending();
        let request = Request {
            ref_num,
            op,
            submitted,
            state: RequestState::Queued(pb),
        };
        let rejected = match requests.insert(request) {
            Ok(key) => {
                let id = RequestId(key);
                match queue.enqueue(id) {
                    Ok(()) => {
                        dce.insert_flags(DceFlags::ACTIVE);
                        trace!("queued {:?} on {} as {:?} (depth {})", op, ref_num, id, queue.len());
                        return Ok(id);
                    }
                    Err(error) => (error, requests.remove(key)),
                }
            }
            Err(request) => (DeviceError::OutOfMemory, Some(request)),
        };

        drop(queue);
        drop(requests);
        self.counters.errors.inc();
        let (error, request) = rejected;
        let mut block = request
            .and_then(Request::into_block)
            .unwrap_or_else(|| ParamBlock::new(trap, ref_num));
        block.mark_idle();
        Err(SubmitError { error, block })
    }

    /// Submission checks: initialized, idle block, device present, capability, open
    fn validate_async(&self, op: DriverOp, trap: Trap, pb: &ParamBlock) -> DeviceResult<alloc::sync::Arc<Dce>> {
        self.ensure_initialized()?;
        if pb.result().is_pending() {
            return Err(DeviceError::InvalidParameter);
        }
        let dce = self.precheck(op, trap, pb)?;
        let goodbye = op == DriverOp::Control && pb.cs_code == CS_GOODBYE;
        if op != DriverOp::Open && !goodbye && !dce.is_open() {
            return Err(DeviceError::NotOpen);
        }
        Ok(dce)
    }

    // ========================================================================
    // Interrupt-Side Servicing
    // ========================================================================

    /// Service one queued request on a device. Returns whether a request ran.
    ///
    /// A completion slot is reserved before the request leaves the queue; if
    /// none is free the request stays queued and the overflow is counted.
    pub(crate) fn service_device(&self, ref_num: RefNum) -> bool {
        let Some(dce) = self.units.lock().lookup(ref_num) else {
            return false;
        };
        if !dce.is_active() {
            return false;
        }

        if self.completions.lock().reserve(1).is_err() {
            self.interrupts.counters.queue_overflows.inc();
            warn!("completion queue full, {} left queued", ref_num);
            return false;
        }

        let taken = {
            let mut requests = self.requests.lock();
            let mut queue = dce.queue();
            let next = queue.dequeue();
            if next.is_none() && queue.is_empty() {
                dce.remove_flags(DceFlags::ACTIVE);
            }
            next.and_then(|id| {
                let request = requests.get_mut(id.0)?;
                match core::mem::replace(&mut request.state, RequestState::InFlight) {
                    RequestState::Queued(pb) => Some((id, request.op, pb)),
                    other => {
                        request.state = other;
                        None
                    }
                }
            })
        };

        let Some((id, op, mut pb)) = taken else {
            self.completions.lock().unreserve(1);
            return false;
        };

        let result = self.dispatch(op, &mut pb, &dce);
        self.complete_transfer(op, &mut pb, &dce, result, true);
        if let Some(request) = self.requests.lock().get_mut(id.0) {
            request.state = RequestState::Finishing(pb);
        }

        let entry = CompletionEntry::new(id, result, self.clock.now());
        if self.completions.lock().push_reserved(entry).is_ok() {
            self.interrupts.counters.completions_queued.inc();
        }
        {
            let queue = dce.queue();
            if queue.is_empty() {
                dce.remove_flags(DceFlags::ACTIVE);
            }
        }
        trace!("serviced {:?} on {}: {:?}", id, ref_num, result);
        true
    }

    /// Service one request on every device with queued work
    pub(crate) fn service_pending(&self) -> usize {
        let active: Vec<RefNum> = self
            .units
            .lock()
            .entries()
            .iter()
            .filter(|d| d.is_active())
            .map(|d| d.ref_num())
            .collect();
        active
            .into_iter()
            .filter(|&r| self.service_device(r))
            .count()
    }

    /// Deliver queued completions. Does nothing inside interrupt context.
    pub fn process_completions(&self) -> usize {
        if self.interrupts.nesting() > 0 {
            return 0;
        }
        let mut delivered = 0;
        loop {
            let entry = self.completions.lock().pop();
            let Some(entry) = entry else {
                break;
            };
            if self.finish_request(entry.request, entry.result) {
                self.interrupts.counters.completions_delivered.inc();
                delivered += 1;
            }
        }
        delivered
    }

    /// Make a request's result terminal. A block with a completion routine
    /// is handed to it and the request released; otherwise the block stays
    /// `Done` until taken. The routine runs with no lock held.
    fn finish_request(&self, id: RequestId, result: DeviceResult<()>) -> bool {
        let taken = {
            let mut requests = self.requests.lock();
            let Some(request) = requests.get_mut(id.0) else {
                return false;
            };
            match core::mem::replace(&mut request.state, RequestState::InFlight) {
                RequestState::Finishing(mut pb) | RequestState::Queued(mut pb) => {
                    pb.finish(result);
                    match pb.take_completion() {
                        Some(routine) => {
                            requests.remove(id.0);
                            Some((pb, routine))
                        }
                        None => {
                            request.state = RequestState::Done(pb);
                            None
                        }
                    }
                }
                other => {
                    request.state = other;
                    return false;
                }
            }
        };

        if let Some((pb, routine)) = taken {
            routine(pb);
        }
        self.signal_completion();
        true
    }

    #[cfg(feature = "std")]
    fn signal_completion(&self) {
        let (lock, cvar) = &self.completion_signal;
        if let Ok(mut generation) = lock.lock() {
            *generation = generation.wrapping_add(1);
            cvar.notify_all();
        }
    }

    #[cfg(not(feature = "std"))]
    fn signal_completion(&self) {}

    /// One cooperative step: deliver a posted interrupt if any, otherwise
    /// service every active device, then deliver completions.
    pub fn poll(&self) -> usize {
        if self.interrupts.nesting() > 0 {
            return 0;
        }
        if !self.deliver_next_interrupt() {
            self.service_pending();
        }
        self.process_completions()
    }

    // ========================================================================
    // Cancel, Flush, Discard
    // ========================================================================

    /// Cancel a request still waiting in its device queue. It completes as
    /// `Canceled` and its completion routine runs.
    pub fn cancel(&self, id: RequestId) -> DeviceResult<()> {
        self.ensure_initialized()?;
        let ref_num = {
            let requests = self.requests.lock();
            match requests.get(id.0) {
                Some(r) if matches!(r.state, RequestState::Queued(_)) => r.ref_num,
                _ => return Err(DeviceError::RequestNotFound),
            }
        };
        let dce = self.lookup_dce(ref_num)?;

        let nested = self.in_interrupt();
        if nested {
            self.completions.lock().reserve(1)?;
        }

        let removed = {
            let requests = self.requests.lock();
            let mut queue = dce.queue();
            let queued = requests
                .get(id.0)
                .is_some_and(|r| matches!(r.state, RequestState::Queued(_)));
            let removed = queued && queue.remove(id);
            if queue.is_empty() {
                dce.remove_flags(DceFlags::ACTIVE);
            }
            removed
        };
        if !removed {
            if nested {
                self.completions.lock().unreserve(1);
            }
            return Err(DeviceError::RequestNotFound);
        }

        self.counters.canceled.inc();
        trace!("canceled {:?} on {}", id, ref_num);
        if nested {
            self.queue_finishing(id, Err(DeviceError::Canceled));
        } else {
            self.finish_request(id, Err(DeviceError::Canceled));
        }
        Ok(())
    }

    /// Complete every queued request on a device as `Canceled`
    pub fn flush(&self, ref_num: RefNum) -> DeviceResult<usize> {
        self.ensure_initialized()?;
        let dce = self.lookup_dce(ref_num)?;
        self.flush_dce(&dce)
    }

    pub(crate) fn flush_dce(&self, dce: &Dce) -> DeviceResult<usize> {
        let nested = self.in_interrupt();
        let ids = {
            let _requests = self.requests.lock();
            let mut queue = dce.queue();
            if nested {
                self.completions.lock().reserve(queue.len())?;
            }
            let ids = queue.drain();
            dce.remove_flags(DceFlags::ACTIVE);
            ids
        };

        for &id in &ids {
            self.counters.canceled.inc();
            if nested {
                self.queue_finishing(id, Err(DeviceError::Canceled));
            } else {
                self.finish_request(id, Err(DeviceError::Canceled));
            }
        }
        if !ids.is_empty() {
            trace!("flushed {} requests on {}", ids.len(), dce.ref_num());
        }
        Ok(ids.len())
    }

    /// Move a queued request to `Finishing` and fill a reserved completion slot
    fn queue_finishing(&self, id: RequestId, result: DeviceResult<()>) {
        {
            let mut requests = self.requests.lock();
            if let Some(request) = requests.get_mut(id.0) {
                let state = core::mem::replace(&mut request.state, RequestState::InFlight);
                request.state = match state {
                    RequestState::Queued(pb) => RequestState::Finishing(pb),
                    other => other,
                };
            }
        }
        let entry = CompletionEntry::new(id, result, self.clock.now());
        if self.completions.lock().push_reserved(entry).is_ok() {
            self.interrupts.counters.completions_queued.inc();
        }
    }

    /// Drop every queued request on a device without running completion
    /// routines. Used by KillIO.
    pub(crate) fn discard_queue(&self, dce: &Dce) -> usize {
        let mut requests = self.requests.lock();
        let ids = {
            let mut queue = dce.queue();
            let ids = queue.drain();
            dce.remove_flags(DceFlags::ACTIVE);
            ids
        };
        for &id in &ids {
            requests.remove(id.0);
        }
        drop(requests);

        self.counters.discarded.add(ids.len() as u64);
        if !ids.is_empty() {
            trace!("discarded {} requests on {}", ids.len(), dce.ref_num());
        }
        ids.len()
    }

    // ========================================================================
    // Results
    // ========================================================================

    /// Current result of a request
    pub fn request_result(&self, id: RequestId) -> DeviceResult<IoResult> {
        let requests = self.requests.lock();
        let request = requests.get(id.0).ok_or(DeviceError::RequestNotFound)?;
        Ok(match &request.state {
            RequestState::Done(pb) => pb.result(),
            _ => IoResult::Pending,
        })
    }

    /// Tick count at which a request was submitted
    pub fn request_submitted(&self, id: RequestId) -> DeviceResult<Ticks> {
        let requests = self.requests.lock();
        requests
            .get(id.0)
            .map(|r| r.submitted)
            .ok_or(DeviceError::RequestNotFound)
    }

    pub fn is_complete(&self, id: RequestId) -> bool {
        matches!(self.request_result(id), Ok(IoResult::Done(_)))
    }

    /// Is a completion for `id` queued but not yet delivered?
    pub fn is_completion_pending(&self, id: RequestId) -> bool {
        self.completions.lock().is_pending(id)
    }

    pub fn completion_queue_depth(&self) -> usize {
        self.completions.lock().len()
    }

    /// Requests queued, in flight, or done but not yet taken back
    pub fn outstanding_requests(&self) -> usize {
        self.requests.lock().len()
    }

    /// Take back a completed block and release its request id
    pub fn take(&self, id: RequestId) -> DeviceResult<ParamBlock> {
        let mut requests = self.requests.lock();
        match requests.get(id.0).map(|r| &r.state) {
            None => Err(DeviceError::RequestNotFound),
            Some(RequestState::Done(_)) => match requests.remove(id.0).map(|r| r.state) {
                Some(RequestState::Done(pb)) => Ok(pb),
                _ => Err(DeviceError::RequestNotFound),
            },
            Some(_) => Err(DeviceError::InvalidParameter),
        }
    }

    /// Wait cooperatively for a request to finish.
    ///
    /// At nesting level zero each iteration polls: posted interrupts are
    /// delivered, active devices serviced, and completions run. `timeout`
    /// is measured in ticks from the manager's clock. A request whose
    /// completion routine has already run is gone and reports `RequestNotFound`.
    pub fn wait(&self, id: RequestId, timeout: Option<Ticks>) -> DeviceResult<()> {
        self.ensure_initialized()?;
        let start = self.clock.now();
        loop {
            if let IoResult::Done(result) = self.request_result(id)? {
                return result;
            }
            if !self.in_interrupt() {
                self.poll();
                if let IoResult::Done(result) = self.request_result(id)? {
                    return result;
                }
            }
            if let Some(limit) = timeout {
                if self.clock.now().wrapping_sub(start) >= limit {
                    return Err(DeviceError::WaitTimeout);
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Block the calling thread until another thread completes the request
    #[cfg(feature = "std")]
    pub fn wait_blocking(&self, id: RequestId, timeout: Option<std::time::Duration>) -> DeviceResult<()> {
        use std::time::Instant;

        self.ensure_initialized()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let (lock, cvar) = &self.completion_signal;
        let mut seen = lock.lock().map_err(|_| DeviceError::Aborted)?;
        loop {
            if let IoResult::Done(result) = self.request_result(id)? {
                return result;
            }
            let generation = *seen;
            seen = match deadline {
                None => cvar
                    .wait_while(seen, |g| *g == generation)
                    .map_err(|_| DeviceError::Aborted)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DeviceError::WaitTimeout);
                    }
                    let (guard, _) = cvar
                        .wait_timeout_while(seen, deadline - now, |g| *g == generation)
                        .map_err(|_| DeviceError::Aborted)?;
                    guard
                }
            };
        }
    }

    // ========================================================================
    // Queue Control
    // ========================================================================

    /// Stop servicing a device's queue; submissions are still accepted
    pub fn pause_queue(&self, ref_num: RefNum) -> DeviceResult<()> {
        self.ensure_initialized()?;
        self.lookup_dce(ref_num)?.queue().pause();
        Ok(())
    }

    pub fn resume_queue(&self, ref_num: RefNum) -> DeviceResult<()> {
        self.ensure_initialized()?;
        self.lookup_dce(ref_num)?.queue().resume();
        Ok(())
    }

    pub fn queue_status(&self, ref_num: RefNum) -> DeviceResult<QueueStatus> {
        self.ensure_initialized()?;
        Ok(self.lookup_dce(ref_num)?.queue_status())
    }
}
