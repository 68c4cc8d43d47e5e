//! Unit Table
//!
//! Fixed-capacity registry mapping driver reference numbers to device
//! control entries. A slot can be reserved before its DCE exists so an
//! install can be rolled back without leaving a half-built entry behind.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::device::dce::Dce;
use crate::device::stats::Counter;
use crate::error::{DeviceError, DeviceResult};
use crate::types::RefNum;

#[derive(Debug, Default)]
struct UnitSlot {
    in_use: bool,
    dce: Option<Arc<Dce>>,
}

/// Unit table statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitTableStats {
    pub capacity: usize,
    pub in_use: usize,
    pub lookups: u64,
    pub allocations: u64,
    pub deallocations: u64,
}

/// Unit table
#[derive(Debug)]
pub struct UnitTable {
    slots: Vec<UnitSlot>,
    in_use: usize,
    lookups: Counter,
    allocations: Counter,
    deallocations: Counter,
}

impl UnitTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(RefNum::MAX_SLOT + 1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, UnitSlot::default);
        Self {
            slots,
            in_use: 0,
            lookups: Counter::new("lookups"),
            allocations: Counter::new("allocations"),
            deallocations: Counter::new("deallocations"),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    fn index(&self, ref_num: RefNum) -> Option<usize> {
        ref_num.slot().filter(|&i| i < self.slots.len())
    }

    /// Is `ref_num` inside the table's range?
    pub fn is_valid(&self, ref_num: RefNum) -> bool {
        self.index(ref_num).is_some()
    }

    pub fn is_allocated(&self, ref_num: RefNum) -> bool {
        self.index(ref_num).is_some_and(|i| self.slots[i].in_use)
    }

    /// First free refnum, scanning -1, -2, ...
    pub fn next_available(&self) -> DeviceResult<RefNum> {
        self.slots
            .iter()
            .position(|s| !s.in_use)
            .map(RefNum::from_slot)
            .ok_or(DeviceError::UnitTableFull)
    }

    /// Reserve a slot, either the preferred one or the next available
    pub fn allocate(&mut self, preferred: Option<RefNum>) -> DeviceResult<RefNum> {
        let ref_num = match preferred {
            Some(r) => {
                let i = self.index(r).ok_or(DeviceError::BadRefNum)?;
                if self.slots[i].in_use {
                    return Err(DeviceError::InstallFailed);
                }
                r
            }
            None => self.next_available()?,
        };

        let i = self.index(ref_num).ok_or(DeviceError::BadRefNum)?;
        self.slots[i] = UnitSlot {
            in_use: true,
            dce: None,
        };
        self.in_use += 1;
        self.allocations.inc();
        Ok(ref_num)
    }

    /// Attach a DCE to a reserved, empty slot
    pub fn attach(&mut self, ref_num: RefNum, dce: Arc<Dce>) -> DeviceResult<()> {
        let i = self.index(ref_num).ok_or(DeviceError::BadRefNum)?;
        let slot = &mut self.slots[i];
        if !slot.in_use {
            return Err(DeviceError::BadRefNum);
        }
        if slot.dce.is_some() {
            return Err(DeviceError::InstallFailed);
        }
        slot.dce = Some(dce);
        Ok(())
    }

    /// Free a slot, returning its DCE if one was attached
    pub fn deallocate(&mut self, ref_num: RefNum) -> DeviceResult<Option<Arc<Dce>>> {
        let i = self.index(ref_num).ok_or(DeviceError::BadRefNum)?;
        let slot = &mut self.slots[i];
        if !slot.in_use {
            return Err(DeviceError::BadRefNum);
        }
        let dce = slot.dce.take();
        slot.in_use = false;
        self.in_use -= 1;
        self.deallocations.inc();
        Ok(dce)
    }

    /// DCE for `ref_num`; `None` when out of range, unallocated or not yet attached
    pub fn lookup(&self, ref_num: RefNum) -> Option<Arc<Dce>> {
        self.lookups.inc();
        let i = self.index(ref_num)?;
        self.slots[i].dce.clone()
    }

    /// Exact, case-sensitive driver name match
    pub fn find_by_name(&self, name: &[u8]) -> Option<RefNum> {
        if name.is_empty() {
            return None;
        }
        self.slots
            .iter()
            .position(|s| s.dce.as_ref().is_some_and(|d| d.name() == name))
            .map(RefNum::from_slot)
    }

    /// Refnums of every allocated slot, ascending slot order
    pub fn allocated(&self) -> Vec<RefNum> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .map(|(i, _)| RefNum::from_slot(i))
            .collect()
    }

    /// Every attached DCE
    pub fn entries(&self) -> Vec<Arc<Dce>> {
        self.slots.iter().filter_map(|s| s.dce.clone()).collect()
    }

    /// Check slot bookkeeping: attached DCEs sit in used slots under their own refnum
    pub fn verify_consistency(&self) -> bool {
        let counted = self.slots.iter().filter(|s| s.in_use).count();
        if counted != self.in_use {
            return false;
        }
        self.slots.iter().enumerate().all(|(i, s)| match &s.dce {
            Some(dce) => s.in_use && dce.ref_num() == RefNum::from_slot(i),
            None => true,
        })
    }

    pub fn stats(&self) -> UnitTableStats {
        UnitTableStats {
            capacity: self.slots.len(),
            in_use: self.in_use,
            lookups: self.lookups.get(),
            allocations: self.allocations.get(),
            deallocations: self.deallocations.get(),
        }
    }
}
