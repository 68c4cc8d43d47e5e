//! Core Device Manager types
//!
//! Reference numbers, trap words and the small enums that travel inside
//! every parameter block.

use core::fmt;

// ============================================================================
// Reference Numbers
// ============================================================================

/// Driver reference number.
///
/// Driver refnums are negative: slot `i` of the unit table is refnum
/// `-(i + 1)`. Positive values belong to the file system and are never
/// valid here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefNum(pub i16);

impl RefNum {
    /// Largest slot index representable as a refnum
    pub const MAX_SLOT: usize = i16::MAX as usize - 1;

    /// Refnum for a unit table slot
    pub const fn from_slot(slot: usize) -> Self {
        Self(-((slot as i32) + 1) as i16)
    }

    /// Unit table slot for this refnum, if it is a driver refnum
    pub const fn slot(self) -> Option<usize> {
        if self.0 < 0 {
            Some((-(self.0 as i32) - 1) as usize)
        } else {
            None
        }
    }

    /// Driver refnums are strictly negative
    #[inline]
    pub const fn is_driver(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for RefNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tick count (1/60 second units in the classic system)
pub type Ticks = u32;

// ============================================================================
// Trap Words
// ============================================================================

/// Device Manager trap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Trap {
    Open = 0xA000,
    Close = 0xA001,
    Read = 0xA002,
    Write = 0xA003,
    Control = 0xA004,
    Status = 0xA005,
    KillIO = 0xA006,
}

impl Trap {
    pub const fn from_raw(word: u16) -> Option<Self> {
        match word {
            0xA000 => Some(Self::Open),
            0xA001 => Some(Self::Close),
            0xA002 => Some(Self::Read),
            0xA003 => Some(Self::Write),
            0xA004 => Some(Self::Control),
            0xA005 => Some(Self::Status),
            0xA006 => Some(Self::KillIO),
            _ => None,
        }
    }

    #[inline]
    pub const fn raw(self) -> u16 {
        self as u16
    }
}

// ============================================================================
// Position and Permission
// ============================================================================

/// Position mode for prime requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum PositionMode {
    /// Use the current device position
    #[default]
    AtMark = 0,
    /// Offset from the start of the device
    FromStart = 1,
    /// Offset from the logical end of file
    FromLeof = 2,
    /// Offset from the current position
    FromMark = 3,
}

impl PositionMode {
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::AtMark),
            1 => Some(Self::FromStart),
            2 => Some(Self::FromLeof),
            3 => Some(Self::FromMark),
            _ => None,
        }
    }
}

/// Open permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Permission {
    #[default]
    Current = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

// ============================================================================
// Driver Constants
// ============================================================================

/// Resource type tag
pub type ResType = [u8; 4];

/// Resource type holding classic driver images
pub const DRVR: ResType = *b"DRVR";

/// Control: driver is about to be removed or the heap reinitialized
pub const CS_GOODBYE: i16 = -1;

/// Control: abort queued I/O
pub const CS_KILL_IO: i16 = 1;

/// Status: copy the device control entry into the side channel
pub const CS_GET_DCE: i16 = 1;
