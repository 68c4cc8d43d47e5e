//! devmgr - Toolbox Device Manager
//!
//! Unit table, driver loader, driver dispatch, asynchronous I/O queues and
//! a simulated interrupt path for classic offset-addressed driver images
//! and modern dispatch-table drivers.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Many manager types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Rejected submissions hand the parameter block back inside the error
#![allow(clippy::result_large_err)]

extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Device subsystem
pub mod device;

pub use config::DeviceManagerConfig;
pub use device::{device_manager, init, DeviceManager};
pub use error::{DeviceError, DeviceResult};
pub use types::{Permission, PositionMode, RefNum, Ticks, Trap};
