//! Bus-facing core of a Commodore serial-bus peripheral emulator.
//!
//! A [`iec::IecBus`] or [`gpib::GpibBus`] impersonates up to 30 numbered
//! peripherals on the physical bus of an unmodified Commodore 8-bit host.
//! Concrete devices implement [`device::Device`] (or the narrower
//! [`filedev::FileOps`] for CBM-DOS channel semantics) and are attached to
//! the handler, which runs all protocol logic from its cooperative `task()`
//! loop. Hardware access goes through the port and platform traits of
//! `ferriec-shared`, so the same core runs on bare-metal ports and under the
//! hosted simulation in `ferriec-testing`.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod address;
pub mod device;
pub mod error;
pub mod filedev;
pub mod gpib;
pub mod iec;
pub mod registry;
pub mod status;

/// Maximum number of devices attachable to one bus handler.
pub const MAX_DEVICES: usize = 30;
