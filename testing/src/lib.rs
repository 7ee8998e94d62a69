//! Hosted simulation harness for the bus handlers.
//!
//! Provides a microsecond-stepped model of the wired-OR bus lines with a
//! scripted host automaton on the far side, so the handlers' timing loops
//! run unmodified against a deterministic "Commodore". Simulated time only
//! advances while the device polls its clock or pins, which makes every
//! run reproducible.

pub mod gpib_host;
pub mod iec_host;
pub mod loopback;

pub use gpib_host::{GpibOp, GpibSim};
pub use iec_host::{HostOp, IecSim};
pub use loopback::LoopbackFs;
