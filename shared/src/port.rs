//! Bus port traits.
//!
//! All Commodore bus lines are active-low, wired-OR, open-collector: a line
//! reads high (`true`) only while nobody drives it low. Writing `false`
//! drives the pin low; writing `true` releases it to the pull-up. On
//! hardware without a line driver this means switching the pin between
//! OUTPUT-LOW and INPUT-float, never OUTPUT-HIGH. Inverted or split in/out
//! line drivers are an implementation detail of the port.

/// Line released / reading high.
pub const RELEASED: bool = true;
/// Line driven low.
pub const ASSERTED: bool = false;

/// The three-wire serial (IEC) bus port.
///
/// The timing-critical read/write methods are called from loops that must
/// keep microsecond cadence; implementations should reduce them to a single
/// register access and, on cached-flash platforms, place them in RAM.
pub trait SerialPort {
    fn read_atn(&self) -> bool;
    fn read_clk(&self) -> bool;
    fn read_data(&self) -> bool;

    /// Level of the RESET line; ports without a RESET pin report high.
    fn read_reset(&self) -> bool {
        RELEASED
    }

    fn write_clk(&mut self, level: bool);
    fn write_data(&mut self, level: bool);

    /// Drive the control pin of an external gate that pulls DATA low in
    /// hardware whenever ATN is asserted. Low enables the gate.
    fn write_ctrl(&mut self, _level: bool) {}

    /// Whether [`SerialPort::write_ctrl`] is wired to such a gate.
    fn has_ctrl(&self) -> bool {
        false
    }

    /// True once after each falling edge on ATN, latched by an edge interrupt
    /// (or equivalent hardware); polling-only ports return false and the
    /// handler detects the edge by level.
    fn atn_edge_latched(&mut self) -> bool {
        false
    }

    /// Whether ATN falling edges are latched out-of-band. Together with
    /// [`SerialPort::has_ctrl`] this determines how long device code may
    /// block the task loop.
    fn has_atn_latch(&self) -> bool {
        false
    }

    /// Emit a short low pulse on the SRQ line, if wired.
    fn pulse_srq(&mut self) {}
}

/// The IEEE-488 (GPIB) bus port: eight data lines plus the three handshake
/// lines and EOI. Data lines are driven as a byte and switched between input
/// and output as a group.
pub trait GpibPort {
    fn read_atn(&self) -> bool;
    fn read_dav(&self) -> bool;
    fn read_nrfd(&self) -> bool;
    fn read_ndac(&self) -> bool;
    fn read_eoi(&self) -> bool;

    fn read_reset(&self) -> bool {
        RELEASED
    }

    fn write_dav(&mut self, level: bool);
    fn write_nrfd(&mut self, level: bool);
    fn write_ndac(&mut self, level: bool);
    fn write_eoi(&mut self, level: bool);

    fn data_input(&mut self);
    fn data_output(&mut self);
    /// Data lines are active-low on the wire; ports return and accept
    /// already-uninverted bytes.
    fn read_data(&self) -> u8;
    fn write_data(&mut self, data: u8);

    fn write_ctrl(&mut self, _level: bool) {}
    fn has_ctrl(&self) -> bool {
        false
    }

    fn atn_edge_latched(&mut self) -> bool {
        false
    }
    fn has_atn_latch(&self) -> bool {
        false
    }

    fn pulse_srq(&mut self) {}
}

/// The parallel fast-loader cable (DolphinDOS / SpeedDOS): eight data lines
/// between host user-port and device plus one handshake line in each
/// direction. A handshake is a low pulse of at most a microsecond; receivers
/// latch the edge (edge interrupt, or pulse counter with glitch filter).
pub trait ParallelPort {
    /// Whether a cable (or expander) is present at all. Loaders that need the
    /// cable refuse to enable without it.
    fn available(&self) -> bool {
        true
    }

    fn set_input(&mut self);
    fn set_output(&mut self);

    fn read(&self) -> u8;
    fn write(&mut self, data: u8);

    /// Pulse the transmit-handshake line low for about a microsecond.
    fn handshake_pulse(&mut self);

    /// True once per received handshake pulse; cleared by the call.
    fn handshake_received(&mut self) -> bool;
}

/// Absent parallel cable. [`ParallelPort::available`] is false; the data and
/// handshake methods are never reached because loaders that need the cable
/// cannot be enabled.
#[derive(Default)]
pub struct NoParallelCable;

impl ParallelPort for NoParallelCable {
    fn available(&self) -> bool {
        false
    }
    fn set_input(&mut self) {}
    fn set_output(&mut self) {}
    fn read(&self) -> u8 {
        0xFF
    }
    fn write(&mut self, _data: u8) {}
    fn handshake_pulse(&mut self) {}
    fn handshake_received(&mut self) -> bool {
        false
    }
}
