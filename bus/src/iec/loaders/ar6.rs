//! Action Replay 6: serial bit pairs clocked by the DATA edge. The
//! cartridge identifies the drive type by reading $FFFE through the command
//! channel first (we answer as a 1581, whose loader transmits file names
//! instead of whole directory tracks). The stand-alone image loader uses
//! the older Action Replay 3 cadence with inverted bits.

use crate::error::Abort;
use crate::iec::IecBus;
use ferriec_shared::platform::Platform;
use ferriec_shared::port::{ParallelPort, SerialPort, ASSERTED, RELEASED};

impl<P: SerialPort, PL: Platform, C: ParallelPort> IecBus<P, PL, C> {
    fn transmit_ar6_byte(&mut self, data: u8, ar6_cadence: bool) -> Result<(), Abort> {
        self.masked(|bus| {
            // ready
            bus.port.write_clk(RELEASED);

            let t0 = bus.spin(|p| p.read_data())?;

            if ar6_cadence {
                // pairs read 10/18/26/34 cycles after DATA high
                bus.port.write_clk(data & 1 != 0);
                bus.port.write_data(data & (1 << 1) != 0);
                bus.wait_until(t0, 12);

                bus.port.write_clk(data & (1 << 2) != 0);
                bus.port.write_data(data & (1 << 3) != 0);
                bus.wait_until(t0, 20);

                bus.port.write_clk(data & (1 << 4) != 0);
                bus.port.write_data(data & (1 << 5) != 0);
                bus.wait_until(t0, 28);

                bus.port.write_clk(data & (1 << 6) != 0);
                bus.port.write_data(data & (1 << 7) != 0);
                bus.wait_until(t0, 36);
            } else {
                // AR3 image loader: inverted bits, read 16/26/36/46 cycles
                // after DATA high
                let data = !data;

                bus.port.write_clk(data & (1 << 7) != 0);
                bus.port.write_data(data & (1 << 5) != 0);
                bus.wait_until(t0, 18);

                bus.port.write_clk(data & (1 << 6) != 0);
                bus.port.write_data(data & (1 << 4) != 0);
                bus.wait_until(t0, 28);

                bus.port.write_clk(data & (1 << 3) != 0);
                bus.port.write_data(data & (1 << 1) != 0);
                bus.wait_until(t0, 38);

                bus.port.write_clk(data & (1 << 2) != 0);
                bus.port.write_data(data & (1 << 0) != 0);
                bus.wait_until(t0, 48);
            }

            // not ready, release DATA
            bus.port.write_clk(ASSERTED);
            bus.port.write_data(RELEASED);
            Ok(())
        })?;

        // receiver pulls DATA low 38 cycles after its DATA high
        self.wait_data(ASSERTED, 1000)
    }

    fn receive_ar6_byte(&mut self) -> Result<u8, Abort> {
        let res = self.masked(|bus| {
            // ready
            bus.port.write_clk(RELEASED);

            let t0 = bus.spin(|p| p.read_data())?;
            let mut data: u8 = 0;

            // pairs driven 8/18/34/44 cycles after our CLK release
            bus.wait_until(t0, 11);
            if bus.port.read_clk() == ASSERTED {
                data |= 1 << 7;
            }
            if bus.port.read_data() == ASSERTED {
                data |= 1 << 5;
            }

            bus.wait_until(t0, 21);
            if bus.port.read_clk() == ASSERTED {
                data |= 1 << 6;
            }
            if bus.port.read_data() == ASSERTED {
                data |= 1 << 4;
            }

            bus.wait_until(t0, 37);
            if bus.port.read_clk() == ASSERTED {
                data |= 1 << 3;
            }
            if bus.port.read_data() == ASSERTED {
                data |= 1 << 1;
            }

            bus.wait_until(t0, 47);
            if bus.port.read_clk() == ASSERTED {
                data |= 1 << 2;
            }
            if bus.port.read_data() == ASSERTED {
                data |= 1 << 0;
            }

            // not ready
            bus.port.write_clk(ASSERTED);
            Ok(data)
        });
        let data = res?;

        // sender releases CLK and pulls DATA low 57 cycles after DATA high
        self.wait_data(ASSERTED, 1000)?;
        Ok(data)
    }

    /// Transmit the next LOAD block: a length byte followed by up to 254
    /// data bytes; a zero length ends the transfer. Returns whether more
    /// blocks follow.
    pub(crate) fn transmit_ar6_block(&mut self, idx: usize, ar6_cadence: bool) -> Result<bool, Abort> {
        // The first two file bytes (load address) already went over the
        // serial path; the loader restarts the file and discards them, so
        // their values do not matter.
        let n = if self.buffer[255] == 0 {
            self.registry.device(idx).read_buf(&mut self.buffer[2..254]) + 2
        } else {
            self.registry.device(idx).read_buf(&mut self.buffer[..254])
        };
        self.drain_requests(idx);

        #[allow(clippy::cast_possible_truncation)]
        self.transmit_ar6_byte(n as u8, ar6_cadence)?;

        for i in 0..n {
            let data = self.buffer[i];
            self.transmit_ar6_byte(data, ar6_cadence)?;
        }

        self.buffer[255] = self.buffer[255].wrapping_add(1);
        Ok(n != 0)
    }

    /// Receive one fast-save block of 256 bytes: blocks-remaining count,
    /// then (on the final block) the number of valid bytes, then the data.
    /// Returns whether more blocks follow.
    pub(crate) fn receive_ar6_block(&mut self, idx: usize) -> Result<bool, Abort> {
        for i in 0..256 {
            self.buffer[i] = self.receive_ar6_byte()?;
        }

        let eoi = self.buffer[0] == 0;
        let n = if eoi {
            (self.buffer[1] as usize).saturating_sub(2)
        } else {
            254
        };

        if self.registry.device(idx).write_buf(&self.buffer[2..2 + n], eoi) == n {
            Ok(!eoi)
        } else {
            Err(Abort::Timeout)
        }
    }
}
