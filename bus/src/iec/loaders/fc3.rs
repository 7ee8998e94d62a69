//! Final Cartridge 3: four bytes per CLK-low handshake, bit pairs on a
//! fixed schedule. The receiver's polling loop has a 7-cycle jitter and
//! PAL/NTSC differ slightly, leaving only a few microseconds of margin
//! around each write point, so the whole tuple is driven off one reference
//! edge.

use crate::error::Abort;
use crate::iec::IecBus;
use ferriec_shared::platform::Platform;
use ferriec_shared::port::{ParallelPort, SerialPort, ASSERTED, RELEASED};

// write points of the four bytes relative to our CLK low; within a byte the
// remaining pairs follow at +13/+25/+37
const TUPLE_SCHEDULE: [u32; 4] = [21, 72, 123, 173];

impl<P: SerialPort, PL: Platform, C: ParallelPort> IecBus<P, PL, C> {
    /// Transmit four bytes from `buffer[offset..]`. Caller masks interrupts.
    fn transmit_fc3_tuple(&mut self, offset: usize) {
        // ready; the receiver leaves its polling loop within 7 cycles
        self.port.write_clk(ASSERTED);
        let t0 = self.now();

        // make sure the receiver has seen CLK low
        self.wait_until(t0, 8);

        for (i, &t) in TUPLE_SCHEDULE.iter().enumerate() {
            let data = self.buffer[offset + i];

            self.port.write_clk(data & 1 != 0);
            self.port.write_data(data & (1 << 1) != 0);
            self.wait_until(t0, t);

            self.port.write_clk(data & (1 << 2) != 0);
            self.port.write_data(data & (1 << 3) != 0);
            self.wait_until(t0, t + 13);

            self.port.write_clk(data & (1 << 4) != 0);
            self.port.write_data(data & (1 << 5) != 0);
            self.wait_until(t0, t + 25);

            self.port.write_clk(data & (1 << 6) != 0);
            self.port.write_data(data & (1 << 7) != 0);
            self.wait_until(t0, t + 37);
        }

        self.port.write_clk(RELEASED);
    }

    /// Receive one byte during a fast-save, pairs driven 12/22/38/48 cycles
    /// after the sender's CLK release.
    fn receive_fc3_byte(&mut self) -> Result<u8, Abort> {
        let t0 = self.spin(|p| p.read_clk())?;
        let mut data: u8 = 0;

        self.wait_until(t0, 15);
        if self.port.read_clk() == ASSERTED {
            data |= 1 << 7;
        }
        if self.port.read_data() == ASSERTED {
            data |= 1 << 5;
        }

        self.wait_until(t0, 25);
        if self.port.read_clk() == ASSERTED {
            data |= 1 << 6;
        }
        if self.port.read_data() == ASSERTED {
            data |= 1 << 4;
        }

        self.wait_until(t0, 41);
        if self.port.read_clk() == ASSERTED {
            data |= 1 << 3;
        }
        if self.port.read_data() == ASSERTED {
            data |= 1 << 1;
        }

        self.wait_until(t0, 51);
        if self.port.read_clk() == ASSERTED {
            data |= 1 << 2;
        }
        if self.port.read_data() == ASSERTED {
            data |= 1 << 0;
        }

        // sender releases DATA and pulls CLK low at 58 cycles
        self.wait_clk(ASSERTED, 1000)?;
        Ok(data)
    }

    /// Transmit the next LOAD block: 65 tuples of 4 bytes. Block layout:
    /// byte 1 block number, byte 2 count of valid bytes (0 = full block of
    /// 254), bytes 3..=256 payload. Returns whether more blocks follow.
    pub(crate) fn transmit_fc3_block(&mut self, idx: usize) -> Result<bool, Abort> {
        if self.buffer[1] == 0 {
            // First block: the load address already went over the serial
            // path and the receiver discards the two repeated bytes, so
            // only 252 payload bytes are new. One extra byte probes whether
            // another block follows.
            let n = self.registry.device(idx).read_buf(&mut self.buffer[5..258]);
            #[allow(clippy::cast_possible_truncation)]
            {
                self.buffer[2] = if n == 253 { 0 } else { n as u8 + 3 };
            }
        } else {
            // move the probe byte of the previous round to the front, then
            // try to fill the block plus the next probe byte
            self.buffer[3] = self.buffer[257];
            let n = self.registry.device(idx).read_buf(&mut self.buffer[4..258]);
            #[allow(clippy::cast_possible_truncation)]
            {
                self.buffer[2] = if n == 254 { 0 } else { n as u8 + 2 };
            }
        }
        self.drain_requests(idx);

        if self.flags.atn() {
            return Err(Abort::AtnTransition);
        }

        // ready, wait for confirmation
        self.port.write_clk(ASSERTED);
        self.wait_data(ASSERTED, 0)?;
        self.port.write_clk(RELEASED);
        self.wait_data(RELEASED, 0)?;

        self.masked(|bus| {
            for i in 0..65 {
                // give the receiver time to store the previous tuple
                bus.delay(150);
                bus.transmit_fc3_tuple(i * 4);
            }

            // end-of-data is signaled by holding DATA low
            bus.port.write_clk(RELEASED);
            bus.port
                .write_data(if bus.buffer[2] == 0 { RELEASED } else { ASSERTED });

            bus.buffer[1] = bus.buffer[1].wrapping_add(1);
        });

        Ok(self.buffer[2] == 0)
    }

    /// Transmit the next block of a cartridge-image ("snapshot") load; the
    /// handshake here is per tuple rather than per block.
    pub(crate) fn transmit_fc3_image_block(&mut self, idx: usize) -> Result<bool, Abort> {
        let n = self.registry.device(idx).read_buf(&mut self.buffer[3..257]);
        #[allow(clippy::cast_possible_truncation)]
        {
            self.buffer[2] = if n == 254 { 0 } else { n as u8 + 1 };
        }
        self.drain_requests(idx);

        if n == 0 || self.flags.atn() {
            return Ok(false);
        }

        self.masked(|bus| {
            for i in 0..65 {
                // ready, wait for confirmation
                bus.port.write_clk(ASSERTED);
                bus.wait_data(ASSERTED, 0)?;
                bus.port.write_clk(RELEASED);
                bus.wait_data(RELEASED, 0)?;

                bus.transmit_fc3_tuple(i * 4);

                bus.port.write_clk(RELEASED);
                bus.port.write_data(RELEASED);
            }
            Ok(())
        })?;

        Ok(self.buffer[2] == 0)
    }

    /// Receive one fast-save block. The length byte is 0 for a full block;
    /// any other value marks the final block. Returns whether more blocks
    /// follow.
    pub(crate) fn receive_fc3_block(&mut self, idx: usize) -> Result<bool, Abort> {
        let res = self.masked(|bus| {
            // ready
            bus.port.write_data(RELEASED);

            let len = bus.receive_fc3_byte()?;
            let n = if len == 0 { 254 } else { len as usize - 1 };
            for i in 0..n {
                bus.buffer[i] = bus.receive_fc3_byte()?;
            }

            // not ready
            bus.port.write_data(ASSERTED);
            Ok((len, n))
        });

        let (len, n) = res?;
        let eoi = len > 0;

        if self.registry.device(idx).write_buf(&self.buffer[..n], eoi) == n {
            Ok(!eoi)
        } else {
            Err(Abort::Timeout)
        }
    }
}
