//! JiffyDOS: serial bit-pairs on CLK+DATA sampled at fixed offsets from the
//! handshake edge. Offsets follow the JiffyDOS KERNAL send/receive loops
//! (FC51/FBD5 and friends).

use crate::error::Abort;
use crate::iec::{IecBus, LineCond};
use ferriec_shared::platform::{elapsed_us, Platform};
use ferriec_shared::port::{ParallelPort, SerialPort, ASSERTED, RELEASED};

impl<P: SerialPort, PL: Platform, C: ParallelPort> IecBus<P, PL, C> {
    /// Receive one byte from the host. The sender clocks bit pairs relative
    /// to its CLK release, so the whole byte runs with interrupts masked.
    pub(crate) fn receive_jiffy_byte(&mut self, can_write_ok: bool) -> Result<(), Abort> {
        let res = self.masked(|bus| {
            // signal ready by releasing DATA
            bus.port.write_data(RELEASED);

            // must block until the sender releases CLK: transmission starts
            // immediately afterwards, leaving the task loop would miss it
            let t0 = bus.spin(|p| p.read_clk())?;

            let mut data: u8 = 0;

            // bit pairs are driven 11/24/35/48 cycles after CLK high
            bus.wait_until(t0, 14);
            if bus.port.read_clk() == ASSERTED {
                data |= 1 << 4;
            }
            if bus.port.read_data() == ASSERTED {
                data |= 1 << 5;
            }

            bus.wait_until(t0, 27);
            if bus.port.read_clk() == ASSERTED {
                data |= 1 << 6;
            }
            if bus.port.read_data() == ASSERTED {
                data |= 1 << 7;
            }

            bus.wait_until(t0, 38);
            if bus.port.read_clk() == ASSERTED {
                data |= 1 << 3;
            }
            if bus.port.read_data() == ASSERTED {
                data |= 1 << 1;
            }

            bus.wait_until(t0, 51);
            if bus.port.read_clk() == ASSERTED {
                data |= 1 << 2;
            }
            if bus.port.read_data() == ASSERTED {
                data |= 1 << 0;
            }

            // CLK still high at 61 cycles signals EOI
            bus.wait_until(t0, 64);
            let eoi = bus.port.read_clk() == RELEASED;

            // acknowledge receipt; the sender samples it at 80 cycles
            bus.port.write_data(ASSERTED);
            bus.wait_until(t0, 83);

            Ok((data, eoi))
        });

        let (data, eoi) = res?;
        if can_write_ok {
            if let Some(idx) = self.current {
                self.registry.device(idx).write(data, eoi);
            }
            Ok(())
        } else {
            Err(Abort::Timeout)
        }
    }

    /// Transmit one byte to the host. `num_data` is the `can_read` count:
    /// 0 signals an error, 1 sends with EOI.
    pub(crate) fn transmit_jiffy_byte(&mut self, num_data: i8) -> Result<(), Abort> {
        let data = if num_data > 0 {
            match self.current {
                Some(idx) => self.registry.device(idx).peek(),
                None => 0,
            }
        } else {
            0
        };

        self.masked(|bus| {
            // signal ready by releasing CLK
            bus.port.write_clk(RELEASED);

            // blocking: the receiver reads immediately after releasing DATA
            let t0 = bus.spin(|p| p.read_data())?;

            bus.port.write_clk(data & 1 != 0);
            bus.port.write_data(data & (1 << 1) != 0);
            // receiver samples bits 0+1 at 16 cycles after DATA high
            bus.wait_until(t0, 17);

            bus.port.write_clk(data & (1 << 2) != 0);
            bus.port.write_data(data & (1 << 3) != 0);
            bus.wait_until(t0, 28);

            bus.port.write_clk(data & (1 << 4) != 0);
            bus.port.write_data(data & (1 << 5) != 0);
            bus.wait_until(t0, 39);

            bus.port.write_clk(data & (1 << 6) != 0);
            bus.port.write_data(data & (1 << 7) != 0);
            bus.wait_until(t0, 50);

            if num_data > 1 {
                // CLK low, DATA high: at least one more byte
                bus.port.write_clk(ASSERTED);
                bus.port.write_data(RELEASED);
            } else {
                // CLK high + DATA low: EOI; CLK high + DATA high: error
                bus.port.write_clk(RELEASED);
                bus.port.write_data(num_data == 0);
            }

            // receiver reads the status at 59 cycles, then acknowledges
            bus.wait_until(t0, 60);
            bus.wait_data(ASSERTED, 1000)?;

            // back to busy configuration even after EOI/error status
            bus.port.write_clk(ASSERTED);
            bus.port.write_data(RELEASED);
            Ok(())
        })?;

        if num_data > 0 {
            // success: consume the byte sent from peek()
            if let Some(idx) = self.current {
                self.registry.device(idx).read();
            }
            Ok(())
        } else {
            Err(Abort::Timeout)
        }
    }

    /// Transmit `num_bytes` from the scratch buffer using the block cadence
    /// (TALK secondary 0x61).
    pub(crate) fn transmit_jiffy_block(&mut self, num_bytes: usize) -> Result<(), Abort> {
        // wait for the receiver to release DATA; it starts counting its EOI
        // timeout right away, so this must block
        self.spin(|p| p.read_data())?;

        if num_bytes == 0 {
            // nothing to send: signal EOI with a CLK high-low pulse
            self.port.write_data(RELEASED);
            self.port.write_clk(RELEASED);
            self.wait_timeout(100, LineCond::None)?;
            self.port.write_clk(ASSERTED);
            self.wait_timeout(100, LineCond::None)?;
            return Err(Abort::Timeout);
        }

        // ready-to-send: DATA low, CLK released; allow for a VIC "bad line"
        // stealing time from the receiver's polling loop
        self.port.write_data(ASSERTED);
        self.port.write_clk(RELEASED);
        self.wait_timeout(60, LineCond::None)?;

        self.masked(|bus| {
            for i in 0..num_bytes {
                let data = bus.buffer[i];

                bus.port.write_data(RELEASED);
                bus.port.write_clk(RELEASED);

                // let DATA settle; the receiver needs 19 cycles between
                // seeing DATA high and pulling it low again
                bus.delay(2);

                let t0 = bus.spin(|p| !p.read_data())?;

                // receiver expects CLK high 4 cycles after DATA low
                bus.wait_until(t0, 6);
                bus.port.write_clk(data & 1 != 0);
                bus.port.write_data(data & (1 << 1) != 0);

                bus.wait_until(t0, 17);
                bus.port.write_clk(data & (1 << 2) != 0);
                bus.port.write_data(data & (1 << 3) != 0);

                bus.wait_until(t0, 27);
                bus.port.write_clk(data & (1 << 4) != 0);
                bus.port.write_data(data & (1 << 5) != 0);

                bus.wait_until(t0, 39);
                bus.port.write_clk(data & (1 << 6) != 0);
                bus.port.write_data(data & (1 << 7) != 0);

                bus.wait_until(t0, 50);
            }

            // not ready, release DATA
            bus.port.write_clk(ASSERTED);
            bus.port.write_data(RELEASED);
            Ok(())
        })
    }

    /// Task-loop half of the block transfer: fetch a chunk from the device,
    /// respect the re-entry guard, and push it over the wire.
    pub(crate) fn transmit_jiffy_block_phase(&mut self, idx: usize) {
        let chunk = self.chunk_size;
        let num = self.registry.device(idx).read_buf(&mut self.buffer[..chunk]);
        self.drain_requests(idx);

        // If a VIC bad line delays the receiver right after the last bit
        // pair, it may need up to 160us to reach its CLK-low check; getting
        // back here earlier would let it miss the "new block" state.
        while elapsed_us(self.now(), self.timeout_start) < 175 {}

        if self.flags.atn()
            || self.port.read_atn() == ASSERTED
            || self.transmit_jiffy_block(num).is_err()
        {
            self.flags.set_done(true);
        } else {
            self.timeout_start = self.now();
        }
    }
}
