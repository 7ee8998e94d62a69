//! DolphinDOS: bytes move over the parallel cable, CLK/DATA carry the
//! handshake. Burst mode (`XQ`/`XZ`) paces whole blocks with cable
//! handshake pulses only.

use crate::error::Abort;
use crate::iec::{IecBus, LineCond, PARALLEL_PREBUFFER};
use ferriec_shared::platform::Platform;
use ferriec_shared::port::{ParallelPort, SerialPort, ASSERTED, RELEASED};

impl<P: SerialPort, PL: Platform, C: ParallelPort> IecBus<P, PL, C> {
    /// Receive one byte (sender has already released CLK).
    pub(crate) fn receive_dolphin_byte(&mut self, can_write_ok: bool) -> Result<(), Abort> {
        let Some(idx) = self.current else {
            return Err(Abort::Timeout);
        };

        // A SAVE begins with two bytes sent before the host decides between
        // burst and byte-wise mode. Once the host is ready to send more
        // (and thus did not burst), replay them to the device.
        if self.secondary == 0x61 && self.buffer_ctr > 0 && self.buffer_ctr <= PARALLEL_PREBUFFER
        {
            let data = self.buffer[self.buffer_ctr - 1];
            self.registry.device(idx).write(data, false);
            self.buffer_ctr -= 1;
            return Ok(());
        }

        let res = self.masked(|bus| {
            let mut eoi = false;

            // ready-for-data
            bus.port.write_data(RELEASED);

            match bus.wait_clk(ASSERTED, 100) {
                Ok(()) => {}
                Err(Abort::AtnTransition) => return Err(Abort::AtnTransition),
                Err(Abort::Timeout) => {
                    // no CLK within 100us: EOI; acknowledge with a 60us
                    // DATA pulse
                    eoi = true;
                    bus.port.write_data(ASSERTED);
                    bus.wait_timeout(60, LineCond::None)?;
                    bus.port.write_data(RELEASED);
                    bus.wait_clk(ASSERTED, 1000)?;
                }
            }

            if !can_write_ok {
                return Err(Abort::Timeout);
            }

            let data = bus.cable.read();

            // confirm receipt
            bus.port.write_data(ASSERTED);
            Ok((data, eoi))
        });

        let (data, eoi) = res?;

        // The first two bytes of a SAVE may be garbage re-sent in burst mode
        // later; hold them back until the burst decision is known.
        if self.secondary == 0x61 && self.buffer_ctr > PARALLEL_PREBUFFER {
            self.buffer[self.buffer_ctr - PARALLEL_PREBUFFER - 1] = data;
            self.buffer_ctr -= 1;
        } else {
            self.registry.device(idx).write(data, eoi);
        }
        Ok(())
    }

    /// Transmit one byte. The receiver allows only 50us between its DATA
    /// release and our CLK assert before it assumes EOI, so the data byte is
    /// fetched and staged on the cable before the handshake starts.
    pub(crate) fn transmit_dolphin_byte(&mut self, num_data: i8) -> Result<(), Abort> {
        let Some(idx) = self.current else {
            return Err(Abort::Timeout);
        };
        let data = if num_data > 0 {
            self.registry.device(idx).peek()
        } else {
            0xFF
        };

        // stage the byte; the bus is still in input mode so it is not
        // visible yet
        self.cable.write(data);

        let res = self.masked(|bus| {
            // ready-to-send
            bus.port.write_clk(RELEASED);

            // ready-for-data
            if bus.wait_data(RELEASED, 0).is_err() {
                bus.atn_request();
                return Err(Abort::AtnTransition);
            }

            if num_data == 0 {
                // nothing to send: aborting here signals the error
                return Err(Abort::Timeout);
            }

            if num_data == 1 {
                // EOI: keep CLK released, wait for the DATA low-high pulse
                if bus.wait_data(ASSERTED, 1000).is_err() || bus.wait_data(RELEASED, 1000).is_err()
                {
                    bus.atn_request();
                    return Err(Abort::AtnTransition);
                }
            }

            // expose the byte, then signal data-ready
            bus.cable.set_output();
            bus.port.write_clk(ASSERTED);
            Ok(())
        });

        if res.is_err() {
            return res;
        }

        // consume the byte sent from peek()
        self.registry.device(idx).read();

        // remember the initial bytes of a LOAD for a possible burst replay
        if self.secondary == 0x60 && self.buffer_ctr < PARALLEL_PREBUFFER {
            self.buffer[self.buffer_ctr] = data;
            self.buffer_ctr += 1;
        }

        // receipt must come within 1ms
        let res = self.wait_data(ASSERTED, 1000);
        self.cable.set_input();
        res
    }

    /// Burst receive (`XZ`); sender has pulled CLK low.
    pub(crate) fn receive_dolphin_burst(&mut self, idx: usize) -> Result<(), Abort> {
        let mut n = 0usize;

        self.cable.handshake_received();

        self.port.write_data(ASSERTED);

        // confirm burst mode
        self.cable.handshake_pulse();

        let mut eoi = false;
        while !eoi {
            if !self.wait_cable_handshake() {
                return Err(Abort::AtnTransition);
            }

            // CLK released means the final byte is coming
            eoi = self.port.read_clk() == RELEASED;

            self.buffer[n] = self.cable.read();
            n += 1;

            if n < self.chunk_size && !eoi {
                self.cable.handshake_pulse();
            } else if self.registry.device(idx).write_buf(&self.buffer[..n], eoi) == n {
                self.cable.handshake_pulse();
                n = 0;
            } else {
                // write error: release DATA to signal it and give up
                self.port.write_data(RELEASED);
                return Err(Abort::Timeout);
            }
        }

        Ok(())
    }

    /// Burst transmit (`XQ`); receiver has pulled DATA low.
    pub(crate) fn transmit_dolphin_burst(&mut self, idx: usize) -> Result<(), Abort> {
        // confirm burst mode (Dolphin kernal EEDA); the host is busy
        // printing the load address after seeing this, so the long delay
        // before the next handshake loses nothing and keeps the two pulses
        // distinguishable
        self.cable.handshake_pulse();
        self.delay(1000);

        self.cable.set_output();

        // the host switches to burst only after the first bytes went over
        // the serial path; it expects those to be re-transmitted
        for i in 0..self.buffer_ctr {
            let data = self.buffer[i];
            self.cable.write(data);
            if !self.pulse_and_wait_handshake() {
                self.cable.set_input();
                return Err(Abort::Timeout);
            }
        }

        loop {
            let chunk = self.chunk_size;
            let n = self.registry.device(idx).read_buf(&mut self.buffer[..chunk]);
            if n == 0 {
                break;
            }
            for i in 0..n {
                let data = self.buffer[i];
                self.cable.write(data);

                // sending our handshake can glitch the receive line, so the
                // latch is cleared right after the pulse, atomically
                self.masked(|bus| {
                    bus.cable.handshake_pulse();
                    bus.cable.handshake_received();
                });

                while !self.cable.handshake_received() {
                    if self.port.read_atn() == ASSERTED || self.port.read_data() == RELEASED {
                        // receiver released DATA or host pulled ATN
                        self.cable.set_input();
                        self.port.write_clk(RELEASED);
                        return Err(Abort::Timeout);
                    }
                }
            }
        }

        self.cable.set_input();

        // the receiver waits 2ms for the final handshake after confirming
        // our end-of-data
        self.masked(|bus| {
            // end-of-data
            bus.port.write_clk(RELEASED);
            bus.wait_data(RELEASED, 1000)?;
            bus.cable.handshake_pulse();
            Ok(())
        })
    }

    fn pulse_and_wait_handshake(&mut self) -> bool {
        self.masked(|bus| {
            bus.cable.handshake_pulse();
            bus.cable.handshake_received();
        });
        self.wait_cable_handshake()
    }
}
