//! SpeedDOS: parallel-cable transfers with CLK/DATA handshake. The host
//! allows 350us from its ready signal to our cable handshake, so the timed
//! stretches run with interrupts masked.

use crate::error::Abort;
use crate::iec::{IecBus, PARALLEL_PREBUFFER};
use ferriec_shared::platform::Platform;
use ferriec_shared::port::{ParallelPort, SerialPort, ASSERTED, RELEASED};

impl<P: SerialPort, PL: Platform, C: ParallelPort> IecBus<P, PL, C> {
    /// Receive one byte; returns an error after the EOI byte as well so the
    /// caller stops polling (a later cable pulse would otherwise read as
    /// another byte).
    pub(crate) fn receive_speeddos_byte(&mut self, can_write_ok: bool) -> Result<(), Abort> {
        let Some(idx) = self.current else {
            return Err(Abort::Timeout);
        };

        self.wait_clk(RELEASED, 0)?;

        let res = self.masked(|bus| {
            // ready-for-data
            bus.port.write_data(RELEASED);

            if !bus.wait_cable_handshake_isafe(false) {
                return Err(Abort::AtnTransition);
            }

            if !can_write_ok {
                return Err(Abort::Timeout);
            }

            let data = bus.cable.read();

            // CLK released at this point signals EOI
            let eoi = bus.port.read_clk() == RELEASED;

            // confirm receipt
            bus.cable.handshake_pulse();
            bus.port.write_data(ASSERTED);
            Ok((data, eoi))
        });

        let (data, eoi) = res?;
        self.registry.device(idx).write(data, eoi);

        if eoi {
            Err(Abort::Timeout)
        } else {
            Ok(())
        }
    }

    /// Transmit one byte.
    pub(crate) fn transmit_speeddos_byte(&mut self, num_data: i8) -> Result<(), Abort> {
        let Some(idx) = self.current else {
            return Err(Abort::Timeout);
        };
        let data = if num_data > 0 {
            self.registry.device(idx).peek()
        } else {
            0xFF
        };

        // stage the byte before the handshake to stay inside the 350us
        // window
        self.cable.write(data);

        self.masked(|bus| {
            // ready-to-send
            bus.port.write_clk(RELEASED);

            // ready-for-data
            if bus.wait_data(RELEASED, 0).is_err() {
                bus.atn_request();
                return Err(Abort::AtnTransition);
            }

            if num_data == 0 {
                return Err(Abort::Timeout);
            }

            // CLK state signals EOI
            bus.port.write_clk(num_data == 1);

            // expose the byte and announce it
            bus.cable.set_output();
            bus.cable.handshake_pulse();

            // the receiver pulls DATA low and answers with a pulse once it
            // has read the byte
            bus.wait_cable_handshake_isafe(false);

            bus.port.write_clk(ASSERTED);
            bus.cable.set_input();
            Ok(())
        })?;

        // consume the byte sent from peek()
        self.registry.device(idx).read();

        if self.secondary == 0x60 && self.buffer_ctr < PARALLEL_PREBUFFER {
            self.buffer[self.buffer_ctr] = data;
            self.buffer_ctr += 1;
        }
        Ok(())
    }

    fn transmit_speeddos_parallel_byte(&mut self, data: u8) -> bool {
        self.cable.write(data);

        self.masked(|bus| {
            bus.cable.handshake_pulse();
            bus.cable.handshake_received();
        });

        self.wait_cable_handshake()
    }

    /// Burst transmit of the remaining file as length-prefixed blocks.
    ///
    /// The host uploads its loader after the load address already went over
    /// the serial path, and expects those bytes again at the start.
    pub(crate) fn transmit_speeddos_file(&mut self, idx: usize) -> Result<(), Abort> {
        self.cable.set_output();

        let mut offset = self.buffer_ctr;
        loop {
            let chunk = self.chunk_size;
            let read = self
                .registry
                .device(idx)
                .read_buf(&mut self.buffer[offset..chunk]);
            let n = read + offset;
            if n == 0 {
                break;
            }
            offset = 0;

            #[allow(clippy::cast_possible_truncation)]
            if !self.transmit_speeddos_parallel_byte(n as u8 + 1) {
                self.cable.set_input();
                return Err(Abort::Timeout);
            }
            for i in 0..n {
                let data = self.buffer[i];
                if !self.transmit_speeddos_parallel_byte(data) {
                    self.cable.set_input();
                    return Err(Abort::Timeout);
                }
            }
        }

        // zero-length block terminates, then confirm success (0 would be
        // LOAD ERROR)
        self.transmit_speeddos_parallel_byte(0);
        self.transmit_speeddos_parallel_byte(1);

        self.cable.set_input();
        Ok(())
    }
}
