//! Epyx FastLoad: inverted serial bit-pairs clocked by alternating CLK
//! edges (receive) or sampled at fixed offsets from the DATA edge
//! (transmit). The cartridge uploads 256 bytes of drive code identified by
//! checksum; LOAD and the sector operations of the disk tools share the
//! upload path.

use crate::device::{FastLoadKind, Loader};
use crate::error::Abort;
use crate::iec::{IecBus, LineCond};
use ferriec_shared::platform::Platform;
use ferriec_shared::port::{ParallelPort, SerialPort, ASSERTED, RELEASED};

// checksums of the uploaded drive-code pages
const CHECKSUM_LOAD_V1: u8 = 0x26;
const CHECKSUM_LOAD_V2: u8 = 0x86;
const CHECKSUM_LOAD_V3: u8 = 0xAA;
const CHECKSUM_SECTOR_READ_V1: u8 = 0x0B;
const CHECKSUM_SECTOR_WRITE_V1: u8 = 0xBA;
const CHECKSUM_SECTOR_V2_V3: u8 = 0xB8;

impl<P: SerialPort, PL: Platform, C: ParallelPort> IecBus<P, PL, C> {
    /// Receive one byte, bits inverted, one pair per CLK transition. Runs
    /// with interrupts already masked; no timeouts are available there, the
    /// waits abort on ATN only.
    fn receive_epyx_byte(&mut self) -> Result<u8, Abort> {
        let mut clk = RELEASED;
        let mut data: u8 = 0;
        for _ in 0..8 {
            clk = !clk;
            self.wait_clk(clk, 0)?;
            data >>= 1;
            if self.port.read_data() == ASSERTED {
                data |= 0x80;
            }
        }
        Ok(data)
    }

    /// Transmit one byte, bits inverted, pairs sampled by the host at
    /// 15/25/35/45 cycles after it releases DATA.
    fn transmit_epyx_byte(&mut self, data: u8) -> Result<(), Abort> {
        let data = !data;

        let t0 = self.spin(|p| p.read_data())?;

        self.port.write_clk(data & (1 << 7) != 0);
        self.port.write_data(data & (1 << 5) != 0);
        self.wait_until(t0, 17);

        self.port.write_clk(data & (1 << 6) != 0);
        self.port.write_data(data & (1 << 4) != 0);
        self.wait_until(t0, 27);

        self.port.write_clk(data & (1 << 3) != 0);
        self.port.write_data(data & (1 << 1) != 0);
        self.wait_until(t0, 37);

        self.port.write_clk(data & (1 << 2) != 0);
        self.port.write_data(data & (1 << 0) != 0);
        self.wait_until(t0, 47);

        // release DATA with some settle/buffer time, then wait for the
        // host's "not ready"
        self.port.write_data(RELEASED);
        self.wait_until(t0, 52);
        self.wait_data(ASSERTED, 0)?;
        Ok(())
    }

    /// Receive the 256-byte drive-code upload, identify it by checksum and
    /// set up the requested operation.
    pub(crate) fn receive_epyx_header(&mut self, idx: usize) -> Result<(), Abort> {
        // the computer clocks everything; while we signal "ready" no
        // interrupt may delay us
        self.mask_irq();

        // ready for header
        self.port.write_clk(ASSERTED);
        if let Err(e) = self.wait_data(ASSERTED, 0) {
            self.unmask_irq();
            return Err(e);
        }
        self.port.write_clk(RELEASED);

        let mut checksum: u8 = 0;
        for _ in 0..256 {
            match self.receive_epyx_byte() {
                Ok(b) => checksum = checksum.wrapping_add(b),
                Err(e) => {
                    self.unmask_irq();
                    return Err(e);
                }
            }
        }

        match checksum {
            CHECKSUM_LOAD_V1 | CHECKSUM_LOAD_V2 | CHECKSUM_LOAD_V3 => {
                self.receive_epyx_load_request(idx)
            }
            CHECKSUM_SECTOR_READ_V1 => self.start_epyx_sector_command(idx, 0x82),
            CHECKSUM_SECTOR_WRITE_V1 => self.start_epyx_sector_command(idx, 0x81),
            CHECKSUM_SECTOR_V2_V3 => self.start_epyx_sector_command(idx, 0),
            _ => {
                log::debug!("unknown epyx upload, checksum {:#04x}", checksum);
                self.unmask_irq();
                Err(Abort::Timeout)
            }
        }
    }

    /// LOAD: the file name follows the upload, in reverse order. Opens
    /// channel 0 through the regular listen path and arms the block
    /// transmitter. Entered with interrupts masked.
    fn receive_epyx_load_request(&mut self, idx: usize) -> Result<(), Abort> {
        let n = match self.receive_epyx_byte() {
            Ok(n) => n as usize,
            Err(e) => {
                self.unmask_irq();
                return Err(e);
            }
        };
        if n == 0 || n > 32 {
            self.unmask_irq();
            return Err(Abort::Timeout);
        }

        for i in (0..n).rev() {
            match self.receive_epyx_byte() {
                Ok(b) => self.buffer[i] = b,
                Err(e) => {
                    self.unmask_irq();
                    return Err(e);
                }
            }
        }

        // not ready while the file is opened
        self.port.write_clk(ASSERTED);
        self.unmask_irq();

        // open channel 0 with the received name
        self.registry.device(idx).listen(0xF0);
        for i in 0..n {
            loop {
                let ok = self.registry.device(idx).can_write();
                if ok > 0 {
                    break;
                }
                if ok == 0 || self.port.read_atn() == ASSERTED {
                    return Err(Abort::Timeout);
                }
            }
            let data = self.buffer[i];
            self.registry.device(idx).write(data, i < n - 1);
        }
        self.registry.device(idx).unlisten();
        self.drain_requests(idx);

        self.fast_load_request(idx, Loader::Epyx, FastLoadKind::Load);
        Ok(())
    }

    /// Begin a sector command: receive track/sector (and for the combined
    /// V2/V3 upload the command byte), plus the data for a write. Entered
    /// with interrupts masked, leaves with them enabled.
    fn start_epyx_sector_command(&mut self, idx: usize, command: u8) -> Result<(), Abort> {
        let mut command = command;

        if command == 0x81 {
            // V1 sector write: the host takes its time before the next
            // sector, wait with interrupts enabled as the 1541 code does
            self.unmask_irq();
            self.wait_data(ASSERTED, 0)?;
            self.mask_irq();
            self.port.write_clk(RELEASED);
        }

        let res = (|| {
            let track = self.receive_epyx_byte()?;
            let sector = self.receive_epyx_byte()?;

            // V1 has separate uploads for read and write; V2/V3 send the
            // command explicitly
            if command == 0 {
                command = self.receive_epyx_byte()?;
            }

            if command & 0x7F == 1 {
                for i in 0..256 {
                    self.buffer[i] = self.receive_epyx_byte()?;
                }
            }

            Ok((track, sector))
        })();

        // not ready
        self.port.write_clk(ASSERTED);
        self.unmask_irq();

        let (track, sector) = res?;

        if command & 0x7F == 1
            && !self
                .registry
                .device(idx)
                .epyx_write_sector(track, sector, &self.buffer[..256])
        {
            return Err(Abort::Timeout);
        }

        self.buffer[0] = command;
        self.buffer[1] = track;
        self.buffer[2] = sector;

        self.fast_load_request(idx, Loader::Epyx, FastLoadKind::Sector);
        Ok(())
    }

    /// Serve the pending sector command and poll for a follow-up. An error
    /// return ends the sector protocol.
    pub(crate) fn finish_epyx_sector_command(&mut self, idx: usize) -> Result<(), Abort> {
        let command = self.buffer[0];
        let track = self.buffer[1];
        let sector = self.buffer[2];

        if command & 0x7F != 1
            && !self
                .registry
                .device(idx)
                .epyx_read_sector(track, sector, &mut self.buffer[..256])
        {
            return Err(Abort::Timeout);
        }

        self.mask_irq();

        // ready
        self.port.write_clk(RELEASED);

        if command == 0x81 {
            // V1 write: straight into the next track/sector
            return self.start_epyx_sector_command(idx, 0x81);
        }

        if command & 0x7F != 1 {
            for i in 0..256 {
                let data = self.buffer[i];
                if let Err(e) = self.transmit_epyx_byte(data) {
                    self.unmask_irq();
                    return Err(e);
                }
            }
        } else {
            self.port.write_data(RELEASED);
            if let Err(e) = self.wait_data(ASSERTED, 0) {
                self.unmask_irq();
                return Err(e);
            }
        }

        // Toggle CLK as a heartbeat so the computer knows the sector code is
        // still resident; without it, tools like "copy disk" re-upload the
        // code for every sector. The real drive has no timeout here, but we
        // cannot sit forever with interrupts masked, so give up after
        // roughly half a second. The gaps between blocks are under 400us,
        // too short to re-enable interrupts for good.
        for _ in 0..30_000 {
            self.port.write_clk(ASSERTED);
            if self.port.read_atn() == ASSERTED {
                break;
            }
            self.unmask_irq();
            self.delay(8);
            self.mask_irq();
            self.port.write_clk(RELEASED);
            if self.port.read_data() == RELEASED {
                break;
            }
            self.delay(8);
        }

        if self.port.read_data() == ASSERTED || self.port.read_atn() == ASSERTED {
            self.unmask_irq();
            return Err(Abort::Timeout);
        }

        // the host's DATA pulse can last up to 90us
        if let Err(e) = self.wait_timeout(100, LineCond::None) {
            self.unmask_irq();
            return Err(e);
        }

        if self.port.read_data() == RELEASED || self.port.read_atn() == ASSERTED {
            // done
            self.unmask_irq();
            Err(Abort::Timeout)
        } else {
            // another sector follows
            let next = if command & 0x80 != 0 { command } else { 0 };
            self.start_epyx_sector_command(idx, next)
        }
    }

    /// Transmit the next LOAD block: a length byte followed by the data. An
    /// error return (including a zero-length block) ends the transfer.
    pub(crate) fn transmit_epyx_block(&mut self, idx: usize) -> Result<(), Abort> {
        // select channel 0 for the reads below
        self.registry.device(idx).talk(0);

        let chunk = self.chunk_size;
        let n = self.registry.device(idx).read_buf(&mut self.buffer[..chunk]);
        self.drain_requests(idx);

        if self.flags.atn() || self.port.read_atn() == ASSERTED {
            return Err(Abort::AtnTransition);
        }

        let res = self.masked(|bus| {
            // ready
            bus.port.write_clk(RELEASED);

            #[allow(clippy::cast_possible_truncation)]
            bus.transmit_epyx_byte(n as u8)?;
            for i in 0..n {
                let data = bus.buffer[i];
                bus.transmit_epyx_byte(data)?;
            }

            // not ready
            bus.port.write_clk(ASSERTED);
            Ok(())
        });
        res?;

        // a zero-length block told the receiver we are done
        if n > 0 {
            Ok(())
        } else {
            Err(Abort::Timeout)
        }
    }
}
