//! The eight-line IEEE-488 (GPIB) bus handler for PET/CBM-class hosts.
//!
//! Structurally the counterpart of [`crate::iec::IecBus`], sharing the
//! device contract, registry and dispatch, but moving whole bytes per
//! DAV/NRFD/NDAC handshake with EOI on its own line. There is no bit-banged
//! serial loop and no fast-loader phase (the hosts that install those are
//! IEC machines).

use crate::address::{AtnCommand, UNLISTEN, UNTALK};
use crate::device::{BusCaps, BusRequest, Device};
use crate::error::Abort;
use crate::registry::DeviceRegistry;
use alloc::boxed::Box;
use ferriec_shared::flags::BusFlags;
use ferriec_shared::platform::{delay_isafe, elapsed_us, Platform};
use ferriec_shared::port::{GpibPort, ASSERTED, RELEASED};
use log::{debug, trace};

#[derive(Clone, Copy, PartialEq, Eq)]
enum LineCond {
    DavLow,
    DavHigh,
    NrfdLow,
    NrfdHigh,
    NdacLow,
    NdacHigh,
}

pub struct GpibBus<P: GpibPort, PL: Platform> {
    port: P,
    platform: PL,
    registry: DeviceRegistry,

    flags: BusFlags,
    begun: bool,
    current: Option<usize>,
    primary: u8,
    secondary: u8,

    timeout_start: u32,
    timeout_duration: u32,

    irq_masked: bool,
    wdt_start: u32,
}

impl<P: GpibPort, PL: Platform> GpibBus<P, PL> {
    pub fn new(port: P, platform: PL) -> Self {
        GpibBus {
            port,
            platform,
            registry: DeviceRegistry::new(),
            flags: BusFlags::new(),
            begun: false,
            current: None,
            primary: 0,
            secondary: 0,
            timeout_start: 0,
            timeout_duration: 0,
            irq_masked: false,
            wdt_start: 0,
        }
    }

    /// Must be called once before the first [`GpibBus::task`] call.
    pub fn begin(&mut self) {
        self.flags.clear();
        self.current = None;
        self.begun = true;

        self.port.write_dav(RELEASED);
        self.port.write_nrfd(RELEASED);
        self.port.write_ndac(RELEASED);
        self.port.write_eoi(RELEASED);
        self.port.data_input();

        // allow ATN to pull NRFD low in hardware
        self.port.write_ctrl(ASSERTED);

        let caps = self.caps();
        for entry in self.registry.iter_mut() {
            entry.device_mut().begin(caps);
        }
    }

    pub fn can_serve_atn(&self) -> bool {
        self.port.has_ctrl() || self.port.has_atn_latch()
    }

    pub fn in_transaction(&self) -> bool {
        self.flags.in_transaction()
    }

    fn caps(&self) -> BusCaps {
        BusCaps {
            can_serve_atn: self.can_serve_atn(),
        }
    }

    pub fn attach(&mut self, devnr: u8, dev: Box<dyn Device>) -> Result<(), Box<dyn Device>> {
        self.registry.attach(devnr, dev)?;
        if self.begun {
            let caps = self.caps();
            if let Some(entry) = self.registry.get_mut(devnr) {
                entry.device_mut().begin(caps);
            }
        }
        Ok(())
    }

    pub fn detach(&mut self, devnr: u8) -> Option<Box<dyn Device>> {
        let idx = self.registry.index_of(devnr, true)?;
        // removal swaps the last entry into the vacated slot
        match self.current {
            Some(cur) if cur == idx => self.current = None,
            Some(cur) if cur == self.registry.len() - 1 => self.current = Some(idx),
            _ => {}
        }
        self.registry.detach(devnr)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    pub fn send_srq(&mut self) {
        self.port.pulse_srq();
    }

    // ---------------------------------------------------------------- timing

    fn now(&self) -> u32 {
        self.platform.micros()
    }

    fn mask_irq(&mut self) {
        self.platform.interrupts_off();
        self.irq_masked = true;
        self.wdt_start = self.platform.micros();
    }

    fn unmask_irq(&mut self) {
        self.irq_masked = false;
        self.platform.interrupts_on();
    }

    fn maybe_feed_wdt(&mut self) {
        if !self.irq_masked {
            return;
        }
        let Some(budget) = self.platform.watchdog_budget() else {
            return;
        };
        #[allow(clippy::cast_possible_truncation)]
        let budget_us = budget.as_micros() as u32;
        if elapsed_us(self.platform.micros(), self.wdt_start) >= budget_us {
            self.platform.interrupts_on();
            self.platform.interrupts_off();
            self.wdt_start = self.platform.micros();
        }
    }

    fn cond_met(&self, cond: LineCond) -> bool {
        match cond {
            LineCond::DavLow => self.port.read_dav() == ASSERTED,
            LineCond::DavHigh => self.port.read_dav() == RELEASED,
            LineCond::NrfdLow => self.port.read_nrfd() == ASSERTED,
            LineCond::NrfdHigh => self.port.read_nrfd() == RELEASED,
            LineCond::NdacLow => self.port.read_ndac() == ASSERTED,
            LineCond::NdacHigh => self.port.read_ndac() == RELEASED,
        }
    }

    fn atn_mismatch(&self) -> bool {
        self.flags.atn() == self.port.read_atn()
    }

    fn wait_timeout(&mut self, timeout: u32, cond: LineCond) -> Result<(), Abort> {
        let mut remaining = timeout;
        let mut t0 = self.platform.micros();
        loop {
            if self.cond_met(cond) {
                return Ok(());
            }
            if self.atn_mismatch() {
                return Err(Abort::AtnTransition);
            }
            let slice = remaining.min(100);
            if elapsed_us(self.platform.micros(), t0) >= slice {
                if remaining <= 100 {
                    return Err(Abort::Timeout);
                }
                remaining -= 100;
                t0 = self.platform.micros();
            }
        }
    }

    fn wait_line(&mut self, cond: LineCond, timeout: u32) -> Result<(), Abort> {
        if timeout == 0 {
            while !self.cond_met(cond) {
                if self.atn_mismatch() {
                    return Err(Abort::AtnTransition);
                }
                self.maybe_feed_wdt();
            }
            Ok(())
        } else {
            self.wait_timeout(timeout, cond)
        }
    }

    fn wait_dav(&mut self, level: bool, timeout: u32) -> Result<(), Abort> {
        let cond = if level {
            LineCond::DavHigh
        } else {
            LineCond::DavLow
        };
        self.wait_line(cond, timeout)
    }

    /// NRFD-low observations are only trusted once ATN fell, since other
    /// devices may hold the line.
    fn wait_nrfd(&mut self, level: bool, timeout: u32) -> Result<(), Abort> {
        let cond = if level {
            LineCond::NrfdHigh
        } else {
            LineCond::NrfdLow
        };
        self.wait_line(cond, timeout)?;
        if level == ASSERTED && !self.flags.atn() && self.port.read_atn() == ASSERTED {
            return Err(Abort::AtnTransition);
        }
        Ok(())
    }

    fn wait_ndac(&mut self, level: bool, timeout: u32) -> Result<(), Abort> {
        let cond = if level {
            LineCond::NdacHigh
        } else {
            LineCond::NdacLow
        };
        self.wait_line(cond, timeout)?;
        if level == ASSERTED && !self.flags.atn() && self.port.read_atn() == ASSERTED {
            return Err(Abort::AtnTransition);
        }
        Ok(())
    }

    fn wait_atn(&mut self, level: bool) {
        while self.port.read_atn() != level {
            self.maybe_feed_wdt();
        }
    }

    fn drain_requests(&mut self, idx: usize) {
        while let Some(req) = self.registry.device(idx).take_request() {
            match req {
                BusRequest::Srq => self.port.pulse_srq(),
                // no fast loaders on this bus
                BusRequest::FastLoad(..) | BusRequest::DolphinBurst(_) => {}
            }
        }
    }

    // ------------------------------------------------------------- protocol

    fn atn_request(&mut self) {
        if self.port.read_atn() == RELEASED {
            return;
        }

        self.flags.set_atn(true);
        self.flags.set_done(false);
        self.current = None;

        // ignore anything for 100us after the falling edge
        self.timeout_start = self.now();

        // release DAV in case we were holding it, signal "I am here"
        self.port.write_dav(RELEASED);
        self.port.write_nrfd(ASSERTED);

        // disable the hardware that lets ATN pull NRFD low
        self.port.write_ctrl(RELEASED);

        for entry in self.registry.iter_mut() {
            entry.fl_protocol = None;
        }
    }

    /// Receive one byte under ATN: a single parallel handshake with the
    /// controller as talker.
    fn receive_byte_atn(&mut self) -> Result<u8, Abort> {
        self.port.data_input();

        // no data accepted yet, but ready for it
        self.port.write_ndac(ASSERTED);
        self.port.write_nrfd(RELEASED);

        // data valid; the controller waits for every device to release
        // NRFD before asserting DAV
        self.wait_dav(ASSERTED, 0)?;
        self.port.write_nrfd(ASSERTED);

        let data = self.port.read_data();

        // accepted; wait for the handshake to finish
        self.port.write_ndac(RELEASED);
        self.wait_dav(RELEASED, 0)?;
        self.port.write_ndac(ASSERTED);

        Ok(data)
    }

    /// Complete one data byte under LISTENING; the receive phase has
    /// already signaled ready-for-data and seen DAV asserted.
    fn receive_byte(&mut self, can_write_ok: bool) -> Result<(), Abort> {
        self.mask_irq();

        // busy while the byte is stored
        self.port.write_nrfd(ASSERTED);

        let eoi = self.port.read_eoi() == ASSERTED;
        let data = self.port.read_data();

        if !can_write_ok {
            self.unmask_irq();
            return Err(Abort::Timeout);
        }

        // accepted
        self.port.write_ndac(RELEASED);
        let res = self.wait_dav(RELEASED, 1000);
        self.port.write_ndac(ASSERTED);
        self.unmask_irq();
        res?;

        if let Some(idx) = self.current {
            self.registry.device(idx).write(data, eoi);
        }
        Ok(())
    }

    /// Transmit one data byte under TALKING.
    fn transmit_byte(&mut self, num_data: i8) -> Result<(), Abort> {
        self.mask_irq();
        let res = (|| {
            self.port.data_output();

            // ready-to-send
            self.port.write_dav(RELEASED);

            // wait (indefinitely) for ready-for-data
            self.wait_nrfd(RELEASED, 0)?;

            if num_data == 1 {
                self.port.write_eoi(ASSERTED);
            }

            // nothing to send: aborting here surfaces the error (e.g. FILE
            // NOT FOUND on a LOAD)
            if num_data == 0 {
                return Err(Abort::Timeout);
            }
            Ok(())
        })();
        self.unmask_irq();
        res?;

        let Some(idx) = self.current else {
            return Err(Abort::Timeout);
        };
        let data = self.registry.device(idx).read();

        self.port.write_data(data);

        // data valid
        self.port.write_dav(ASSERTED);

        // accepted
        self.wait_ndac(RELEASED, 1000)?;

        // data invalid, wait for the handshake to finish
        self.port.write_dav(RELEASED);
        self.port.write_eoi(RELEASED);
        self.wait_ndac(ASSERTED, 1000)?;

        Ok(())
    }

    fn handle_atn_sequence(&mut self) {
        self.mask_irq();
        self.flags.set_done(false);

        self.primary = 0;
        let received = match self.receive_byte_atn() {
            Ok(p) => {
                self.primary = p;
                p == UNLISTEN
                    || p == UNTALK
                    || self.registry.index_of(p & 0x1F, false).is_some()
            }
            Err(_) => false,
        };

        if received {
            self.secondary = if self.primary == UNLISTEN || self.primary == UNTALK {
                0
            } else {
                self.receive_byte_atn().unwrap_or(0)
            };

            self.wait_atn(RELEASED);
            self.flags.set_atn(false);
            self.port.write_ctrl(ASSERTED);

            self.dispatch_atn();

            if !self.flags.in_transaction() {
                self.port.write_dav(RELEASED);
                self.port.write_nrfd(RELEASED);
            }
        } else {
            delay_isafe(&self.platform, 150);
            self.port.write_dav(RELEASED);
            self.port.write_nrfd(RELEASED);
            self.wait_atn(RELEASED);
            self.flags.set_atn(false);

            if matches!(AtnCommand::decode(self.primary), AtnCommand::Talk(_)) {
                self.flags.set_talking(false);
            }
            self.port.write_ctrl(ASSERTED);
        }

        self.unmask_irq();
    }

    fn dispatch_atn(&mut self) {
        match AtnCommand::decode(self.primary) {
            AtnCommand::Listen(devnr) => {
                if let Some(idx) = self.registry.index_of(devnr, false) {
                    trace!("listen {} sec {:02x}", devnr, self.secondary);
                    self.current = Some(idx);
                    let secondary = self.secondary;
                    self.registry.device(idx).listen(secondary);
                    self.drain_requests(idx);
                    self.flags.set_talking(false);
                    self.flags.set_listening(true);

                    self.port.write_nrfd(ASSERTED);
                }
            }
            AtnCommand::Talk(devnr) => {
                if let Some(idx) = self.registry.index_of(devnr, false) {
                    trace!("talk {} sec {:02x}", devnr, self.secondary);
                    self.current = Some(idx);
                    let secondary = self.secondary;
                    self.registry.device(idx).talk(secondary);
                    self.drain_requests(idx);
                    self.flags.set_listening(false);
                    self.flags.set_talking(true);

                    // talker role: stop driving the listener handshakes
                    self.port.write_nrfd(RELEASED);
                    self.port.write_ndac(RELEASED);

                    // role reversal on DAV
                    if self.wait_dav(RELEASED, 1000).is_ok() {
                        self.port.write_dav(ASSERTED);
                        self.port.write_nrfd(RELEASED);
                        delay_isafe(&self.platform, 80);
                        self.timeout_duration = 0;
                    }
                }
            }
            AtnCommand::Unlisten => {
                trace!("unlisten");
                if self.flags.listening() {
                    self.flags.set_listening(false);
                    for i in 0..self.registry.len() {
                        self.registry.device(i).unlisten();
                        self.drain_requests(i);
                    }
                }
            }
            AtnCommand::Untalk => {
                trace!("untalk");
                if self.flags.talking() {
                    self.flags.set_talking(false);
                    for i in 0..self.registry.len() {
                        self.registry.device(i).untalk();
                        self.drain_requests(i);
                    }
                }
            }
            AtnCommand::Other(_) => {}
        }
    }

    // ----------------------------------------------------------------- task

    /// Run one iteration of the bus service loop.
    pub fn task(&mut self) {
        if !self.begun {
            return;
        }

        // RESET edge detection
        if self.port.read_reset() == RELEASED {
            self.flags.set_reset(true);
        } else if self.flags.reset() {
            debug!("bus reset");
            self.current = None;
            self.flags.clear();
            self.port.write_dav(RELEASED);
            self.port.write_nrfd(RELEASED);
            self.port.write_ctrl(ASSERTED);
            for entry in self.registry.iter_mut() {
                entry.fl_protocol = None;
                entry.device_mut().reset();
            }
        }

        if !self.flags.atn() && (self.port.atn_edge_latched() || self.port.read_atn() == ASSERTED)
        {
            self.atn_request();
        }

        if self.flags.atn()
            && self.port.read_atn() == ASSERTED
            && elapsed_us(self.now(), self.timeout_start) > 100
            && self.port.read_dav() == RELEASED
        {
            self.handle_atn_sequence();

            if self.flags.listening() {
                let can_write = match self.current {
                    Some(idx) => {
                        self.registry.device(idx).task();
                        let n = self.registry.device(idx).can_write();
                        self.drain_requests(idx);
                        n > 0
                    }
                    None => false,
                };

                if self.port.read_atn() == ASSERTED && !self.flags.atn() {
                    self.atn_request();
                } else if !self.flags.atn() && !can_write {
                    // signal the error by releasing NRFD
                    self.port.write_nrfd(RELEASED);
                    self.flags.set_done(true);
                }
            }
        } else if self.flags.atn() && self.port.read_atn() == RELEASED {
            self.flags.set_atn(false);
        }

        self.receive_phase();
        self.transmit_phase();

        if self.port.read_atn() == ASSERTED && !self.flags.atn() {
            self.atn_request();
        }

        for i in 0..self.registry.len() {
            self.registry.device(i).task();
            self.drain_requests(i);
        }
    }

    fn receive_phase(&mut self) {
        if self.flags.atn() || self.flags.done() || !self.flags.listening() {
            return;
        }
        let Some(idx) = self.current else {
            return;
        };

        let num_data = self.registry.device(idx).can_write();
        self.drain_requests(idx);

        if self.port.read_atn() == ASSERTED && !self.flags.atn() {
            self.atn_request();
            return;
        }
        if num_data < 0 {
            return;
        }

        // signal ready-for-data; the byte completes once the controller
        // asserts DAV
        self.port.data_input();
        self.port.write_ndac(ASSERTED);
        self.port.write_nrfd(RELEASED);

        if self.port.read_dav() == ASSERTED && self.receive_byte(num_data > 0).is_err() {
            self.flags.set_done(true);
        }
    }

    fn transmit_phase(&mut self) {
        if self.flags.atn() || self.flags.done() || !self.flags.talking() {
            return;
        }
        let Some(idx) = self.current else {
            return;
        };

        let num_data = self.registry.device(idx).can_read();
        self.drain_requests(idx);

        if self.port.read_atn() == ASSERTED && !self.flags.atn() {
            self.atn_request();
            return;
        }
        if elapsed_us(self.now(), self.timeout_start) < self.timeout_duration || num_data < 0 {
            return;
        }

        if self.transmit_byte(num_data).is_ok() {
            // pacing before the next byte
            self.timeout_start = self.now();
            self.timeout_duration = 200;
        } else {
            self.flags.set_done(true);
        }
    }
}
