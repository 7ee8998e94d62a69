//! The three-wire serial (IEC) bus handler.
//!
//! Implements the slave side of the Commodore serial protocol: ATN
//! addressing, byte-level send/receive with timing-encoded EOI, turn-around,
//! and the runtime switch into fast-loader sub-protocols once one has been
//! detected on the command channel.
//!
//! All protocol logic runs in [`IecBus::task`]; interrupt handlers only
//! latch the ATN falling edge at the port level. On cached-flash targets the
//! byte engines (this module and `loaders/`) must execute from RAM.

pub mod loaders;

use crate::address::{AtnCommand, UNLISTEN, UNTALK};
use crate::device::{BusCaps, BusRequest, Device, FastLoad, FastLoadKind, Loader};
use crate::error::Abort;
use crate::registry::DeviceRegistry;
use alloc::boxed::Box;
use ferriec_shared::flags::BusFlags;
use ferriec_shared::platform::{delay_isafe, elapsed_us, Platform};
use ferriec_shared::port::{ParallelPort, SerialPort, ASSERTED, RELEASED};
use log::{debug, trace};

/// Scratch buffer length; the Final Cartridge 3 block format needs 260
/// bytes (254 payload plus framing).
pub const BUFFER_LEN: usize = 260;

/// Default fast-load transfer chunk size. Larger values buy little speed.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// Bytes withheld at the start of a parallel LOAD/SAVE until the host
/// commits to burst mode (DolphinDOS sends `\0 \x01` before `XZ`).
pub(crate) const PARALLEL_PREBUFFER: usize = 2;

/// Wait-loop conditions, see [`IecBus::wait_timeout`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineCond {
    None,
    DataLow,
    DataHigh,
    ClkLow,
    ClkHigh,
}

pub struct IecBus<P: SerialPort, PL: Platform, C: ParallelPort> {
    pub(crate) port: P,
    pub(crate) platform: PL,
    pub(crate) cable: C,
    pub(crate) registry: DeviceRegistry,

    pub(crate) flags: BusFlags,
    begun: bool,
    /// Index of the currently addressed device.
    pub(crate) current: Option<usize>,
    pub(crate) primary: u8,
    pub(crate) secondary: u8,

    pub(crate) timeout_start: u32,
    pub(crate) timeout_duration: u32,

    pub(crate) buffer: [u8; BUFFER_LEN],
    pub(crate) chunk_size: usize,
    pub(crate) buffer_ctr: usize,

    irq_masked: bool,
    wdt_start: u32,
}

impl<P: SerialPort, PL: Platform, C: ParallelPort> IecBus<P, PL, C> {
    pub fn new(port: P, platform: PL, cable: C) -> Self {
        IecBus {
            port,
            platform,
            cable,
            registry: DeviceRegistry::new(),
            flags: BusFlags::new(),
            begun: false,
            current: None,
            primary: 0,
            secondary: 0,
            timeout_start: 0,
            timeout_duration: 0,
            buffer: [0; BUFFER_LEN],
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_ctr: 0,
            irq_masked: false,
            wdt_start: 0,
        }
    }

    /// Cap the fast-load transfer chunk (2..=254 bytes).
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.clamp(PARALLEL_PREBUFFER, 254);
    }

    /// Must be called once before the first [`IecBus::task`] call.
    pub fn begin(&mut self) {
        self.flags.clear();
        self.current = None;
        self.begun = true;

        // allow ATN to pull DATA low in hardware
        self.port.write_clk(RELEASED);
        self.port.write_data(RELEASED);
        self.port.write_ctrl(ASSERTED);

        let caps = self.caps();
        for entry in self.registry.iter_mut() {
            entry.device_mut().begin(caps);
        }
    }

    /// Whether ATN can be acknowledged without the task loop running
    /// promptly (hardware DATA gate, or edge latch on ATN).
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

    /// Enable or disable a fast-load protocol on a device. Parallel-cable
    /// loaders require a cable to be present. Returns the resulting state.
    pub fn enable_loader(&mut self, devnr: u8, loader: Loader, enable: bool) -> bool {
        if loader.needs_parallel_cable() && enable && !self.cable.available() {
            return false;
        }
        let Some(entry) = self.registry.get_mut(devnr) else {
            return false;
        };
        entry.fl_protocol = None;
        entry.set_loader_enabled(loader, enable);
        match loader {
            Loader::Jiffy => {
                entry.fl_flags.set_jiffy_detected(false);
                entry.fl_flags.set_jiffy_block(false);
            }
            Loader::Dolphin => {
                entry.fl_flags.set_dolphin_burst(true);
                entry.fl_flags.set_dolphin_detected(false);
            }
            Loader::SpeedDos => {
                entry.fl_flags.set_speeddos_detected(false);
            }
            _ => {}
        }
        entry.loader_enabled(loader)
    }

    /// Pulse SRQ to request host attention.
    pub fn send_srq(&mut self) {
        self.port.pulse_srq();
    }

    // ---------------------------------------------------------------- timing

    pub(crate) fn now(&self) -> u32 {
        self.platform.micros()
    }

    pub(crate) fn mask_irq(&mut self) {
        self.platform.interrupts_off();
        self.irq_masked = true;
        self.wdt_start = self.platform.micros();
    }

    pub(crate) fn unmask_irq(&mut self) {
        self.irq_masked = false;
        self.platform.interrupts_on();
    }

    /// Run `f` with interrupts masked.
    pub(crate) fn masked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.mask_irq();
        let r = f(self);
        self.unmask_irq();
        r
    }

    /// Briefly re-enable interrupts inside an unbounded wait loop when the
    /// platform's interrupt watchdog would otherwise starve.
    pub(crate) fn maybe_feed_wdt(&mut self) {
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

    pub(crate) fn delay(&mut self, us: u32) {
        delay_isafe(&self.platform, us);
    }

    /// Busy-wait until `deadline_us` after the reference timestamp `t0`.
    pub(crate) fn wait_until(&self, t0: u32, deadline_us: u32) {
        while elapsed_us(self.platform.micros(), t0) < deadline_us {}
    }

    fn cond_met(&self, cond: LineCond) -> bool {
        match cond {
            LineCond::None => false,
            LineCond::DataLow => self.port.read_data() == ASSERTED,
            LineCond::DataHigh => self.port.read_data() == RELEASED,
            LineCond::ClkLow => self.port.read_clk() == ASSERTED,
            LineCond::ClkHigh => self.port.read_clk() == RELEASED,
        }
    }

    /// ATN no longer matches our view of it: the host started or ended an
    /// addressing sequence and every in-flight transfer must abort.
    pub(crate) fn atn_mismatch(&self) -> bool {
        self.flags.atn() == self.port.read_atn()
    }

    /// Wait up to `timeout` µs for `cond`, aborting on an ATN transition.
    /// With `LineCond::None` the expiry itself is the success condition.
    /// Timeouts are consumed in 100 µs slices so short platform timers
    /// suffice; precision is not guaranteed beyond a few microseconds.
    pub(crate) fn wait_timeout(&mut self, timeout: u32, cond: LineCond) -> Result<(), Abort> {
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
                    return if cond == LineCond::None {
                        Ok(())
                    } else {
                        Err(Abort::Timeout)
                    };
                }
                remaining -= 100;
                t0 = self.platform.micros();
            }
        }
    }

    /// Wait for DATA to reach `level`; `timeout` of 0 waits indefinitely
    /// (still aborting on ATN). A DATA-low observation is only trusted once
    /// ATN went high-to-low, since other devices may be holding DATA.
    pub(crate) fn wait_data(&mut self, level: bool, timeout: u32) -> Result<(), Abort> {
        if timeout == 0 {
            while self.port.read_data() != level {
                if self.atn_mismatch() {
                    return Err(Abort::AtnTransition);
                }
                self.maybe_feed_wdt();
            }
        } else {
            let cond = if level {
                LineCond::DataHigh
            } else {
                LineCond::DataLow
            };
            self.wait_timeout(timeout, cond)?;
        }
        if level == ASSERTED && !self.flags.atn() && self.port.read_atn() == ASSERTED {
            return Err(Abort::AtnTransition);
        }
        Ok(())
    }

    /// Wait for CLK to reach `level`; `timeout` of 0 waits indefinitely.
    pub(crate) fn wait_clk(&mut self, level: bool, timeout: u32) -> Result<(), Abort> {
        if timeout == 0 {
            while self.port.read_clk() != level {
                if self.atn_mismatch() {
                    return Err(Abort::AtnTransition);
                }
                self.maybe_feed_wdt();
            }
            Ok(())
        } else {
            let cond = if level {
                LineCond::ClkHigh
            } else {
                LineCond::ClkLow
            };
            self.wait_timeout(timeout, cond)
        }
    }

    /// Wait (indefinitely) for ATN to reach `level`.
    pub(crate) fn wait_atn(&mut self, level: bool) {
        while self.port.read_atn() != level {
            self.maybe_feed_wdt();
        }
    }

    /// Spin until `cond` holds on the port, returning the timestamp of the
    /// observation; aborts only when ATN is pulled low. Used by the loader
    /// engines, whose reference edge starts a bit-timing schedule.
    pub(crate) fn spin<F: Fn(&P) -> bool>(&mut self, cond: F) -> Result<u32, Abort> {
        loop {
            if cond(&self.port) {
                return Ok(self.platform.micros());
            }
            if self.port.read_atn() == ASSERTED {
                return Err(Abort::AtnTransition);
            }
            self.maybe_feed_wdt();
        }
    }

    // ------------------------------------------------------ parallel cable

    /// Wait up to 5 ms for a handshake pulse on the parallel cable; gives up
    /// when ATN is pulled.
    pub(crate) fn wait_cable_handshake(&mut self) -> bool {
        let t0 = self.now();
        while !self.cable.handshake_received() {
            if self.port.read_atn() == ASSERTED || elapsed_us(self.now(), t0) > 5000 {
                return false;
            }
        }
        true
    }

    /// Interrupt-safe variant: polls the latched handshake while watching
    /// for an ATN (and optionally CLK) transition.
    pub(crate) fn wait_cable_handshake_isafe(&mut self, exit_on_clk: bool) -> bool {
        self.cable.handshake_received();

        let atn = self.port.read_atn();
        let clk = self.port.read_clk();
        loop {
            if self.cable.handshake_received() {
                return true;
            }
            if atn != self.port.read_atn() {
                return false;
            }
            if exit_on_clk && clk != self.port.read_clk() {
                return false;
            }
        }
    }

    // ------------------------------------------------------------- requests

    /// Drain bus requests raised by the device at `idx`.
    pub(crate) fn drain_requests(&mut self, idx: usize) {
        while let Some(req) = self.registry.device(idx).take_request() {
            match req {
                BusRequest::FastLoad(loader, kind) => self.fast_load_request(idx, loader, kind),
                BusRequest::DolphinBurst(enable) => {
                    let entry = self.registry.entry(idx);
                    entry.fl_flags.set_dolphin_burst(enable);
                    entry.fl_protocol = None;
                }
                BusRequest::Srq => self.port.pulse_srq(),
            }
        }
    }

    /// Arm a fast-load sub-protocol on the device at `idx`. The wire phase
    /// switches once the task loop observes the protocol's precondition.
    pub(crate) fn fast_load_request(&mut self, idx: usize, loader: Loader, kind: FastLoadKind) {
        if !self.registry.entry(idx).loader_enabled(loader) {
            return;
        }
        debug!("fast load request: {:?} {:?}", loader, kind);
        self.registry.entry(idx).fl_protocol = Some(FastLoad { loader, kind });
        self.current = Some(idx);

        match loader {
            Loader::Dolphin => {
                self.timeout_start = self.now();
                self.timeout_duration = if kind == FastLoadKind::Save { 500 } else { 200 };
            }
            Loader::Fc3 => {
                self.timeout_start = self.now();
                self.timeout_duration = 20_000;
                match kind {
                    FastLoadKind::Load | FastLoadKind::LoadImage => {
                        self.buffer[0] = 7; // not used by the receiver
                        self.buffer[1] = 0; // first block number
                    }
                    FastLoadKind::Save => {
                        // signal "not ready"
                        self.port.write_data(ASSERTED);
                    }
                    _ => {}
                }
            }
            Loader::Ar6 => {
                // signal "not ready"
                self.port.write_clk(ASSERTED);
                // block counter for LOAD
                self.buffer[255] = 0;
                // give the sender time to pull DATA low and see our CLK low
                self.timeout_start = self.now();
                self.timeout_duration = 500;
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------- protocol

    /// Handle a falling edge on ATN: acknowledge within the 1000 µs budget
    /// and reset per-transaction loader state on every device.
    pub(crate) fn atn_request(&mut self) {
        if self.port.read_atn() == RELEASED {
            return;
        }

        self.flags.set_atn(true);
        self.flags.set_done(false);

        // ignore anything for 100us after the falling edge
        self.timeout_start = self.now();

        // release CLK (in case we were holding it), signal "I am here";
        // the host reports "device not present" if nobody pulls DATA within
        // 1ms
        self.port.write_clk(RELEASED);
        self.port.write_data(ASSERTED);

        // disable the hardware that lets ATN pull DATA low
        self.port.write_ctrl(RELEASED);

        for entry in self.registry.iter_mut() {
            entry.fl_flags.clear_detections();
            entry.fl_protocol = None;
        }
    }

    /// Receive one byte under ATN. `is_primary` selects the JiffyDOS
    /// detection hook, its complement the SpeedDOS/DolphinDOS cable probes.
    fn receive_byte_atn(&mut self, is_primary: bool) -> Result<u8, Abort> {
        // SpeedDos announces itself with a cable handshake pulse before the
        // secondary address, which then arrives over the cable
        if !is_primary {
            if let Some(idx) = self.addressed_index() {
                if self.registry.entry(idx).loader_enabled(Loader::SpeedDos)
                    && self.wait_cable_handshake_isafe(true)
                {
                    self.registry.entry(idx).fl_flags.set_speeddos_detected(true);
                    self.cable.handshake_pulse();
                }
                if self.registry.entry(idx).fl_flags.speeddos_detected() {
                    self.wait_clk(RELEASED, 0)?;
                    self.port.write_data(RELEASED);
                    self.wait_clk(ASSERTED, 0)?;
                    if !self.wait_cable_handshake_isafe(false) {
                        return Err(Abort::AtnTransition);
                    }
                    let data = self.cable.read();
                    self.cable.handshake_pulse();
                    self.port.write_data(ASSERTED);
                    return Ok(data);
                }
            }
        }

        // wait for the host to release CLK, then signal ready-for-data
        self.wait_clk(RELEASED, 0)?;
        self.port.write_data(RELEASED);

        // other devices may be holding DATA low; the host starts its EOI
        // timeout once DATA actually goes high
        self.wait_data(RELEASED, 0)?;

        if self.wait_clk(ASSERTED, 200).is_err() {
            if self.atn_mismatch() {
                return Err(Abort::AtnTransition);
            }
            // EOI is not normally signaled under ATN but some cartridges do
            // (Epyx sector ops); acknowledge with an 80us DATA pulse
            self.port.write_data(ASSERTED);
            self.wait_timeout(80, LineCond::None)?;
            self.port.write_data(RELEASED);
            self.wait_clk(ASSERTED, 0)?;
        }

        let mut data: u8 = 0;
        for i in 0..8 {
            if is_primary && i == 7 && self.wait_clk(RELEASED, 200).is_err() {
                if self.atn_mismatch() {
                    return Err(Abort::AtnTransition);
                }
                // host stalled before the final bit of the primary: JiffyDOS
                // protocol detection; acknowledge if we are addressed and
                // support it
                let devnr = (data >> 1) & 0x1F;
                if let Some(entry) = self.registry.get_mut(devnr) {
                    if entry.loader_enabled(Loader::Jiffy) {
                        entry.fl_flags.set_jiffy_detected(true);
                        self.port.write_data(ASSERTED);
                        self.wait_timeout(80, LineCond::None)?;
                        self.port.write_data(RELEASED);
                    }
                }
            }

            self.wait_clk(RELEASED, 1000)?;
            data >>= 1;
            if self.port.read_data() == RELEASED {
                data |= 0x80;
            }
            self.wait_clk(ASSERTED, 1000)?;
        }

        // acknowledge receipt
        self.port.write_data(ASSERTED);

        // DolphinDos announces itself with a cable handshake pulse after
        // the secondary address
        if !is_primary {
            if let Some(idx) = self.addressed_index() {
                if self.registry.entry(idx).loader_enabled(Loader::Dolphin)
                    && self.wait_cable_handshake_isafe(true)
                {
                    self.registry.entry(idx).fl_flags.set_dolphin_detected(true);
                    self.cable.handshake_pulse();
                }
            }
        }

        Ok(data)
    }

    fn addressed_index(&self) -> Option<usize> {
        self.registry.index_of(self.primary & 0x1F, false)
    }

    /// Receive and dispatch a full ATN sequence (primary plus optional
    /// secondary), then perform the role change it demands.
    fn handle_atn_sequence(&mut self) {
        // Interrupts stay off for the whole sequence; a long interrupt near
        // its end could make us miss a quick ATN low-high-low transition.
        self.mask_irq();
        self.flags.set_done(false);

        self.primary = 0;
        let received = match self.receive_byte_atn(true) {
            Ok(p) => {
                self.primary = p;
                p == UNLISTEN || p == UNTALK || self.addressed_index().is_some()
            }
            Err(_) => false,
        };

        if received {
            // receive the secondary address, assume 0 if absent
            self.secondary = if self.primary == UNLISTEN || self.primary == UNTALK {
                0
            } else {
                match self.receive_byte_atn(false) {
                    Ok(s) => s,
                    Err(_) => 0,
                }
            };

            // the host may issue an UNTALK/UNLISTEN right after TALK/LISTEN
            // within the same ATN window
            if self.wait_clk(RELEASED, 0).is_ok() {
                if let Ok(p) = self.receive_byte_atn(true) {
                    if p == UNLISTEN || p == UNTALK {
                        self.primary = 0;
                    }
                }
                self.wait_atn(RELEASED);
            }

            self.flags.set_atn(false);
            self.port.write_ctrl(ASSERTED);

            self.dispatch_atn();

            if !self.flags.in_transaction() {
                self.port.write_clk(RELEASED);
                self.port.write_data(RELEASED);
            }
        } else {
            // not addressed, or the primary was corrupted
            self.delay(150);
            self.port.write_clk(RELEASED);
            self.port.write_data(RELEASED);
            self.wait_atn(RELEASED);
            self.flags.set_atn(false);

            // if someone else was told to talk then we must stop
            if matches!(AtnCommand::decode(self.primary), AtnCommand::Talk(_)) {
                self.flags.set_talking(false);
            }
            self.port.write_ctrl(ASSERTED);
        }

        self.unmask_irq();
    }

    fn dispatch_atn(&mut self) {
        match AtnCommand::decode(self.primary) {
            AtnCommand::Unlisten => {
                trace!("unlisten");
                if self.flags.listening() {
                    if let Some(idx) = self.current {
                        self.registry.device(idx).unlisten();
                        self.drain_requests(idx);
                    }
                    self.current = None;
                    self.flags.set_listening(false);
                }
            }
            AtnCommand::Untalk => {
                trace!("untalk");
                if self.flags.talking() {
                    if let Some(idx) = self.current {
                        self.registry.device(idx).untalk();
                        self.drain_requests(idx);
                    }
                    self.current = None;
                    self.flags.set_talking(false);
                }
            }
            AtnCommand::Listen(devnr) => {
                if let Some(idx) = self.registry.index_of(devnr, false) {
                    trace!("listen {} sec {:02x}", devnr, self.secondary);
                    self.current = Some(idx);
                    let secondary = self.secondary;
                    self.registry.device(idx).listen(secondary);
                    self.drain_requests(idx);
                    self.flags.set_talking(false);
                    self.flags.set_listening(true);

                    // DolphinDos SAVE pre-buffers its first bytes, see the
                    // burst receive path
                    if self.secondary == 0x61 {
                        self.buffer_ctr = 2 * PARALLEL_PREBUFFER;
                    }

                    self.port.write_data(ASSERTED);
                }
            }
            AtnCommand::Talk(devnr) => {
                if let Some(idx) = self.registry.index_of(devnr, false) {
                    self.current = Some(idx);

                    // JiffyDOS secondary 0x61 when talking selects block
                    // transfer mode
                    if self.registry.entry(idx).fl_flags.jiffy_detected() && self.secondary == 0x61
                    {
                        self.secondary = 0x60;
                        self.registry.entry(idx).fl_flags.set_jiffy_block(true);
                    }
                    trace!("talk {} sec {:02x}", devnr, self.secondary);

                    let secondary = self.secondary;
                    self.registry.device(idx).talk(secondary);
                    self.drain_requests(idx);
                    self.flags.set_listening(false);
                    self.flags.set_talking(true);

                    if self.secondary == 0x60 {
                        self.buffer_ctr = 0;
                    }

                    // role reversal: wait for the host to release CLK, then
                    // take over the line and settle before the first byte
                    if self.wait_clk(RELEASED, 1000).is_ok() {
                        self.port.write_clk(ASSERTED);
                        self.port.write_data(RELEASED);
                        self.delay(80);
                        self.timeout_duration = 0;
                    }
                }
            }
            AtnCommand::Other(_) => {}
        }
    }

    /// Receive one data byte under LISTENING (sender has released CLK).
    /// `can_write_ok` is the result of the device's `can_write` probe; a
    /// false value consumes the byte from the wire but fails the transfer.
    pub(crate) fn receive_byte(&mut self, can_write_ok: bool) -> Result<(), Abort> {
        let mut eoi = false;

        self.mask_irq();
        let res = (|| {
            // ready-for-data
            self.port.write_data(RELEASED);

            if self.wait_clk(ASSERTED, 200).is_err() {
                if self.atn_mismatch() {
                    return Err(Abort::AtnTransition);
                }
                // no CLK within 200us: sender signals EOI; acknowledge with
                // an 80us DATA pulse, then keep waiting
                eoi = true;
                self.port.write_data(ASSERTED);
                self.wait_timeout(80, LineCond::None)?;
                self.port.write_data(RELEASED);
                self.wait_clk(ASSERTED, 0)?;
            }

            let mut data: u8 = 0;
            for _ in 0..8 {
                self.wait_clk(RELEASED, 1000)?;
                data >>= 1;
                if self.port.read_data() == RELEASED {
                    data |= 0x80;
                }
                self.wait_clk(ASSERTED, 1000)?;
            }
            Ok(data)
        })();

        match res {
            Ok(data) => {
                self.unmask_irq();
                if can_write_ok {
                    // acknowledge receipt
                    self.port.write_data(ASSERTED);
                    if let Some(idx) = self.current {
                        self.registry.device(idx).write(data, eoi);
                    }
                    Ok(())
                } else {
                    Err(Abort::Timeout)
                }
            }
            Err(e) => {
                self.unmask_irq();
                Err(e)
            }
        }
    }

    /// Transmit one data byte under TALKING. `num_data` is the device's
    /// `can_read` result: 0 aborts (signalling e.g. FILE NOT FOUND), 1 sends
    /// with EOI, more sends normally.
    pub(crate) fn transmit_byte(&mut self, num_data: i8) -> Result<(), Abort> {
        // DATA already released before we signal ready-to-send indicates a
        // host-side "verify error"; treated as an implicit EOI (the 1541 ROM
        // does, and "copy 190" locks up otherwise)
        let verify_error = self.port.read_data() == RELEASED;

        self.mask_irq();
        let res = (|| {
            // ready-to-send
            self.port.write_clk(RELEASED);

            // must be a blocking wait: the receiver starts its EOI timeout
            // on DATA high, and leaving the task loop here could exceed it
            self.wait_data(RELEASED, 0)?;

            if num_data == 1 || verify_error {
                // EOI: hold CLK released until the receiver acknowledges
                // with a DATA low-high pulse
                self.wait_data(ASSERTED, if verify_error { 0 } else { 1000 })?;
                self.wait_data(RELEASED, 1000)?;
            }

            if num_data == 0 {
                return Err(Abort::Timeout);
            }

            self.port.write_clk(ASSERTED);
            Ok(())
        })();

        if let Err(e) = res {
            self.unmask_irq();
            return Err(e);
        }
        self.unmask_irq();

        // Peek now, consume after the byte went through: some hosts (Action
        // Replay 6) signal ready again before pulling ATN, and consuming
        // early would lose a byte.
        let Some(idx) = self.current else {
            return Err(Abort::Timeout);
        };
        let mut data = self.registry.device(idx).peek();

        for _ in 0..8 {
            // data not valid
            self.port.write_clk(ASSERTED);
            self.port.write_data(data & 1 != 0);
            self.wait_timeout(80, LineCond::None)?;

            // data valid; 60us is not enough for some titles
            self.port.write_clk(RELEASED);
            self.wait_timeout(70, LineCond::None)?;

            data >>= 1;
        }

        // signal busy, wait for the receiver's busy-ack
        self.port.write_clk(ASSERTED);
        self.port.write_data(RELEASED);
        self.wait_data(ASSERTED, 1000)?;

        self.registry.device(idx).read();
        Ok(())
    }

    // ----------------------------------------------------------------- task

    /// Run one iteration of the bus service loop. Must be called at least
    /// once per millisecond unless the port latches ATN edges or has the
    /// hardware DATA gate.
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
            self.port.write_clk(RELEASED);
            self.port.write_data(RELEASED);
            self.port.write_ctrl(ASSERTED);
            for entry in self.registry.iter_mut() {
                entry.fl_flags.clear_detections();
                entry.fl_protocol = None;
                entry.device_mut().reset();
            }
        }

        // ATN falling edge, latched or polled
        if !self.flags.atn() && (self.port.atn_edge_latched() || self.port.read_atn() == ASSERTED)
        {
            self.atn_request();
        }

        if self.flags.atn()
            && self.port.read_atn() == ASSERTED
            && elapsed_us(self.now(), self.timeout_start) > 100
            && self.port.read_clk() == RELEASED
        {
            // under ATN, the 100us guard has passed and the host released
            // CLK: receive the addressing sequence
            self.handle_atn_sequence();

            if self.flags.listening() {
                // check the device can accept data; this may take time, so
                // ATN edges are picked up again afterwards
                let can_write = match self.current {
                    Some(idx) => {
                        self.registry.device(idx).task();
                        let n = self.registry.device(idx).can_write();
                        self.drain_requests(idx);
                        n != 0
                    }
                    None => false,
                };

                if !self.flags.atn() && self.port.read_atn() == ASSERTED {
                    self.atn_request();
                } else if !self.flags.atn() && !can_write {
                    // signal the error by releasing DATA
                    self.port.write_data(RELEASED);
                    self.flags.set_done(true);
                }
            }
        } else if self.flags.atn() && self.port.read_atn() == RELEASED {
            self.flags.set_atn(false);
        }

        self.handle_fastload_protocols();

        self.receive_phase();
        self.transmit_phase();

        // if ATN fell while we were busy above, process it before leaving
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

        // the probe doubles as the device's chance to run long work while
        // the host waits in ready-for-data
        let num_data = self.registry.device(idx).can_write();
        self.drain_requests(idx);

        if self.port.read_atn() == ASSERTED && !self.flags.atn() {
            self.atn_request();
            return;
        }
        if self.flags.atn() || num_data < 0 {
            return;
        }

        let entry = self.registry.entry(idx);
        let fl = entry.fl_flags;
        let failed = if fl.jiffy_detected() {
            self.receive_jiffy_byte(num_data > 0).is_err()
        } else if fl.dolphin_detected() {
            if self.port.read_clk() == ASSERTED {
                return; // sender not ready yet
            }
            self.receive_dolphin_byte(num_data > 0).is_err()
        } else if fl.speeddos_detected() {
            if self.port.read_clk() == ASSERTED {
                return;
            }
            self.receive_speeddos_byte(num_data > 0).is_err()
        } else if self.port.read_clk() == RELEASED {
            // CLK released: sender is ready to transmit
            self.receive_byte(num_data > 0).is_err()
        } else {
            return;
        };

        if failed {
            // release DATA and stop listening; the sender sees the error
            self.port.write_data(RELEASED);
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

        if self.registry.entry(idx).fl_flags.jiffy_block() {
            self.transmit_jiffy_block_phase(idx);
            return;
        }

        let num_data = self.registry.device(idx).can_read();
        self.drain_requests(idx);

        if self.port.read_atn() == ASSERTED && !self.flags.atn() {
            self.atn_request();
            return;
        }
        if self.flags.atn() {
            return;
        }
        if elapsed_us(self.now(), self.timeout_start) < self.timeout_duration || num_data < 0 {
            return;
        }

        let fl = self.registry.entry(idx).fl_flags;
        if fl.jiffy_detected() {
            if self.transmit_jiffy_byte(num_data).is_err() {
                self.flags.set_done(true);
            }
        } else if fl.dolphin_detected() {
            if self.transmit_dolphin_byte(num_data).is_err() {
                self.port.write_clk(RELEASED);
                self.flags.set_done(true);
            }
        } else if fl.speeddos_detected() {
            if self.transmit_speeddos_byte(num_data).is_err() {
                self.port.write_clk(RELEASED);
                self.flags.set_done(true);
            }
        } else if self.transmit_byte(num_data).is_ok() {
            // pacing before the next byte
            self.timeout_start = self.now();
            self.timeout_duration = 200;
        } else {
            self.flags.set_done(true);
        }
    }
}
