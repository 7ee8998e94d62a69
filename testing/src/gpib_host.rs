//! Scripted IEEE-488 host (PET/CBM controller side).
//!
//! Much simpler than the serial host: one byte per DAV/NRFD/NDAC
//! handshake, EOI on its own line, no bit timing.

use core::time::Duration;
use ferriec_shared::platform::Platform;
use ferriec_shared::port::GpibPort;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

const TIME_CAP: u64 = 60_000_000;

#[derive(Debug, Clone, Copy)]
pub enum GpibOp {
    /// Assert ATN and wait for a device to pull NRFD low.
    AssertAtn,
    /// Transmit one byte under ATN.
    AtnByte(u8),
    /// Release ATN, staying the talker.
    ReleaseAtn,
    /// Release ATN and become the listener (after TALK).
    ReleaseAtnTurnaround,
    /// Transmit one data byte.
    Send { byte: u8, eoi: bool },
    /// Receive one data byte.
    Recv,
    DelayUs(u64),
    AssertReset,
    ReleaseReset,
}

#[derive(Clone, Copy)]
enum Phase {
    Idle,
    Delay { until: u64 },
    AtnPresence { deadline: u64 },
    TxWaitReady { byte: u8, eoi: bool, deadline: u64 },
    TxWaitAccept { deadline: u64 },
    TxWaitDone { deadline: u64 },
    RxWaitValid,
    RxWaitInvalid,
}

struct State {
    time: u64,

    // host drives (true = pulling low)
    atn_h: bool,
    dav_h: bool,
    nrfd_h: bool,
    ndac_h: bool,
    eoi_h: bool,
    reset_h: bool,

    // device drives
    dav_d: bool,
    nrfd_d: bool,
    ndac_d: bool,
    eoi_d: bool,

    // whoever currently outputs drives the data lines
    host_data: u8,
    device_data: u8,
    device_outputs: bool,

    atn_latch: bool,
    srq_pulses: u32,

    ops: VecDeque<GpibOp>,
    phase: Phase,
    received: Vec<(u8, bool)>,
    error: Option<String>,
}

impl State {
    fn atn(&self) -> bool {
        !self.atn_h
    }
    fn dav(&self) -> bool {
        !(self.dav_h || self.dav_d)
    }
    fn nrfd(&self) -> bool {
        !(self.nrfd_h || self.nrfd_d)
    }
    fn ndac(&self) -> bool {
        !(self.ndac_h || self.ndac_d)
    }
    fn eoi(&self) -> bool {
        !(self.eoi_h || self.eoi_d)
    }

    fn fail(&mut self, msg: &str) {
        if self.error.is_none() {
            self.error = Some(format!("t={}: {}", self.time, msg));
        }
        // release everything so the device side can settle
        self.atn_h = false;
        self.dav_h = false;
        self.nrfd_h = false;
        self.ndac_h = false;
        self.eoi_h = false;
        self.phase = Phase::Idle;
        self.ops.clear();
    }

    fn tick(&mut self) {
        self.time += 1;
        assert!(self.time < TIME_CAP, "simulation stalled (host: {:?})", self.error);
        self.step();
    }

    fn start_op(&mut self) {
        let Some(op) = self.ops.pop_front() else {
            self.phase = Phase::Idle;
            return;
        };
        match op {
            GpibOp::AssertAtn => {
                self.atn_h = true;
                self.atn_latch = true;
                // the controller talks: release the listener handshakes
                self.nrfd_h = false;
                self.ndac_h = false;
                self.dav_h = false;
                self.phase = Phase::AtnPresence {
                    deadline: self.time + 1000,
                };
            }
            GpibOp::AtnByte(byte) => {
                self.phase = Phase::TxWaitReady {
                    byte,
                    eoi: false,
                    deadline: self.time + 100_000,
                };
            }
            GpibOp::ReleaseAtn => {
                self.atn_h = false;
                self.phase = Phase::Idle;
            }
            GpibOp::ReleaseAtnTurnaround => {
                self.atn_h = false;
                // host becomes the listener: not ready, not accepted
                self.nrfd_h = true;
                self.ndac_h = true;
                self.dav_h = false;
                self.phase = Phase::Idle;
            }
            GpibOp::Send { byte, eoi } => {
                self.phase = Phase::TxWaitReady {
                    byte,
                    eoi,
                    deadline: self.time + 100_000,
                };
            }
            GpibOp::Recv => {
                // ready for data
                self.ndac_h = true;
                self.nrfd_h = false;
                self.phase = Phase::RxWaitValid;
            }
            GpibOp::DelayUs(us) => {
                self.phase = Phase::Delay {
                    until: self.time + us,
                };
            }
            GpibOp::AssertReset => {
                self.reset_h = true;
                self.phase = Phase::Idle;
            }
            GpibOp::ReleaseReset => {
                self.reset_h = false;
                self.phase = Phase::Idle;
            }
        }
    }

    fn step(&mut self) {
        match self.phase {
            Phase::Idle => {
                if !self.ops.is_empty() {
                    self.start_op();
                }
            }

            Phase::Delay { until } => {
                if self.time >= until {
                    self.phase = Phase::Idle;
                }
            }

            Phase::AtnPresence { deadline } => {
                if !self.nrfd() {
                    self.phase = Phase::Idle;
                } else if self.time >= deadline {
                    self.fail("device not present (no NRFD ack on ATN)");
                }
            }

            Phase::TxWaitReady { byte, eoi, deadline } => {
                // wait for every listener to release NRFD
                if self.nrfd() {
                    self.host_data = byte;
                    self.eoi_h = eoi;
                    self.dav_h = true;
                    self.phase = Phase::TxWaitAccept {
                        deadline: self.time + 100_000,
                    };
                } else if self.time >= deadline {
                    self.fail("listener never became ready");
                }
            }

            Phase::TxWaitAccept { deadline } => {
                if self.ndac() {
                    self.dav_h = false;
                    self.eoi_h = false;
                    self.phase = Phase::TxWaitDone {
                        deadline: self.time + 100_000,
                    };
                } else if self.time >= deadline {
                    self.fail("listener never accepted the byte");
                }
            }

            Phase::TxWaitDone { deadline } => {
                if !self.ndac() {
                    self.phase = Phase::Idle;
                } else if self.time >= deadline {
                    self.fail("listener kept NDAC released");
                }
            }

            Phase::RxWaitValid => {
                if !self.dav() {
                    // floating bus reads all-ones if the device forgot to
                    // switch its drivers around
                    let byte = if self.device_outputs {
                        self.device_data
                    } else {
                        0xFF
                    };
                    let eoi = !self.eoi();
                    self.received.push((byte, eoi));
                    // accepted
                    self.ndac_h = false;
                    self.phase = Phase::RxWaitInvalid;
                }
            }

            Phase::RxWaitInvalid => {
                if self.dav() {
                    self.ndac_h = true;
                    self.phase = Phase::Idle;
                }
            }
        }
    }
}

/// Handle to one simulated IEEE-488 bus plus its scripted controller.
#[derive(Clone)]
pub struct GpibSim {
    st: Rc<RefCell<State>>,
}

impl Default for GpibSim {
    fn default() -> Self {
        Self::new()
    }
}

impl GpibSim {
    pub fn new() -> Self {
        GpibSim {
            st: Rc::new(RefCell::new(State {
                time: 0,
                atn_h: false,
                dav_h: false,
                nrfd_h: false,
                ndac_h: false,
                eoi_h: false,
                reset_h: false,
                dav_d: false,
                nrfd_d: false,
                ndac_d: false,
                eoi_d: false,
                host_data: 0xFF,
                device_data: 0xFF,
                device_outputs: false,
                atn_latch: false,
                srq_pulses: 0,
                ops: VecDeque::new(),
                phase: Phase::Idle,
                received: Vec::new(),
                error: None,
            })),
        }
    }

    pub fn port(&self) -> SimGpibPort {
        SimGpibPort {
            st: Rc::clone(&self.st),
        }
    }

    pub fn platform(&self) -> SimGpibPlatform {
        SimGpibPlatform {
            st: Rc::clone(&self.st),
        }
    }

    pub fn push(&self, op: GpibOp) {
        self.st.borrow_mut().ops.push_back(op);
    }

    pub fn script(&self, ops: impl IntoIterator<Item = GpibOp>) {
        let mut st = self.st.borrow_mut();
        for op in ops {
            st.ops.push_back(op);
        }
    }

    pub fn idle(&self) -> bool {
        let st = self.st.borrow();
        st.ops.is_empty() && matches!(st.phase, Phase::Idle)
    }

    pub fn received(&self) -> Vec<(u8, bool)> {
        self.st.borrow().received.clone()
    }

    pub fn received_bytes(&self) -> Vec<u8> {
        self.st.borrow().received.iter().map(|&(b, _)| b).collect()
    }

    pub fn error(&self) -> Option<String> {
        self.st.borrow().error.clone()
    }

    pub fn run(&self, mut task: impl FnMut()) {
        self.st.borrow_mut().step();
        let mut iterations = 0u32;
        while !self.idle() {
            task();
            iterations += 1;
            assert!(
                iterations < 2_000_000,
                "script did not complete: {:?}",
                self.error()
            );
            if let Some(err) = self.error() {
                panic!("host error: {err}");
            }
        }
    }
}

pub struct SimGpibPort {
    st: Rc<RefCell<State>>,
}

impl GpibPort for SimGpibPort {
    fn read_atn(&self) -> bool {
        let mut st = self.st.borrow_mut();
        st.tick();
        st.atn()
    }
    fn read_dav(&self) -> bool {
        let mut st = self.st.borrow_mut();
        st.tick();
        st.dav()
    }
    fn read_nrfd(&self) -> bool {
        let mut st = self.st.borrow_mut();
        st.tick();
        st.nrfd()
    }
    fn read_ndac(&self) -> bool {
        let mut st = self.st.borrow_mut();
        st.tick();
        st.ndac()
    }
    fn read_eoi(&self) -> bool {
        let mut st = self.st.borrow_mut();
        st.tick();
        st.eoi()
    }
    fn read_reset(&self) -> bool {
        let mut st = self.st.borrow_mut();
        st.tick();
        !st.reset_h
    }

    fn write_dav(&mut self, level: bool) {
        let mut st = self.st.borrow_mut();
        st.dav_d = !level;
        st.step();
    }
    fn write_nrfd(&mut self, level: bool) {
        let mut st = self.st.borrow_mut();
        st.nrfd_d = !level;
        st.step();
    }
    fn write_ndac(&mut self, level: bool) {
        let mut st = self.st.borrow_mut();
        st.ndac_d = !level;
        st.step();
    }
    fn write_eoi(&mut self, level: bool) {
        let mut st = self.st.borrow_mut();
        st.eoi_d = !level;
        st.step();
    }

    fn data_input(&mut self) {
        self.st.borrow_mut().device_outputs = false;
    }
    fn data_output(&mut self) {
        self.st.borrow_mut().device_outputs = true;
    }
    fn read_data(&self) -> u8 {
        let mut st = self.st.borrow_mut();
        st.tick();
        st.host_data
    }
    fn write_data(&mut self, data: u8) {
        let mut st = self.st.borrow_mut();
        st.device_data = data;
        st.step();
    }

    fn atn_edge_latched(&mut self) -> bool {
        let mut st = self.st.borrow_mut();
        let latched = st.atn_latch;
        st.atn_latch = false;
        latched
    }
    fn has_atn_latch(&self) -> bool {
        true
    }

    fn pulse_srq(&mut self) {
        self.st.borrow_mut().srq_pulses += 1;
    }
}

pub struct SimGpibPlatform {
    st: Rc<RefCell<State>>,
}

impl Platform for SimGpibPlatform {
    fn micros(&self) -> u32 {
        let mut st = self.st.borrow_mut();
        st.tick();
        #[allow(clippy::cast_possible_truncation)]
        {
            st.time as u32
        }
    }

    fn interrupts_off(&self) {}
    fn interrupts_on(&self) {}

    fn watchdog_budget(&self) -> Option<Duration> {
        None
    }
}
