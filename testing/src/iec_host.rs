//! Scripted IEC host (the "Commodore" side of the wire).
//!
//! The host is a state machine advanced once per simulated microsecond;
//! time moves only when the device under test polls its clock or pins.
//! Scripts are queues of [`HostOp`]s covering the KERNAL-side protocol:
//! ATN sequences, byte transfers with EOI, turn-around, mid-byte aborts,
//! and the JiffyDOS bit-pair cadence.

use core::time::Duration;
use ferriec_shared::platform::Platform;
use ferriec_shared::port::{ParallelPort, SerialPort};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Dwell time per standard-protocol bit phase.
const BIT_DWELL: u64 = 20;

/// Hard cap on simulated time; reaching it means a wait loop deadlocked.
const TIME_CAP: u64 = 60_000_000;

/// A recorded device-side line transition.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub at: u64,
    pub clk: bool,
    pub data: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum HostOp {
    /// Assert ATN (and CLK) and wait for a device to pull DATA low.
    AssertAtn,
    /// Transmit one byte under ATN. With `jiffy_probe`, stall before the
    /// final bit to offer the JiffyDOS handshake.
    AtnByte { byte: u8, jiffy_probe: bool },
    /// Release ATN, staying the sender (after LISTEN addressing).
    ReleaseAtn,
    /// Release ATN and turn the bus around to receive (after TALK).
    ReleaseAtnTurnaround,
    /// Transmit one data byte.
    Send { byte: u8, eoi: bool },
    /// Start transmitting a byte but assert ATN after `bits` bits.
    SendAbortAtn { byte: u8, bits: u8 },
    /// Receive one data byte (records byte + EOI).
    Recv,
    /// Start receiving a byte but assert ATN after `bits` valid bits.
    RecvAbortAtn { bits: u8 },
    /// Transmit one byte with the JiffyDOS cadence.
    JiffySend { byte: u8, eoi: bool },
    /// Receive one byte with the JiffyDOS cadence.
    JiffyRecv,
    DelayUs(u64),
    AssertReset,
    ReleaseReset,
}

#[derive(Clone, Copy)]
enum Phase {
    Idle,
    Delay {
        until: u64,
    },
    AtnPresence {
        deadline: u64,
    },
    TxWaitReady {
        ctx: TxCtx,
    },
    TxEoiAckLow {
        ctx: TxCtx,
        deadline: u64,
    },
    TxEoiAckHigh {
        ctx: TxCtx,
    },
    TxJiffyProbe {
        ctx: TxCtx,
        until: u64,
    },
    TxBitSetup {
        ctx: TxCtx,
        bit: u8,
        until: u64,
    },
    TxBitValid {
        ctx: TxCtx,
        bit: u8,
        until: u64,
    },
    TxFrameAck {
        under_atn: bool,
        deadline: u64,
    },
    RxWaitDevReady,
    RxWaitFirstClk {
        deadline: u64,
        eoi: bool,
    },
    RxEoiPulse {
        until: u64,
    },
    RxWaitClkNoTimeout {
        eoi: bool,
    },
    RxBitWaitValid {
        bit: u8,
        acc: u8,
        eoi: bool,
    },
    RxBitWaitInvalid {
        bit: u8,
        acc: u8,
        eoi: bool,
    },
    RxAbortWaitDevReady {
        target: u8,
    },
    RxAbortWaitFirstClk {
        target: u8,
    },
    RxAbortCount {
        target: u8,
        seen: u8,
        prev_clk: bool,
    },
    JTxWaitDevReady {
        byte: u8,
        eoi: bool,
    },
    JTxPairs {
        byte: u8,
        eoi: bool,
        t0: u64,
        step: u8,
    },
    JRxWaitDevReady,
    JRxSample {
        t0: u64,
        step: u8,
        acc: u8,
        eoi: bool,
    },
}

#[derive(Debug, Clone, Copy)]
struct TxCtx {
    byte: u8,
    eoi: bool,
    under_atn: bool,
    jiffy_probe: bool,
    abort_after_bits: Option<u8>,
}

struct State {
    time: u64,

    // true = the side is pulling the line low
    atn_h: bool,
    clk_h: bool,
    data_h: bool,
    reset_h: bool,
    clk_d: bool,
    data_d: bool,

    atn_latch: bool,
    has_ctrl: bool,
    ctrl_gate: bool,
    has_latch: bool,
    srq_pulses: u32,

    ops: VecDeque<HostOp>,
    phase: Phase,
    received: Vec<(u8, bool)>,
    jiffy_ack_seen: bool,
    error: Option<String>,

    edges: Vec<Edge>,

    // parallel cable
    cable_present: bool,
    cable_data: u8,
    dev_handshake_latch: bool,
    host_handshake_count: u32,
}

impl State {
    // line levels as seen on the (wired-OR, active-low) bus
    fn atn(&self) -> bool {
        !self.atn_h
    }
    fn clk(&self) -> bool {
        !(self.clk_h || self.clk_d)
    }
    fn data(&self) -> bool {
        // the optional hardware gate pulls DATA low while ATN is asserted
        let gate = self.has_ctrl && self.ctrl_gate && self.atn_h;
        !(self.data_h || self.data_d || gate)
    }

    fn bit(byte: u8, i: u8) -> bool {
        byte & (1 << i) != 0
    }

    fn fail(&mut self, msg: &str) {
        if self.error.is_none() {
            self.error = Some(format!("t={}: {}", self.time, msg));
        }
        // release everything so the device side can settle
        self.atn_h = false;
        self.clk_h = false;
        self.data_h = false;
        self.phase = Phase::Idle;
        self.ops.clear();
    }

    fn record_edge(&mut self, before: (bool, bool)) {
        let now = (self.clk(), self.data());
        if now != before {
            self.edges.push(Edge {
                at: self.time,
                clk: now.0,
                data: now.1,
            });
        }
    }

    fn tick(&mut self) {
        self.time += 1;
        assert!(self.time < TIME_CAP, "simulation stalled (host: {:?})", self.error);
        self.step();
    }

    fn begin_tx_bit(&mut self, ctx: TxCtx, bit: u8) {
        if let Some(n) = ctx.abort_after_bits {
            if bit == n {
                // host aborts the byte: ATN falls, CLK stays asserted
                self.atn_h = true;
                self.atn_latch = true;
                self.clk_h = true;
                self.data_h = false;
                self.phase = Phase::Idle;
                return;
            }
        }
        if bit == 7 && ctx.jiffy_probe {
            // stall with CLK asserted and DATA released; a JiffyDOS-capable
            // device answers with an 80us DATA pulse
            self.clk_h = true;
            self.data_h = false;
            self.phase = Phase::TxJiffyProbe {
                ctx,
                until: self.time + 400,
            };
        } else {
            self.clk_h = true;
            // drive DATA low for a zero bit
            self.data_h = !Self::bit(ctx.byte, bit);
            self.phase = Phase::TxBitSetup {
                ctx,
                bit,
                until: self.time + BIT_DWELL,
            };
        }
    }

    fn start_op(&mut self) {
        let Some(op) = self.ops.pop_front() else {
            self.phase = Phase::Idle;
            return;
        };
        match op {
            HostOp::AssertAtn => {
                self.atn_h = true;
                self.clk_h = true;
                self.atn_latch = true;
                self.phase = Phase::AtnPresence {
                    deadline: self.time + 1000,
                };
            }
            HostOp::AtnByte { byte, jiffy_probe } => {
                let ctx = TxCtx {
                    byte,
                    eoi: false,
                    under_atn: true,
                    jiffy_probe,
                    abort_after_bits: None,
                };
                // ready-to-send
                self.clk_h = false;
                self.data_h = false;
                self.phase = Phase::TxWaitReady { ctx };
            }
            HostOp::ReleaseAtn => {
                self.atn_h = false;
                self.phase = Phase::Idle;
            }
            HostOp::ReleaseAtnTurnaround => {
                self.atn_h = false;
                self.clk_h = false;
                self.data_h = true;
                self.phase = Phase::Idle;
            }
            HostOp::Send { byte, eoi } => {
                let ctx = TxCtx {
                    byte,
                    eoi,
                    under_atn: false,
                    jiffy_probe: false,
                    abort_after_bits: None,
                };
                self.clk_h = false;
                self.data_h = false;
                self.phase = Phase::TxWaitReady { ctx };
            }
            HostOp::SendAbortAtn { byte, bits } => {
                let ctx = TxCtx {
                    byte,
                    eoi: false,
                    under_atn: false,
                    jiffy_probe: false,
                    abort_after_bits: Some(bits),
                };
                self.clk_h = false;
                self.data_h = false;
                self.phase = Phase::TxWaitReady { ctx };
            }
            HostOp::Recv => {
                self.phase = Phase::RxWaitDevReady;
            }
            HostOp::RecvAbortAtn { bits } => {
                self.phase = Phase::RxAbortWaitDevReady { target: bits };
            }
            HostOp::JiffySend { byte, eoi } => {
                self.phase = Phase::JTxWaitDevReady { byte, eoi };
            }
            HostOp::JiffyRecv => {
                self.phase = Phase::JRxWaitDevReady;
            }
            HostOp::DelayUs(us) => {
                self.phase = Phase::Delay {
                    until: self.time + us,
                };
            }
            HostOp::AssertReset => {
                self.reset_h = true;
                self.phase = Phase::Idle;
            }
            HostOp::ReleaseReset => {
                self.reset_h = false;
                self.phase = Phase::Idle;
            }
        }
    }

    #[allow(clippy::too_many_lines)]
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
                if !self.data() {
                    self.phase = Phase::Idle;
                } else if self.time >= deadline {
                    self.fail("device not present (no DATA ack on ATN)");
                }
            }

            Phase::TxWaitReady { ctx } => {
                if self.data() {
                    if ctx.eoi {
                        self.phase = Phase::TxEoiAckLow {
                            ctx,
                            deadline: self.time + 100_000,
                        };
                    } else {
                        self.begin_tx_bit(ctx, 0);
                    }
                }
            }

            Phase::TxEoiAckLow { ctx, deadline } => {
                if !self.data() {
                    self.phase = Phase::TxEoiAckHigh { ctx };
                } else if self.time >= deadline {
                    self.fail("no EOI acknowledge pulse");
                }
            }

            Phase::TxEoiAckHigh { ctx } => {
                if self.data() {
                    self.begin_tx_bit(ctx, 0);
                }
            }

            Phase::TxJiffyProbe { ctx, until } => {
                if !self.data() {
                    self.jiffy_ack_seen = true;
                }
                if self.time >= until {
                    self.clk_h = true;
                    self.data_h = !Self::bit(ctx.byte, 7);
                    self.phase = Phase::TxBitSetup {
                        ctx,
                        bit: 7,
                        until: self.time + BIT_DWELL,
                    };
                }
            }

            Phase::TxBitSetup { ctx, bit, until } => {
                if self.time >= until {
                    self.clk_h = false;
                    self.phase = Phase::TxBitValid {
                        ctx,
                        bit,
                        until: self.time + BIT_DWELL,
                    };
                }
            }

            Phase::TxBitValid { ctx, bit, until } => {
                if self.time >= until {
                    if bit < 7 {
                        self.begin_tx_bit(ctx, bit + 1);
                    } else {
                        self.clk_h = true;
                        self.data_h = false;
                        self.phase = Phase::TxFrameAck {
                            under_atn: ctx.under_atn,
                            deadline: self.time + 1000,
                        };
                    }
                }
            }

            Phase::TxFrameAck {
                under_atn,
                deadline,
            } => {
                if !self.data() {
                    self.phase = Phase::Idle;
                } else if self.time >= deadline {
                    if under_atn {
                        self.fail("device not present (no byte acknowledge under ATN)");
                    } else {
                        self.fail("no byte acknowledge");
                    }
                }
            }

            Phase::RxWaitDevReady => {
                if self.clk() {
                    // ready-for-data
                    self.data_h = false;
                    self.phase = Phase::RxWaitFirstClk {
                        deadline: self.time + 200,
                        eoi: false,
                    };
                }
            }

            Phase::RxWaitFirstClk { deadline, eoi } => {
                if !self.clk() {
                    self.phase = Phase::RxBitWaitValid { bit: 0, acc: 0, eoi };
                } else if self.time >= deadline {
                    // talker is signalling EOI: acknowledge with a DATA pulse
                    self.data_h = true;
                    self.phase = Phase::RxEoiPulse {
                        until: self.time + 60,
                    };
                }
            }

            Phase::RxEoiPulse { until } => {
                if self.time >= until {
                    self.data_h = false;
                    self.phase = Phase::RxWaitClkNoTimeout { eoi: true };
                }
            }

            Phase::RxWaitClkNoTimeout { eoi } => {
                if !self.clk() {
                    self.phase = Phase::RxBitWaitValid { bit: 0, acc: 0, eoi };
                }
            }

            Phase::RxBitWaitValid { bit, acc, eoi } => {
                if self.clk() {
                    let mut acc = acc;
                    if self.data() {
                        acc |= 1 << bit;
                    }
                    self.phase = Phase::RxBitWaitInvalid { bit, acc, eoi };
                }
            }

            Phase::RxBitWaitInvalid { bit, acc, eoi } => {
                if !self.clk() {
                    if bit < 7 {
                        self.phase = Phase::RxBitWaitValid {
                            bit: bit + 1,
                            acc,
                            eoi,
                        };
                    } else {
                        // busy-ack
                        self.data_h = true;
                        self.received.push((acc, eoi));
                        self.phase = Phase::Idle;
                    }
                }
            }

            Phase::RxAbortWaitDevReady { target } => {
                if self.clk() {
                    self.data_h = false;
                    self.phase = Phase::RxAbortWaitFirstClk { target };
                }
            }

            Phase::RxAbortWaitFirstClk { target } => {
                if !self.clk() {
                    self.phase = Phase::RxAbortCount {
                        target,
                        seen: 0,
                        prev_clk: false,
                    };
                }
            }

            Phase::RxAbortCount {
                target,
                seen,
                prev_clk,
            } => {
                let clk = self.clk();
                let mut seen = seen;
                if clk && !prev_clk {
                    seen += 1;
                    if seen >= target {
                        // mid-byte abort: host takes the bus for addressing
                        self.atn_h = true;
                        self.clk_h = true;
                        self.data_h = false;
                        self.atn_latch = true;
                        self.phase = Phase::Idle;
                        return;
                    }
                }
                self.phase = Phase::RxAbortCount {
                    target,
                    seen,
                    prev_clk: clk,
                };
            }

            Phase::JTxWaitDevReady { byte, eoi } => {
                if self.data() {
                    // ready-to-send; the bit-pair schedule runs from here
                    self.clk_h = false;
                    self.phase = Phase::JTxPairs {
                        byte,
                        eoi,
                        t0: self.time,
                        step: 0,
                    };
                }
            }

            Phase::JTxPairs {
                byte,
                eoi,
                t0,
                step,
            } => {
                let dt = self.time - t0;
                // drive a pair: line low = bit set (receiver inverts)
                let mut next = step;
                match step {
                    0 if dt >= 11 => {
                        self.clk_h = Self::bit(byte, 4);
                        self.data_h = Self::bit(byte, 5);
                        next = 1;
                    }
                    1 if dt >= 24 => {
                        self.clk_h = Self::bit(byte, 6);
                        self.data_h = Self::bit(byte, 7);
                        next = 2;
                    }
                    2 if dt >= 35 => {
                        self.clk_h = Self::bit(byte, 3);
                        self.data_h = Self::bit(byte, 1);
                        next = 3;
                    }
                    3 if dt >= 48 => {
                        self.clk_h = Self::bit(byte, 2);
                        self.data_h = Self::bit(byte, 0);
                        next = 4;
                    }
                    4 if dt >= 61 => {
                        // CLK released here means EOI
                        self.clk_h = !eoi;
                        self.data_h = false;
                        next = 5;
                    }
                    5 => {
                        if !self.data() {
                            // receipt acknowledged
                            next = 6;
                        } else if dt > 1000 {
                            self.fail("no JiffyDOS receive acknowledge");
                            return;
                        }
                    }
                    6 if dt >= 85 => {
                        // busy until the next byte
                        self.clk_h = true;
                        self.phase = Phase::Idle;
                        return;
                    }
                    _ => {}
                }
                if next != step {
                    self.phase = Phase::JTxPairs {
                        byte,
                        eoi,
                        t0,
                        step: next,
                    };
                }
            }

            Phase::JRxWaitDevReady => {
                if self.clk() {
                    // ready-to-receive
                    self.data_h = false;
                    self.phase = Phase::JRxSample {
                        t0: self.time,
                        step: 0,
                        acc: 0,
                        eoi: false,
                    };
                }
            }

            Phase::JRxSample { t0, step, acc, eoi } => {
                let dt = self.time - t0;
                let mut acc = acc;
                let mut eoi = eoi;
                let mut next = step;
                match step {
                    // sample points sit between the device's write points
                    0 if dt >= 15 => {
                        if self.clk() {
                            acc |= 1 << 0;
                        }
                        if self.data() {
                            acc |= 1 << 1;
                        }
                        next = 1;
                    }
                    1 if dt >= 26 => {
                        if self.clk() {
                            acc |= 1 << 2;
                        }
                        if self.data() {
                            acc |= 1 << 3;
                        }
                        next = 2;
                    }
                    2 if dt >= 37 => {
                        if self.clk() {
                            acc |= 1 << 4;
                        }
                        if self.data() {
                            acc |= 1 << 5;
                        }
                        next = 3;
                    }
                    3 if dt >= 48 => {
                        if self.clk() {
                            acc |= 1 << 6;
                        }
                        if self.data() {
                            acc |= 1 << 7;
                        }
                        next = 4;
                    }
                    4 if dt >= 58 => {
                        // status: CLK high + DATA low = EOI, both high = error
                        if self.clk() && !self.data() {
                            eoi = true;
                        } else if self.clk() && self.data() {
                            self.fail("JiffyDOS talker reported an error");
                            return;
                        }
                        next = 5;
                    }
                    5 if dt >= 62 => {
                        // done/busy ack
                        self.data_h = true;
                        self.received.push((acc, eoi));
                        self.phase = Phase::Idle;
                        return;
                    }
                    _ => {}
                }
                self.phase = Phase::JRxSample {
                    t0,
                    step: next,
                    acc,
                    eoi,
                };
            }
        }
    }
}

/// Handle to one simulated IEC bus plus its scripted host.
#[derive(Clone)]
pub struct IecSim {
    st: Rc<RefCell<State>>,
}

impl Default for IecSim {
    fn default() -> Self {
        Self::new()
    }
}

impl IecSim {
    pub fn new() -> Self {
        IecSim {
            st: Rc::new(RefCell::new(State {
                time: 0,
                atn_h: false,
                clk_h: false,
                data_h: false,
                reset_h: false,
                clk_d: false,
                data_d: false,
                atn_latch: false,
                has_ctrl: false,
                ctrl_gate: true,
                has_latch: true,
                srq_pulses: 0,
                ops: VecDeque::new(),
                phase: Phase::Idle,
                received: Vec::new(),
                jiffy_ack_seen: false,
                error: None,
                edges: Vec::new(),
                cable_present: false,
                cable_data: 0xFF,
                dev_handshake_latch: false,
                host_handshake_count: 0,
            })),
        }
    }

    /// Model the optional hardware gate that holds DATA low under ATN.
    pub fn with_ctrl(self) -> Self {
        self.st.borrow_mut().has_ctrl = true;
        self
    }

    /// Attach a parallel fast-loader cable.
    pub fn with_cable(self) -> Self {
        self.st.borrow_mut().cable_present = true;
        self
    }

    pub fn port(&self) -> SimSerialPort {
        SimSerialPort {
            st: Rc::clone(&self.st),
        }
    }

    pub fn platform(&self) -> SimPlatform {
        SimPlatform {
            st: Rc::clone(&self.st),
        }
    }

    pub fn cable(&self) -> SimCable {
        SimCable {
            st: Rc::clone(&self.st),
        }
    }

    pub fn push(&self, op: HostOp) {
        self.st.borrow_mut().ops.push_back(op);
    }

    pub fn script(&self, ops: impl IntoIterator<Item = HostOp>) {
        let mut st = self.st.borrow_mut();
        for op in ops {
            st.ops.push_back(op);
        }
    }

    /// All ops executed and the host automaton is at rest.
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

    pub fn clear_received(&self) {
        self.st.borrow_mut().received.clear();
    }

    pub fn error(&self) -> Option<String> {
        self.st.borrow().error.clone()
    }

    pub fn jiffy_ack_seen(&self) -> bool {
        self.st.borrow().jiffy_ack_seen
    }

    pub fn srq_pulses(&self) -> u32 {
        self.st.borrow().srq_pulses
    }

    pub fn time(&self) -> u64 {
        self.st.borrow().time
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.st.borrow().edges.clone()
    }

    pub fn clear_edges(&self) {
        self.st.borrow_mut().edges.clear();
    }

    /// Latch a cable handshake pulse towards the device.
    pub fn cable_pulse_to_device(&self) {
        self.st.borrow_mut().dev_handshake_latch = true;
    }

    pub fn cable_pulses_from_device(&self) -> u32 {
        self.st.borrow().host_handshake_count
    }

    /// Drive the whole script to completion, calling `task` (one bus
    /// iteration) in between. Panics on a host-side protocol failure.
    pub fn run(&self, mut task: impl FnMut()) {
        // prime the host so the first op starts
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

/// Device-side serial port of the simulated bus.
pub struct SimSerialPort {
    st: Rc<RefCell<State>>,
}

impl SerialPort for SimSerialPort {
    fn read_atn(&self) -> bool {
        let mut st = self.st.borrow_mut();
        st.tick();
        st.atn()
    }

    fn read_clk(&self) -> bool {
        let mut st = self.st.borrow_mut();
        st.tick();
        st.clk()
    }

    fn read_data(&self) -> bool {
        let mut st = self.st.borrow_mut();
        st.tick();
        st.data()
    }

    fn read_reset(&self) -> bool {
        let mut st = self.st.borrow_mut();
        st.tick();
        !st.reset_h
    }

    fn write_clk(&mut self, level: bool) {
        let mut st = self.st.borrow_mut();
        let before = (st.clk(), st.data());
        st.clk_d = !level;
        st.record_edge(before);
        st.step();
    }

    fn write_data(&mut self, level: bool) {
        let mut st = self.st.borrow_mut();
        let before = (st.clk(), st.data());
        st.data_d = !level;
        st.record_edge(before);
        st.step();
    }

    fn write_ctrl(&mut self, level: bool) {
        // asserted (low) enables the gate
        let mut st = self.st.borrow_mut();
        st.ctrl_gate = !level;
        st.step();
    }

    fn has_ctrl(&self) -> bool {
        self.st.borrow().has_ctrl
    }

    fn atn_edge_latched(&mut self) -> bool {
        let mut st = self.st.borrow_mut();
        let latched = st.atn_latch;
        st.atn_latch = false;
        latched
    }

    fn has_atn_latch(&self) -> bool {
        self.st.borrow().has_latch
    }

    fn pulse_srq(&mut self) {
        self.st.borrow_mut().srq_pulses += 1;
    }
}

/// Device-side platform: the microsecond counter advances on every poll.
pub struct SimPlatform {
    st: Rc<RefCell<State>>,
}

impl Platform for SimPlatform {
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

/// Device-side parallel cable.
pub struct SimCable {
    st: Rc<RefCell<State>>,
}

impl ParallelPort for SimCable {
    fn available(&self) -> bool {
        self.st.borrow().cable_present
    }

    fn set_input(&mut self) {}
    fn set_output(&mut self) {}

    fn read(&self) -> u8 {
        self.st.borrow().cable_data
    }

    fn write(&mut self, data: u8) {
        self.st.borrow_mut().cable_data = data;
    }

    fn handshake_pulse(&mut self) {
        self.st.borrow_mut().host_handshake_count += 1;
    }

    fn handshake_received(&mut self) -> bool {
        let mut st = self.st.borrow_mut();
        let latched = st.dev_handshake_latch;
        st.dev_handshake_latch = false;
        latched
    }
}
