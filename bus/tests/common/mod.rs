//! Shared scaffolding for the bus integration suites.

#![allow(dead_code)]

use ferriec::filedev::FileDevice;
use ferriec::iec::IecBus;
use ferriec_testing::iec_host::{SimCable, SimPlatform, SimSerialPort};
use ferriec_testing::{HostOp, IecSim, LoopbackFs};

pub type SimBus = IecBus<SimSerialPort, SimPlatform, SimCable>;

/// One bus with a loopback file device at number 8.
pub fn setup_with(sim: IecSim) -> (IecSim, LoopbackFs, SimBus) {
    let fs = LoopbackFs::new();
    let mut bus = IecBus::new(sim.port(), sim.platform(), sim.cable());
    assert!(bus.attach(8, Box::new(FileDevice::new(fs.clone()))).is_ok());
    bus.begin();
    (sim, fs, bus)
}

pub fn setup() -> (IecSim, LoopbackFs, SimBus) {
    setup_with(IecSim::new())
}

pub fn pump(bus: &mut SimBus, n: usize) {
    for _ in 0..n {
        bus.task();
    }
}

fn atn_byte(byte: u8) -> HostOp {
    HostOp::AtnByte {
        byte,
        jiffy_probe: false,
    }
}

/// ATN sequence that leaves the host as sender.
pub fn atn(bytes: &[u8]) -> Vec<HostOp> {
    let mut ops = vec![HostOp::AssertAtn];
    ops.extend(bytes.iter().copied().map(atn_byte));
    ops.push(HostOp::ReleaseAtn);
    ops
}

/// ATN sequence ending in a bus turn-around (TALK addressing).
pub fn atn_turnaround(bytes: &[u8]) -> Vec<HostOp> {
    let mut ops = vec![HostOp::AssertAtn];
    ops.extend(bytes.iter().copied().map(atn_byte));
    ops.push(HostOp::ReleaseAtnTurnaround);
    ops
}

/// Send a run of data bytes, EOI on the last.
pub fn send(data: &[u8]) -> Vec<HostOp> {
    let last = data.len() - 1;
    data.iter()
        .enumerate()
        .map(|(i, &byte)| HostOp::Send { byte, eoi: i == last })
        .collect()
}

pub fn recv(n: usize) -> Vec<HostOp> {
    vec![HostOp::Recv; n]
}

/// The full script for sending one command to the command channel of
/// device 8.
pub fn command_script(cmd: &[u8]) -> Vec<HostOp> {
    let mut ops = atn(&[0x28, 0x6F]);
    ops.extend(send(cmd));
    ops.extend(atn(&[0x3F]));
    ops
}

/// Run a command-channel transmission and let the queued EXEC happen.
pub fn run_command(sim: &IecSim, bus: &mut SimBus, cmd: &[u8]) {
    sim.script(command_script(cmd));
    sim.run(|| bus.task());
    pump(bus, 2);
}

/// An `M-W` command whose payload is zeros plus a final checksum-fixing
/// byte, matching signature `(addr, len, checksum)`.
pub fn mw(addr: u16, len: u8, checksum: u8) -> Vec<u8> {
    let mut cmd = b"M-W".to_vec();
    cmd.push((addr & 0xFF) as u8);
    cmd.push((addr >> 8) as u8);
    cmd.push(len);
    let mut payload = vec![0u8; len as usize];
    payload[len as usize - 1] = checksum;
    cmd.extend(payload);
    cmd
}

pub fn me(addr: u16) -> Vec<u8> {
    let mut cmd = b"M-E".to_vec();
    cmd.push((addr & 0xFF) as u8);
    cmd.push((addr >> 8) as u8);
    cmd
}
