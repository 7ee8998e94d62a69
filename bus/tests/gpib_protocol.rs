//! IEEE-488 handler scenarios: same channel semantics, parallel handshake.

use ferriec::filedev::FileDevice;
use ferriec::gpib::GpibBus;
use ferriec_testing::{GpibOp, GpibSim, LoopbackFs};

fn setup() -> (
    GpibSim,
    LoopbackFs,
    GpibBus<ferriec_testing::gpib_host::SimGpibPort, ferriec_testing::gpib_host::SimGpibPlatform>,
) {
    let sim = GpibSim::new();
    let fs = LoopbackFs::new();
    let mut bus = GpibBus::new(sim.port(), sim.platform());
    assert!(bus.attach(8, Box::new(FileDevice::new(fs.clone()))).is_ok());
    bus.begin();
    (sim, fs, bus)
}

fn atn(bytes: &[u8]) -> Vec<GpibOp> {
    let mut ops = vec![GpibOp::AssertAtn];
    ops.extend(bytes.iter().copied().map(GpibOp::AtnByte));
    ops.push(GpibOp::ReleaseAtn);
    ops
}

fn atn_turnaround(bytes: &[u8]) -> Vec<GpibOp> {
    let mut ops = vec![GpibOp::AssertAtn];
    ops.extend(bytes.iter().copied().map(GpibOp::AtnByte));
    ops.push(GpibOp::ReleaseAtnTurnaround);
    ops
}

fn send(data: &[u8]) -> Vec<GpibOp> {
    let last = data.len() - 1;
    data.iter()
        .enumerate()
        .map(|(i, &byte)| GpibOp::Send { byte, eoi: i == last })
        .collect()
}

#[test]
fn status_query() {
    let (sim, _fs, mut bus) = setup();

    let line = b"73,FERRIEC DOS V1.0,00,00\r";
    let mut script = atn_turnaround(&[0x48, 0x6F]);
    script.extend(vec![GpibOp::Recv; line.len()]);
    script.extend(atn(&[0x5F]));
    sim.script(script);
    sim.run(|| bus.task());

    assert_eq!(sim.received_bytes(), line);
    // EOI travels on its own line here
    assert!(sim.received().last().is_some_and(|&(_, eoi)| eoi));
}

#[test]
fn save_then_load_roundtrip() {
    let (sim, fs, mut bus) = setup();
    let data: Vec<u8> = vec![0x11, 0x00, 0xFE, 0x80, 0x42];

    let mut script = atn(&[0x28, 0xF1]);
    script.extend(send(b"PRG"));
    script.extend(atn(&[0x3F]));
    script.extend(atn(&[0x28, 0x61]));
    script.extend(send(&data));
    script.extend(atn(&[0x3F]));
    script.extend(atn(&[0x28, 0xE1]));
    script.extend(atn(&[0x3F]));
    sim.script(script);
    sim.run(|| bus.task());
    bus.task();
    bus.task();

    assert_eq!(fs.file(b"PRG").as_deref(), Some(data.as_slice()));

    let mut script = atn(&[0x28, 0xF0]);
    script.extend(send(b"PRG"));
    script.extend(atn(&[0x3F]));
    script.extend(atn_turnaround(&[0x48, 0x60]));
    script.extend(vec![GpibOp::Recv; data.len()]);
    script.extend(atn(&[0x5F]));
    sim.script(script);
    sim.run(|| bus.task());

    assert_eq!(sim.received_bytes(), data);
    let got = sim.received();
    for (i, &(_, eoi)) in got.iter().enumerate() {
        assert_eq!(eoi, i == got.len() - 1, "EOI at byte {i}");
    }
}

#[test]
fn unlisten_is_broadcast_to_all_devices() {
    let (sim, fs8, mut bus) = setup();
    let fs9 = LoopbackFs::new();
    assert!(bus.attach(9, Box::new(FileDevice::new(fs9.clone()))).is_ok());

    // a command for device 8; the UNLISTEN closing the transaction reaches
    // device 9 as well without disturbing it
    let mut script = atn(&[0x28, 0x6F]);
    script.extend(send(b"I0"));
    script.extend(atn(&[0x3F]));
    sim.script(script);
    sim.run(|| bus.task());
    bus.task();
    bus.task();

    assert_eq!(fs8.executed(), vec![b"I0".to_vec()]);
    assert!(fs9.executed().is_empty());
}

#[test]
fn reset_line_resets_devices() {
    let (sim, fs, mut bus) = setup();

    bus.task();
    sim.script([
        GpibOp::AssertReset,
        GpibOp::DelayUs(20),
        GpibOp::ReleaseReset,
    ]);
    sim.run(|| bus.task());
    bus.task();

    assert_eq!(fs.resets(), 1);
}
