//! End-to-end scenarios for the three-wire handler, driven by the scripted
//! host simulation.

mod common;

use common::{atn, atn_turnaround, pump, recv, send, setup};
use ferriec::device::Device;
use ferriec::filedev::FileDevice;
use ferriec::iec::IecBus;
use ferriec_testing::{HostOp, IecSim, LoopbackFs};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn simple_load() {
    let (sim, fs, mut bus) = setup();
    fs.add_file(b"0:TEST", b"\x01\x08HELLO");

    let mut script = atn(&[0x28, 0xF0]);
    script.extend(send(b"0:TEST"));
    script.extend(atn(&[0x3F]));
    script.extend(atn_turnaround(&[0x48, 0x60]));
    script.extend(recv(7));
    script.extend(atn(&[0x5F]));

    sim.script(script);
    sim.run(|| bus.task());

    let got = sim.received();
    assert_eq!(sim.received_bytes(), b"\x01\x08HELLO");
    // EOI on exactly the last byte
    for (i, &(_, eoi)) in got.iter().enumerate() {
        assert_eq!(eoi, i == got.len() - 1, "EOI at byte {i}");
    }
}

#[test]
fn status_query_returns_version_then_ok() {
    let (sim, _fs, mut bus) = setup();

    let version = b"73,FERRIEC DOS V1.0,00,00\r";
    let mut script = atn_turnaround(&[0x48, 0x6F]);
    script.extend(recv(version.len()));
    script.extend(atn(&[0x5F]));
    sim.script(script);
    sim.run(|| bus.task());

    assert_eq!(sim.received_bytes(), version);
    assert!(sim.received().last().is_some_and(|&(_, eoi)| eoi));

    // a second query reads the reset status
    sim.clear_received();
    let ok_line = b"00, OK,00,00\r";
    let mut script = atn_turnaround(&[0x48, 0x6F]);
    script.extend(recv(ok_line.len()));
    script.extend(atn(&[0x5F]));
    sim.script(script);
    sim.run(|| bus.task());

    assert_eq!(sim.received_bytes(), ok_line);
}

#[test]
fn save_then_load_roundtrip() {
    let (sim, fs, mut bus) = setup();
    // include bytes with the high bit set
    let data: Vec<u8> = vec![0x00, 0x41, 0x80, 0xFF, 0x0D, 0x7F];

    // SAVE: open channel 1, write, close
    let mut script = atn(&[0x28, 0xF1]);
    script.extend(send(b"NOTES"));
    script.extend(atn(&[0x3F]));
    script.extend(atn(&[0x28, 0x61]));
    script.extend(send(&data));
    script.extend(atn(&[0x3F]));
    script.extend(atn(&[0x28, 0xE1]));
    script.extend(atn(&[0x3F]));
    sim.script(script);
    sim.run(|| bus.task());
    pump(&mut bus, 2);

    assert_eq!(fs.file(b"NOTES").as_deref(), Some(data.as_slice()));

    // LOAD it back on channel 0
    let mut script = atn(&[0x28, 0xF0]);
    script.extend(send(b"NOTES"));
    script.extend(atn(&[0x3F]));
    script.extend(atn_turnaround(&[0x48, 0x60]));
    script.extend(recv(data.len()));
    script.extend(atn(&[0x5F]));
    sim.script(script);
    sim.run(|| bus.task());

    assert_eq!(sim.received_bytes(), data);
}

#[test]
fn open_of_missing_file_reports_file_not_found() {
    let (sim, _fs, mut bus) = setup();

    let mut script = atn(&[0x28, 0xF0]);
    script.extend(send(b"NOSUCH"));
    script.extend(atn(&[0x3F]));
    sim.script(script);
    sim.run(|| bus.task());
    pump(&mut bus, 2);

    let line = b"62,FILE NOT FOUND,00,00\r";
    let mut script = atn_turnaround(&[0x48, 0x6F]);
    script.extend(recv(line.len()));
    script.extend(atn(&[0x5F]));
    sim.script(script);
    sim.run(|| bus.task());

    assert_eq!(sim.received_bytes(), line);
}

#[test]
fn atn_mid_byte_aborts_and_byte_is_resent() {
    let (sim, fs, mut bus) = setup();
    fs.add_file(b"A", b"XYZ");

    let mut script = atn(&[0x28, 0xF0]);
    script.extend(send(b"A"));
    script.extend(atn(&[0x3F]));
    script.extend(atn_turnaround(&[0x48, 0x60]));
    // abort the first byte after three bits, then untalk cleanly
    script.push(HostOp::RecvAbortAtn { bits: 3 });
    script.push(HostOp::AtnByte {
        byte: 0x5F,
        jiffy_probe: false,
    });
    script.push(HostOp::ReleaseAtn);
    // re-address: the aborted byte must come again
    script.extend(atn_turnaround(&[0x48, 0x60]));
    script.extend(recv(3));
    script.extend(atn(&[0x5F]));
    sim.script(script);
    sim.run(|| bus.task());

    assert_eq!(sim.received_bytes(), b"XYZ");
}

#[test]
fn two_devices_share_the_bus() {
    let (sim, _fs8, mut bus) = setup();
    let fs9 = LoopbackFs::new();
    fs9.add_file(b"NINE", b"9!");
    assert!(bus.attach(9, Box::new(FileDevice::new(fs9.clone()))).is_ok());

    // address device 9; device 8 must stay quiet and keep following ATN
    let mut script = atn(&[0x29, 0xF0]);
    script.extend(send(b"NINE"));
    script.extend(atn(&[0x3F]));
    script.extend(atn_turnaround(&[0x49, 0x60]));
    script.extend(recv(2));
    script.extend(atn(&[0x5F]));
    sim.script(script);
    sim.run(|| bus.task());
    assert_eq!(sim.received_bytes(), b"9!");

    // device 8 still answers the next ATN sequence
    sim.clear_received();
    let line = b"73,FERRIEC DOS V1.0,00,00\r";
    let mut script = atn_turnaround(&[0x48, 0x6F]);
    script.extend(recv(line.len()));
    script.extend(atn(&[0x5F]));
    sim.script(script);
    sim.run(|| bus.task());
    assert_eq!(sim.received_bytes(), line);
}

#[test]
fn unattached_device_number_reports_not_present() {
    let (sim, _fs, mut bus) = setup();

    sim.script(atn(&[0x4A, 0x60]));
    let mut iterations = 0u32;
    while !sim.idle() && sim.error().is_none() {
        bus.task();
        iterations += 1;
        assert!(iterations < 2_000_000);
    }
    let err = sim.error().expect("host must time out");
    assert!(err.contains("device not present"), "{err}");
}

#[test]
fn reset_line_clears_device_state() {
    let (sim, fs, mut bus) = setup();
    fs.add_file(b"R", b"DATA");

    // open a read channel
    let mut script = atn(&[0x28, 0xF2]);
    script.extend(send(b"R"));
    script.extend(atn(&[0x3F]));
    sim.script(script);
    sim.run(|| bus.task());
    pump(&mut bus, 2);
    assert_eq!(fs.open_channels(), 1);

    sim.script([
        HostOp::AssertReset,
        HostOp::DelayUs(20),
        HostOp::ReleaseReset,
    ]);
    sim.run(|| bus.task());
    pump(&mut bus, 2);

    assert_eq!(fs.resets(), 1);
    assert_eq!(fs.open_channels(), 0);
}

#[test]
fn attach_detach_is_a_noop() {
    let (sim, _fs, mut bus) = setup();

    let fs9 = LoopbackFs::new();
    assert!(bus.attach(9, Box::new(FileDevice::new(fs9))).is_ok());
    assert!(bus.detach(9).is_some());

    // device 8 is unaffected
    let line = b"73,FERRIEC DOS V1.0,00,00\r";
    let mut script = atn_turnaround(&[0x48, 0x6F]);
    script.extend(recv(line.len()));
    script.extend(atn(&[0x5F]));
    sim.script(script);
    sim.run(|| bus.task());
    assert_eq!(sim.received_bytes(), line);

    // and the number can be reused
    let fs9 = LoopbackFs::new();
    assert!(bus.attach(9, Box::new(FileDevice::new(fs9))).is_ok());
}

/// Sink that is "not ready" for a while before accepting; the bus must hold
/// DATA low and the host must simply wait.
struct SlowSink {
    not_ready_polls: i32,
    got: Rc<RefCell<Vec<(u8, bool)>>>,
}

impl Device for SlowSink {
    fn can_write(&mut self) -> i8 {
        if self.not_ready_polls > 0 {
            self.not_ready_polls -= 1;
            -1
        } else {
            1
        }
    }

    fn write(&mut self, data: u8, eoi: bool) {
        self.got.borrow_mut().push((data, eoi));
    }
}

#[test]
fn negative_can_write_stalls_the_host_without_error() {
    let sim = IecSim::new();
    let got = Rc::new(RefCell::new(Vec::new()));
    let mut bus = IecBus::new(sim.port(), sim.platform(), sim.cable());
    assert!(bus
        .attach(4, Box::new(SlowSink {
            not_ready_polls: 50,
            got: Rc::clone(&got),
        }))
        .is_ok());
    bus.begin();

    let mut script = atn(&[0x24, 0x62]);
    script.push(HostOp::Send {
        byte: 0xA5,
        eoi: true,
    });
    script.extend(atn(&[0x3F]));
    sim.script(script);
    sim.run(|| bus.task());

    assert_eq!(got.borrow().as_slice(), &[(0xA5, true)]);
}
