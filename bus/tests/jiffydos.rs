//! JiffyDOS detection and bit-pair transfers.

mod common;

use common::{atn, pump, send, setup};
use ferriec::device::Loader;
use ferriec_testing::HostOp;

fn atn_probe(byte: u8) -> HostOp {
    HostOp::AtnByte {
        byte,
        jiffy_probe: true,
    }
}

fn atn_plain(byte: u8) -> HostOp {
    HostOp::AtnByte {
        byte,
        jiffy_probe: false,
    }
}

#[test]
fn detection_handshake_is_acknowledged() {
    let (sim, _fs, mut bus) = setup();
    assert!(bus.enable_loader(8, Loader::Jiffy, true));

    sim.script([
        HostOp::AssertAtn,
        atn_probe(0x48),
        atn_plain(0x6F),
        HostOp::ReleaseAtn,
        HostOp::AssertAtn,
        atn_plain(0x5F),
        HostOp::ReleaseAtn,
    ]);
    sim.run(|| bus.task());

    assert!(sim.jiffy_ack_seen(), "device must pulse DATA in the probe");
}

#[test]
fn detection_is_ignored_when_disabled() {
    let (sim, _fs, mut bus) = setup();

    sim.script([
        HostOp::AssertAtn,
        atn_probe(0x48),
        atn_plain(0x6F),
        HostOp::ReleaseAtn,
        HostOp::AssertAtn,
        atn_plain(0x5F),
        HostOp::ReleaseAtn,
    ]);
    sim.run(|| bus.task());

    assert!(!sim.jiffy_ack_seen());
}

#[test]
fn talk_uses_bit_pair_cadence_after_detection() {
    let (sim, fs, mut bus) = setup();
    assert!(bus.enable_loader(8, Loader::Jiffy, true));
    let data = b"\x00\x01\x55\xAA\xFFJIFFY";
    fs.add_file(b"J", data);

    // open the file through the standard protocol
    let mut script = atn(&[0x28, 0xF0]);
    script.extend(send(b"J"));
    script.extend(atn(&[0x3F]));
    sim.script(script);
    sim.run(|| bus.task());
    pump(&mut bus, 2);

    // talk with the detection probe, then fetch every byte Jiffy-style
    let mut script = vec![
        HostOp::AssertAtn,
        atn_probe(0x48),
        atn_plain(0x60),
        HostOp::ReleaseAtnTurnaround,
    ];
    script.extend(vec![HostOp::JiffyRecv; data.len()]);
    script.push(HostOp::AssertAtn);
    script.push(atn_plain(0x5F));
    script.push(HostOp::ReleaseAtn);
    sim.script(script);
    sim.run(|| bus.task());

    assert!(sim.jiffy_ack_seen());
    assert_eq!(sim.received_bytes(), data);
    let got = sim.received();
    for (i, &(_, eoi)) in got.iter().enumerate() {
        assert_eq!(eoi, i == got.len() - 1, "EOI at byte {i}");
    }
}

#[test]
fn listen_accepts_bit_pair_writes_after_detection() {
    let (sim, fs, mut bus) = setup();
    assert!(bus.enable_loader(8, Loader::Jiffy, true));
    let data = b"\x02\x10\x81\xFE";

    // open channel 1 for writing (name via Jiffy as well, since detection
    // applies to the whole transaction)
    let mut script = vec![
        HostOp::AssertAtn,
        atn_probe(0x28),
        atn_plain(0xF1),
        HostOp::ReleaseAtn,
    ];
    for (i, &byte) in b"JW".iter().enumerate() {
        script.push(HostOp::JiffySend { byte, eoi: i == 1 });
    }
    script.extend(atn(&[0x3F]));

    // data phase
    script.push(HostOp::AssertAtn);
    script.push(atn_probe(0x28));
    script.push(atn_plain(0x61));
    script.push(HostOp::ReleaseAtn);
    for (i, &byte) in data.iter().enumerate() {
        script.push(HostOp::JiffySend {
            byte,
            eoi: i == data.len() - 1,
        });
    }
    script.extend(atn(&[0x3F]));

    // close
    script.extend(atn(&[0x28, 0xE1]));
    script.extend(atn(&[0x3F]));

    sim.script(script);
    sim.run(|| bus.task());
    pump(&mut bus, 2);

    assert_eq!(fs.file(b"JW").as_deref(), Some(data.as_slice()));
}
