//! Fast-loader upload detection through the command channel.

mod common;

use common::{atn, atn_turnaround, me, mw, pump, recv, run_command, send, setup, setup_with};
use ferriec::device::{FastLoad, FastLoadKind, Loader};
use ferriec::filedev::signatures::{EPYX_V1, UPLOADS};
use ferriec_testing::IecSim;

fn upload_of(loader: Loader, kind: FastLoadKind) -> &'static ferriec::filedev::signatures::UploadSignature {
    UPLOADS
        .iter()
        .find(|u| u.loader == loader && u.kind == kind)
        .expect("signature table entry")
}

#[test]
fn fc3_load_upload_arms_the_protocol() {
    let (sim, _fs, mut bus) = setup();
    assert!(bus.enable_loader(8, Loader::Fc3, true));

    let upload = upload_of(Loader::Fc3, FastLoadKind::Load);
    for sig in upload.sigs {
        run_command(&sim, &mut bus, &mw(sig.addr, sig.len, sig.checksum));
    }
    run_command(&sim, &mut bus, &me(0x059A));

    assert_eq!(
        bus.registry().get(8).unwrap().active_protocol(),
        Some(FastLoad {
            loader: Loader::Fc3,
            kind: FastLoadKind::Load,
        })
    );

    // the next ATN cancels any armed protocol
    sim.script(atn(&[0x3F]));
    sim.run(|| bus.task());
    assert_eq!(bus.registry().get(8).unwrap().active_protocol(), None);
}

#[test]
fn fc3_save_accepts_both_entry_points() {
    for entry in [0x059C_u16, 0x05AF] {
        let (sim, _fs, mut bus) = setup();
        assert!(bus.enable_loader(8, Loader::Fc3, true));

        let upload = upload_of(Loader::Fc3, FastLoadKind::Save);
        for sig in upload.sigs {
            run_command(&sim, &mut bus, &mw(sig.addr, sig.len, sig.checksum));
        }
        run_command(&sim, &mut bus, &me(entry));

        assert_eq!(
            bus.registry().get(8).unwrap().active_protocol(),
            Some(FastLoad {
                loader: Loader::Fc3,
                kind: FastLoadKind::Save,
            }),
            "entry {entry:#06x}"
        );
        sim.script(atn(&[0x3F]));
        sim.run(|| bus.task());
    }
}

#[test]
fn ar6_load_upload_arms_the_protocol() {
    let (sim, _fs, mut bus) = setup();
    assert!(bus.enable_loader(8, Loader::Ar6, true));

    let upload = upload_of(Loader::Ar6, FastLoadKind::Load);
    for sig in upload.sigs {
        run_command(&sim, &mut bus, &mw(sig.addr, sig.len, sig.checksum));
    }
    run_command(&sim, &mut bus, &me(0x0500));

    assert_eq!(
        bus.registry().get(8).unwrap().active_protocol(),
        Some(FastLoad {
            loader: Loader::Ar6,
            kind: FastLoadKind::Load,
        })
    );
    sim.script(atn(&[0x3F]));
    sim.run(|| bus.task());
}

#[test]
fn epyx_stage1_upload_arms_the_header_protocol() {
    let (sim, _fs, mut bus) = setup();
    assert!(bus.enable_loader(8, Loader::Epyx, true));

    for sig in &EPYX_V1 {
        run_command(&sim, &mut bus, &mw(sig.addr, sig.len, sig.checksum));
    }
    // no extra pumping after the M-E: the armed header engine would start
    // clocking in the stage-2 upload
    sim.script(common::command_script(&me(0x01A2)));
    sim.run(|| bus.task());

    assert_eq!(
        bus.registry().get(8).unwrap().active_protocol(),
        Some(FastLoad {
            loader: Loader::Epyx,
            kind: FastLoadKind::Header,
        })
    );
    sim.script(atn(&[0x3F]));
    sim.run(|| bus.task());
}

#[test]
fn speeddos_upload_requires_the_cable() {
    // no cable: the loader cannot even be enabled
    let (_sim, _fs, mut bus) = setup();
    assert!(!bus.enable_loader(8, Loader::SpeedDos, true));

    // with a cable the upload is recognized
    let (sim, _fs, mut bus) = setup_with(IecSim::new().with_cable());
    assert!(bus.enable_loader(8, Loader::SpeedDos, true));

    let upload = upload_of(Loader::SpeedDos, FastLoadKind::Load);
    for sig in upload.sigs {
        run_command(&sim, &mut bus, &mw(sig.addr, sig.len, sig.checksum));
    }
    // the SpeedDos transfer has no arming delay, so inspect the protocol
    // right after the M-E executed and before another task iteration
    sim.script(common::command_script(&me(0x0303)));
    sim.run(|| bus.task());

    assert_eq!(
        bus.registry().get(8).unwrap().active_protocol(),
        Some(FastLoad {
            loader: Loader::SpeedDos,
            kind: FastLoadKind::Load,
        })
    );
    sim.script(atn(&[0x3F]));
    sim.run(|| bus.task());
}

#[test]
fn diverging_upload_resets_the_counter() {
    let (sim, fs, mut bus) = setup();
    assert!(bus.enable_loader(8, Loader::Fc3, true));

    let upload = upload_of(Loader::Fc3, FastLoadKind::Load);
    run_command(&sim, &mut bus, &mw(upload.sigs[0].addr, upload.sigs[0].len, upload.sigs[0].checksum));
    run_command(&sim, &mut bus, &mw(upload.sigs[1].addr, upload.sigs[1].len, upload.sigs[1].checksum));

    // unrelated M-W: falls through to the device and resets the walk
    let stray = mw(0x1234, 4, 0x55);
    run_command(&sim, &mut bus, &stray);
    assert_eq!(fs.executed().last().map(Vec::as_slice), Some(stray.as_slice()));

    run_command(&sim, &mut bus, &me(0x059A));
    assert_eq!(bus.registry().get(8).unwrap().active_protocol(), None);
    // the unrecognized M-E reached the device too
    assert_eq!(fs.executed().last().map(Vec::as_slice), Some(me(0x059A).as_slice()));
}

#[test]
fn ar6_drive_type_probe_answers_as_1581() {
    let (sim, _fs, mut bus) = setup();
    assert!(bus.enable_loader(8, Loader::Ar6, true));

    run_command(&sim, &mut bus, b"M-R\xFE\xFF\x01");

    let mut script = atn_turnaround(&[0x48, 0x6F]);
    script.extend(recv(1));
    script.extend(atn(&[0x5F]));
    sim.script(script);
    sim.run(|| bus.task());

    assert_eq!(sim.received(), vec![(0x03, true)]);
}

#[test]
fn ar6_save_prefix_bytes_are_discarded() {
    let (sim, fs, mut bus) = setup();
    assert!(bus.enable_loader(8, Loader::Ar6, true));

    run_command(&sim, &mut bus, b"M-R\xFE\xFF\x01");

    // OPEN on channel 1, then exactly \0 \x01 in one transaction
    let mut script = atn(&[0x28, 0xF1]);
    script.extend(send(b"AF"));
    script.extend(atn(&[0x3F]));
    script.extend(atn(&[0x28, 0x61]));
    script.extend(send(&[0x00, 0x01]));
    script.extend(atn(&[0x3F]));
    script.extend(atn(&[0x28, 0xE1]));
    script.extend(atn(&[0x3F]));
    sim.script(script);
    sim.run(|| bus.task());
    pump(&mut bus, 2);

    assert_eq!(fs.file(b"AF").as_deref(), Some(&[] as &[u8]));
}

#[test]
fn dolphin_burst_commands_arm_and_configure() {
    let (sim, _fs, mut bus) = setup_with(IecSim::new().with_cable());
    assert!(bus.enable_loader(8, Loader::Dolphin, true));
    assert!(bus.registry().get(8).unwrap().loader_flags().dolphin_burst());

    run_command(&sim, &mut bus, b"XF-");
    assert!(!bus.registry().get(8).unwrap().loader_flags().dolphin_burst());

    run_command(&sim, &mut bus, b"XF+");
    assert!(bus.registry().get(8).unwrap().loader_flags().dolphin_burst());

    sim.script(common::command_script(b"XQ"));
    sim.run(|| bus.task());
    bus.task();
    assert_eq!(
        bus.registry().get(8).unwrap().active_protocol(),
        Some(FastLoad {
            loader: Loader::Dolphin,
            kind: FastLoadKind::Load,
        })
    );
    sim.script(atn(&[0x3F]));
    sim.run(|| bus.task());
    assert_eq!(bus.registry().get(8).unwrap().active_protocol(), None);
}

#[test]
fn burst_request_without_the_loader_is_passed_through() {
    let (sim, fs, mut bus) = setup();

    run_command(&sim, &mut bus, b"XQ");

    assert_eq!(bus.registry().get(8).unwrap().active_protocol(), None);
    // Dolphin not enabled: the adapter still intercepts XQ (it is a loader
    // command, not a DOS command), so the device never sees it and no
    // protocol is armed
    assert!(fs.executed().is_empty());
}
