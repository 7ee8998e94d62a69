//! Fast-loader wire engines.
//!
//! Each submodule implements the drive side of one host-installed loader.
//! The microsecond offsets in these engines are contracts dictated by the
//! host-side code; fractional offsets from the 6502 cycle counts are rounded
//! up to the next microsecond, which stays inside every read-window margin.
//! Engines run with interrupts masked for their timed sections and must live
//! in RAM on cached-flash targets.

mod ar6;
mod dolphin;
mod epyx;
mod fc3;
mod jiffy;
mod speeddos;

use super::IecBus;
use crate::device::{FastLoad, FastLoadKind, Loader};
use ferriec_shared::platform::{elapsed_us, Platform};
use ferriec_shared::port::{ParallelPort, SerialPort, ASSERTED, RELEASED};

impl<P: SerialPort, PL: Platform, C: ParallelPort> IecBus<P, PL, C> {
    /// Run the wire phase of the active fast-load protocol once its
    /// precondition holds. Called from the task loop between the ATN and
    /// data phases.
    pub(crate) fn handle_fastload_protocols(&mut self) {
        let Some(idx) = self.current else {
            return;
        };
        let Some(FastLoad { loader, kind }) = self.registry.entry(idx).active_protocol() else {
            return;
        };

        let armed = self.timeout_duration == 0
            || elapsed_us(self.now(), self.timeout_start) > self.timeout_duration;

        match (loader, kind) {
            (Loader::Dolphin, FastLoadKind::Load) => {
                // burst transmit starts once the host pulls DATA low; the
                // initial delay lets other devices release the line
                if elapsed_us(self.now(), self.timeout_start) > self.timeout_duration
                    && self.port.read_data() == ASSERTED
                {
                    // host has released CLK by now, take it over
                    self.port.write_clk(ASSERTED);

                    if self.registry.entry(idx).fl_flags.dolphin_burst() {
                        let _ = self.transmit_dolphin_burst(idx);

                        // the host skips the usual CLOSE when bursting
                        self.registry.device(idx).listen(0xE0);
                        self.registry.device(idx).unlisten();
                        self.drain_requests(idx);

                        if self.port.read_atn() == ASSERTED {
                            self.atn_request();
                        }
                    } else {
                        // burst rejected: fall back to byte-wise transfers
                        self.flags.clear();
                        self.flags.set_talking(true);
                        self.registry.entry(idx).fl_flags.set_dolphin_detected(true);
                        self.secondary = 0x60;
                    }

                    self.registry.entry(idx).fl_protocol = None;
                }
            }

            (Loader::Dolphin, FastLoadKind::Save) => {
                // wait out the host releasing CLK after `XZ`, then for it to
                // pull CLK low again
                if elapsed_us(self.now(), self.timeout_start) > self.timeout_duration
                    && self.port.read_clk() == ASSERTED
                {
                    if self.registry.entry(idx).fl_flags.dolphin_burst() {
                        let _ = self.receive_dolphin_burst(idx);
                        if self.port.read_atn() == ASSERTED {
                            self.atn_request();
                        }
                    } else {
                        self.flags.clear();
                        self.flags.set_listening(true);
                        self.registry.entry(idx).fl_flags.set_dolphin_detected(true);
                        self.secondary = 0x61;

                        // bytes already taken over the serial path get
                        // replayed to the device, see receive_dolphin_byte
                        self.buffer_ctr = 2 * super::PARALLEL_PREBUFFER - self.buffer_ctr;

                        self.port.write_data(ASSERTED);
                    }

                    self.registry.entry(idx).fl_protocol = None;
                }
            }

            (Loader::SpeedDos, FastLoadKind::Load) => {
                let _ = self.transmit_speeddos_file(idx);

                self.port.write_clk(RELEASED);
                self.port.write_data(RELEASED);

                self.registry.device(idx).listen(0xE0);
                self.registry.device(idx).unlisten();
                self.drain_requests(idx);

                if self.port.read_atn() == ASSERTED {
                    self.atn_request();
                }
                self.registry.entry(idx).fl_protocol = None;
            }

            (Loader::Epyx, FastLoadKind::Header) => {
                if self.port.read_data() == RELEASED {
                    self.registry.entry(idx).fl_protocol = None;
                    if self.receive_epyx_header(idx).is_err() {
                        self.port.write_clk(RELEASED);
                        self.port.write_data(RELEASED);
                    }
                }
            }

            (Loader::Epyx, FastLoadKind::Load) => {
                if self.transmit_epyx_block(idx).is_err() {
                    // end-of-data or transmission error
                    self.port.write_clk(RELEASED);
                    self.port.write_data(RELEASED);

                    // close the file opened by the header upload
                    self.registry.device(idx).listen(0xE0);
                    self.registry.device(idx).unlisten();
                    self.drain_requests(idx);

                    self.registry.entry(idx).fl_protocol = None;
                }
            }

            (Loader::Epyx, FastLoadKind::Sector) => {
                if self.finish_epyx_sector_command(idx).is_err() {
                    self.port.write_clk(RELEASED);
                    self.port.write_data(RELEASED);
                    self.registry.entry(idx).fl_protocol = None;
                }
            }

            (Loader::Fc3, FastLoadKind::Load) if armed => {
                self.timeout_duration = 0;
                if self.transmit_fc3_block(idx) != Ok(true) {
                    self.registry.entry(idx).fl_protocol = None;
                }
            }

            (Loader::Fc3, FastLoadKind::LoadImage) if armed => {
                self.timeout_duration = 0;
                if self.transmit_fc3_image_block(idx) != Ok(true) {
                    self.registry.entry(idx).fl_protocol = None;
                }
            }

            (Loader::Fc3, FastLoadKind::Save) if armed => {
                if self.receive_fc3_block(idx) != Ok(true) {
                    self.port.write_clk(RELEASED);
                    self.port.write_data(RELEASED);
                    self.registry.entry(idx).fl_protocol = None;

                    // the host skips the CLOSE after a fast-save
                    self.registry.device(idx).listen(0xE1);
                    self.registry.device(idx).unlisten();
                    self.drain_requests(idx);
                }
            }

            (Loader::Ar6, FastLoadKind::Load | FastLoadKind::LoadImage) if armed => {
                self.timeout_duration = 0;

                // the stand-alone image loader uses the older AR3 cadence
                let res = self.transmit_ar6_block(idx, kind == FastLoadKind::Load);
                if res != Ok(true) {
                    self.port.write_clk(RELEASED);
                    self.port.write_data(RELEASED);
                    self.registry.entry(idx).fl_protocol = None;

                    if res.is_err() {
                        // interrupted transfer: close the file ourselves
                        self.registry.device(idx).listen(0xE0);
                        self.registry.device(idx).unlisten();
                        self.drain_requests(idx);
                    }
                }
            }

            (Loader::Ar6, FastLoadKind::Save) if armed => {
                if self.receive_ar6_block(idx) != Ok(true) {
                    self.port.write_clk(RELEASED);
                    self.port.write_data(RELEASED);
                    self.registry.entry(idx).fl_protocol = None;
                }
            }

            _ => {}
        }
    }
}
