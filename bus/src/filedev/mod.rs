//! CBM-DOS channel semantics on top of the bus handlers.
//!
//! [`FileDevice`] implements the bus-facing [`Device`] contract and maps it
//! onto the narrower, filesystem-oriented [`FileOps`] hooks a concrete
//! device provides: per-channel open/close/read/write, command execution
//! and the channel-15 status text. It also owns fast-loader detection,
//! which watches the command channel for the `M-W`/`M-E` upload sequences.

pub mod command;
pub mod signatures;

use crate::device::{BusCaps, BusRequest, Device, FastLoadKind, Loader};
use alloc::collections::VecDeque;
use command::DosCommand;
use log::{debug, trace};

/// Capacity for accumulating channel-15 commands and buffered channel
/// writes; longer channel-15 commands are cut off.
pub const WRITE_BUFFER_SIZE: usize = 255;

/// Capacity of the channel-15 status text.
pub const STATUS_BUFFER_SIZE: usize = 255;

/// Queued work decoupling bus callbacks from (potentially slow) device
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingCmd {
    None,
    Open,
    Close,
    Exec,
    Write,
}

/// Filesystem-oriented hooks implemented by concrete file devices.
///
/// `open`/`close`/`execute` and both data directions run outside the bus
/// handler's timing-critical sections and may access slow media.
pub trait FileOps {
    /// Open `channel` for the given (PETSCII) name; false fails the open
    /// and poisons the channel until it is re-opened.
    fn open(&mut self, channel: u8, name: &[u8]) -> bool;

    fn close(&mut self, channel: u8);

    /// Read up to `buf.len()` bytes from `channel`; set `*eoi` when the
    /// returned bytes end the stream. Returning 0 implies EOI.
    fn read(&mut self, channel: u8, buf: &mut [u8], eoi: &mut bool) -> usize;

    /// Write bytes to `channel`, returning how many were accepted.
    fn write(&mut self, channel: u8, buf: &[u8], eoi: bool) -> usize;

    /// Execute a DOS command that is not handled by the adapter itself.
    fn execute(&mut self, cmd: &[u8]);

    /// Render the current status into `buf`, returning its length. Called
    /// when the host reads channel 15 and the previous text is exhausted.
    fn status(&mut self, buf: &mut [u8]) -> usize;

    fn task(&mut self) {}
    fn reset(&mut self) {}

    fn epyx_read_sector(&mut self, _track: u8, _sector: u8, _buf: &mut [u8]) -> bool {
        false
    }
    fn epyx_write_sector(&mut self, _track: u8, _sector: u8, _buf: &[u8]) -> bool {
        false
    }
}

/// Adapter from the bus [`Device`] contract to [`FileOps`].
pub struct FileDevice<F: FileOps> {
    ops: F,

    status_buffer: [u8; STATUS_BUFFER_SIZE],
    status_len: usize,
    status_ptr: usize,

    write_buffer: [u8; WRITE_BUFFER_SIZE],
    write_len: usize,

    /// Two-byte read lookahead per data channel; the transmit path needs to
    /// know one byte early whether more data follows to signal EOI.
    read_buffer: [[u8; 2]; 15],
    /// -128 poisons a channel whose open failed.
    read_len: [i8; 15],

    /// Currently selected channel, 0xFF when none.
    channel: u8,
    opening: bool,
    eoi: bool,
    cmd: PendingCmd,

    upload_ctr: u8,
    ar6_detect: u8,

    can_serve_atn: bool,
    pending: VecDeque<BusRequest>,
}

impl<F: FileOps> FileDevice<F> {
    pub fn new(ops: F) -> Self {
        FileDevice {
            ops,
            status_buffer: [0; STATUS_BUFFER_SIZE],
            status_len: 0,
            status_ptr: 0,
            write_buffer: [0; WRITE_BUFFER_SIZE],
            write_len: 0,
            read_buffer: [[0; 2]; 15],
            read_len: [0; 15],
            channel: 0xFF,
            opening: false,
            eoi: false,
            cmd: PendingCmd::None,
            upload_ctr: 0,
            ar6_detect: 0,
            can_serve_atn: false,
            pending: VecDeque::new(),
        }
    }

    pub fn ops(&self) -> &F {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut F {
        &mut self.ops
    }

    /// Replace the pending channel-15 status text (for unsolicited replies
    /// such as the AR6 drive-type answer).
    pub fn set_status(&mut self, data: &[u8]) {
        let n = data.len().min(STATUS_BUFFER_SIZE);
        self.status_buffer[..n].copy_from_slice(&data[..n]);
        self.status_len = n;
        self.status_ptr = 0;
    }

    pub fn clear_status(&mut self) {
        self.status_len = 0;
        self.status_ptr = 0;
    }

    fn request(&mut self, req: BusRequest) {
        self.pending.push_back(req);
    }

    fn fill_read_buffer(&mut self) {
        let ch = self.channel as usize;
        while (self.read_len[ch] as usize) < 2 && !self.eoi {
            let have = self.read_len[ch] as usize;
            let n = self
                .ops
                .read(self.channel, &mut self.read_buffer[ch][have..2], &mut self.eoi);
            if n == 0 {
                self.eoi = true;
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            {
                self.read_len[ch] += n as i8;
            }
        }
    }

    fn empty_write_buffer(&mut self) {
        if self.write_len == 0 {
            return;
        }
        let n = self
            .ops
            .write(self.channel, &self.write_buffer[..self.write_len], self.eoi);
        if n < self.write_len {
            self.write_buffer.copy_within(n..self.write_len, 0);
            self.write_len -= n;
        } else {
            self.write_len = 0;
        }
    }

    /// Run the queued command, if any. Called from `task` when the bus can
    /// serve ATN in hardware, otherwise inlined into the
    /// `can_read`/`can_write` probes (which may block).
    fn file_task(&mut self) {
        self.detect_ar6_save_prefix();

        match self.cmd {
            PendingCmd::None => return,

            PendingCmd::Open => {
                let name_len = self.write_len;
                debug!("open #{}: {} bytes", self.channel, name_len);
                let ch = self.channel as usize;
                let ok = {
                    let (buf, channel) = (&self.write_buffer[..name_len], self.channel);
                    self.ops.open(channel, buf)
                };
                if ch < 15 {
                    self.read_len[ch] = if ok { 0 } else { -128 };
                }
                self.write_len = 0;
                self.channel = 0xFF;
            }

            PendingCmd::Close => {
                debug!("close #{}", self.channel);
                // buffered data that cannot be flushed now is lost
                self.empty_write_buffer();
                self.write_len = 0;

                let ch = self.channel as usize;
                self.ops.close(self.channel);
                if ch < 15 {
                    self.read_len[ch] = 0;
                }
                self.channel = 0xFF;
            }

            PendingCmd::Write => {
                self.empty_write_buffer();
                self.write_len = 0;
                self.channel = 0xFF;
            }

            PendingCmd::Exec => self.execute_command(),
        }

        self.cmd = PendingCmd::None;
    }

    /// Action Replay 6 sends two garbage bytes through the regular protocol
    /// before switching to fast-save. They are only discarded when the full
    /// tell-tale sequence is seen: the $FFFE drive-type read, an OPEN on a
    /// channel above 0, then exactly `\0 \x01` as the first write.
    fn detect_ar6_save_prefix(&mut self) {
        if self.cmd == PendingCmd::None {
            return;
        }
        let is_drive_type_read = self.cmd == PendingCmd::Exec
            && self.write_buffer[..self.write_len].starts_with(b"M-R\xFE\xFF\x01");

        if self.ar6_detect == 0 && is_drive_type_read {
            self.ar6_detect = 1;
        } else if self.ar6_detect == 1 && self.cmd == PendingCmd::Open && self.channel > 0 {
            self.ar6_detect = 2;
        } else if self.ar6_detect == 2
            && self.cmd == PendingCmd::Write
            && self.write_len == 2
            && self.write_buffer[..2] == [0x00, 0x01]
        {
            self.write_len = 0;
            self.cmd = PendingCmd::None;
            self.ar6_detect = 0;
        } else if self.ar6_detect != 0 {
            self.ar6_detect = 0;
        }
    }

    /// Handle a complete channel-15 command: fast-loader detection first,
    /// everything else goes to the device.
    fn execute_command(&mut self) {
        let len = self.write_len;
        self.write_len = 0;

        match command::parse(&self.write_buffer[..len]) {
            DosCommand::MemoryWrite { addr, data } => {
                // the payload sits at a fixed offset behind the M-W header
                let dlen = data.len();
                let handled = track_upload(
                    &mut self.upload_ctr,
                    addr,
                    &self.write_buffer[6..6 + dlen],
                );
                if !handled {
                    // unrelated M-W: fall through to the device
                    self.pass_to_device(len);
                }
            }

            DosCommand::MemoryExecute { addr } => {
                if !self.dispatch_upload_entry(addr) {
                    self.pass_to_device(len);
                }
            }

            DosCommand::MemoryRead { addr: 0xFFFE, len: 1 } => {
                // AR6 probes the drive type; 3 identifies a 1581, whose
                // loader transmits file names instead of raw directory
                // tracks
                self.set_status(&[0x03]);
            }

            DosCommand::BurstLoad => {
                self.request(BusRequest::FastLoad(Loader::Dolphin, FastLoadKind::Load));
                self.channel = 0;
                self.eoi = false;
            }

            DosCommand::BurstSave => {
                self.request(BusRequest::FastLoad(Loader::Dolphin, FastLoadKind::Save));
                self.channel = 1;
                self.eoi = false;
            }

            DosCommand::BurstEnable(enable) => {
                self.request(BusRequest::DolphinBurst(enable));
                self.clear_status();
            }

            DosCommand::MemoryRead { .. } | DosCommand::Other(_) => {
                self.pass_to_device(len);
            }
        }
    }

    fn pass_to_device(&mut self, mut len: usize) {
        if len > 0 && self.write_buffer[len - 1] == 0x0D {
            len -= 1;
        }
        trace!("execute: {} bytes", len);
        {
            let buf = &self.write_buffer[..len];
            self.ops.execute(buf);
        }
        self.upload_ctr = 0;
    }

    fn dispatch_upload_entry(&mut self, addr: u16) -> bool {
        use self::signatures::{
            EPYX_V1_BASE, EPYX_V1_ENTRY, EPYX_V2_V3_BASE, EPYX_V2_V3_ENTRY, UPLOADS,
        };

        // Epyx stage 1 complete?
        let epyx = (self.upload_ctr == EPYX_V1_BASE + 2 && addr == EPYX_V1_ENTRY)
            || (self.upload_ctr == EPYX_V2_V3_BASE + 3 && addr == EPYX_V2_V3_ENTRY);
        if epyx {
            debug!("epyx fastload upload detected");
            self.request(BusRequest::FastLoad(Loader::Epyx, FastLoadKind::Header));
            self.upload_ctr = 0;
            return true;
        }

        for upload in &UPLOADS {
            if self.upload_ctr == upload.terminal() && upload.entry.contains(&addr) {
                debug!("{:?} {:?} upload detected", upload.loader, upload.kind);
                self.request(BusRequest::FastLoad(upload.loader, upload.kind));
                self.upload_ctr = 0;
                self.eoi = false;
                // LOAD serves channel 0, SAVE receives on channel 1
                self.channel = match upload.kind {
                    FastLoadKind::Save => 1,
                    _ => 0,
                };
                return true;
            }
        }
        false
    }
}

/// Walk the signature tables for one observed `M-W`. Epyx runs its own
/// two-step counter since its upload continues over the wire after `M-E`.
fn track_upload(counter: &mut u8, addr: u16, data: &[u8]) -> bool {
    use self::signatures::{walk, EPYX_V1, EPYX_V1_BASE, EPYX_V2_V3, EPYX_V2_V3_BASE, UPLOADS};

    if walk(counter, &EPYX_V1, EPYX_V1_BASE, addr, data)
        || walk(counter, &EPYX_V2_V3, EPYX_V2_V3_BASE, addr, data)
    {
        return true;
    }
    for upload in &UPLOADS {
        if walk(counter, upload.sigs, upload.counter_base, addr, data) {
            return true;
        }
    }

    // part of no known upload: a partially walked table resets silently
    *counter = 0;
    false
}

impl<F: FileOps> Device for FileDevice<F> {
    fn begin(&mut self, caps: BusCaps) {
        self.can_serve_atn = caps.can_serve_atn;
        self.reset_state();
    }

    fn reset(&mut self) {
        debug!("file device reset");
        self.reset_state();
        self.ops.reset();
    }

    fn task(&mut self) {
        self.ops.task();
        if self.can_serve_atn {
            self.file_task();
        }
    }

    fn talk(&mut self, secondary: u8) {
        self.channel = secondary & 0x0F;
        self.eoi = false;

        // Final Cartridge 3 interrupts a DOS"$" with TALK, CLOSE, UNLISTEN
        if self.channel != 15 && secondary & 0xF0 == 0xE0 {
            self.cmd = PendingCmd::Close;
        }
    }

    fn untalk(&mut self) {
        self.channel = 0xFF;
    }

    fn listen(&mut self, secondary: u8) {
        self.channel = secondary & 0x0F;
        self.eoi = false;

        if self.channel == 15 {
            self.write_len = 0;
        } else if secondary & 0xF0 == 0xF0 {
            self.opening = true;
            self.write_len = 0;
        } else if secondary & 0xF0 == 0xE0 {
            self.cmd = PendingCmd::Close;
        }
    }

    fn unlisten(&mut self) {
        if self.channel == 15 {
            if self.write_len > 0 {
                self.cmd = PendingCmd::Exec;
            }
            self.channel = 0xFF;
        } else if self.opening {
            self.opening = false;
            self.cmd = PendingCmd::Open;
            // the channel is cleared once the open has been processed
        } else if self.write_len > 0 {
            self.cmd = PendingCmd::Write;
        }
    }

    fn can_read(&mut self) -> i8 {
        if !self.can_serve_atn {
            // processing an OPEN clears the channel, but the follow-up TALK
            // has already selected it again; keep the selection
            if self.cmd == PendingCmd::Open {
                let ch = self.channel;
                self.file_task();
                self.channel = ch;
            } else {
                self.file_task();
            }
        }

        if self.channel == 15 {
            if self.status_ptr == self.status_len {
                self.status_ptr = 0;
                self.status_len = {
                    let (ops, buf) = (&mut self.ops, &mut self.status_buffer);
                    ops.status(buf)
                };
                trace!("status: {} bytes", self.status_len);
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            {
                (self.status_len - self.status_ptr).min(i8::MAX as usize) as i8
            }
        } else if self.channel > 15 || self.read_len[self.channel as usize] == -128 {
            0
        } else {
            self.fill_read_buffer();
            self.read_len[self.channel as usize]
        }
    }

    fn can_write(&mut self) -> i8 {
        if !self.can_serve_atn {
            if self.cmd == PendingCmd::Open {
                let ch = self.channel;
                self.file_task();
                self.channel = ch;
            } else {
                self.file_task();
            }
        }

        if self.channel == 15 || self.opening {
            1
        } else if self.channel > 15 || self.read_len[self.channel as usize] == -128 {
            0
        } else {
            if self.write_len == WRITE_BUFFER_SIZE - 1 {
                self.empty_write_buffer();
            }
            i8::from(self.write_len < WRITE_BUFFER_SIZE - 1)
        }
    }

    fn peek(&mut self) -> u8 {
        if self.channel == 15 {
            self.status_buffer[self.status_ptr]
        } else if self.channel < 15 {
            self.read_buffer[self.channel as usize][0]
        } else {
            0
        }
    }

    fn read(&mut self) -> u8 {
        if self.channel == 15 {
            let data = self.status_buffer[self.status_ptr];
            self.status_ptr += 1;
            data
        } else if self.channel < 15 {
            let ch = self.channel as usize;
            let data = self.read_buffer[ch][0];
            if self.read_len[ch] == 2 {
                self.read_buffer[ch][0] = self.read_buffer[ch][1];
                self.read_len[ch] = 1;
            } else {
                self.read_len[ch] = 0;
            }
            data
        } else {
            0
        }
    }

    // must return within a millisecond: only buffers the byte
    fn write(&mut self, data: u8, eoi: bool) {
        self.eoi |= eoi;
        if self.write_len < WRITE_BUFFER_SIZE - 1 {
            self.write_buffer[self.write_len] = data;
            self.write_len += 1;
        }
    }

    fn read_buf(&mut self, buf: &mut [u8]) -> usize {
        if self.channel >= 15 {
            // bulk reads only serve the fast-load paths on data channels
            return 0;
        }
        let ch = self.channel as usize;
        let mut res = 0;

        // drain the two-byte lookahead first
        while self.read_len[ch] > 0 && res < buf.len() {
            buf[res] = self.read_buffer[ch][0];
            self.read_buffer[ch][0] = self.read_buffer[ch][1];
            self.read_len[ch] -= 1;
            res += 1;
        }

        while res < buf.len() && !self.eoi {
            let n = {
                let (ops, channel, eoi) = (&mut self.ops, self.channel, &mut self.eoi);
                ops.read(channel, &mut buf[res..], eoi)
            };
            if n == 0 {
                self.eoi = true;
            }
            res += n;
        }
        res
    }

    fn write_buf(&mut self, buf: &[u8], eoi: bool) -> usize {
        if self.channel >= 15 {
            return 0;
        }
        // buffered bytes go first; if they cannot be flushed, nothing of
        // the new data counts as written
        self.empty_write_buffer();
        if self.write_len > 0 {
            return 0;
        }
        self.eoi |= eoi;
        let e = self.eoi;
        self.ops.write(self.channel, buf, e)
    }

    fn take_request(&mut self) -> Option<BusRequest> {
        self.pending.pop_front()
    }

    fn epyx_read_sector(&mut self, track: u8, sector: u8, buf: &mut [u8]) -> bool {
        self.ops.epyx_read_sector(track, sector, buf)
    }

    fn epyx_write_sector(&mut self, track: u8, sector: u8, buf: &[u8]) -> bool {
        self.ops.epyx_write_sector(track, sector, buf)
    }
}

impl<F: FileOps> FileDevice<F> {
    fn reset_state(&mut self) {
        self.status_ptr = 0;
        self.status_len = 0;
        self.write_len = 0;
        self.read_len = [0; 15];
        self.channel = 0xFF;
        self.cmd = PendingCmd::None;
        self.opening = false;
        self.eoi = false;
        self.upload_ctr = 0;
        self.ar6_detect = 0;
        self.pending.clear();
    }
}
