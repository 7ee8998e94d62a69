//! In-memory file backend for exercising the channel layer.
//!
//! Behaves like a very small drive: named files live in a map, channels
//! 0-14 stream bytes in or out, channel 15 carries DOS status text. The
//! handle is cheaply cloneable so tests keep one for assertions after
//! attaching the other to a bus.

use ferriec::filedev::FileOps;
use ferriec::status::{DosError, Status};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

#[derive(Debug)]
enum Channel {
    Read { data: VecDeque<u8> },
    Write { name: Vec<u8>, data: Vec<u8> },
}

struct Inner {
    files: HashMap<Vec<u8>, Vec<u8>>,
    channels: HashMap<u8, Channel>,
    executed: Vec<Vec<u8>>,
    status: Status,
    resets: u32,
    sectors: HashMap<(u8, u8), [u8; 256]>,
}

/// A loopback filesystem: writes land in a map keyed by file name, reads
/// stream back whatever was stored.
#[derive(Clone)]
pub struct LoopbackFs {
    inner: Rc<RefCell<Inner>>,
}

impl Default for LoopbackFs {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFs {
    pub fn new() -> Self {
        LoopbackFs {
            inner: Rc::new(RefCell::new(Inner {
                files: HashMap::new(),
                channels: HashMap::new(),
                executed: Vec::new(),
                status: Status::version(),
                resets: 0,
                sectors: HashMap::new(),
            })),
        }
    }

    pub fn add_file(&self, name: &[u8], data: &[u8]) {
        self.inner
            .borrow_mut()
            .files
            .insert(name.to_vec(), data.to_vec());
    }

    pub fn file(&self, name: &[u8]) -> Option<Vec<u8>> {
        self.inner.borrow().files.get(name).cloned()
    }

    pub fn executed(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().executed.clone()
    }

    pub fn open_channels(&self) -> usize {
        self.inner.borrow().channels.len()
    }

    pub fn resets(&self) -> u32 {
        self.inner.borrow().resets
    }

    pub fn add_sector(&self, track: u8, sector: u8, data: [u8; 256]) {
        self.inner.borrow_mut().sectors.insert((track, sector), data);
    }

    pub fn sector(&self, track: u8, sector: u8) -> Option<[u8; 256]> {
        self.inner.borrow().sectors.get(&(track, sector)).copied()
    }
}

impl FileOps for LoopbackFs {
    fn open(&mut self, channel: u8, name: &[u8]) -> bool {
        let mut inner = self.inner.borrow_mut();
        // channel 1 (SAVE) and any explicit ",W" suffix open for write;
        // everything else reads
        let write = channel == 1 || name.ends_with(b",W");
        if write {
            inner.channels.insert(
                channel,
                Channel::Write {
                    name: name.to_vec(),
                    data: Vec::new(),
                },
            );
            inner.status = Status::ok();
            true
        } else if let Some(data) = inner.files.get(name) {
            let data = data.iter().copied().collect();
            inner.channels.insert(channel, Channel::Read { data });
            inner.status = Status::ok();
            true
        } else {
            inner.status = Status::new(DosError::FileNotFound);
            false
        }
    }

    fn close(&mut self, channel: u8) {
        let mut inner = self.inner.borrow_mut();
        if let Some(Channel::Write { name, data }) = inner.channels.remove(&channel) {
            inner.files.insert(name, data);
        }
    }

    fn read(&mut self, channel: u8, buf: &mut [u8], eoi: &mut bool) -> usize {
        let mut inner = self.inner.borrow_mut();
        let Some(Channel::Read { data }) = inner.channels.get_mut(&channel) else {
            *eoi = true;
            return 0;
        };
        let mut n = 0;
        while n < buf.len() {
            match data.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        if data.is_empty() {
            *eoi = true;
        }
        n
    }

    fn write(&mut self, channel: u8, buf: &[u8], _eoi: bool) -> usize {
        let mut inner = self.inner.borrow_mut();
        match inner.channels.get_mut(&channel) {
            Some(Channel::Write { data, .. }) => {
                data.extend_from_slice(buf);
                buf.len()
            }
            _ => 0,
        }
    }

    fn execute(&mut self, cmd: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        inner.executed.push(cmd.to_vec());
        inner.status = Status::ok();
    }

    fn status(&mut self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.borrow_mut();
        let n = inner.status.render(buf);
        // reading the status resets it, as CBM DOS does
        inner.status = Status::ok();
        n
    }

    fn reset(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.channels.clear();
        inner.status = Status::version();
        inner.resets += 1;
    }

    fn epyx_read_sector(&mut self, track: u8, sector: u8, buf: &mut [u8]) -> bool {
        match self.inner.borrow().sectors.get(&(track, sector)) {
            Some(data) => {
                buf[..256].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    fn epyx_write_sector(&mut self, track: u8, sector: u8, buf: &[u8]) -> bool {
        let mut data = [0u8; 256];
        data.copy_from_slice(&buf[..256]);
        self.inner.borrow_mut().sectors.insert((track, sector), data);
        true
    }
}
