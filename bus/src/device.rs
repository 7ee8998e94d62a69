//! The contract between a bus handler and the devices attached to it.

/// Fast-load protocols a device may support. The discriminants are the bit
/// positions used in the per-device enable mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Loader {
    Jiffy = 0,
    Epyx = 1,
    Fc3 = 2,
    Ar6 = 3,
    Dolphin = 4,
    SpeedDos = 5,
}

impl Loader {
    pub const fn mask(self) -> u8 {
        1 << (self as u8)
    }

    /// Whether the loader moves data over the parallel cable.
    pub const fn needs_parallel_cable(self) -> bool {
        matches!(self, Loader::Dolphin | Loader::SpeedDos)
    }
}

/// The request kind of an active fast-load sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastLoadKind {
    Load,
    Save,
    Header,
    Sector,
    LoadImage,
}

/// A running fast-load sub-protocol on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastLoad {
    pub loader: Loader,
    pub kind: FastLoadKind,
}

/// Capabilities of the bus a device was attached to, passed to
/// [`Device::begin`].
#[derive(Debug, Clone, Copy)]
pub struct BusCaps {
    /// The bus can acknowledge ATN without the task loop running promptly:
    /// either a hardware gate pulls DATA low on ATN, or ATN edges are
    /// latched by an interrupt. When false, devices must never block the
    /// task loop longer than the ATN response budget and have to do heavy
    /// work inside `can_read`/`can_write`.
    pub can_serve_atn: bool,
}

/// An action a device asks its bus handler to perform.
///
/// Devices cannot call into the handler that owns them; instead the handler
/// drains pending requests after every `unlisten`, `can_read`, `can_write`
/// and `task` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusRequest {
    /// Switch the wire phase to a fast-load sub-protocol. Only honored if
    /// the loader is enabled on the requesting device.
    FastLoad(Loader, FastLoadKind),
    /// Enable or disable DolphinDOS burst transfers (host `XF+`/`XF-`).
    DolphinBurst(bool),
    /// Pulse the SRQ line.
    Srq,
}

/// A virtual peripheral on the bus.
///
/// `talk`/`listen`/`untalk`/`unlisten` and `write` must return within about
/// a millisecond; `can_read`/`can_write` and `read` may take arbitrary time
/// (the handler lifts its task guard around them). Any method may be called
/// in any order without panicking.
pub trait Device {
    /// One-time setup after attachment; called from the handler's `begin`
    /// (or immediately, if the handler was already started).
    fn begin(&mut self, _caps: BusCaps) {}

    /// Called on a falling edge of the RESET line.
    fn reset(&mut self) {}

    /// Periodic hook, called from the bus task loop.
    fn task(&mut self) {}

    fn talk(&mut self, _secondary: u8) {}
    fn listen(&mut self, _secondary: u8) {}
    fn untalk(&mut self) {}
    fn unlisten(&mut self) {}

    /// How many bytes can be read: negative = not yet (bus waits and
    /// retries), 0 = error, positive = at least that many bytes available.
    fn can_read(&mut self) -> i8 {
        0
    }

    /// Whether a byte can be written, same polarity as [`Device::can_read`].
    fn can_write(&mut self) -> i8 {
        0
    }

    /// Next byte without consuming it. Only called after `can_read() > 0`.
    fn peek(&mut self) -> u8 {
        0
    }

    /// Consume and return the next byte. Only called after `can_read() > 0`.
    fn read(&mut self) -> u8 {
        0
    }

    /// Accept one byte. Only called after `can_write() > 0`. `eoi` marks the
    /// final byte of the transmission.
    fn write(&mut self, _data: u8, _eoi: bool) {}

    /// Bulk read used by the fast-load engines. Devices should override this
    /// when they can serve whole buffers more efficiently than byte-wise.
    fn read_buf(&mut self, buf: &mut [u8]) -> usize {
        let mut i = 0;
        while i < buf.len() {
            let n = loop {
                let n = self.can_read();
                if n >= 0 {
                    break n;
                }
            };
            if n == 0 {
                break;
            }
            buf[i] = self.read();
            i += 1;
        }
        i
    }

    /// Bulk write used by the fast-load engines; returns how many bytes were
    /// accepted.
    fn write_buf(&mut self, buf: &[u8], eoi: bool) -> usize {
        let mut i = 0;
        while i < buf.len() {
            let n = loop {
                let n = self.can_write();
                if n >= 0 {
                    break n;
                }
            };
            if n == 0 {
                break;
            }
            self.write(buf[i], eoi && i == buf.len() - 1);
            i += 1;
        }
        i
    }

    /// Pending request for the bus handler, if any. Drained (repeatedly)
    /// after `unlisten`, `can_read`, `can_write` and `task`.
    fn take_request(&mut self) -> Option<BusRequest> {
        None
    }

    /// Epyx FastLoad sector read (disk editor / copier support). `buf` holds
    /// exactly 256 bytes.
    fn epyx_read_sector(&mut self, _track: u8, _sector: u8, _buf: &mut [u8]) -> bool {
        false
    }

    /// Epyx FastLoad sector write.
    fn epyx_write_sector(&mut self, _track: u8, _sector: u8, _buf: &[u8]) -> bool {
        false
    }
}
