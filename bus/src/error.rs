//! Failure classification for the wire-level protocol engines.

use core::fmt;

/// Why a wait loop or transfer gave up.
///
/// Neither variant escapes the task loop: an ATN transition re-enters
/// addressing, a timeout marks the transaction done and releases the lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    /// The ATN line no longer matches the handler's view: the host started
    /// (or aborted) an addressing sequence mid-transfer.
    AtnTransition,
    /// The wait budget for a handshake condition expired.
    Timeout,
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Abort::AtnTransition => write!(f, "ATN transition"),
            Abort::Timeout => write!(f, "handshake timeout"),
        }
    }
}
