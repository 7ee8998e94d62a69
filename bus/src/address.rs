//! ATN address byte decoding.
//!
//! Two bytes arrive under ATN: the primary (command + device number) and,
//! for LISTEN/TALK, the secondary (subcommand + channel).

use arbitrary_int::{u3, u4, u5};
use bitbybit::bitfield;

/// UNLISTEN broadcast primary (LISTEN with the all-ones device field).
pub const UNLISTEN: u8 = 0x3F;
/// UNTALK broadcast primary.
pub const UNTALK: u8 = 0x5F;

#[bitfield(u8)]
pub struct Primary {
    #[bits(0..=4, r)]
    device: u5,
    #[bits(5..=7, r)]
    command: u3,
}

#[bitfield(u8)]
pub struct Secondary {
    #[bits(0..=3, r)]
    channel: u4,
    #[bits(4..=7, r)]
    mode: u4,
}

/// Decoded primary address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtnCommand {
    Listen(u8),
    Unlisten,
    Talk(u8),
    Untalk,
    /// Not a device-addressing byte (e.g. IEEE-488 controller commands).
    Other(u8),
}

impl AtnCommand {
    pub fn decode(primary: u8) -> AtnCommand {
        let p = Primary::new_with_raw_value(primary);
        match p.command().value() {
            1 if primary == UNLISTEN => AtnCommand::Unlisten,
            1 => AtnCommand::Listen(p.device().value()),
            2 if primary == UNTALK => AtnCommand::Untalk,
            2 => AtnCommand::Talk(p.device().value()),
            _ => AtnCommand::Other(primary),
        }
    }
}

/// Decoded secondary address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryCommand {
    /// `0xF?`: open the named channel; file name follows on the data phase.
    Open(u8),
    /// `0xE?`: close the channel.
    Close(u8),
    /// `0x6?`: data transfer on an open channel.
    Data(u8),
    Other(u8),
}

impl SecondaryCommand {
    pub fn decode(secondary: u8) -> SecondaryCommand {
        let s = Secondary::new_with_raw_value(secondary);
        let ch = s.channel().value();
        match s.mode().value() {
            0xF => SecondaryCommand::Open(ch),
            0xE => SecondaryCommand::Close(ch),
            0x6 => SecondaryCommand::Data(ch),
            _ => SecondaryCommand::Other(secondary),
        }
    }

    pub fn channel(&self) -> u8 {
        match *self {
            SecondaryCommand::Open(ch)
            | SecondaryCommand::Close(ch)
            | SecondaryCommand::Data(ch) => ch,
            SecondaryCommand::Other(raw) => raw & 0x0F,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primary_decoding() {
        assert_eq!(AtnCommand::decode(0x28), AtnCommand::Listen(8));
        assert_eq!(AtnCommand::decode(0x3F), AtnCommand::Unlisten);
        assert_eq!(AtnCommand::decode(0x49), AtnCommand::Talk(9));
        assert_eq!(AtnCommand::decode(0x5F), AtnCommand::Untalk);
        assert_eq!(AtnCommand::decode(0x00), AtnCommand::Other(0x00));
    }

    #[test]
    fn secondary_decoding() {
        assert_eq!(SecondaryCommand::decode(0xF0), SecondaryCommand::Open(0));
        assert_eq!(SecondaryCommand::decode(0xE2), SecondaryCommand::Close(2));
        assert_eq!(SecondaryCommand::decode(0x6F), SecondaryCommand::Data(15));
        assert_eq!(SecondaryCommand::decode(0x10), SecondaryCommand::Other(0x10));
    }
}
