//! Channel-15 command grammar.
//!
//! DOS commands arrive as raw bytes: a short ASCII mnemonic, for the memory
//! commands followed by a little-endian address and binary payload.

use nom::bytes::complete::{tag, take};
use nom::number::complete::{le_u16, u8 as byte};
use nom::IResult;

/// A parsed command-channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DosCommand<'a> {
    /// `M-R <lo> <hi> <len>`
    MemoryRead { addr: u16, len: u8 },
    /// `M-W <lo> <hi> <len> <data…>`
    MemoryWrite { addr: u16, data: &'a [u8] },
    /// `M-E <lo> <hi>`
    MemoryExecute { addr: u16 },
    /// DolphinDOS `XQ` (burst load follows)
    BurstLoad,
    /// DolphinDOS `XZ` (burst save follows)
    BurstSave,
    /// DolphinDOS `XF+` / `XF-`
    BurstEnable(bool),
    /// Anything else; handed to the device's `execute` hook.
    Other(&'a [u8]),
}

fn mem_read(i: &[u8]) -> IResult<&[u8], DosCommand> {
    let (i, _) = tag("M-R")(i)?;
    let (i, addr) = le_u16(i)?;
    let (i, len) = byte(i)?;
    Ok((i, DosCommand::MemoryRead { addr, len }))
}

fn mem_write(i: &[u8]) -> IResult<&[u8], DosCommand> {
    let (i, _) = tag("M-W")(i)?;
    let (i, addr) = le_u16(i)?;
    let (i, len) = byte(i)?;
    let (i, data) = take(len as usize)(i)?;
    Ok((i, DosCommand::MemoryWrite { addr, data }))
}

fn mem_execute(i: &[u8]) -> IResult<&[u8], DosCommand> {
    let (i, _) = tag("M-E")(i)?;
    let (i, addr) = le_u16(i)?;
    Ok((i, DosCommand::MemoryExecute { addr }))
}

/// Parse one command-channel transmission. Never fails; unrecognized input
/// becomes [`DosCommand::Other`]. The Dolphin burst commands only match
/// exactly (a file named "XQ..." must not trigger a burst).
pub fn parse(input: &[u8]) -> DosCommand {
    if let Ok((_, cmd)) = mem_write(input) {
        return cmd;
    }
    if let Ok((_, cmd)) = mem_read(input) {
        return cmd;
    }
    if let Ok((_, cmd)) = mem_execute(input) {
        return cmd;
    }
    match input {
        b"XQ" => DosCommand::BurstLoad,
        b"XZ" => DosCommand::BurstSave,
        b"XF+" => DosCommand::BurstEnable(true),
        b"XF-" => DosCommand::BurstEnable(false),
        other => DosCommand::Other(other),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_memory_write() {
        let cmd = parse(b"M-W\x80\x01\x03\xAA\xBB\xCC");
        assert_eq!(
            cmd,
            DosCommand::MemoryWrite {
                addr: 0x0180,
                data: b"\xAA\xBB\xCC"
            }
        );
    }

    #[test]
    fn parses_memory_read_of_fffe() {
        let cmd = parse(b"M-R\xFE\xFF\x01");
        assert_eq!(
            cmd,
            DosCommand::MemoryRead {
                addr: 0xFFFE,
                len: 1
            }
        );
    }

    #[test]
    fn parses_memory_execute() {
        assert_eq!(
            parse(b"M-E\x9A\x05"),
            DosCommand::MemoryExecute { addr: 0x059A }
        );
    }

    #[test]
    fn truncated_memory_write_is_other() {
        // length byte promises more data than was sent
        assert!(matches!(parse(b"M-W\x00\x05\x23ab"), DosCommand::Other(_)));
    }

    #[test]
    fn burst_commands_match_exactly() {
        assert_eq!(parse(b"XQ"), DosCommand::BurstLoad);
        assert_eq!(parse(b"XZ"), DosCommand::BurstSave);
        assert_eq!(parse(b"XF+"), DosCommand::BurstEnable(true));
        assert!(matches!(parse(b"XQ:FILE"), DosCommand::Other(_)));
    }

    #[test]
    fn plain_commands_are_other() {
        assert!(matches!(parse(b"I0"), DosCommand::Other(b"I0")));
    }
}
