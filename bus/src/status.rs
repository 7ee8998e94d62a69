//! CBM-DOS style status responses for the command channel.

use core::fmt::{self, Write};

/// The well-known CBM DOS error codes surfaced on channel 15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DosError {
    Ok = 0,
    FilesScratched = 1,
    ReadErrorBlockHeader = 20,
    ReadErrorSyncMark = 21,
    ReadErrorDataBlock = 22,
    ReadErrorChecksum = 23,
    WriteErrorVerify = 25,
    WriteProtectOn = 26,
    SyntaxError = 30,
    SyntaxUnknownCommand = 31,
    SyntaxLineTooLong = 32,
    SyntaxInvalidName = 33,
    SyntaxNoName = 34,
    FileTooLarge = 52,
    FileOpenForWrite = 60,
    FileNotOpen = 61,
    FileNotFound = 62,
    FileExists = 63,
    FileTypeMismatch = 64,
    NoChannel = 70,
    DirError = 71,
    DiskFull = 72,
    DosVersion = 73,
    DriveNotReady = 74,
}

impl DosError {
    pub fn text(self) -> &'static str {
        match self {
            DosError::Ok => " OK",
            DosError::FilesScratched => "FILES SCRATCHED",
            DosError::ReadErrorBlockHeader
            | DosError::ReadErrorSyncMark
            | DosError::ReadErrorDataBlock
            | DosError::ReadErrorChecksum => "READ ERROR",
            DosError::WriteErrorVerify => "WRITE ERROR",
            DosError::WriteProtectOn => "WRITE PROTECT ON",
            DosError::SyntaxError
            | DosError::SyntaxUnknownCommand
            | DosError::SyntaxLineTooLong
            | DosError::SyntaxInvalidName
            | DosError::SyntaxNoName => "SYNTAX ERROR",
            DosError::FileTooLarge => "FILE TOO LARGE",
            DosError::FileOpenForWrite => "WRITE FILE OPEN",
            DosError::FileNotOpen => "FILE NOT OPEN",
            DosError::FileNotFound => "FILE NOT FOUND",
            DosError::FileExists => "FILE EXISTS",
            DosError::FileTypeMismatch => "FILE TYPE MISMATCH",
            DosError::NoChannel => "NO CHANNEL",
            DosError::DirError => "DIR ERROR",
            DosError::DiskFull => "DISK FULL",
            DosError::DosVersion => "FERRIEC DOS V1.0",
            DosError::DriveNotReady => "DRIVE NOT READY",
        }
    }
}

/// One `<code>,<text>,<track>,<sector>` status line.
#[derive(Debug, Clone, Copy)]
pub struct Status {
    pub code: DosError,
    pub track: u8,
    pub sector: u8,
}

impl Status {
    pub const fn new(code: DosError) -> Self {
        Status {
            code,
            track: 0,
            sector: 0,
        }
    }

    pub const fn with_position(code: DosError, track: u8, sector: u8) -> Self {
        Status {
            code,
            track,
            sector,
        }
    }

    pub const fn ok() -> Self {
        Status::new(DosError::Ok)
    }

    /// Power-up / reset status (`73,...`).
    pub const fn version() -> Self {
        Status::new(DosError::DosVersion)
    }

    /// Render the DOS status line (terminated by CR) into `buf`; returns the
    /// number of bytes written. Truncates if `buf` is too small.
    pub fn render(&self, buf: &mut [u8]) -> usize {
        let mut w = SliceWriter { buf, len: 0 };
        let _ = write!(
            w,
            "{:02},{},{:02},{:02}\r",
            self.code as u8,
            self.code.text(),
            self.track,
            self.sector
        );
        w.len
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        if n < s.len() {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn renders_ok_line() {
        let mut buf = [0u8; 32];
        let n = Status::ok().render(&mut buf);
        assert_eq!(&buf[..n], b"00, OK,00,00\r");
    }

    #[test]
    fn renders_error_with_position() {
        let mut buf = [0u8; 32];
        let n = Status::with_position(DosError::ReadErrorSyncMark, 18, 1).render(&mut buf);
        assert_eq!(&buf[..n], b"21,READ ERROR,18,01\r");
    }

    #[test]
    fn truncates_to_buffer() {
        let mut buf = [0u8; 4];
        let n = Status::version().render(&mut buf);
        assert_eq!(n, 4);
        assert_eq!(&buf, b"73,F");
    }
}
