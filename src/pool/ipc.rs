//! Pipe I/O primitives for worker communication.
//!
//! [`PipeFd`] wraps one end of a pipe with EINTR handling. The worker side
//! reads commands with a [`CommandReader`] and writes replies with a
//! [`ReplyWriter`]; the dispatcher side drains its non-blocking read ends with
//! [`PipeFd::read_available`].

use super::codec::{LengthPrefixedCodec, LineCodec};
use super::protocol::{Command, Reply};
use crate::error::{ProcfanError, Result};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Size of a single dispatcher-side read (64KB).
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

/// Result of one non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were appended to the buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The write end is closed.
    Eof,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create from a raw file descriptor (takes ownership).
    ///
    /// # Safety
    /// The caller must ensure `fd` is a valid file descriptor that can be owned.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    /// Put the descriptor into non-blocking mode.
    pub fn set_nonblocking(&self) -> Result<()> {
        let flags = OFlag::from_bits_truncate(fcntl(&self.fd, FcntlArg::F_GETFL)?);
        fcntl(&self.fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        Ok(())
    }

    /// Perform one read and append whatever arrived to `buf`.
    pub fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<ReadStatus> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        match self.read(&mut chunk) {
            Ok(0) => Ok(ReadStatus::Eof),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                Ok(ReadStatus::Data(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadStatus::WouldBlock),
            Err(e) => Err(e),
        }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Blocking reader of newline-delimited commands (worker side).
pub struct CommandReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    codec: LineCodec,
}

impl<R: Read> CommandReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_CHUNK_SIZE, inner),
            line: Vec::with_capacity(4096),
            codec: LineCodec,
        }
    }

    /// Read the next command. Returns `None` on a clean EOF.
    ///
    /// A final line without a terminating newline is a truncated frame.
    pub fn next_command(&mut self) -> Result<Option<Command>> {
        self.line.clear();
        if self.reader.read_until(b'\n', &mut self.line)? == 0 {
            return Ok(None);
        }
        match self.codec.try_decode(&self.line)? {
            Some((command, _)) => Ok(Some(command)),
            None => Err(ProcfanError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "command stream ended in the middle of a line",
            ))),
        }
    }
}

/// Writer of length-prefixed replies (worker side).
pub struct ReplyWriter<W> {
    writer: W,
    codec: LengthPrefixedCodec,
}

impl<W: Write> ReplyWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            codec: LengthPrefixedCodec::default(),
        }
    }

    /// Encode and write one reply frame, then flush.
    pub fn send(&mut self, reply: &Reply) -> Result<()> {
        let frame = self.codec.encode(reply)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
