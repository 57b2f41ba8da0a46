/// Buffered I/O channel to the debugged program
///
/// The inferior's stdio is wired to a pseudo-terminal; [`InferiorIo`] owns
/// the master side and offers timeout-bounded reads with a push-back buffer.
/// Bytes are returned exactly once and in order: anything read from the
/// descriptor but not handed to the caller stays in the buffer for the next
/// call.
///
/// This type is synchronous and meant for a single owner.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bytes requested per underlying read
pub const READ_CHUNK: usize = 4096;

/// Wait used by callers that poll in a loop
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Timed out after {0:?} waiting for delimiter")]
    Timeout(Duration),
    #[error("Inferior stream closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StreamError>;

/// Raw byte transport underneath an [`InferiorIo`]
pub trait Transport {
    /// Block up to `timeout` for readable data; `Ok(false)` on timeout
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;
    /// Read once; `Ok(0)` means end of stream
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Transport over an owned file descriptor, typically a pty master
pub struct FdTransport {
    file: File,
}

impl FdTransport {
    pub fn new(fd: OwnedFd) -> Self {
        Self { file: File::from(fd) }
    }
}

impl Transport for FdTransport {
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = u16::try_from(remaining.as_micros().div_ceil(1000)).unwrap_or(u16::MAX);
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];

            match poll(&mut fds, millis) {
                Ok(0) if Instant::now() >= deadline => return Ok(false),
                Ok(0) => continue,
                // POLLHUP and POLLERR count as readable; the read reports them
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.read(buf) {
            // a pty master reports EIO once the slave side is closed
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => Ok(0),
            other => other,
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.file.flush()
    }
}

/// Stream channel to the inferior's standard I/O
pub struct InferiorIo<T: Transport = FdTransport> {
    transport: T,
    buffer: Vec<u8>,
}

impl InferiorIo<FdTransport> {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::new(FdTransport::new(fd))
    }
}

impl<T: Transport> InferiorIo<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            buffer: Vec::new(),
        }
    }

    /// Bytes already read but not yet returned
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.transport.write_all(data)?;
        Ok(data.len())
    }

    pub fn sendline(&mut self, data: &[u8]) -> Result<usize> {
        let mut line = Vec::with_capacity(data.len() + 1);
        line.extend_from_slice(data);
        line.push(b'\n');
        self.send(&line)
    }

    /// Read up to `max_size` bytes
    ///
    /// Buffered bytes are served first without touching the descriptor.
    /// Otherwise waits up to `timeout`; an empty result means nothing arrived.
    pub fn recv(&mut self, max_size: usize, timeout: Duration) -> Result<Vec<u8>> {
        if max_size == 0 {
            return Ok(Vec::new());
        }

        if !self.buffer.is_empty() {
            let n = max_size.min(self.buffer.len());
            return Ok(self.buffer.drain(..n).collect());
        }

        if !self.transport.wait_readable(timeout)? {
            return Ok(Vec::new());
        }

        let mut data = vec![0u8; max_size.max(READ_CHUNK)];
        let n = self.transport.read(&mut data)?;
        if n == 0 {
            return Err(StreamError::Closed);
        }
        data.truncate(n);

        if n > max_size {
            self.buffer.extend_from_slice(&data[max_size..]);
            data.truncate(max_size);
        }
        Ok(data)
    }

    /// Read until `delim` appears, failing with [`StreamError::Timeout`]
    /// if it does not within `timeout`
    ///
    /// Bytes after the delimiter are kept for later calls. With `drop` the
    /// delimiter is consumed but not returned. On failure everything read so
    /// far is kept as well.
    pub fn recv_until(&mut self, delim: &[u8], drop: bool, timeout: Duration) -> Result<Vec<u8>> {
        if delim.is_empty() {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + timeout;
        let mut data: Vec<u8> = Vec::new();
        let mut searched = 0;

        loop {
            if let Some(pos) = find(&data[searched..], delim).map(|p| p + searched) {
                let rest = data.split_off(pos + delim.len());
                self.unrecv(rest);
                if drop {
                    data.truncate(pos);
                }
                return Ok(data);
            }
            // a delimiter may straddle the next read
            searched = data.len().saturating_sub(delim.len() - 1);

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && self.buffer.is_empty() {
                self.unrecv(data);
                return Err(StreamError::Timeout(timeout));
            }

            match self.recv(READ_CHUNK, remaining) {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => {
                    self.unrecv(data);
                    return Err(e);
                }
            }
        }
    }

    pub fn recv_line(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.recv_until(b"\n", false, timeout)
    }

    /// Wait for `delim`, discard everything up to it, then send
    pub fn send_after(&mut self, delim: &[u8], data: &[u8], timeout: Duration) -> Result<usize> {
        self.recv_until(delim, false, timeout)?;
        self.send(data)
    }

    pub fn sendline_after(
        &mut self,
        delim: &[u8],
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.recv_until(delim, false, timeout)?;
        self.sendline(data)
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn unrecv(&mut self, mut bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        bytes.append(&mut self.buffer);
        self.buffer = bytes;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
