use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::error::Result;

/// A byte-stream transport the multiplexer can drive.
///
/// Reads and writes must be non-blocking: `read` reports "no data" with
/// `ErrorKind::WouldBlock` (or `Ok(0)`), `write` may accept fewer bytes than
/// offered. Readiness is discovered by polling the raw descriptor.
pub trait Transport: Read + Write + AsRawFd + Send {
    /// Transport name for diagnostics.
    fn transport_name(&self) -> &'static str;
}

/// A connected non-blocking byte stream: a serial tty or a Unix socket.
pub struct SerialStream {
    inner: SerialStreamInner,
}

enum SerialStreamInner {
    Tty(File),
    Unix(UnixStream),
}

impl Read for SerialStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            SerialStreamInner::Tty(file) => file.read(buf),
            SerialStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for SerialStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            SerialStreamInner::Tty(file) => file.write(buf),
            SerialStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            SerialStreamInner::Tty(file) => file.flush(),
            SerialStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl AsRawFd for SerialStream {
    fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            SerialStreamInner::Tty(file) => file.as_raw_fd(),
            SerialStreamInner::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

impl Transport for SerialStream {
    fn transport_name(&self) -> &'static str {
        match &self.inner {
            SerialStreamInner::Tty(_) => "serial-tty",
            SerialStreamInner::Unix(_) => "unix-domain-socket",
        }
    }
}

impl SerialStream {
    /// Wrap an already configured, non-blocking tty file.
    pub(crate) fn from_tty(file: File) -> Self {
        Self {
            inner: SerialStreamInner::Tty(file),
        }
    }

    /// Wrap a Unix socket stream, switching it to non-blocking mode.
    pub fn from_unix(stream: UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            inner: SerialStreamInner::Unix(stream),
        })
    }

    /// A connected pair of in-process streams, one per multiplexer side.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair()?;
        Ok((Self::from_unix(left)?, Self::from_unix(right)?))
    }
}

impl std::fmt::Debug for SerialStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialStream")
            .field("type", &self.transport_name())
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use super::*;

    #[test]
    fn pair_is_non_blocking() {
        let (mut left, _right) = SerialStream::pair().unwrap();
        let mut buf = [0u8; 4];
        let err = left.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn pair_carries_bytes() {
        let (mut left, mut right) = SerialStream::pair().unwrap();
        left.write_all(&[0xF9, 0x03, 0x3F]).unwrap();

        let mut buf = [0u8; 8];
        let n = right.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0xF9, 0x03, 0x3F]);
        assert_eq!(right.transport_name(), "unix-domain-socket");
    }
}
