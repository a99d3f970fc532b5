use std::io::{ErrorKind, Read};

use crate::codec::MAX_FRAME_LEN;
use crate::error::{FrameError, Result};

/// Fixed-capacity byte buffer sized for one maximum-length frame.
///
/// All accumulation is bounds-checked; nothing here reallocates.
#[derive(Clone)]
pub struct FrameBuffer {
    bytes: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl FrameBuffer {
    /// Capacity in bytes.
    pub const CAPACITY: usize = MAX_FRAME_LEN;

    pub fn new() -> Self {
        Self {
            bytes: [0; MAX_FRAME_LEN],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Shorten the buffer, keeping the first `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len == Self::CAPACITY {
            return Err(self.overflow());
        }
        self.bytes[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    pub fn extend_from_slice(&mut self, src: &[u8]) -> Result<()> {
        let end = self.len + src.len();
        if end > Self::CAPACITY {
            return Err(self.overflow());
        }
        self.bytes[self.len..end].copy_from_slice(src);
        self.len = end;
        Ok(())
    }

    /// Read at most `want` bytes from `src` into the tail of the buffer.
    ///
    /// Returns `Ok(0)` when the source has nothing available (`WouldBlock` or
    /// a zero-length read). Interrupted reads are retried.
    pub fn read_from<R: Read>(&mut self, src: &mut R, want: usize) -> Result<usize> {
        let end = self.len + want;
        if end > Self::CAPACITY {
            return Err(self.overflow());
        }
        if want == 0 {
            return Ok(0);
        }

        loop {
            match src.read(&mut self.bytes[self.len..end]) {
                Ok(n) => {
                    self.len += n;
                    return Ok(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(0),
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    fn overflow(&self) -> FrameError {
        FrameError::BufferOverflow {
            capacity: Self::CAPACITY,
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.len)
            .field("bytes", &self.as_slice())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn push_and_extend() {
        let mut buf = FrameBuffer::new();
        buf.push(0xF9).unwrap();
        buf.extend_from_slice(&[0x03, 0x3F, 0x01]).unwrap();
        assert_eq!(buf.as_slice(), &[0xF9, 0x03, 0x3F, 0x01]);

        buf.truncate(1);
        assert_eq!(buf.as_slice(), &[0xF9]);
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn overflow_is_rejected() {
        let mut buf = FrameBuffer::new();
        buf.extend_from_slice(&[0u8; FrameBuffer::CAPACITY]).unwrap();
        assert!(matches!(
            buf.push(1),
            Err(FrameError::BufferOverflow { .. })
        ));
        assert_eq!(buf.len(), FrameBuffer::CAPACITY);
    }

    #[test]
    fn read_from_is_bounded_by_want() {
        let mut buf = FrameBuffer::new();
        let mut src = Cursor::new(vec![1u8, 2, 3, 4, 5]);

        assert_eq!(buf.read_from(&mut src, 3).unwrap(), 3);
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
        assert_eq!(buf.read_from(&mut src, 10).unwrap(), 2);
        assert_eq!(buf.read_from(&mut src, 10).unwrap(), 0);
    }

    #[test]
    fn read_from_past_capacity_fails() {
        let mut buf = FrameBuffer::new();
        let mut src = Cursor::new(vec![0u8; 4]);
        let result = buf.read_from(&mut src, FrameBuffer::CAPACITY + 1);
        assert!(matches!(result, Err(FrameError::BufferOverflow { .. })));
    }
}
