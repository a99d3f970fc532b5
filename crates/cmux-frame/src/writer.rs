use std::io::{ErrorKind, Write};

use tracing::trace;

use crate::buffer::FrameBuffer;
use crate::codec::{encode_frame, Address, FrameKind, Role};
use crate::error::{FrameError, Result};

/// Outcome of one [`FrameWriter::flush`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// Every byte of the loaded frame has been accepted by the sink.
    Complete,
    /// The sink stopped accepting bytes; call again when it is writable.
    Pending,
}

/// Transmit buffer holding the single in-flight outbound frame.
///
/// A frame is loaded, then flushed across as many partial writes as the sink
/// needs. [`rewind`](Self::rewind) restarts transmission of the same bytes,
/// which is how retransmission reuses the buffer.
pub struct FrameWriter {
    buf: FrameBuffer,
    offset: usize,
    dlci: u8,
    kind: Option<FrameKind>,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self {
            buf: FrameBuffer::new(),
            offset: 0,
            dlci: 0,
            kind: None,
        }
    }

    /// Load a command (`SABM`, `DISC`) with the P bit set.
    pub fn load_request(&mut self, dlci: u8, kind: FrameKind, role: Role) -> Result<()> {
        self.load(dlci, kind, role, true, &[])
    }

    /// Load a response (`UA`, `DM`) with the F bit set.
    pub fn load_response(&mut self, dlci: u8, kind: FrameKind, role: Role) -> Result<()> {
        self.load(dlci, kind, role, true, &[])
    }

    /// Load a `UIH` data frame. At most [`MAX_PAYLOAD`](crate::MAX_PAYLOAD)
    /// bytes are accepted.
    pub fn load_data(&mut self, dlci: u8, role: Role, payload: &[u8]) -> Result<()> {
        self.load(dlci, FrameKind::Uih, role, false, payload)
    }

    fn load(
        &mut self,
        dlci: u8,
        kind: FrameKind,
        role: Role,
        poll_final: bool,
        payload: &[u8],
    ) -> Result<()> {
        let address = Address::for_frame(dlci, kind, role);
        encode_frame(&mut self.buf, address, kind, poll_final, payload)?;
        self.offset = 0;
        self.dlci = dlci;
        self.kind = Some(kind);
        trace!(
            dlci,
            kind = kind.name(),
            len = self.buf.len(),
            "frame loaded"
        );
        Ok(())
    }

    /// Bytes of the loaded frame not yet written.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Bytes of the loaded frame already written.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Restart transmission of the loaded frame from its first byte.
    pub fn rewind(&mut self) {
        self.offset = 0;
    }

    /// The loaded frame, flags included.
    pub fn frame(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn dlci(&self) -> u8 {
        self.dlci
    }

    pub fn kind(&self) -> Option<FrameKind> {
        self.kind
    }

    /// Drop the loaded frame.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.offset = 0;
        self.kind = None;
    }

    /// Write as much of the remaining frame as `dst` accepts.
    ///
    /// `WouldBlock` yields [`WriteProgress::Pending`]; a sink that accepts zero
    /// bytes is reported as a `WriteZero` I/O error.
    pub fn flush<W: Write>(&mut self, dst: &mut W) -> Result<WriteProgress> {
        while self.offset < self.buf.len() {
            match dst.write(&self.buf.as_slice()[self.offset..]) {
                Ok(0) => {
                    return Err(FrameError::Io(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "transport accepted zero bytes",
                    )));
                }
                Ok(n) => self.offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::Pending);
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(WriteProgress::Complete)
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("dlci", &self.dlci)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("len", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `budget` bytes, then reports `WouldBlock`.
    struct Throttled {
        written: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget == 0 {
                return Err(std::io::Error::from(ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.budget);
            self.written.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn control_channel_requests_and_responses() {
        let mut writer = FrameWriter::new();

        writer
            .load_request(0, FrameKind::Sabm, Role::Initiator)
            .unwrap();
        assert_eq!(writer.frame(), &[0xF9, 0x03, 0x3F, 0x01, 0x1C, 0xF9]);

        writer
            .load_response(0, FrameKind::Ua, Role::Responder)
            .unwrap();
        assert_eq!(writer.frame(), &[0xF9, 0x03, 0x73, 0x01, 0xD7, 0xF9]);

        writer
            .load_response(0, FrameKind::Dm, Role::Responder)
            .unwrap();
        assert_eq!(writer.frame(), &[0xF9, 0x03, 0x1F, 0x01, 0x36, 0xF9]);
    }

    #[test]
    fn data_channel_addresses_follow_role() {
        let mut writer = FrameWriter::new();

        writer
            .load_request(1, FrameKind::Sabm, Role::Initiator)
            .unwrap();
        assert_eq!(writer.frame(), &[0xF9, 0x07, 0x3F, 0x01, 0xDE, 0xF9]);

        writer
            .load_response(1, FrameKind::Ua, Role::Initiator)
            .unwrap();
        assert_eq!(writer.frame(), &[0xF9, 0x05, 0x73, 0x01, 0x74, 0xF9]);

        writer
            .load_response(1, FrameKind::Dm, Role::Responder)
            .unwrap();
        assert_eq!(writer.frame(), &[0xF9, 0x07, 0x1F, 0x01, 0xF4, 0xF9]);

        writer.load_data(1, Role::Initiator, b"hello").unwrap();
        assert_eq!(
            writer.frame(),
            &[0xF9, 0x07, 0xEF, 0x0B, b'h', b'e', b'l', b'l', b'o', 0xDA, 0xF9]
        );
        assert_eq!(writer.kind(), Some(FrameKind::Uih));
        assert_eq!(writer.dlci(), 1);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut writer = FrameWriter::new();
        let result = writer.load_data(1, Role::Initiator, &[0u8; 128]);
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 128, max: 127 })
        ));
    }

    #[test]
    fn flush_resumes_after_partial_write() {
        let mut writer = FrameWriter::new();
        writer
            .load_request(0, FrameKind::Sabm, Role::Initiator)
            .unwrap();
        let mut sink = Throttled {
            written: Vec::new(),
            budget: 4,
        };

        assert_eq!(writer.flush(&mut sink).unwrap(), WriteProgress::Pending);
        assert_eq!(writer.offset(), 4);
        assert_eq!(writer.remaining(), 2);

        sink.budget = 16;
        assert_eq!(writer.flush(&mut sink).unwrap(), WriteProgress::Complete);
        assert_eq!(sink.written, writer.frame());
    }

    #[test]
    fn rewind_sends_the_same_frame_again() {
        let mut writer = FrameWriter::new();
        writer
            .load_request(2, FrameKind::Sabm, Role::Initiator)
            .unwrap();
        let mut sink = Vec::new();

        writer.flush(&mut sink).unwrap();
        assert_eq!(writer.remaining(), 0);
        writer.rewind();
        writer.flush(&mut sink).unwrap();

        let expected = [0xF9, 0x0B, 0x3F, 0x01, 0x59, 0xF9];
        assert_eq!(&sink[..6], &expected);
        assert_eq!(&sink[6..], &expected);
    }

    #[test]
    fn zero_length_write_is_an_error() {
        struct Stuck;
        impl Write for Stuck {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut writer = FrameWriter::new();
        writer
            .load_request(0, FrameKind::Sabm, Role::Initiator)
            .unwrap();
        let err = writer.flush(&mut Stuck).unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WriteZero));
    }
}
