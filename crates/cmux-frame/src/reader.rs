use std::io::{ErrorKind, Read};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::buffer::FrameBuffer;
use crate::codec::{checksum, classify, Address, Frame, EA_BIT, FLAG, HEADER_LEN, PF_BIT};
use crate::error::{FrameError, Result};

/// Receive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Hunting for the first flag octet.
    FrameStart,
    /// Reading address, control and length.
    HeaderRead,
    /// Reading payload, FCS and closing flag.
    TrailerRead,
    /// A delivered frame is parked; nothing is read until [`FrameReader::resume`].
    Suspend,
}

/// Incremental receive state machine over a non-blocking stream.
///
/// Holds at most one partially received frame. Once the first flag has been
/// seen the reader stays synchronised: after every frame it restarts in
/// [`RxState::HeaderRead`] with the flag already consumed.
pub struct FrameReader {
    buf: FrameBuffer,
    state: RxState,
    remaining: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: FrameBuffer::new(),
            state: RxState::FrameStart,
            remaining: 1,
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        self.state == RxState::Suspend
    }

    /// Stop reading until [`resume`](Self::resume) is called.
    ///
    /// Only valid between frames, i.e. right after `read_frame` returned one.
    pub fn suspend(&mut self) {
        debug!("receive suspended");
        self.state = RxState::Suspend;
    }

    /// Leave [`RxState::Suspend`] and wait for the next header.
    pub fn resume(&mut self) {
        if self.state == RxState::Suspend {
            debug!("receive resumed");
            self.begin_header();
        }
    }

    /// Drive the state machine with whatever `src` has available.
    ///
    /// Returns `Ok(Some(frame))` for each completed frame and `Ok(None)` once
    /// the source has nothing more to give (or the reader is suspended).
    /// Frames with a bad FCS are dropped. Multi-byte lengths and unknown
    /// frame types are protocol violations and returned as errors.
    pub fn read_frame<R: Read>(&mut self, src: &mut R) -> Result<Option<Frame>> {
        loop {
            match self.state {
                RxState::Suspend => return Ok(None),
                RxState::FrameStart => {
                    let Some(byte) = read_byte(src)? else {
                        return Ok(None);
                    };
                    if byte == FLAG {
                        self.buf.clear();
                        self.buf.push(FLAG)?;
                        self.begin_header();
                    }
                }
                RxState::HeaderRead => {
                    if self.buf.len() == 1 {
                        // Address position: repeated flags are inter-frame fill.
                        let Some(byte) = read_byte(src)? else {
                            return Ok(None);
                        };
                        if byte != FLAG {
                            self.buf.push(byte)?;
                            self.remaining -= 1;
                        }
                        continue;
                    }

                    if self.fill(src)? == 0 {
                        return Ok(None);
                    }
                    if self.remaining == 0 {
                        let length = self.buf.as_slice()[HEADER_LEN];
                        if length & EA_BIT == 0 {
                            return Err(FrameError::InvalidLength(length));
                        }
                        // Payload, FCS and closing flag.
                        self.remaining = usize::from(length >> 1) + 2;
                        self.state = RxState::TrailerRead;
                    }
                }
                RxState::TrailerRead => {
                    if self.fill(src)? == 0 {
                        return Ok(None);
                    }
                    if self.remaining == 0 {
                        if let Some(frame) = self.complete()? {
                            return Ok(Some(frame));
                        }
                    }
                }
            }
        }
    }

    fn begin_header(&mut self) {
        self.buf.truncate(1);
        self.remaining = HEADER_LEN;
        self.state = RxState::HeaderRead;
    }

    fn fill<R: Read>(&mut self, src: &mut R) -> Result<usize> {
        let n = self.buf.read_from(src, self.remaining)?;
        self.remaining -= n;
        Ok(n)
    }

    /// Validate the assembled frame and reset for the next one.
    fn complete(&mut self) -> Result<Option<Frame>> {
        let bytes = self.buf.as_slice();
        let total = bytes.len();
        let closing = bytes[total - 1];
        let header = [bytes[1], bytes[2], bytes[3]];
        let fcs = bytes[total - 2];
        let payload = Bytes::copy_from_slice(&bytes[1 + HEADER_LEN..total - 2]);

        if closing != FLAG {
            warn!(closing, "frame not terminated by flag; resynchronising");
            self.buf.clear();
            self.remaining = 1;
            self.state = RxState::FrameStart;
            return Ok(None);
        }

        self.begin_header();

        let expected = checksum(&header);
        if expected != fcs {
            warn!(
                address = header[0],
                expected, actual = fcs, "dropping frame with bad checksum"
            );
            return Ok(None);
        }

        let kind = classify(header[1])?;
        Ok(Some(Frame {
            address: Address::from_octet(header[0]),
            kind,
            poll_final: header[1] & PF_BIT != 0,
            payload,
        }))
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("state", &self.state)
            .field("offset", &self.buf.len())
            .field("remaining", &self.remaining)
            .finish()
    }
}

fn read_byte<R: Read>(src: &mut R) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match src.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
}
