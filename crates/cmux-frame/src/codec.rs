use bytes::Bytes;

use crate::buffer::FrameBuffer;
use crate::channel::CONTROL_DLCI;
use crate::error::{FrameError, Result};

/// Flag sequence octet opening and closing every frame.
pub const FLAG: u8 = 0xF9;

/// Poll/Final bit in the control octet.
pub const PF_BIT: u8 = 0x10;

/// Extension bit in the address and length octets.
pub const EA_BIT: u8 = 0x01;

/// Command/Response bit in the address octet.
pub const CR_BIT: u8 = 0x02;

/// Address, control and length octets.
pub const HEADER_LEN: usize = 3;

/// Largest payload a single-octet length field can describe.
pub const MAX_PAYLOAD: usize = 127;

/// Opening flag + header + FCS + closing flag.
pub const FRAME_OVERHEAD: usize = 1 + HEADER_LEN + 1 + 1;

/// Largest frame on the wire.
pub const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MAX_PAYLOAD;

/// CRC-8 lookup table for the reflected polynomial x^8 + x^2 + x + 1 (0xE0).
const CRC_TABLE: [u8; 256] = crc_table();

const fn crc_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut index = 0;
    while index < 256 {
        let mut crc = index as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ 0xE0
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[index] = crc;
        index += 1;
    }
    table
}

/// Frame check sequence over `bytes`.
///
/// Starts from 0xFF, folds every byte through the table and returns the
/// ones' complement of the remainder.
pub fn checksum(bytes: &[u8]) -> u8 {
    let fcs = bytes
        .iter()
        .fold(0xFFu8, |fcs, &byte| CRC_TABLE[usize::from(fcs ^ byte)]);
    0xFF - fcs
}

/// Frame types handled by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Set Asynchronous Balanced Mode: open request.
    Sabm,
    /// Unnumbered Acknowledgement: request accepted.
    Ua,
    /// Disconnected Mode: request rejected / channel not open.
    Dm,
    /// Disconnect: close request.
    Disc,
    /// Unnumbered Information with Header check: user data.
    Uih,
}

impl FrameKind {
    /// Control octet value with the P/F bit clear.
    pub const fn code(self) -> u8 {
        match self {
            FrameKind::Sabm => 0x2F,
            FrameKind::Ua => 0x63,
            FrameKind::Dm => 0x0F,
            FrameKind::Disc => 0x43,
            FrameKind::Uih => 0xEF,
        }
    }

    /// Commands originate an exchange; responses answer one.
    pub const fn is_command(self) -> bool {
        matches!(self, FrameKind::Sabm | FrameKind::Disc | FrameKind::Uih)
    }

    pub const fn name(self) -> &'static str {
        match self {
            FrameKind::Sabm => "SABM",
            FrameKind::Ua => "UA",
            FrameKind::Dm => "DM",
            FrameKind::Disc => "DISC",
            FrameKind::Uih => "UIH",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Map a control octet to its frame type, ignoring the P/F bit.
pub fn classify(control: u8) -> Result<FrameKind> {
    match control & !PF_BIT {
        0x2F => Ok(FrameKind::Sabm),
        0x63 => Ok(FrameKind::Ua),
        0x0F => Ok(FrameKind::Dm),
        0x43 => Ok(FrameKind::Disc),
        0xEF => Ok(FrameKind::Uih),
        _ => Err(FrameError::UnsupportedFrameType(control)),
    }
}

/// Which side opened the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the SABM on DLCI 0.
    Initiator,
    /// Answered the SABM on DLCI 0.
    Responder,
}

/// Address octet: `dlci << 2 | C/R << 1 | EA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(u8);

impl Address {
    pub fn new(dlci: u8, command_response: bool) -> Self {
        let cr = if command_response { CR_BIT } else { 0 };
        Self(((dlci & 0x3F) << 2) | cr | EA_BIT)
    }

    /// Address for a frame of `kind` sent by the side playing `role`.
    ///
    /// Initiator commands and responder responses carry C/R = 1, the other two
    /// combinations carry 0. DLCI 0 always uses C/R = 1.
    pub fn for_frame(dlci: u8, kind: FrameKind, role: Role) -> Self {
        let cr = dlci == CONTROL_DLCI
            || matches!(
                (kind.is_command(), role),
                (true, Role::Initiator) | (false, Role::Responder)
            );
        Self::new(dlci, cr)
    }

    pub const fn from_octet(octet: u8) -> Self {
        Self(octet)
    }

    pub const fn octet(self) -> u8 {
        self.0
    }

    pub const fn dlci(self) -> u8 {
        self.0 >> 2
    }

    pub const fn command_response(self) -> bool {
        self.0 & CR_BIT != 0
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: Address,
    pub kind: FrameKind,
    pub poll_final: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn dlci(&self) -> u8 {
        self.address.dlci()
    }

    /// The total wire size of this frame.
    pub fn wire_size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

/// Encode a frame into `dst`, replacing its contents.
///
/// Wire format:
/// ```text
/// ┌──────┬─────────┬─────────┬────────┬─────────┬─────┬──────┐
/// │ 0xF9 │ Address │ Control │ Length │ Payload │ FCS │ 0xF9 │
/// │      │  (1B)   │  (1B)   │  (1B)  │ (0-127) │(1B) │      │
/// └──────┴─────────┴─────────┴────────┴─────────┴─────┴──────┘
/// ```
/// The FCS covers address, control and length only.
pub fn encode_frame(
    dst: &mut FrameBuffer,
    address: Address,
    kind: FrameKind,
    poll_final: bool,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let control = if poll_final {
        kind.code() | PF_BIT
    } else {
        kind.code()
    };
    let header = [address.octet(), control, ((payload.len() as u8) << 1) | EA_BIT];

    dst.clear();
    dst.push(FLAG)?;
    dst.extend_from_slice(&header)?;
    dst.extend_from_slice(payload)?;
    dst.push(checksum(&header))?;
    dst.push(FLAG)
}

/// Decode one complete frame, flags included.
pub fn decode_frame(src: &[u8]) -> Result<Frame> {
    if src.len() < FRAME_OVERHEAD {
        return Err(FrameError::Truncated(src.len()));
    }
    if src[0] != FLAG {
        return Err(FrameError::MissingFlag(src[0]));
    }

    let length = src[3];
    if length & EA_BIT == 0 {
        return Err(FrameError::InvalidLength(length));
    }
    let payload_len = usize::from(length >> 1);
    let total = FRAME_OVERHEAD + payload_len;
    if src.len() < total {
        return Err(FrameError::Truncated(src.len()));
    }
    if src[total - 1] != FLAG {
        return Err(FrameError::MissingFlag(src[total - 1]));
    }

    let expected = checksum(&src[1..1 + HEADER_LEN]);
    let actual = src[total - 2];
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    let control = src[2];
    Ok(Frame {
        address: Address::from_octet(src[1]),
        kind: classify(control)?,
        poll_final: control & PF_BIT != 0,
        payload: Bytes::copy_from_slice(&src[4..4 + payload_len]),
    })
}
