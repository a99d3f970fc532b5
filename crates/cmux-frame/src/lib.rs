//! GSM 07.10 / 3GPP 27.010 basic-option framing.
//!
//! Every frame on the wire looks like:
//! - opening flag `0xF9`
//! - address (DLCI, C/R bit, EA bit)
//! - control (frame type, P/F bit)
//! - one length octet (EA bit set; payloads are at most 127 bytes)
//! - payload
//! - CRC-8 frame check sequence over address, control and length
//! - closing flag `0xF9`
//!
//! [`FrameReader`] assembles frames incrementally from a non-blocking stream,
//! [`FrameWriter`] holds the single in-flight outbound frame.

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use buffer::FrameBuffer;
pub use channel::{channel_name, is_valid_dlci, CONTROL_DLCI, MAX_DLCI, MIN_DLCI};
pub use codec::{
    checksum, classify, decode_frame, encode_frame, Address, Frame, FrameKind, Role, FLAG,
    MAX_FRAME_LEN, MAX_PAYLOAD, PF_BIT,
};
pub use error::{FrameError, Result};
pub use reader::{FrameReader, RxState};
pub use writer::{FrameWriter, WriteProgress};
