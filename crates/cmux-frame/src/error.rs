/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length octet uses the multi-byte encoding (EA bit clear).
    #[error("multi-byte length field not supported (length octet 0x{0:02X})")]
    InvalidLength(u8),

    /// The control octet names a frame type this engine does not handle.
    #[error("unsupported frame type (control octet 0x{0:02X})")]
    UnsupportedFrameType(u8),

    /// The payload does not fit a single-octet length field.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A write would run past the end of a fixed-capacity frame buffer.
    #[error("frame buffer overflow (capacity {capacity} bytes)")]
    BufferOverflow { capacity: usize },

    /// The frame check sequence does not match the header.
    #[error("checksum mismatch (expected 0x{expected:02X}, got 0x{actual:02X})")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// A frame boundary octet was not the flag sequence.
    #[error("expected flag 0xF9, got 0x{0:02X}")]
    MissingFlag(u8),

    /// The input ended before a complete frame.
    #[error("truncated frame ({0} bytes)")]
    Truncated(usize),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether this error breaks a protocol invariant (no recovery path exists).
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidLength(_) | FrameError::UnsupportedFrameType(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
