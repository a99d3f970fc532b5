/// Errors returned by multiplexer operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] cmux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] cmux_frame::FrameError),

    /// DLCI outside `1..=63`.
    #[error("invalid channel id {0} (expected 1..=63)")]
    InvalidChannel(u8),

    /// The control channel has not been established yet.
    #[error("control channel is not open")]
    NotOpen,

    /// The control channel is already open.
    #[error("control channel is already open")]
    AlreadyOpen,

    /// A self-initiated establishment of the same kind is already pending or running.
    #[error("an establishment is already in progress")]
    InProgress,

    /// No channel with this DLCI has been established.
    #[error("channel {0} is not open")]
    ChannelNotOpen(u8),

    /// The channel is already allocated.
    #[error("channel {0} is already in use")]
    ChannelInUse(u8),

    /// Every slot of the channel pool is allocated.
    #[error("no free channel slots")]
    ResourceExhausted,

    /// The peer opened the channel before our own request went out.
    #[error("channel {0} was opened by the peer first")]
    AlreadySatisfied(u8),

    /// The peer answered the SABM with DM.
    #[error("peer rejected establishment of dlci {0}")]
    Rejected(u8),

    /// No answer after the initial SABM and every retransmission.
    #[error("no response for dlci {dlci} after {attempts} attempts")]
    Timeout { dlci: u8, attempts: u32 },

    /// The SABM could not be written to the transport.
    #[error("failed to send SABM for dlci {dlci}: {source}")]
    WriteFailed {
        dlci: u8,
        #[source]
        source: cmux_frame::FrameError,
    },

    /// The transmit path is busy; a notification follows once it is free.
    #[error("transmit path busy")]
    WouldBlock,

    /// A blocking call was made from the scheduler thread.
    #[error("blocking call from the scheduler thread")]
    Reentrant,

    /// The engine session has ended.
    #[error("multiplexer terminated: {0}")]
    Terminated(String),

    /// The engine lock was poisoned by a panicking callback.
    #[error("engine lock poisoned")]
    LockPoisoned,
}

impl From<MuxError> for std::io::Error {
    fn from(err: MuxError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            MuxError::WouldBlock => ErrorKind::WouldBlock,
            MuxError::Terminated(_) => ErrorKind::BrokenPipe,
            MuxError::Timeout { .. } => ErrorKind::TimedOut,
            MuxError::NotOpen => ErrorKind::NotConnected,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
