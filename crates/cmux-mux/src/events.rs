use crate::channel::MuxChannel;

/// Something the engine reports once its lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxEvent {
    /// The peer opened the control channel.
    ControlChannelOpened,
    /// The peer opened a data channel.
    ChannelOpened(u8),
}

/// Callbacks for peer-initiated establishment.
///
/// Invoked on the scheduler thread with no engine lock held. Writing to a
/// channel from here is fine; blocking opens return
/// [`MuxError::Reentrant`](crate::MuxError::Reentrant).
pub trait MuxEvents: Send + Sync {
    fn on_control_channel_open(&self) {}

    fn on_channel_open(&self, channel: MuxChannel, dlci: u8) {
        let _ = (channel, dlci);
    }
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl MuxEvents for NoEvents {}
