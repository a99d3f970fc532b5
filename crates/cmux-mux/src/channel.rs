use std::sync::Arc;
use std::time::{Duration, Instant};

use cmux_frame::RxState;

use crate::engine::ChannelReadiness;
use crate::error::{MuxError, Result};
use crate::mux::{Shared, Task};

/// Handle to one established data channel.
///
/// Handles are cheap to clone and may be used from any thread. The inherent
/// [`read`](Self::read) and [`write`](Self::write) never block; the
/// `std::io::Read`/`Write` impls block until data arrives or the transmit
/// path frees up.
#[derive(Clone)]
pub struct MuxChannel {
    dlci: u8,
    shared: Arc<Shared>,
}

impl MuxChannel {
    pub(crate) fn new(dlci: u8, shared: Arc<Shared>) -> Self {
        Self { dlci, shared }
    }

    pub fn dlci(&self) -> u8 {
        self.dlci
    }

    /// Send up to one frame of `data`.
    ///
    /// Returns the number of bytes taken. [`MuxError::WouldBlock`] means the
    /// transmit path is busy; the registered notification fires once it is
    /// this channel's turn.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut engine = self.shared.lock()?;
        let written = engine.channel_write(self.dlci, data)?;
        let pending = engine.wants_write();
        drop(engine);

        if pending {
            self.shared.post(Task::Kick)?;
        }
        Ok(written)
    }

    /// Take buffered inbound bytes. [`MuxError::WouldBlock`] when none are
    /// buffered.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_until(buf, Some(Instant::now()))
    }

    /// Block for inbound bytes, at most `timeout` if given.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if self.shared.on_worker() {
            return Err(MuxError::Reentrant);
        }
        self.read_until(buf, timeout.map(|timeout| Instant::now() + timeout))
    }

    pub fn poll(&self) -> Result<ChannelReadiness> {
        self.shared.lock()?.channel_poll(self.dlci)
    }

    /// Call `notify` on the scheduler thread when a previously refused write
    /// can be retried. Replaces any earlier registration.
    pub fn register_notification<F>(&self, notify: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.set_notifier(self.dlci, Arc::new(notify))
    }

    fn read_until(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
        let mut engine = self.shared.lock()?;
        loop {
            let suspended = engine.rx_state() == RxState::Suspend;
            match engine.channel_read(self.dlci, buf) {
                Ok(n) => {
                    let resumed = suspended && engine.rx_state() != RxState::Suspend;
                    drop(engine);
                    if resumed {
                        self.shared.post(Task::Resume)?;
                    }
                    return Ok(n);
                }
                Err(MuxError::WouldBlock) => engine = self.shared.wait(engine, deadline)?,
                Err(err) => return Err(err),
            }
        }
    }

    fn write_blocking(&self, data: &[u8]) -> Result<usize> {
        if self.shared.on_worker() {
            return Err(MuxError::Reentrant);
        }
        let mut engine = self.shared.lock()?;
        loop {
            match engine.channel_write(self.dlci, data) {
                Ok(written) => {
                    let pending = engine.wants_write();
                    drop(engine);
                    if pending {
                        self.shared.post(Task::Kick)?;
                    }
                    return Ok(written);
                }
                Err(MuxError::WouldBlock) => engine = self.shared.wait(engine, None)?,
                Err(err) => return Err(err),
            }
        }
    }
}

impl std::io::Read for MuxChannel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.read_timeout(buf, None) {
            Ok(n) => Ok(n),
            // End of stream once the session is over and the buffer is drained.
            Err(MuxError::Terminated(_)) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

impl std::io::Write for MuxChannel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_blocking(buf).map_err(Into::into)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MuxChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxChannel")
            .field("dlci", &self.dlci)
            .finish()
    }
}
