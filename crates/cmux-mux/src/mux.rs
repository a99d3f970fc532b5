//! Threaded runtime around [`Engine`].
//!
//! A single scheduler thread owns every protocol transition. It polls the
//! transport descriptor and a wake-up socket, honours the engine's T1
//! deadline through the poll timeout, and runs posted tasks. Callers open
//! channels from their own threads and block on a one-shot handoff until the
//! scheduler reports the outcome.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use cmux_frame::Role;
use cmux_transport::{poll, Interest, PollFd, Transport, TransportError};
use tracing::{debug, error, info, trace, warn};

use crate::channel::MuxChannel;
use crate::config::MuxConfig;
use crate::engine::Engine;
use crate::error::{MuxError, Result};
use crate::events::{MuxEvent, MuxEvents};

pub(crate) type Notifier = Arc<dyn Fn() + Send + Sync>;

type SharedEngine = Engine<Box<dyn Transport>>;

/// Work posted to the scheduler thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Task {
    /// Start queued establishments or pending writes.
    Kick,
    /// Receive was un-suspended; drain the transport again.
    Resume,
    /// Terminate the session and exit.
    Shutdown,
}

/// State shared between the scheduler thread, the [`Mux`] and channel handles.
pub(crate) struct Shared {
    engine: Mutex<SharedEngine>,
    changed: Condvar,
    tasks: Sender<Task>,
    wake: UnixStream,
    notifiers: Mutex<HashMap<u8, Notifier>>,
    worker: OnceLock<ThreadId>,
}

impl Shared {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, SharedEngine>> {
        self.engine.lock().map_err(|_| MuxError::LockPoisoned)
    }

    /// Block until the scheduler finishes a pass or `deadline` passes.
    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, SharedEngine>,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, SharedEngine>> {
        match deadline {
            None => self.changed.wait(guard).map_err(|_| MuxError::LockPoisoned),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(MuxError::WouldBlock);
                }
                let (guard, _) = self
                    .changed
                    .wait_timeout(guard, deadline - now)
                    .map_err(|_| MuxError::LockPoisoned)?;
                Ok(guard)
            }
        }
    }

    pub(crate) fn post(&self, task: Task) -> Result<()> {
        self.tasks
            .send(task)
            .map_err(|_| MuxError::Terminated("scheduler stopped".to_string()))?;
        loop {
            match (&self.wake).write(&[1]) {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // A full wake socket already guarantees a wake-up.
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(TransportError::Io(err).into()),
            }
        }
    }

    pub(crate) fn on_worker(&self) -> bool {
        self.worker.get() == Some(&thread::current().id())
    }

    pub(crate) fn set_notifier(&self, dlci: u8, notify: Notifier) -> Result<()> {
        self.notifiers
            .lock()
            .map_err(|_| MuxError::LockPoisoned)?
            .insert(dlci, notify);
        Ok(())
    }

    fn notifier(&self, dlci: u8) -> Result<Option<Notifier>> {
        Ok(self
            .notifiers
            .lock()
            .map_err(|_| MuxError::LockPoisoned)?
            .get(&dlci)
            .cloned())
    }
}

/// A running multiplexer session over one transport.
///
/// Dropping the `Mux` shuts the session down; outstanding [`MuxChannel`]
/// handles then report [`MuxError::Terminated`].
pub struct Mux {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Mux {
    /// Take ownership of `transport` and start the scheduler thread.
    ///
    /// `events` receives peer-initiated establishments.
    pub fn start<T, E>(transport: T, config: MuxConfig, events: E) -> Result<Self>
    where
        T: Transport + 'static,
        E: MuxEvents + 'static,
    {
        let fd = transport.as_raw_fd();
        let name = transport.transport_name();
        let transport: Box<dyn Transport> = Box::new(transport);

        let (wake_rx, wake_tx) = UnixStream::pair().map_err(TransportError::Io)?;
        wake_rx.set_nonblocking(true).map_err(TransportError::Io)?;
        wake_tx.set_nonblocking(true).map_err(TransportError::Io)?;
        let (tasks, queue) = mpsc::channel();

        let shared = Arc::new(Shared {
            engine: Mutex::new(Engine::new(transport, config)),
            changed: Condvar::new(),
            tasks,
            wake: wake_tx,
            notifiers: Mutex::new(HashMap::new()),
            worker: OnceLock::new(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            queue,
            wake: wake_rx,
            fd,
            events: Box::new(events),
        };
        let handle = thread::Builder::new()
            .name("cmux-scheduler".to_string())
            .spawn(move || worker.run())
            .map_err(TransportError::Io)?;

        info!(transport = name, fd, "multiplexer started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Establish the control channel (DLCI 0), blocking until the peer answers.
    pub fn open_control_channel(&self) -> Result<()> {
        if self.shared.on_worker() {
            return Err(MuxError::Reentrant);
        }
        let (tx, rx) = mpsc::channel();
        self.shared.lock()?.request_control_open(tx)?;
        self.shared.post(Task::Kick)?;
        await_handoff(&rx)
    }

    /// Establish data channel `dlci`, blocking until the peer answers.
    pub fn open_channel(&self, dlci: u8) -> Result<MuxChannel> {
        if self.shared.on_worker() {
            return Err(MuxError::Reentrant);
        }
        let (tx, rx) = mpsc::channel();
        self.shared.lock()?.request_channel_open(dlci, tx)?;
        self.shared.post(Task::Kick)?;
        await_handoff(&rx)?;
        Ok(MuxChannel::new(dlci, Arc::clone(&self.shared)))
    }

    /// Handle for an already established channel, whoever opened it.
    pub fn channel(&self, dlci: u8) -> Result<MuxChannel> {
        if !self.shared.lock()?.pool().is_in_use(dlci) {
            return Err(MuxError::ChannelNotOpen(dlci));
        }
        Ok(MuxChannel::new(dlci, Arc::clone(&self.shared)))
    }

    /// Established DLCIs in pool order.
    pub fn channels(&self) -> Result<Vec<u8>> {
        Ok(self.shared.lock()?.pool().dlcis().collect())
    }

    pub fn is_control_open(&self) -> Result<bool> {
        Ok(self.shared.lock()?.is_control_open())
    }

    pub fn role(&self) -> Result<Option<Role>> {
        Ok(self.shared.lock()?.role())
    }

    /// Why the session ended, if it has.
    pub fn terminated(&self) -> Result<Option<String>> {
        Ok(self.shared.lock()?.terminated().map(str::to_string))
    }

    /// Stop the scheduler and release every blocked caller.
    ///
    /// Safe to call more than once. From inside a callback the scheduler is
    /// told to stop but not joined.
    pub fn shutdown(&self) -> Result<()> {
        let handle = self
            .worker
            .lock()
            .map_err(|_| MuxError::LockPoisoned)?
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        // The scheduler may already be gone after a fatal error.
        let _ = self.shared.post(Task::Shutdown);
        if handle.thread().id() == thread::current().id() {
            return Ok(());
        }
        if handle.join().is_err() {
            warn!("scheduler thread panicked");
        }
        Ok(())
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.shared.engine.try_lock() {
            Ok(engine) => f.debug_struct("Mux").field("engine", &*engine).finish(),
            Err(_) => f.debug_struct("Mux").finish_non_exhaustive(),
        }
    }
}

fn await_handoff(rx: &Receiver<Result<()>>) -> Result<()> {
    rx.recv()
        .unwrap_or_else(|_| Err(MuxError::Terminated("scheduler stopped".to_string())))
}

/// Ends the session when the scheduler thread exits, including by a panic in
/// a user callback, so nobody stays blocked on a dead scheduler.
struct Stopped<'a>(&'a Shared);

impl Drop for Stopped<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("scheduler panicked in a callback");
            self.0
                .engine
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .terminate("scheduler panicked");
        }
        self.0.changed.notify_all();
    }
}

struct Worker {
    shared: Arc<Shared>,
    queue: Receiver<Task>,
    wake: UnixStream,
    fd: RawFd,
    events: Box<dyn MuxEvents>,
}

impl Worker {
    fn run(self) {
        let _ = self.shared.worker.set(thread::current().id());
        let _stopped = Stopped(&self.shared);
        debug!("scheduler running");

        loop {
            match self.turn() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    error!(error = %err, "scheduler failed");
                    if let Ok(mut engine) = self.shared.lock() {
                        engine.terminate(err.to_string());
                    }
                    break;
                }
            }
        }
        debug!("scheduler stopped");
    }

    /// One scheduling pass. Returns `false` once the session is over.
    fn turn(&self) -> Result<bool> {
        while let Ok(task) = self.queue.try_recv() {
            trace!(?task, "task");
            let now = Instant::now();
            match task {
                Task::Kick => self.shared.lock()?.kick(now),
                Task::Resume => self.shared.lock()?.on_readable(now),
                Task::Shutdown => {
                    self.shared.lock()?.terminate("multiplexer shut down");
                    debug!("shutdown requested");
                    return Ok(false);
                }
            }
        }
        self.deliver()?;

        let (interest, deadline) = {
            let engine = self.shared.lock()?;
            if engine.terminated().is_some() {
                return Ok(false);
            }
            let interest = Interest {
                readable: engine.wants_read(),
                writable: engine.wants_write(),
            };
            (interest, engine.next_deadline())
        };

        let timeout = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let mut fds = [
            PollFd::new(self.fd, interest),
            PollFd::new(self.wake.as_raw_fd(), Interest::READABLE),
        ];
        poll(&mut fds, timeout)?;
        self.drain_wake();

        let ready = fds[0].readiness();
        {
            let mut engine = self.shared.lock()?;
            let now = Instant::now();
            if ready.readable {
                engine.on_readable(now);
            }
            if ready.writable {
                engine.on_writable(now);
            }
            if ready.hangup || ready.error {
                error!(hangup = ready.hangup, "transport closed");
                engine.terminate("transport closed");
            }
            engine.on_timer(now);
        }
        self.deliver()?;
        Ok(true)
    }

    /// Run callbacks for events and transmit notifications, lock released.
    fn deliver(&self) -> Result<()> {
        let events = self.shared.lock()?.take_events();
        for event in events {
            match event {
                MuxEvent::ControlChannelOpened => self.events.on_control_channel_open(),
                MuxEvent::ChannelOpened(dlci) => {
                    let channel = MuxChannel::new(dlci, Arc::clone(&self.shared));
                    self.events.on_channel_open(channel, dlci);
                }
            }
        }

        loop {
            let next = self.shared.lock()?.next_notification();
            let Some(dlci) = next else {
                break;
            };
            if let Some(notify) = self.shared.notifier(dlci)? {
                trace!(dlci, "transmit notification");
                notify();
            }
        }

        self.shared.changed.notify_all();
        Ok(())
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake).read(&mut buf) {
                Ok(n) if n == buf.len() => continue,
                Ok(_) => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }
}
