//! The protocol engine.
//!
//! [`Engine`] owns the transport and every piece of protocol state: the
//! receive and transmit machines, the T1 timer, the channel pool and the
//! notification dispatcher. It never blocks and never spawns; a scheduler
//! feeds it readiness, timer expiry and kicks, and takes back events and
//! notifications to deliver outside the lock.

use std::io::{Read, Write};
use std::sync::mpsc::Sender;
use std::time::Instant;

use bytes::Bytes;
use cmux_frame::{
    is_valid_dlci, Frame, FrameError, FrameKind, FrameReader, FrameWriter, Role, RxState,
    WriteProgress, CONTROL_DLCI,
};
use tracing::{debug, error, info, trace, warn};

use crate::config::MuxConfig;
use crate::dispatch::TxDispatcher;
use crate::error::{MuxError, Result};
use crate::events::MuxEvent;
use crate::pool::{ChannelPool, Slot};
use crate::tx::{Activity, ResponseHook, Retransmit, TxState};

/// One-shot handoff that releases a blocked establishment caller.
pub type Handoff = Sender<Result<()>>;

/// Channel readiness as reported by [`Engine::channel_poll`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelReadiness {
    /// Inbound bytes are buffered.
    pub readable: bool,
    /// A write would be accepted right now.
    pub writable: bool,
}

pub struct Engine<T> {
    transport: T,
    config: MuxConfig,
    reader: FrameReader,
    writer: FrameWriter,
    tx: TxState,
    timer: Retransmit,
    pool: ChannelPool,
    dispatcher: TxDispatcher,
    control_open: bool,
    role: Option<Role>,
    control_self: Activity,
    control_waiter: Option<Handoff>,
    channel_self: Activity,
    channel_self_dlci: u8,
    channel_waiter: Option<Handoff>,
    peer: Activity,
    peer_dlci: u8,
    hook: ResponseHook,
    parked: Option<Frame>,
    events: Vec<MuxEvent>,
    terminated: Option<String>,
}

impl<T: Read + Write> Engine<T> {
    pub fn new(transport: T, config: MuxConfig) -> Self {
        let timer = Retransmit::new(config.t1, config.retransmits);
        Self {
            transport,
            config,
            reader: FrameReader::new(),
            writer: FrameWriter::new(),
            tx: TxState::Idle,
            timer,
            pool: ChannelPool::new(),
            dispatcher: TxDispatcher::new(),
            control_open: false,
            role: None,
            control_self: Activity::Inactive,
            control_waiter: None,
            channel_self: Activity::Inactive,
            channel_self_dlci: 0,
            channel_waiter: None,
            peer: Activity::Inactive,
            peer_dlci: 0,
            hook: ResponseHook::None,
            parked: None,
            events: Vec::new(),
            terminated: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn is_control_open(&self) -> bool {
        self.control_open
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn tx_state(&self) -> TxState {
        self.tx
    }

    pub fn rx_state(&self) -> RxState {
        self.reader.state()
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Why the session ended, once it has.
    pub fn terminated(&self) -> Option<&str> {
        self.terminated.as_deref()
    }

    /// When [`on_timer`](Self::on_timer) next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Whether the scheduler should wait for the transport to become writable.
    pub fn wants_write(&self) -> bool {
        self.terminated.is_none() && self.tx.is_writing() && self.writer.remaining() > 0
    }

    /// Whether the scheduler should wait for the transport to become readable.
    pub fn wants_read(&self) -> bool {
        self.terminated.is_none() && !self.reader.is_suspended()
    }

    /// Queue a self-initiated control channel establishment.
    ///
    /// The outcome is sent on `waiter` once the peer answers, T1 runs out
    /// or the session ends.
    pub fn request_control_open(&mut self, waiter: Handoff) -> Result<()> {
        self.ensure_running()?;
        if self.control_open {
            return Err(MuxError::AlreadyOpen);
        }
        if self.control_self.is_active() {
            return Err(MuxError::InProgress);
        }
        self.control_self = Activity::Pending;
        self.control_waiter = Some(waiter);
        debug!("control channel open requested");
        Ok(())
    }

    /// Queue a self-initiated data channel establishment.
    pub fn request_channel_open(&mut self, dlci: u8, waiter: Handoff) -> Result<()> {
        self.ensure_running()?;
        if !is_valid_dlci(dlci) {
            return Err(MuxError::InvalidChannel(dlci));
        }
        if !self.control_open {
            return Err(MuxError::NotOpen);
        }
        if self.pool.is_full() {
            return Err(MuxError::ResourceExhausted);
        }
        if self.pool.is_in_use(dlci) {
            return Err(MuxError::ChannelInUse(dlci));
        }
        if self.channel_self.is_active() {
            return Err(MuxError::InProgress);
        }
        self.channel_self = Activity::Pending;
        self.channel_self_dlci = dlci;
        self.channel_waiter = Some(waiter);
        debug!(dlci, "channel open requested");
        Ok(())
    }

    /// Start any queued work if the transmit path is idle.
    pub fn kick(&mut self, now: Instant) {
        self.drive_tx(now);
    }

    /// Drain every complete frame the transport has.
    pub fn on_readable(&mut self, now: Instant) {
        while self.terminated.is_none() {
            match self.reader.read_frame(&mut self.transport) {
                Ok(Some(frame)) => {
                    self.handle_frame(frame, now);
                    if self.reader.is_suspended() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    let reason = if err.is_protocol_violation() {
                        format!("protocol violation: {err}")
                    } else {
                        format!("receive failed: {err}")
                    };
                    error!(%reason, "receive path failed");
                    self.terminate(reason);
                }
            }
        }
    }

    pub fn on_writable(&mut self, now: Instant) {
        self.drive_tx(now);
    }

    /// Handle T1 expiry for the outstanding SABM.
    pub fn on_timer(&mut self, now: Instant) {
        if self.tx != TxState::RetransmitDone || !self.timer.expired(now) {
            return;
        }

        let dlci = self.writer.dlci();
        if self.timer.take() {
            warn!(dlci, left = self.timer.left(), "T1 expired, retransmitting SABM");
            self.writer.rewind();
            self.tx = TxState::RetransmitEnqueue;
        } else {
            let attempts = self.timer.attempts();
            warn!(dlci, attempts, "no answer to SABM");
            self.tx = TxState::Idle;
            self.finish_outstanding(Err(MuxError::Timeout { dlci, attempts }));
        }
        self.drive_tx(now);
    }

    /// Send up to one frame of user data on `dlci`.
    ///
    /// Returns the number of bytes accepted. While anything else is in flight
    /// the channel is queued for a transmit notification and
    /// [`MuxError::WouldBlock`] is returned.
    pub fn channel_write(&mut self, dlci: u8, data: &[u8]) -> Result<usize> {
        self.ensure_running()?;
        let index = self
            .pool
            .lookup(dlci)
            .ok_or(MuxError::ChannelNotOpen(dlci))?;
        if data.is_empty() {
            return Ok(0);
        }
        if self.tx != TxState::Idle || self.establishment_pending() {
            self.dispatcher.mark(index);
            trace!(dlci, tx = ?self.tx, "transmit busy, notification queued");
            return Err(MuxError::WouldBlock);
        }

        let len = data.len().min(self.config.effective_payload());
        let role = self.role.unwrap_or(Role::Initiator);
        self.writer.load_data(dlci, role, &data[..len])?;
        self.tx = TxState::NoRetransmit;

        match self.writer.flush(&mut self.transport) {
            Ok(WriteProgress::Complete) => self.tx = TxState::Idle,
            Ok(WriteProgress::Pending) => {}
            Err(err) => {
                self.writer.clear();
                self.tx = TxState::Idle;
                return Err(err.into());
            }
        }
        trace!(dlci, len, "data frame queued");
        Ok(len)
    }

    /// Copy buffered inbound bytes for `dlci` into `buf`.
    pub fn channel_read(&mut self, dlci: u8, buf: &mut [u8]) -> Result<usize> {
        let index = self
            .pool
            .lookup(dlci)
            .ok_or(MuxError::ChannelNotOpen(dlci))?;
        let inbound = self
            .pool
            .slot_mut(index)
            .map(Slot::inbound_mut)
            .ok_or(MuxError::ChannelNotOpen(dlci))?;

        let len = buf.len().min(inbound.len());
        if len == 0 {
            if buf.is_empty() {
                return Ok(0);
            }
            if let Some(reason) = &self.terminated {
                return Err(MuxError::Terminated(reason.clone()));
            }
            return Err(MuxError::WouldBlock);
        }

        let chunk = inbound.split_to(len);
        buf[..len].copy_from_slice(&chunk);
        self.retry_parked();
        Ok(len)
    }

    pub fn channel_poll(&self, dlci: u8) -> Result<ChannelReadiness> {
        let index = self
            .pool
            .lookup(dlci)
            .ok_or(MuxError::ChannelNotOpen(dlci))?;
        let readable = self
            .pool
            .slot(index)
            .is_some_and(|slot| !slot.inbound().is_empty());
        let writable = self.terminated.is_none()
            && self.tx == TxState::Idle
            && !self.establishment_pending();
        Ok(ChannelReadiness { readable, writable })
    }

    /// Next channel to notify that the transmit path is free.
    ///
    /// Yields nothing while a frame is in flight or an establishment is
    /// queued; call again after the notified channel had its chance to write.
    pub fn next_notification(&mut self) -> Option<u8> {
        if self.terminated.is_some() || self.tx != TxState::Idle || self.establishment_pending() {
            return None;
        }
        let index = self.dispatcher.next()?;
        self.pool.slot(index).and_then(Slot::dlci)
    }

    /// Events produced since the last call.
    pub fn take_events(&mut self) -> Vec<MuxEvent> {
        std::mem::take(&mut self.events)
    }

    /// End the session, releasing every blocked caller.
    pub fn terminate(&mut self, reason: impl Into<String>) {
        if self.terminated.is_some() {
            return;
        }
        let reason = reason.into();
        self.finish_control(Err(MuxError::Terminated(reason.clone())));
        self.finish_channel(Err(MuxError::Terminated(reason.clone())));
        self.peer = Activity::Inactive;
        self.hook = ResponseHook::None;
        self.timer.clear();
        self.writer.clear();
        self.tx = TxState::Idle;
        self.parked = None;
        self.terminated = Some(reason);
    }

    fn ensure_running(&self) -> Result<()> {
        match &self.terminated {
            Some(reason) => Err(MuxError::Terminated(reason.clone())),
            None => Ok(()),
        }
    }

    fn establishment_pending(&self) -> bool {
        self.control_self.is_active() || self.channel_self.is_active() || self.peer.is_active()
    }

    /// Whether a self-initiated open of `dlci` is queued or outstanding.
    fn self_open_for(&self, dlci: u8) -> bool {
        if dlci == CONTROL_DLCI {
            self.control_self.is_active()
        } else {
            self.channel_self.is_active() && self.channel_self_dlci == dlci
        }
    }

    /// DLCI of the SABM currently waiting for an answer.
    fn outstanding_dlci(&self) -> Option<u8> {
        if self.control_self == Activity::Running {
            Some(CONTROL_DLCI)
        } else if self.channel_self == Activity::Running {
            Some(self.channel_self_dlci)
        } else {
            None
        }
    }

    fn drive_tx(&mut self, now: Instant) {
        loop {
            match self.tx {
                TxState::Idle => {
                    if !self.start_next() {
                        return;
                    }
                }
                TxState::RetransmitDone => return,
                TxState::RetransmitEnqueue | TxState::InternalResp | TxState::NoRetransmit => {
                    match self.writer.flush(&mut self.transport) {
                        Ok(WriteProgress::Pending) => return,
                        Ok(WriteProgress::Complete) => self.tx_complete(now),
                        Err(err) => self.tx_failed(err),
                    }
                }
            }
        }
    }

    /// Idle entry: start the highest-priority queued flow.
    ///
    /// Returns `false` when there was nothing to do.
    fn start_next(&mut self) -> bool {
        if self.terminated.is_some() {
            return false;
        }

        // Both ends asked for the same DLCI: answering the peer settles it.
        if self.peer == Activity::Pending && self.self_open_for(self.peer_dlci) {
            self.answer_peer();
            return true;
        }

        if self.control_self == Activity::Pending {
            if self.control_open {
                self.finish_control(Err(MuxError::AlreadySatisfied(CONTROL_DLCI)));
                return true;
            }
            self.control_self = Activity::Running;
            self.send_request(CONTROL_DLCI);
            return true;
        }

        if self.channel_self == Activity::Pending {
            let dlci = self.channel_self_dlci;
            if self.pool.is_in_use(dlci) {
                debug!(dlci, "channel opened by peer before our SABM");
                self.finish_channel(Err(MuxError::AlreadySatisfied(dlci)));
            } else if self.pool.is_full() {
                debug!(dlci, "pool filled before our SABM");
                self.finish_channel(Err(MuxError::ResourceExhausted));
            } else {
                self.channel_self = Activity::Running;
                self.send_request(dlci);
            }
            return true;
        }

        if self.peer == Activity::Pending {
            self.answer_peer();
            return true;
        }

        false
    }

    fn send_request(&mut self, dlci: u8) {
        let role = self.role.unwrap_or(Role::Initiator);
        match self.writer.load_request(dlci, FrameKind::Sabm, role) {
            Ok(()) => {
                self.timer.reset();
                self.tx = TxState::RetransmitEnqueue;
                debug!(dlci, "sending SABM");
            }
            Err(source) => self.finish_outstanding(Err(MuxError::WriteFailed { dlci, source })),
        }
    }

    fn answer_peer(&mut self) {
        let dlci = self.peer_dlci;
        let (kind, hook) = if dlci == CONTROL_DLCI {
            (FrameKind::Ua, ResponseHook::OpenControl)
        } else if !self.control_open {
            (FrameKind::Dm, ResponseHook::None)
        } else if self.pool.is_in_use(dlci) {
            (FrameKind::Ua, ResponseHook::None)
        } else if !self.pool.is_full() {
            (FrameKind::Ua, ResponseHook::OpenChannel(dlci))
        } else {
            (FrameKind::Dm, ResponseHook::None)
        };
        self.start_answer(dlci, kind, hook);
    }

    fn start_answer(&mut self, dlci: u8, kind: FrameKind, hook: ResponseHook) {
        let role = self.role.unwrap_or(Role::Responder);
        match self.writer.load_response(dlci, kind, role) {
            Ok(()) => {
                self.peer = Activity::Running;
                self.peer_dlci = dlci;
                self.hook = hook;
                self.tx = TxState::InternalResp;
                debug!(dlci, answer = kind.name(), "answering peer");
            }
            Err(err) => {
                warn!(dlci, error = %err, "failed to build answer");
                self.peer = Activity::Inactive;
            }
        }
    }

    fn tx_complete(&mut self, now: Instant) {
        match self.tx {
            TxState::RetransmitEnqueue => {
                self.tx = TxState::RetransmitDone;
                self.timer.arm(now);
                trace!(dlci = self.writer.dlci(), "SABM sent, T1 armed");
                self.resolve_collision();
            }
            TxState::InternalResp => {
                self.run_hook();
                self.peer = Activity::Inactive;
                self.tx = TxState::Idle;
            }
            TxState::NoRetransmit => self.tx = TxState::Idle,
            TxState::Idle | TxState::RetransmitDone => {}
        }
    }

    /// Stop waiting for an answer to our SABM once the peer has sent a SABM
    /// for the same DLCI. The self open goes back to pending so it completes
    /// as already satisfied after the peer is answered.
    fn resolve_collision(&mut self) {
        if self.tx != TxState::RetransmitDone
            || self.peer != Activity::Pending
            || self.outstanding_dlci() != Some(self.peer_dlci)
        {
            return;
        }
        debug!(dlci = self.peer_dlci, "simultaneous open, answering peer SABM");
        self.timer.clear();
        self.writer.clear();
        self.tx = TxState::Idle;
        if self.peer_dlci == CONTROL_DLCI {
            self.control_self = Activity::Pending;
        } else {
            self.channel_self = Activity::Pending;
        }
    }

    fn tx_failed(&mut self, err: FrameError) {
        let dlci = self.writer.dlci();
        match self.tx {
            TxState::RetransmitEnqueue => {
                warn!(dlci, error = %err, "SABM write failed");
                self.finish_outstanding(Err(MuxError::WriteFailed { dlci, source: err }));
            }
            TxState::InternalResp => {
                warn!(dlci, error = %err, "answer write failed");
                self.peer = Activity::Inactive;
                self.hook = ResponseHook::None;
            }
            TxState::NoRetransmit => warn!(dlci, error = %err, "data write failed"),
            TxState::Idle | TxState::RetransmitDone => {}
        }
        self.writer.clear();
        self.tx = TxState::Idle;
    }

    fn run_hook(&mut self) {
        match std::mem::replace(&mut self.hook, ResponseHook::None) {
            ResponseHook::None => {}
            ResponseHook::OpenControl => {
                if !self.control_open {
                    self.control_open = true;
                    self.role = Some(Role::Responder);
                    info!("control channel opened by peer");
                    if !self.self_open_for(CONTROL_DLCI) {
                        self.events.push(MuxEvent::ControlChannelOpened);
                    }
                }
            }
            ResponseHook::OpenChannel(dlci) => match self.pool.allocate(dlci) {
                Ok(_) => {
                    info!(dlci, "channel opened by peer");
                    if !self.self_open_for(dlci) {
                        self.events.push(MuxEvent::ChannelOpened(dlci));
                    }
                }
                Err(err) => debug!(dlci, error = %err, "peer channel not allocated"),
            },
        }
    }

    fn finish_outstanding(&mut self, result: Result<()>) {
        self.timer.clear();
        if self.control_self == Activity::Running {
            self.finish_control(result);
        } else if self.channel_self == Activity::Running {
            self.finish_channel(result);
        }
    }

    fn finish_control(&mut self, result: Result<()>) {
        self.control_self = Activity::Inactive;
        if let Some(waiter) = self.control_waiter.take() {
            let _ = waiter.send(result);
        }
    }

    fn finish_channel(&mut self, result: Result<()>) {
        self.channel_self = Activity::Inactive;
        if let Some(waiter) = self.channel_waiter.take() {
            let _ = waiter.send(result);
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        let dlci = frame.dlci();
        trace!(
            dlci,
            kind = frame.kind.name(),
            len = frame.payload.len(),
            "frame received"
        );
        match frame.kind {
            FrameKind::Sabm => self.on_sabm(dlci),
            FrameKind::Ua => self.on_response(dlci, true),
            FrameKind::Dm => self.on_response(dlci, false),
            FrameKind::Disc => self.on_disc(dlci),
            FrameKind::Uih => self.on_uih(frame),
        }
        self.drive_tx(now);
    }

    fn on_sabm(&mut self, dlci: u8) {
        match self.peer {
            Activity::Inactive => {
                self.peer = Activity::Pending;
                self.peer_dlci = dlci;
                self.resolve_collision();
                if self.tx != TxState::Idle {
                    debug!(dlci, tx = ?self.tx, "deferring answer to peer SABM");
                }
            }
            _ if self.peer_dlci == dlci => debug!(dlci, "duplicate peer SABM"),
            _ => warn!(
                dlci,
                pending = self.peer_dlci,
                "dropping peer SABM while another is pending"
            ),
        }
    }

    fn on_response(&mut self, dlci: u8, accepted: bool) {
        if self.tx != TxState::RetransmitDone || self.outstanding_dlci() != Some(dlci) {
            debug!(dlci, accepted, tx = ?self.tx, "ignoring unsolicited response");
            return;
        }

        self.timer.clear();
        self.tx = TxState::Idle;

        if !accepted {
            info!(dlci, "peer rejected establishment");
            self.finish_outstanding(Err(MuxError::Rejected(dlci)));
            return;
        }

        if dlci == CONTROL_DLCI {
            self.control_open = true;
            self.role = Some(Role::Initiator);
            info!("control channel open");
            self.finish_control(Ok(()));
        } else {
            let result = self.pool.allocate(dlci).map(|_| ());
            if result.is_ok() {
                info!(dlci, "channel open");
            }
            self.finish_channel(result);
        }
    }

    fn on_disc(&mut self, dlci: u8) {
        let open = if dlci == CONTROL_DLCI {
            self.control_open
        } else {
            self.pool.is_in_use(dlci)
        };
        if open {
            info!(dlci, "ignoring DISC for open channel");
            return;
        }
        if self.tx == TxState::Idle && !self.peer.is_active() {
            self.start_answer(dlci, FrameKind::Dm, ResponseHook::None);
        } else {
            debug!(dlci, "dropping DISC while transmit is busy");
        }
    }

    fn on_uih(&mut self, frame: Frame) {
        let dlci = frame.dlci();
        if dlci == CONTROL_DLCI {
            debug!(len = frame.payload.len(), "dropping UIH on control channel");
            return;
        }
        let Some(index) = self.pool.lookup(dlci) else {
            debug!(dlci, "dropping UIH for unopened channel");
            return;
        };
        if !self.deliver(index, &frame.payload) {
            debug!(dlci, "channel buffer full, receive suspended");
            self.parked = Some(frame);
            self.reader.suspend();
        }
    }

    fn deliver(&mut self, index: usize, payload: &Bytes) -> bool {
        let limit = self.config.rx_buffer_limit;
        let Some(slot) = self.pool.slot_mut(index) else {
            return true;
        };
        let inbound = slot.inbound_mut();
        if !inbound.is_empty() && inbound.len() + payload.len() > limit {
            return false;
        }
        inbound.extend_from_slice(payload);
        true
    }

    fn retry_parked(&mut self) {
        let Some(frame) = self.parked.take() else {
            return;
        };
        let Some(index) = self.pool.lookup(frame.dlci()) else {
            self.reader.resume();
            return;
        };
        if self.deliver(index, &frame.payload) {
            self.reader.resume();
        } else {
            self.parked = Some(frame);
        }
    }
}

impl<T> std::fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tx", &self.tx)
            .field("rx", &self.reader)
            .field("control_open", &self.control_open)
            .field("role", &self.role)
            .field("channels", &self.pool.dlcis().collect::<Vec<_>>())
            .field("terminated", &self.terminated)
            .finish()
    }
}
