use std::time::{Duration, Instant};

/// Transmit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Nothing in flight.
    Idle,
    /// Writing a SABM that expects an answer.
    RetransmitEnqueue,
    /// SABM fully written, waiting for UA/DM under T1.
    RetransmitDone,
    /// Writing a UA/DM answer to a peer SABM or DISC.
    InternalResp,
    /// Writing a UIH data frame.
    NoRetransmit,
}

impl TxState {
    /// States with bytes still to push to the transport.
    pub fn is_writing(self) -> bool {
        matches!(
            self,
            TxState::RetransmitEnqueue | TxState::InternalResp | TxState::NoRetransmit
        )
    }
}

/// Lifecycle of one establishment flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Inactive,
    /// Requested, waiting for the next idle transmit slot.
    Pending,
    /// Frame in flight.
    Running,
}

impl Activity {
    pub fn is_active(self) -> bool {
        self != Activity::Inactive
    }
}

/// Work run once an answer frame has been fully written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHook {
    None,
    OpenControl,
    OpenChannel(u8),
}

/// T1 timer and retransmit budget for the outstanding SABM.
#[derive(Debug, Clone)]
pub struct Retransmit {
    t1: Duration,
    budget: u32,
    left: u32,
    deadline: Option<Instant>,
}

impl Retransmit {
    pub fn new(t1: Duration, budget: u32) -> Self {
        Self {
            t1,
            budget,
            left: budget,
            deadline: None,
        }
    }

    /// Refill the budget for a new request.
    pub fn reset(&mut self) {
        self.left = self.budget;
        self.deadline = None;
    }

    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.t1);
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the armed deadline has passed.
    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Consume one retransmission. Returns `false` once the budget is spent.
    pub fn take(&mut self) -> bool {
        self.deadline = None;
        if self.left == 0 {
            return false;
        }
        self.left -= 1;
        true
    }

    /// Total SABMs sent for a request that used up its budget.
    pub fn attempts(&self) -> u32 {
        self.budget + 1
    }

    pub fn left(&self) -> u32 {
        self.left
    }
}
