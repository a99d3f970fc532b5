use crate::pool::CHANNEL_CAPACITY;

/// Transmit-completion dispatcher.
///
/// Keeps one pending bit per pool slot. Channels that found the transmit path
/// busy set their bit; when it frees up the bits are drained one at a time,
/// scanning from the slot after the last one served so no channel can starve
/// the others.
#[derive(Debug, Clone)]
pub struct TxDispatcher {
    pending: u8,
    cursor: usize,
}

impl TxDispatcher {
    pub fn new() -> Self {
        Self {
            pending: 0,
            cursor: CHANNEL_CAPACITY - 1,
        }
    }

    /// Request a notification for `slot`. Repeated marks coalesce.
    pub fn mark(&mut self, slot: usize) {
        if slot < CHANNEL_CAPACITY {
            self.pending |= 1 << slot;
        }
    }

    pub fn is_pending(&self, slot: usize) -> bool {
        slot < CHANNEL_CAPACITY && self.pending & (1 << slot) != 0
    }

    pub fn has_pending(&self) -> bool {
        self.pending != 0
    }

    /// Take the next slot to notify, clearing its bit.
    pub fn next(&mut self) -> Option<usize> {
        for step in 1..=CHANNEL_CAPACITY {
            let slot = (self.cursor + step) % CHANNEL_CAPACITY;
            if self.pending & (1 << slot) != 0 {
                self.pending &= !(1 << slot);
                self.cursor = slot;
                return Some(slot);
            }
        }
        None
    }
}

impl Default for TxDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(dispatcher: &mut TxDispatcher) -> Vec<usize> {
        std::iter::from_fn(|| dispatcher.next()).collect()
    }

    #[test]
    fn every_marked_slot_is_served_once() {
        let mut dispatcher = TxDispatcher::new();
        for slot in [2, 0, 3, 1] {
            dispatcher.mark(slot);
        }

        assert_eq!(drain(&mut dispatcher), vec![0, 1, 2, 3]);
        assert!(!dispatcher.has_pending());
    }

    #[test]
    fn repeated_marks_coalesce() {
        let mut dispatcher = TxDispatcher::new();
        dispatcher.mark(1);
        dispatcher.mark(1);
        dispatcher.mark(1);

        assert_eq!(drain(&mut dispatcher), vec![1]);
    }

    #[test]
    fn scan_resumes_after_last_served() {
        let mut dispatcher = TxDispatcher::new();
        dispatcher.mark(1);
        dispatcher.mark(2);
        assert_eq!(dispatcher.next(), Some(1));

        // Slot 1 asks again while 2 is still waiting: 2 goes first.
        dispatcher.mark(1);
        assert_eq!(dispatcher.next(), Some(2));
        assert_eq!(dispatcher.next(), Some(1));
        assert_eq!(dispatcher.next(), None);
    }

    #[test]
    fn scan_wraps_around() {
        let mut dispatcher = TxDispatcher::new();
        dispatcher.mark(3);
        assert_eq!(dispatcher.next(), Some(3));

        dispatcher.mark(0);
        dispatcher.mark(3);
        assert_eq!(drain(&mut dispatcher), vec![0, 3]);
    }

    #[test]
    fn out_of_range_slot_is_ignored() {
        let mut dispatcher = TxDispatcher::new();
        dispatcher.mark(CHANNEL_CAPACITY);
        assert!(!dispatcher.has_pending());
        assert!(!dispatcher.is_pending(CHANNEL_CAPACITY));
    }
}
