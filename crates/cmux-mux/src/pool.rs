use bytes::BytesMut;
use tracing::debug;

use crate::error::{MuxError, Result};

/// Number of data channels the engine can hold.
pub const CHANNEL_CAPACITY: usize = 4;

/// One channel slot.
#[derive(Debug, Default)]
pub struct Slot {
    dlci: Option<u8>,
    inbound: BytesMut,
}

impl Slot {
    /// The DLCI held by this slot, if allocated.
    pub fn dlci(&self) -> Option<u8> {
        self.dlci
    }

    pub fn inbound(&self) -> &BytesMut {
        &self.inbound
    }

    pub fn inbound_mut(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }
}

/// Fixed pool of channel slots.
///
/// Allocation is permanent: there is no close path, so a DLCI once placed
/// stays in its slot for the lifetime of the engine.
#[derive(Debug, Default)]
pub struct ChannelPool {
    slots: [Slot; CHANNEL_CAPACITY],
}

impl ChannelPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_use(&self, dlci: u8) -> bool {
        self.lookup(dlci).is_some()
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|slot| slot.dlci.is_some())
    }

    /// Number of allocated channels.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.dlci.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place `dlci` in the first free slot and return the slot index.
    pub fn allocate(&mut self, dlci: u8) -> Result<usize> {
        if self.is_in_use(dlci) {
            return Err(MuxError::ChannelInUse(dlci));
        }
        let index = self
            .slots
            .iter()
            .position(|slot| slot.dlci.is_none())
            .ok_or(MuxError::ResourceExhausted)?;
        self.slots[index].dlci = Some(dlci);
        debug!(dlci, slot = index, "channel allocated");
        Ok(index)
    }

    /// Slot index holding `dlci`.
    pub fn lookup(&self, dlci: u8) -> Option<usize> {
        self.slots.iter().position(|slot| slot.dlci == Some(dlci))
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots.get_mut(index)
    }

    /// Allocated DLCIs in slot order.
    pub fn dlcis(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots.iter().filter_map(|slot| slot.dlci)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_until_full() {
        let mut pool = ChannelPool::new();
        assert!(pool.is_empty());

        for (index, dlci) in [5u8, 1, 63, 2].into_iter().enumerate() {
            assert_eq!(pool.allocate(dlci).unwrap(), index);
        }
        assert!(pool.is_full());
        assert_eq!(pool.len(), CHANNEL_CAPACITY);
        assert!(matches!(pool.allocate(7), Err(MuxError::ResourceExhausted)));
        assert_eq!(pool.dlcis().collect::<Vec<_>>(), vec![5, 1, 63, 2]);
    }

    #[test]
    fn dlci_appears_once() {
        let mut pool = ChannelPool::new();
        pool.allocate(3).unwrap();
        assert!(matches!(pool.allocate(3), Err(MuxError::ChannelInUse(3))));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn lookup_finds_slot() {
        let mut pool = ChannelPool::new();
        pool.allocate(9).unwrap();
        pool.allocate(4).unwrap();

        assert_eq!(pool.lookup(4), Some(1));
        assert_eq!(pool.lookup(8), None);
        assert!(pool.is_in_use(9));
        assert!(!pool.is_in_use(10));
        assert_eq!(pool.slot(1).and_then(Slot::dlci), Some(4));
    }
}
