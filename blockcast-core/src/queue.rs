//! Outbound queue: bounded FIFO of encoded datagrams drained one per writable turn.

use std::collections::VecDeque;

use tracing::{trace, warn};

use crate::wire::Datagram;

/// Default capacity shared by both roles.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// What happened to a pushed datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// An identical datagram was already waiting.
    Coalesced,
    /// The queue was full; the new datagram was discarded.
    Dropped,
}

/// Bounded FIFO with coalescing and drop-newest overflow.
///
/// Every datagram on this protocol is broadcast to the whole group, so two
/// identical queued datagrams would deliver the same thing twice.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<Datagram>,
    capacity: usize,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, datagram: Datagram) -> Enqueued {
        if self.items.iter().any(|queued| *queued == datagram) {
            trace!(tag = datagram.tag(), "coalesced duplicate outbound datagram");
            return Enqueued::Coalesced;
        }
        if self.items.len() >= self.capacity {
            self.dropped += 1;
            warn!(
                tag = datagram.tag(),
                capacity = self.capacity,
                "outbound queue full, dropping datagram"
            );
            return Enqueued::Dropped;
        }
        self.items.push_back(datagram);
        Enqueued::Queued
    }

    /// Head of the queue, for sending.
    pub fn front(&self) -> Option<&Datagram> {
        self.items.front()
    }

    pub fn pop(&mut self) -> Option<Datagram> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Datagrams discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::HostIdentity;

    fn datagram(tag: u32) -> Datagram {
        Datagram::header_only(tag, HostIdentity::new(1))
    }

    #[test]
    fn fifo_order() {
        let mut q = OutboundQueue::new(4);
        q.push(datagram(1));
        q.push(datagram(2));
        assert_eq!(q.pop().unwrap().tag(), 1);
        assert_eq!(q.pop().unwrap().tag(), 2);
        assert!(q.pop().is_none());
    }

    #[test]
    fn identical_datagrams_coalesce() {
        let mut q = OutboundQueue::new(4);
        assert_eq!(q.push(datagram(1)), Enqueued::Queued);
        assert_eq!(q.push(datagram(1)), Enqueued::Coalesced);
        assert_eq!(q.len(), 1);
        q.pop();
        assert_eq!(q.push(datagram(1)), Enqueued::Queued);
    }

    #[test]
    fn full_queue_drops_newest() {
        let mut q = OutboundQueue::new(2);
        q.push(datagram(1));
        q.push(datagram(2));
        assert_eq!(q.push(datagram(3)), Enqueued::Dropped);
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.front().unwrap().tag(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let q = OutboundQueue::new(0);
        assert_eq!(q.capacity(), 1);
    }
}
