//! One direction of one queue.
//!
//! Slot ownership moves around the ring in a fixed cycle:
//!
//! ```text
//!   unposted ──refill──► posted ──transmit──► ready ──receive──► held
//!      ▲                                                          │
//!      └──────────────────────────────────────────────────────────┘
//! ```
//!
//! `posted` slots belong to the transmitter, `ready` and `held` slots to the
//! receiver. The sum never exceeds the ring capacity.

use std::collections::VecDeque;

use memif::{TransportError, TxDescriptor};

/// A filled slot waiting for the receiver.
#[derive(Debug)]
pub struct Slot {
    pub buf: Box<[u8]>,
    pub len: usize,
    pub more: bool,
}

impl Slot {
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

#[derive(Debug)]
pub struct SlotRing {
    capacity: usize,
    posted: usize,
    ready: VecDeque<Slot>,
    held: usize,
}

impl SlotRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            posted: 0,
            ready: VecDeque::new(),
            held: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots the transmitter may fill.
    #[inline]
    pub fn posted(&self) -> usize {
        self.posted
    }

    /// Filled slots the receiver has not taken yet.
    #[inline]
    pub fn ready(&self) -> usize {
        self.ready.len()
    }

    /// Slots taken by the receiver and not yet refilled.
    #[inline]
    pub fn held(&self) -> usize {
        self.held
    }

    /// Slots the receiver could post right now.
    #[inline]
    pub fn unposted(&self) -> usize {
        self.capacity - self.posted - self.ready.len()
    }

    /// Hand `count` slots to the transmitter.
    pub fn post(&mut self, count: usize) -> Result<(), TransportError> {
        let available = self.unposted();
        if count > available {
            return Err(TransportError::NoBuffers {
                requested: count,
                available,
            });
        }
        self.posted += count;
        self.held = self.held.saturating_sub(count);
        Ok(())
    }

    /// Check that a chain of `segments` slots could be transmitted.
    pub fn can_transmit(&self, segments: usize) -> Result<(), TransportError> {
        if segments > self.posted {
            return Err(TransportError::NoBuffers {
                requested: segments,
                available: self.posted,
            });
        }
        Ok(())
    }

    /// Move a filled chain onto the ready list. All or nothing.
    pub fn push_chain(&mut self, chain: Vec<TxDescriptor>) -> Result<(), TransportError> {
        self.can_transmit(chain.len())?;
        self.posted -= chain.len();
        for desc in chain {
            let (buf, len, more) = desc.into_parts();
            self.ready.push_back(Slot { buf, len, more });
        }
        Ok(())
    }

    /// Take up to `max` ready slots, oldest first.
    pub fn take_burst(&mut self, max: usize, out: &mut Vec<Slot>) {
        let n = max.min(self.ready.len());
        out.extend(self.ready.drain(..n));
        self.held += n;
    }
}
