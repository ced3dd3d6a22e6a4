//! Receive-side consumers.

use tracing::warn;

/// Receives raw ring segments in ring order.
///
/// Called synchronously from the drain; a slow sink delays the refill and so
/// applies backpressure to the peer.
pub trait PacketSink {
    /// `more` is set when further segments of the same packet follow.
    fn deliver(&mut self, segment: &[u8], more: bool);
}

impl<F> PacketSink for F
where
    F: FnMut(&[u8], bool),
{
    fn deliver(&mut self, segment: &[u8], more: bool) {
        self(segment, more)
    }
}

/// A sink that joins continuation chains back into whole packets.
///
/// Chains that grow beyond `max_len` are dropped up to and including their
/// final segment.
pub struct Reassembler<F> {
    on_packet: F,
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
    dropped: u64,
}

impl<F> Reassembler<F>
where
    F: FnMut(&[u8]),
{
    pub fn new(max_len: usize, on_packet: F) -> Self {
        Self {
            on_packet,
            buf: Vec::new(),
            max_len,
            discarding: false,
            dropped: 0,
        }
    }

    /// Packets dropped for exceeding `max_len`.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes buffered for a packet whose last segment has not arrived.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

impl<F> PacketSink for Reassembler<F>
where
    F: FnMut(&[u8]),
{
    fn deliver(&mut self, segment: &[u8], more: bool) {
        if !self.discarding {
            if self.buf.len() + segment.len() > self.max_len {
                warn!(
                    len = self.buf.len() + segment.len(),
                    max = self.max_len,
                    "dropping oversized packet"
                );
                self.buf.clear();
                self.discarding = true;
                self.dropped += 1;
            } else if !more && self.buf.is_empty() {
                // Single-segment packet.
                (self.on_packet)(segment);
                return;
            } else {
                self.buf.extend_from_slice(segment);
            }
        }

        if !more {
            if !self.discarding {
                (self.on_packet)(&self.buf);
            }
            self.buf.clear();
            self.discarding = false;
        }
    }
}
