//! Transmit segmentation.
//!
//! A packet is written into a chain of dataroom-sized slots. Every slot but
//! the last carries the continuation flag; the payloads of the chain, in
//! order, are exactly the packet bytes.

use tracing::{debug, trace};

use crate::error::{SendError, StateError};
use crate::metrics::ConnectionMetrics;
use crate::state::ConnectionState;
use crate::transport::{RingTransport, TxDescriptor};

/// Most slots one packet may span.
pub const MAX_SEGMENTS: usize = 8;

/// Queue used for transmit.
pub const TX_QUEUE: u16 = 0;

/// Number of slots a payload of `len` bytes occupies, or `None` for a zero
/// dataroom.
///
/// An empty packet still takes one (empty) slot.
#[inline]
pub fn segment_count(len: usize, dataroom: u32) -> Option<usize> {
    if dataroom == 0 {
        return None;
    }
    Some(len.div_ceil(dataroom as usize).max(1))
}

/// Check the send preconditions without touching the transport.
///
/// Returns the number of segments the payload needs. With a zero dataroom
/// nothing fits.
pub fn check(state: ConnectionState, len: usize, dataroom: u32) -> Result<u16, StateError> {
    if state != ConnectionState::Up {
        return Err(StateError::NotConnected { state });
    }
    let limit = MAX_SEGMENTS * dataroom as usize;
    let too_large = StateError::PacketTooLarge {
        len,
        max: limit.saturating_sub(1),
    };
    if len >= limit {
        return Err(too_large);
    }
    match segment_count(len, dataroom) {
        // Bounded by MAX_SEGMENTS.
        Some(segments) => Ok(segments as u16),
        None => Err(too_large),
    }
}

/// Copy `payload` into `chain` in order, setting continuation flags.
///
/// Fails without partial effects visible to the peer if the chain cannot hold
/// the payload.
pub fn fill_chain(chain: &mut [TxDescriptor], payload: &[u8]) -> Result<(), SendError> {
    let capacity: usize = chain.iter().map(TxDescriptor::capacity).sum();
    if chain.is_empty() || capacity < payload.len() {
        return Err(SendError::ShortChain {
            capacity,
            len: payload.len(),
        });
    }

    let last = chain.len() - 1;
    let mut remaining = payload;
    for (i, desc) in chain.iter_mut().enumerate() {
        let n = desc.fill(remaining);
        remaining = &remaining[n..];
        desc.set_more(i < last);
    }
    debug_assert!(remaining.is_empty());
    Ok(())
}

/// Segment `payload` and submit it as one transmit burst on [`TX_QUEUE`].
///
/// No retry: on any failure the allocated chain is discarded and the caller
/// resends the whole payload if it wants to.
pub fn send<T>(
    transport: &mut T,
    conn: &T::Connection,
    state: ConnectionState,
    dataroom: u32,
    payload: &[u8],
    metrics: &mut ConnectionMetrics,
) -> Result<(), SendError>
where
    T: RingTransport,
{
    let segments = check(state, payload.len(), dataroom)?;

    let result = transmit(transport, conn, segments, payload);
    match &result {
        Ok(()) => {
            metrics.tx_packets += 1;
            metrics.tx_segments += u64::from(segments);
            metrics.tx_bytes += payload.len() as u64;
            trace!(len = payload.len(), segments, "sent");
        }
        Err(err) => {
            metrics.tx_failures += 1;
            debug!(len = payload.len(), segments, error = %err, "send failed");
        }
    }
    result
}

fn transmit<T: RingTransport>(
    transport: &mut T,
    conn: &T::Connection,
    segments: u16,
    payload: &[u8],
) -> Result<(), SendError> {
    let mut chain = transport.allocate_buffer_chain(conn, TX_QUEUE, segments, payload.len())?;
    if chain.len() != usize::from(segments) {
        return Err(SendError::ChainMismatch {
            expected: segments,
            got: chain.len(),
        });
    }
    fill_chain(&mut chain, payload)?;

    let sent = transport.transmit_burst(conn, TX_QUEUE, chain)?;
    if sent != 1 {
        return Err(SendError::Incomplete { sent });
    }
    Ok(())
}
