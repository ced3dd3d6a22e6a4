//! Receive burst drain and refill.
//!
//! One drain per queue interrupt: take at most [`RX_BURST_SIZE`] ready
//! descriptors, hand each to the sink in ring order, then refill exactly as
//! many slots as were consumed. Consumed-but-unrefilled slots therefore never
//! exceed one burst.

use tracing::{trace, warn};

use crate::error::TransportError;
use crate::metrics::ConnectionMetrics;
use crate::sink::PacketSink;
use crate::transport::RingTransport;

/// Most descriptors taken from a queue per interrupt.
pub const RX_BURST_SIZE: u16 = 16;

/// Outcome of one successful drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Segments delivered to the sink, and slots refilled.
    pub segments: u16,
    /// Delivered segments that ended a packet.
    pub packets: u16,
}

/// Drain one burst from queue `qid` into `sink`.
///
/// If the receive itself fails nothing was consumed and nothing is refilled;
/// the next interrupt retries. A transport that returns more than a burst is
/// treated as a failed receive: nothing is delivered. If the refill fails the segments have already
/// been delivered and the error is returned for reporting.
pub fn drain<T, S>(
    transport: &mut T,
    conn: &T::Connection,
    qid: u16,
    sink: &mut S,
    metrics: &mut ConnectionMetrics,
) -> Result<DrainSummary, TransportError>
where
    T: RingTransport,
    S: PacketSink + ?Sized,
{
    let mut summary = DrainSummary::default();
    {
        let burst = transport.receive_burst(conn, qid, RX_BURST_SIZE)?;
        if burst.len() > usize::from(RX_BURST_SIZE) {
            return Err(TransportError::Other(format!(
                "receive burst returned {} descriptors, limit {}",
                burst.len(),
                RX_BURST_SIZE
            )));
        }

        for desc in &burst {
            sink.deliver(desc.data(), desc.has_more());
            summary.segments += 1;
            if !desc.has_more() {
                summary.packets += 1;
            }
        }
        // Descriptors borrow ring slots; they are gone before the refill.
    }

    metrics.rx_segments += u64::from(summary.segments);
    metrics.rx_packets += u64::from(summary.packets);
    if summary.segments > 0 {
        metrics.rx_bursts += 1;
    }

    if let Err(err) = transport.refill_queue(conn, qid, summary.segments) {
        warn!(qid, count = summary.segments, error = %err, "refill after drain failed");
        return Err(err);
    }
    metrics.rx_refilled += u64::from(summary.segments);

    trace!(qid, segments = summary.segments, packets = summary.packets, "drained");
    Ok(summary)
}
