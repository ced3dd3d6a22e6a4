//! Per-connection counters.

/// Counters kept by a [`Connection`](crate::Connection).
///
/// Plain integers: a connection is driven by a single owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionMetrics {
    /// Transitions into `Up`.
    pub connects: u64,
    /// Transitions out of `Up`.
    pub disconnects: u64,
    /// Connection requests issued by `poll`.
    pub connect_requests: u64,
    /// Non-empty receive bursts.
    pub rx_bursts: u64,
    /// Segments handed to the sink.
    pub rx_segments: u64,
    /// Segments without the continuation flag.
    pub rx_packets: u64,
    /// Receive slots handed back to the peer after a drain.
    pub rx_refilled: u64,
    pub tx_packets: u64,
    pub tx_segments: u64,
    pub tx_bytes: u64,
    /// `send` calls that reached the transport and failed.
    pub tx_failures: u64,
    /// Transport errors swallowed on the poll and interrupt paths.
    pub transport_errors: u64,
}
