//! memif: connection core for shared-memory packet interfaces.
//!
//! Two endpoints, a master and a slave, exchange packets through fixed-size
//! ring slots. This crate holds the parts with the interesting invariants:
//!
//! - the connection lifecycle ([`ConnectionController`])
//! - the receive drain and refill ([`rx::drain`])
//! - transmit segmentation into dataroom-sized chains ([`tx::send`])
//! - the control-channel pump ([`EventPoller`])
//!
//! The rings themselves live behind the [`RingTransport`] trait.
//!
//! # Architecture
//!
//! ```text
//!   caller ──poll()──► EventPoller ──► RingTransport::poll_control_events
//!                          │                    │ on_connect / on_disconnect / on_interrupt
//!                          ▼                    ▼
//!                 ConnectionController ◄── pending events
//!                          │
//!   caller ──send()──► tx::send ──► allocate_buffer_chain ─► transmit_burst
//!
//!   interrupt(qid) ──► rx::drain ──► receive_burst ─► PacketSink ─► refill_queue
//! ```
//!
//! [`Connection`] ties these together for a single owner.

mod config;
mod connection;
mod error;
mod metrics;
mod poll;
pub mod rx;
mod sink;
mod state;
mod transport;
pub mod tx;

#[cfg(test)]
mod test_support;

pub use config::{
    ConfigError, ConnectionConfig, Role, DEFAULT_DATAROOM, DEFAULT_RING_SIZE_LOG2, MAX_DATAROOM,
    MAX_QUEUES, MAX_RING_SIZE_LOG2, MAX_SOCKET_PATH_LEN,
};
pub use connection::Connection;
pub use error::{SendError, SetupError, ShutdownError, StateError, TransportError};
pub use metrics::ConnectionMetrics;
pub use poll::{ConnectionEvent, EventPoller};
pub use rx::{DrainSummary, RX_BURST_SIZE};
pub use sink::{PacketSink, Reassembler};
pub use state::{ConnectionController, ConnectionState};
pub use transport::{
    ConnectionArgs, ConnectionEventSink, RingTransport, RxDescriptor, SessionGeometry, SocketArgs, TxDescriptor,
};
pub use tx::{MAX_SEGMENTS, TX_QUEUE};
