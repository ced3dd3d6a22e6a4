//! memif-transport-mem: an in-process ring transport for memif.
//!
//! Endpoints attach to a shared [`MemFabric`] and meet on links named by
//! socket path and interface id. It implements the whole
//! [`memif::RingTransport`] contract, including slot accounting and queue
//! interrupts, without shared memory or a control socket. Use it for tests,
//! demos and single-process pipelines.
//!
//! # Characteristics
//!
//! - One slot ring per queue per direction, sized by the master
//! - Slots must be posted by the receiver (refill) before the peer can use them
//! - Socketpair doorbells signal ready data on each receive queue
//! - Control events are queued per interface and reported by polling
//!
//! ```text
//!   MemTransport (master) ──┐                 ┌── MemTransport (slave)
//!                           ▼                 ▼
//!                 ┌──────── MemFabric: link("/run/x.sock", 0) ────────┐
//!                 │  queue 0:  to_master ring + doorbell              │
//!                 │            to_slave  ring + doorbell              │
//!                 └───────────────────────────────────────────────────┘
//! ```

mod doorbell;
mod fabric;
mod ring;
mod transport;

pub use doorbell::{AsyncDoorbell, Doorbell};
pub use fabric::{MemFabric, RingStats};
pub use transport::{MemConnection, MemSocket, MemTransport};
