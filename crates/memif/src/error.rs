//! Error types for memif connections.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::state::ConnectionState;

/// Failure reported by a ring transport operation.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection handle has no established session.
    #[error("connection is not established")]
    NotConnected,

    /// The ring has fewer free slots than requested.
    #[error("not enough ring buffers: requested {requested}, available {available}")]
    NoBuffers { requested: usize, available: usize },

    /// The queue id is outside the connection's queue range.
    #[error("invalid queue id {0}")]
    InvalidQueue(u16),

    /// The handle was already deleted or belongs to another transport.
    #[error("invalid or stale handle")]
    InvalidHandle,

    /// The requested number of slots cannot hold the payload at the
    /// session's dataroom.
    #[error("{len} bytes need {needed} slots of {dataroom} bytes, {requested} requested")]
    ChainTooShort {
        len: usize,
        needed: usize,
        requested: u16,
        dataroom: usize,
    },

    /// Another endpoint already owns this socket path / interface id.
    #[error("address already in use")]
    AddrInUse,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

/// Construction failed; no handle survives.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to create socket {path}: {source}")]
    Socket {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to create interface {interface_id}: {source}")]
    Connection {
        interface_id: u32,
        #[source]
        source: TransportError,
    },
}

/// Caller misuse, rejected before any transport call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("not connected (state {state:?})")]
    NotConnected { state: ConnectionState },

    #[error("packet of {len} bytes exceeds the {max} byte limit")]
    PacketTooLarge { len: usize, max: usize },
}

/// Why `send` did not transmit the packet.
#[derive(Error, Debug)]
pub enum SendError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The allocated chain cannot hold the payload.
    #[error("buffer chain holds {capacity} bytes, payload needs {len}")]
    ShortChain { capacity: usize, len: usize },

    /// The transport handed back a chain of the wrong length.
    #[error("transport allocated {got} segments, expected {expected}")]
    ChainMismatch { expected: u16, got: usize },

    /// The transport did not report exactly one packet sent.
    #[error("transmit burst reported {sent} packets, expected 1")]
    Incomplete { sent: u16 },
}

impl SendError {
    /// True for rejections that happened before any transport call.
    pub fn is_state(&self) -> bool {
        matches!(self, SendError::State(_))
    }
}

/// Failure while releasing handles. Logged by `close`, never returned.
#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("failed to delete connection: {0}")]
    Connection(#[source] TransportError),

    #[error("failed to delete socket: {0}")]
    Socket(#[source] TransportError),
}
