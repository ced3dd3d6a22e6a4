//! The ring transport collaborator.
//!
//! A `RingTransport` owns the shared-memory rings, slot allocation and the
//! control channel. The connection core drives it through this narrow
//! interface and never sees the ring layout.
//!
//! # Slot ownership
//!
//! ```text
//!   receive_burst ──► RxDescriptor<'_>  (borrowed until the burst is dropped)
//!   refill_queue  ──► slots return to the peer
//!
//!   allocate_buffer_chain ──► Vec<TxDescriptor>  (owned, writable)
//!   transmit_burst        ──► chain moves back into the ring
//! ```
//!
//! Receive descriptors borrow the transport, so they cannot outlive the
//! `refill_queue` call that hands their slots back. Transmit descriptors are
//! owned values that must be moved into `transmit_burst`, so the core can only
//! write into slots it allocated and cannot touch them after submission.

use std::time::Duration;

use crate::config::Role;
use crate::error::TransportError;

/// Arguments for `RingTransport::create_socket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketArgs {
    pub path: String,
    pub app_name: String,
}

/// Arguments for `RingTransport::create_connection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionArgs {
    pub interface_id: u32,
    pub role: Role,
    pub dataroom: u32,
    pub ring_size_log2: u8,
    pub queue_count: u16,
}

/// Ring geometry of an established session.
///
/// The master sizes the rings, so either side's configuration may differ from
/// what the session actually uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionGeometry {
    /// Bytes per slot.
    pub dataroom: u32,
    /// Slots per ring.
    pub ring_capacity: u16,
    /// Queues per direction.
    pub queue_count: u16,
}

/// Connection-level events raised by the transport.
///
/// The sink is only borrowed for the duration of
/// [`RingTransport::poll_control_events`]; transports never store it.
pub trait ConnectionEventSink {
    /// The handshake with the peer completed.
    fn on_connect(&mut self);

    /// The peer went away; handles stay valid.
    fn on_disconnect(&mut self);

    /// Queue `qid` has received buffers ready.
    fn on_interrupt(&mut self, qid: u16);
}

/// A received ring slot, valid until the burst that produced it is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxDescriptor<'a> {
    data: &'a [u8],
    more: bool,
}

impl<'a> RxDescriptor<'a> {
    pub fn new(data: &'a [u8], more: bool) -> Self {
        Self { data, more }
    }

    /// Bytes actually used in the slot.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// More segments of the same packet follow this one.
    #[inline]
    pub fn has_more(&self) -> bool {
        self.more
    }
}

/// A freshly allocated transmit slot.
///
/// Transports create these from their ring slots; the core fills them and
/// hands them back through `transmit_burst`.
#[derive(Debug)]
pub struct TxDescriptor {
    buf: Box<[u8]>,
    len: usize,
    more: bool,
}

impl TxDescriptor {
    /// Wrap a slot buffer. The whole buffer is usable capacity.
    pub fn new(buf: Box<[u8]>) -> Self {
        Self {
            buf,
            len: 0,
            more: false,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn has_more(&self) -> bool {
        self.more
    }

    /// Copy as much of `src` as fits, replacing previous contents.
    /// Returns the number of bytes taken.
    pub fn fill(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.buf.len());
        self.buf[..n].copy_from_slice(&src[..n]);
        self.len = n;
        n
    }

    pub fn set_more(&mut self, more: bool) {
        self.more = more;
    }

    /// The used part of the slot.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Give the slot buffer back to the transport.
    pub fn into_parts(self) -> (Box<[u8]>, usize, bool) {
        (self.buf, self.len, self.more)
    }
}

/// Operations the connection core needs from a shared-memory ring transport.
///
/// All calls are non-blocking. A transport instance is driven by a single
/// owner; none of these methods are expected to be reentrant.
pub trait RingTransport {
    /// Handle to a host socket.
    type Socket;
    /// Handle to one interface on a socket. Invalid once its socket is deleted.
    type Connection;

    fn create_socket(&mut self, args: &SocketArgs) -> Result<Self::Socket, TransportError>;

    fn create_connection(
        &mut self,
        socket: &Self::Socket,
        args: &ConnectionArgs,
    ) -> Result<Self::Connection, TransportError>;

    fn delete_connection(&mut self, conn: Self::Connection) -> Result<(), TransportError>;

    fn delete_socket(&mut self, socket: Self::Socket) -> Result<(), TransportError>;

    /// Process pending control-channel events, raising them on `events`.
    fn poll_control_events(
        &mut self,
        socket: &Self::Socket,
        timeout: Duration,
        events: &mut dyn ConnectionEventSink,
    ) -> Result<(), TransportError>;

    /// Ask the transport to (re)establish the session with the peer.
    fn request_connection(&mut self, conn: &Self::Connection) -> Result<(), TransportError>;

    /// Geometry of the established session. Fails with `NotConnected` when
    /// there is none.
    fn session_geometry(&self, conn: &Self::Connection) -> Result<SessionGeometry, TransportError>;

    /// Take up to `max` ready descriptors from queue `qid`, in ring order.
    fn receive_burst(
        &mut self,
        conn: &Self::Connection,
        qid: u16,
        max: u16,
    ) -> Result<Vec<RxDescriptor<'_>>, TransportError>;

    /// Return `count` consumed receive slots of queue `qid` to the peer.
    fn refill_queue(
        &mut self,
        conn: &Self::Connection,
        qid: u16,
        count: u16,
    ) -> Result<(), TransportError>;

    /// Allocate a chain of at most `segment_hint` slots covering `total_len`
    /// bytes.
    fn allocate_buffer_chain(
        &mut self,
        conn: &Self::Connection,
        qid: u16,
        segment_hint: u16,
        total_len: usize,
    ) -> Result<Vec<TxDescriptor>, TransportError>;

    /// Submit filled chains. Returns the number of packets sent.
    fn transmit_burst(
        &mut self,
        conn: &Self::Connection,
        qid: u16,
        chain: Vec<TxDescriptor>,
    ) -> Result<u16, TransportError>;
}
