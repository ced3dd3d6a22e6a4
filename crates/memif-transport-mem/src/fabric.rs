//! Shared registry of sockets, interfaces and live sessions.
//!
//! Interfaces meet on a link identified by `(socket path, interface id)`. A
//! link has at most one master and one slave. The master listens; a session
//! starts when the slave requests a connection while the master is present,
//! and ends when either side is deleted or the fabric drops it.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use memif::{ConnectionArgs, ConnectionEvent, Role, SessionGeometry, TransportError, TxDescriptor};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::doorbell::Doorbell;
use crate::ring::{Slot, SlotRing};
use crate::transport::MemTransport;

/// Occupancy of one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub capacity: usize,
    /// Slots the transmitter may fill.
    pub posted: usize,
    /// Filled slots not yet received.
    pub ready: usize,
    /// Received slots not yet refilled.
    pub held: usize,
}

/// Which ring of a queue, seen from one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

/// An in-process medium that [`MemTransport`]s attach to.
///
/// Cheap to clone; every clone refers to the same registry.
#[derive(Clone, Default)]
pub struct MemFabric {
    state: Arc<Mutex<FabricState>>,
}

impl MemFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new transport attached to this fabric.
    pub fn transport(&self) -> MemTransport {
        MemTransport::new(self.clone())
    }

    /// Drop the live session on a link, as if the peer had vanished.
    ///
    /// Both endpoints see a disconnect on their next poll; the slave's next
    /// connection request starts a fresh session. Returns false if no session
    /// was up.
    pub fn disconnect(&self, path: &str, interface_id: u32) -> bool {
        let mut state = self.lock();
        let link = state.by_key.get(&(path.to_owned(), interface_id)).copied();
        match link {
            Some(link) => state.teardown(link),
            None => false,
        }
    }

    pub fn is_connected(&self, path: &str, interface_id: u32) -> bool {
        let state = self.lock();
        state
            .by_key
            .get(&(path.to_owned(), interface_id))
            .and_then(|id| state.links.get(id))
            .is_some_and(|link| link.session.is_some())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock()
    }
}

impl std::fmt::Debug for MemFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(state) = self.state.try_lock() else {
            return f.write_str("MemFabric { <locked> }");
        };
        f.debug_struct("MemFabric")
            .field("sockets", &state.sockets.len())
            .field("endpoints", &state.endpoints.len())
            .field("links", &state.links.len())
            .finish()
    }
}

struct SocketEntry {
    path: String,
}

struct Endpoint {
    socket: u64,
    link: u64,
    role: Role,
    args: ConnectionArgs,
    events: VecDeque<ConnectionEvent>,
}

struct Link {
    key: (String, u32),
    master: Option<u64>,
    slave: Option<u64>,
    session: Option<Session>,
}

struct Lane {
    ring: SlotRing,
    tx_bell: Doorbell,
    rx_bell: Doorbell,
}

impl Lane {
    fn new(capacity: usize) -> io::Result<Self> {
        let (tx_bell, rx_bell) = Doorbell::create_pair()?;
        Ok(Self {
            ring: SlotRing::new(capacity),
            tx_bell,
            rx_bell,
        })
    }

    fn stats(&self) -> RingStats {
        RingStats {
            capacity: self.ring.capacity(),
            posted: self.ring.posted(),
            ready: self.ring.ready(),
            held: self.ring.held(),
        }
    }
}

struct QueuePair {
    to_master: Lane,
    to_slave: Lane,
}

impl QueuePair {
    fn towards_master(role: Role, dir: Direction) -> bool {
        matches!(
            (role, dir),
            (Role::Master, Direction::Rx) | (Role::Slave, Direction::Tx)
        )
    }

    fn lane(&self, role: Role, dir: Direction) -> &Lane {
        if Self::towards_master(role, dir) {
            &self.to_master
        } else {
            &self.to_slave
        }
    }

    fn lane_mut(&mut self, role: Role, dir: Direction) -> &mut Lane {
        if Self::towards_master(role, dir) {
            &mut self.to_master
        } else {
            &mut self.to_slave
        }
    }
}

/// Rings of one established session. The master's configuration sizes them.
struct Session {
    dataroom: usize,
    capacity: usize,
    queues: Vec<QueuePair>,
}

impl Session {
    fn new(master: &ConnectionArgs, slave: &ConnectionArgs) -> io::Result<Self> {
        let capacity = 1usize << master.ring_size_log2;
        let count = master.queue_count.min(slave.queue_count);
        let mut queues = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            queues.push(QueuePair {
                to_master: Lane::new(capacity)?,
                to_slave: Lane::new(capacity)?,
            });
        }
        Ok(Self {
            dataroom: master.dataroom as usize,
            capacity,
            queues,
        })
    }

    fn geometry(&self) -> SessionGeometry {
        SessionGeometry {
            dataroom: self.dataroom as u32,
            // Validated configs cap the exponent at 14.
            ring_capacity: u16::try_from(self.capacity).unwrap_or(u16::MAX),
            queue_count: self.queues.len() as u16,
        }
    }
}

#[derive(Default)]
pub(crate) struct FabricState {
    next_id: u64,
    sockets: HashMap<u64, SocketEntry>,
    endpoints: HashMap<u64, Endpoint>,
    links: HashMap<u64, Link>,
    by_key: HashMap<(String, u32), u64>,
}

impl FabricState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn add_socket(&mut self, path: &str, app_name: &str) -> u64 {
        let id = self.alloc_id();
        self.sockets.insert(
            id,
            SocketEntry {
                path: path.to_owned(),
            },
        );
        debug!(socket = id, path, app_name, "socket created");
        id
    }

    /// Delete a socket. Interfaces still on it are deleted with it.
    pub(crate) fn remove_socket(&mut self, id: u64) -> Result<(), TransportError> {
        let entry = self
            .sockets
            .remove(&id)
            .ok_or(TransportError::InvalidHandle)?;

        let orphans: Vec<u64> = self
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.socket == id)
            .map(|(&ep_id, _)| ep_id)
            .collect();
        for ep_id in orphans {
            warn!(path = %entry.path, endpoint = ep_id, "socket deleted with a live interface");
            self.remove_endpoint(ep_id)?;
        }

        debug!(socket = id, path = %entry.path, "socket deleted");
        Ok(())
    }

    pub(crate) fn add_endpoint(
        &mut self,
        socket: u64,
        args: &ConnectionArgs,
    ) -> Result<u64, TransportError> {
        let path = self
            .sockets
            .get(&socket)
            .ok_or(TransportError::InvalidHandle)?
            .path
            .clone();

        let key = (path, args.interface_id);
        let existing = self.by_key.get(&key).copied();
        let link_id = match existing {
            Some(id) => id,
            None => {
                let id = self.alloc_id();
                self.links.insert(
                    id,
                    Link {
                        key: key.clone(),
                        master: None,
                        slave: None,
                        session: None,
                    },
                );
                self.by_key.insert(key.clone(), id);
                id
            }
        };

        let id = self.alloc_id();
        let link = self
            .links
            .get_mut(&link_id)
            .ok_or(TransportError::InvalidHandle)?;
        let slot = match args.role {
            Role::Master => &mut link.master,
            Role::Slave => &mut link.slave,
        };
        if slot.is_some() {
            return Err(TransportError::AddrInUse);
        }
        *slot = Some(id);

        self.endpoints.insert(
            id,
            Endpoint {
                socket,
                link: link_id,
                role: args.role,
                args: args.clone(),
                events: VecDeque::new(),
            },
        );

        info!(
            path = %key.0,
            interface_id = args.interface_id,
            role = %args.role,
            "interface registered"
        );
        Ok(id)
    }

    /// Delete an interface. A live session ends and the peer is told.
    pub(crate) fn remove_endpoint(&mut self, id: u64) -> Result<(), TransportError> {
        let ep = self
            .endpoints
            .remove(&id)
            .ok_or(TransportError::InvalidHandle)?;
        self.teardown(ep.link);

        let mut orphaned_key = None;
        if let Some(link) = self.links.get_mut(&ep.link) {
            match ep.role {
                Role::Master => link.master = None,
                Role::Slave => link.slave = None,
            }
            if link.master.is_none() && link.slave.is_none() {
                orphaned_key = Some(link.key.clone());
            }
        }
        if let Some(key) = orphaned_key {
            self.links.remove(&ep.link);
            self.by_key.remove(&key);
        }
        Ok(())
    }

    /// End the session on `link_id`, queueing a disconnect for each endpoint
    /// still attached.
    fn teardown(&mut self, link_id: u64) -> bool {
        let Some(link) = self.links.get_mut(&link_id) else {
            return false;
        };
        if link.session.take().is_none() {
            return false;
        }
        info!(path = %link.key.0, interface_id = link.key.1, "session down");

        for ep_id in [link.master, link.slave].into_iter().flatten() {
            if let Some(ep) = self.endpoints.get_mut(&ep_id) {
                ep.events.push_back(ConnectionEvent::Disconnected);
            }
        }
        true
    }

    /// Start a session if `id` is a slave whose master is listening.
    ///
    /// Requests from a master, or while a session is up, do nothing. A slave
    /// without a listening master stays pending and may ask again.
    pub(crate) fn request_connection(&mut self, id: u64) -> Result<(), TransportError> {
        let ep = self.endpoints.get(&id).ok_or(TransportError::InvalidHandle)?;
        let link_id = ep.link;
        let link = self
            .links
            .get(&link_id)
            .ok_or(TransportError::InvalidHandle)?;
        if link.session.is_some() || ep.role.is_master() {
            return Ok(());
        }
        let Some(master_id) = link.master else {
            trace!(path = %link.key.0, interface_id = link.key.1, "no master listening");
            return Ok(());
        };
        let master = self
            .endpoints
            .get(&master_id)
            .ok_or(TransportError::InvalidHandle)?;

        let session = Session::new(&master.args, &ep.args)?;
        info!(
            path = %link.key.0,
            interface_id = link.key.1,
            queues = session.queues.len(),
            dataroom = session.dataroom,
            "session up"
        );

        if let Some(link) = self.links.get_mut(&link_id) {
            link.session = Some(session);
        }
        for ep_id in [master_id, id] {
            if let Some(ep) = self.endpoints.get_mut(&ep_id) {
                ep.events.push_back(ConnectionEvent::Connected);
            }
        }
        Ok(())
    }

    /// Collect pending control events for every interface on `socket`, then
    /// an interrupt for each receive queue that was signalled or still has
    /// ready slots.
    pub(crate) fn poll_socket(
        &mut self,
        socket: u64,
        out: &mut Vec<ConnectionEvent>,
    ) -> Result<(), TransportError> {
        if !self.sockets.contains_key(&socket) {
            return Err(TransportError::InvalidHandle);
        }

        for ep in self.endpoints.values_mut().filter(|ep| ep.socket == socket) {
            out.extend(ep.events.drain(..));

            let Some(session) = self.links.get(&ep.link).and_then(|l| l.session.as_ref()) else {
                continue;
            };
            for (qid, pair) in session.queues.iter().enumerate() {
                let lane = pair.lane(ep.role, Direction::Rx);
                let rung = lane.rx_bell.drain();
                if rung || lane.ring.ready() > 0 {
                    // Bounded by MAX_QUEUES.
                    out.push(ConnectionEvent::Interrupt(qid as u16));
                }
            }
        }
        Ok(())
    }

    fn session_lane(
        &mut self,
        id: u64,
        qid: u16,
        dir: Direction,
    ) -> Result<(&mut Lane, usize), TransportError> {
        let ep = self.endpoints.get(&id).ok_or(TransportError::InvalidHandle)?;
        let role = ep.role;
        let session = self
            .links
            .get_mut(&ep.link)
            .and_then(|l| l.session.as_mut())
            .ok_or(TransportError::NotConnected)?;
        let dataroom = session.dataroom;
        let pair = session
            .queues
            .get_mut(usize::from(qid))
            .ok_or(TransportError::InvalidQueue(qid))?;
        Ok((pair.lane_mut(role, dir), dataroom))
    }

    pub(crate) fn geometry(&self, id: u64) -> Result<SessionGeometry, TransportError> {
        let ep = self.endpoints.get(&id).ok_or(TransportError::InvalidHandle)?;
        self.links
            .get(&ep.link)
            .and_then(|l| l.session.as_ref())
            .map(Session::geometry)
            .ok_or(TransportError::NotConnected)
    }

    pub(crate) fn refill(&mut self, id: u64, qid: u16, count: u16) -> Result<(), TransportError> {
        let (lane, _) = self.session_lane(id, qid, Direction::Rx)?;
        lane.ring.post(usize::from(count))
    }

    pub(crate) fn receive(
        &mut self,
        id: u64,
        qid: u16,
        max: u16,
        out: &mut Vec<Slot>,
    ) -> Result<(), TransportError> {
        let (lane, _) = self.session_lane(id, qid, Direction::Rx)?;
        lane.ring.take_burst(usize::from(max), out);
        Ok(())
    }

    /// Hand out fresh slot buffers covering `total_len` bytes, never more
    /// than `hint` of them.
    ///
    /// Slots are only claimed from the ring when the chain is transmitted, so
    /// an abandoned chain costs nothing.
    pub(crate) fn allocate(
        &mut self,
        id: u64,
        qid: u16,
        hint: u16,
        total_len: usize,
    ) -> Result<Vec<TxDescriptor>, TransportError> {
        let (lane, dataroom) = self.session_lane(id, qid, Direction::Tx)?;
        let segments = total_len.div_ceil(dataroom).max(1);
        if segments > usize::from(hint) {
            debug!(hint, segments, dataroom, "payload needs more slots than requested");
            return Err(TransportError::ChainTooShort {
                len: total_len,
                needed: segments,
                requested: hint,
                dataroom,
            });
        }
        lane.ring.can_transmit(segments)?;
        Ok((0..segments)
            .map(|_| TxDescriptor::new(vec![0u8; dataroom].into_boxed_slice()))
            .collect())
    }

    /// Queue a chain for the peer and ring its doorbell.
    ///
    /// Returns the number of complete packets in the chain.
    pub(crate) fn transmit(
        &mut self,
        id: u64,
        qid: u16,
        chain: Vec<TxDescriptor>,
    ) -> Result<u16, TransportError> {
        let (lane, _) = self.session_lane(id, qid, Direction::Tx)?;
        let packets = chain.iter().filter(|d| !d.has_more()).count();
        lane.ring.push_chain(chain)?;
        lane.tx_bell.signal();
        Ok(u16::try_from(packets).unwrap_or(u16::MAX))
    }

    pub(crate) fn interrupt_doorbell(&mut self, id: u64, qid: u16) -> Result<Doorbell, TransportError> {
        let (lane, _) = self.session_lane(id, qid, Direction::Rx)?;
        Ok(lane.rx_bell.try_clone()?)
    }

    pub(crate) fn ring_stats(
        &mut self,
        id: u64,
        qid: u16,
        dir: Direction,
    ) -> Result<RingStats, TransportError> {
        let (lane, _) = self.session_lane(id, qid, dir)?;
        Ok(lane.stats())
    }
}
