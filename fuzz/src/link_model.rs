//! A master/slave link on the in-memory transport, checked against a model.
//!
//! The model tracks, per end, which packets are in flight towards it. A
//! session loss (fabric disconnect or either end closing) discards whatever
//! was in flight, including the tail of a partially drained chain.
//!
//! Each end has its own dataroom and ring size. The master's win: the send
//! limit the model expects is derived from the master's dataroom on both
//! sides.

use std::collections::VecDeque;

use memif::{Connection, ConnectionConfig, ConnectionState, Role, MAX_SEGMENTS, RX_BURST_SIZE};
use memif_testkit::SegmentLog;
use memif_transport_mem::{MemFabric, MemTransport};

pub const DATAROOM: u32 = 64;
/// 32 slots per ring: room for more than one burst, small enough that an
/// idle receiver runs the sender dry.
pub const RING_SIZE_LOG2: u8 = 5;

/// Ring parameters one end opens with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndGeometry {
    pub dataroom: u32,
    pub ring_size_log2: u8,
}

impl EndGeometry {
    pub const DEFAULT: Self = Self {
        dataroom: DATAROOM,
        ring_size_log2: RING_SIZE_LOG2,
    };
}

const SOCKET: &str = "/run/memif-fuzz.sock";
const INTERFACE_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Master,
    Slave,
}

impl Side {
    fn role(self) -> Role {
        match self {
            Side::Master => Role::Master,
            Side::Slave => Role::Slave,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Master => 0,
            Side::Slave => 1,
        }
    }

    fn peer(self) -> Side {
        match self {
            Side::Master => Side::Slave,
            Side::Slave => Side::Master,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LinkOp {
    Poll(Side),
    /// `len` is reduced modulo a little over the send limit.
    Send { from: Side, len: u16 },
    /// Drop the session under both ends.
    Disconnect,
    Close(Side),
    Reopen(Side),
}

type Conn = Connection<MemTransport, SegmentLog>;

struct End {
    conn: Option<Conn>,
    log: SegmentLog,
    /// Segments of `log` already checked.
    cursor: usize,
    /// Bytes of a chain whose last segment has not arrived.
    partial: Vec<u8>,
    /// Packets sent towards this end, oldest first.
    expected: VecDeque<Vec<u8>>,
}

impl End {
    fn closed() -> Self {
        Self {
            conn: None,
            log: SegmentLog::new(),
            cursor: 0,
            partial: Vec::new(),
            expected: VecDeque::new(),
        }
    }
}

pub struct LinkModel {
    fabric: MemFabric,
    ends: [End; 2],
    geometry: [EndGeometry; 2],
    sends: usize,
}

impl LinkModel {
    /// Both ends open with the default geometry, not yet connected.
    pub fn new() -> Result<Self, String> {
        Self::with_geometry(EndGeometry::DEFAULT, EndGeometry::DEFAULT)
    }

    pub fn with_geometry(master: EndGeometry, slave: EndGeometry) -> Result<Self, String> {
        let mut model = Self {
            fabric: MemFabric::new(),
            ends: [End::closed(), End::closed()],
            geometry: [master, slave],
            sends: 0,
        };
        model.open(Side::Master)?;
        model.open(Side::Slave)?;
        Ok(model)
    }

    fn open(&mut self, side: Side) -> Result<(), String> {
        let geometry = self.geometry[side.index()];
        let config = ConnectionConfig::new(SOCKET, INTERFACE_ID, side.role())
            .with_dataroom(geometry.dataroom)
            .with_ring_size_log2(geometry.ring_size_log2);
        let log = SegmentLog::new();
        let conn = Connection::open(self.fabric.transport(), config, log.clone())
            .map_err(|e| format!("open {:?}: {}", side, e))?;

        let end = &mut self.ends[side.index()];
        *end = End::closed();
        end.conn = Some(conn);
        end.log = log;
        Ok(())
    }

    fn session_lost(&mut self) {
        for end in &mut self.ends {
            end.expected.clear();
            end.partial.clear();
            end.cursor = end.log.len();
        }
    }

    pub fn state(&self, side: Side) -> Option<ConnectionState> {
        self.ends[side.index()].conn.as_ref().map(|c| c.state())
    }

    pub fn apply(&mut self, op: LinkOp) -> Result<(), String> {
        match op {
            LinkOp::Poll(side) => self.poll(side),
            LinkOp::Send { from, len } => self.send(from, len),
            LinkOp::Disconnect => {
                if self.fabric.disconnect(SOCKET, INTERFACE_ID) {
                    self.session_lost();
                }
                Ok(())
            }
            LinkOp::Close(side) => {
                let was_connected = self.fabric.is_connected(SOCKET, INTERFACE_ID);
                if self.ends[side.index()].conn.take().is_some() && was_connected {
                    self.session_lost();
                }
                Ok(())
            }
            LinkOp::Reopen(side) => {
                if self.ends[side.index()].conn.is_none() {
                    self.open(side)?;
                }
                Ok(())
            }
        }
    }

    fn poll(&mut self, side: Side) -> Result<(), String> {
        let end = &mut self.ends[side.index()];
        let Some(conn) = end.conn.as_mut() else {
            return Ok(());
        };
        conn.poll();

        let segments = end.log.segments();
        let fresh = &segments[end.cursor..];

        // INVARIANT: one queue, so at most one burst per poll
        if fresh.len() > usize::from(RX_BURST_SIZE) {
            return Err(format!("{:?} took {} segments in one poll", side, fresh.len()));
        }

        // INVARIANT: packets arrive whole and in send order
        for (data, more) in fresh {
            end.partial.extend_from_slice(data);
            if *more {
                continue;
            }
            let packet = std::mem::take(&mut end.partial);
            match end.expected.pop_front() {
                Some(want) if want == packet => {}
                Some(want) => {
                    return Err(format!(
                        "{:?} received {} bytes, expected {}",
                        side,
                        packet.len(),
                        want.len()
                    ))
                }
                None => {
                    return Err(format!("{:?} received an unexpected {}-byte packet", side, packet.len()))
                }
            }
        }
        end.cursor = segments.len();
        Ok(())
    }

    fn send(&mut self, from: Side, len: u16) -> Result<(), String> {
        // the master's dataroom sizes every session slot
        let limit = MAX_SEGMENTS * self.geometry[Side::Master.index()].dataroom as usize;
        let len = usize::from(len) % (limit + 8);
        let seq = self.sends;
        self.sends += 1;
        let payload: Vec<u8> = (0..len).map(|j| (seq + j) as u8).collect();

        let Some(conn) = self.ends[from.index()].conn.as_mut() else {
            return Ok(());
        };
        let state = conn.state();
        let before = *conn.metrics();

        match conn.send(&payload) {
            Ok(()) => {
                if state != ConnectionState::Up || len >= limit {
                    return Err(format!("{:?} sent {} bytes while {:?}", from, len, state));
                }
                self.ends[from.peer().index()].expected.push_back(payload);
            }
            Err(e) if e.is_state() => {
                // INVARIANT: rejections are decided by state and length alone
                if state == ConnectionState::Up && len < limit {
                    return Err(format!("{:?} rejected {} bytes while up: {}", from, len, e));
                }
                if *conn.metrics() != before {
                    return Err(format!("{:?} rejection changed metrics", from));
                }
            }
            Err(e) => {
                if state != ConnectionState::Up {
                    return Err(format!("{:?} reached the transport while {:?}: {}", from, state, e));
                }
            }
        }
        Ok(())
    }

    fn check_invariants(&self) -> Result<(), String> {
        for (i, end) in self.ends.iter().enumerate() {
            let Some(conn) = end.conn.as_ref() else {
                continue;
            };
            let m = conn.metrics();
            // INVARIANT: every drained segment is refilled in the same drain
            if m.rx_refilled != m.rx_segments {
                return Err(format!(
                    "end {}: refilled {} of {} received segments",
                    i, m.rx_refilled, m.rx_segments
                ));
            }
            if m.rx_segments != end.log.len() as u64 {
                return Err(format!(
                    "end {}: metrics count {} segments, sink saw {}",
                    i,
                    m.rx_segments,
                    end.log.len()
                ));
            }
        }
        Ok(())
    }
}

/// Run `ops` on a fresh link, checking the model after each one.
pub fn execute_and_verify(ops: &[LinkOp]) -> Result<(), String> {
    execute_and_verify_with(EndGeometry::DEFAULT, EndGeometry::DEFAULT, ops)
}

/// Like [`execute_and_verify`], with each end opened at its own geometry.
pub fn execute_and_verify_with(
    master: EndGeometry,
    slave: EndGeometry,
    ops: &[LinkOp],
) -> Result<(), String> {
    let mut model = LinkModel::with_geometry(master, slave)?;
    for (i, op) in ops.iter().enumerate() {
        model
            .apply(*op)
            .and_then(|()| model.check_invariants())
            .map_err(|e| format!("op {} ({:?}): {}", i, op, e))?;
    }
    Ok(())
}
