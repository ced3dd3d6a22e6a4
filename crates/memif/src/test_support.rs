//! A scripted, recording ring transport for unit tests.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use crate::error::TransportError;
use crate::transport::{
    ConnectionArgs, ConnectionEventSink, RingTransport, RxDescriptor, SessionGeometry, SocketArgs,
    TxDescriptor,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateSocket(String),
    CreateConnection(u32),
    DeleteConnection,
    DeleteSocket,
    PollControl,
    RequestConnection,
    ReceiveBurst { qid: u16, max: u16 },
    Refill { qid: u16, count: u16 },
    Allocate { qid: u16, hint: u16, len: usize },
    Transmit { qid: u16, lens: Vec<usize>, flags: Vec<bool> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedEvent {
    Connect,
    Disconnect,
    Interrupt(u16),
}

pub struct ScriptedTransport {
    pub calls: Vec<Call>,
    pub dataroom: usize,

    pub fail_create_socket: bool,
    pub fail_create_connection: bool,
    pub fail_delete_connection: bool,
    pub fail_delete_socket: bool,
    pub fail_poll: bool,
    pub fail_receive: bool,
    pub fail_refill: bool,
    pub fail_allocate: bool,
    pub fail_geometry: bool,

    /// Overrides the geometry derived from the last `create_connection`.
    pub geometry: Option<SessionGeometry>,
    /// Return every ready segment from `receive_burst`, ignoring `max`.
    pub overrun_bursts: bool,
    /// Overrides the packet count `transmit_burst` reports.
    pub transmit_result: Option<u16>,
    /// Chains submitted so far, as (bytes, more) per segment.
    pub transmitted: Vec<Vec<(Vec<u8>, bool)>>,

    events: VecDeque<ScriptedEvent>,
    rx_ready: HashMap<u16, VecDeque<(Vec<u8>, bool)>>,
    rx_held: Vec<(Vec<u8>, bool)>,
    sockets: usize,
    live: Rc<Cell<usize>>,
    next_id: u32,
    created: Option<ConnectionArgs>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            dataroom: 2048,
            fail_create_socket: false,
            fail_create_connection: false,
            fail_delete_connection: false,
            fail_delete_socket: false,
            fail_poll: false,
            fail_receive: false,
            fail_refill: false,
            fail_allocate: false,
            fail_geometry: false,
            geometry: None,
            overrun_bursts: false,
            transmit_result: None,
            transmitted: Vec::new(),
            events: VecDeque::new(),
            rx_ready: HashMap::new(),
            rx_held: Vec::new(),
            sockets: 0,
            live: Rc::new(Cell::new(0)),
            next_id: 1,
            created: None,
        }
    }

    /// Queue an event for the next `poll_control_events`.
    pub fn raise(&mut self, event: ScriptedEvent) {
        self.events.push_back(event);
    }

    /// Make a received segment ready on `qid`.
    pub fn push_rx(&mut self, qid: u16, data: Vec<u8>, more: bool) {
        self.rx_ready.entry(qid).or_default().push_back((data, more));
    }

    pub fn live_sockets(&self) -> usize {
        self.sockets
    }

    /// Shared count of live socket and connection handles.
    pub fn live_handles(&self) -> Rc<Cell<usize>> {
        self.live.clone()
    }

    fn injected(&self, fail: bool) -> Result<(), TransportError> {
        if fail {
            Err(TransportError::Other("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

impl RingTransport for ScriptedTransport {
    type Socket = u32;
    type Connection = u32;

    fn create_socket(&mut self, args: &SocketArgs) -> Result<u32, TransportError> {
        self.calls.push(Call::CreateSocket(args.path.clone()));
        self.injected(self.fail_create_socket)?;
        self.sockets += 1;
        self.live.set(self.live.get() + 1);
        self.next_id += 1;
        Ok(self.next_id)
    }

    fn create_connection(
        &mut self,
        _socket: &u32,
        args: &ConnectionArgs,
    ) -> Result<u32, TransportError> {
        self.calls.push(Call::CreateConnection(args.interface_id));
        self.injected(self.fail_create_connection)?;
        self.created = Some(args.clone());
        self.live.set(self.live.get() + 1);
        self.next_id += 1;
        Ok(self.next_id)
    }

    fn delete_connection(&mut self, _conn: u32) -> Result<(), TransportError> {
        self.calls.push(Call::DeleteConnection);
        self.live.set(self.live.get() - 1);
        self.injected(self.fail_delete_connection)
    }

    fn delete_socket(&mut self, _socket: u32) -> Result<(), TransportError> {
        self.calls.push(Call::DeleteSocket);
        self.sockets -= 1;
        self.live.set(self.live.get() - 1);
        self.injected(self.fail_delete_socket)
    }

    fn poll_control_events(
        &mut self,
        _socket: &u32,
        _timeout: Duration,
        events: &mut dyn ConnectionEventSink,
    ) -> Result<(), TransportError> {
        self.calls.push(Call::PollControl);
        self.injected(self.fail_poll)?;
        while let Some(event) = self.events.pop_front() {
            match event {
                ScriptedEvent::Connect => events.on_connect(),
                ScriptedEvent::Disconnect => events.on_disconnect(),
                ScriptedEvent::Interrupt(qid) => events.on_interrupt(qid),
            }
        }
        Ok(())
    }

    fn request_connection(&mut self, _conn: &u32) -> Result<(), TransportError> {
        self.calls.push(Call::RequestConnection);
        Ok(())
    }

    fn session_geometry(&self, _conn: &u32) -> Result<SessionGeometry, TransportError> {
        self.injected(self.fail_geometry)?;
        if let Some(geometry) = self.geometry {
            return Ok(geometry);
        }
        let args = self.created.as_ref().ok_or(TransportError::NotConnected)?;
        Ok(SessionGeometry {
            dataroom: args.dataroom,
            ring_capacity: 1 << args.ring_size_log2,
            queue_count: args.queue_count,
        })
    }

    fn receive_burst(
        &mut self,
        _conn: &u32,
        qid: u16,
        max: u16,
    ) -> Result<Vec<RxDescriptor<'_>>, TransportError> {
        self.calls.push(Call::ReceiveBurst { qid, max });
        self.injected(self.fail_receive)?;
        self.rx_held.clear();
        if let Some(ready) = self.rx_ready.get_mut(&qid) {
            let max = if self.overrun_bursts { usize::MAX } else { usize::from(max) };
            while self.rx_held.len() < max {
                match ready.pop_front() {
                    Some(seg) => self.rx_held.push(seg),
                    None => break,
                }
            }
        }
        Ok(self
            .rx_held
            .iter()
            .map(|(data, more)| RxDescriptor::new(data, *more))
            .collect())
    }

    fn refill_queue(&mut self, _conn: &u32, qid: u16, count: u16) -> Result<(), TransportError> {
        self.calls.push(Call::Refill { qid, count });
        self.injected(self.fail_refill)
    }

    fn allocate_buffer_chain(
        &mut self,
        _conn: &u32,
        qid: u16,
        segment_hint: u16,
        total_len: usize,
    ) -> Result<Vec<TxDescriptor>, TransportError> {
        self.calls.push(Call::Allocate {
            qid,
            hint: segment_hint,
            len: total_len,
        });
        self.injected(self.fail_allocate)?;
        let count = total_len.div_ceil(self.dataroom).max(1);
        Ok((0..count)
            .map(|_| TxDescriptor::new(vec![0u8; self.dataroom].into_boxed_slice()))
            .collect())
    }

    fn transmit_burst(
        &mut self,
        _conn: &u32,
        qid: u16,
        chain: Vec<TxDescriptor>,
    ) -> Result<u16, TransportError> {
        self.calls.push(Call::Transmit {
            qid,
            lens: chain.iter().map(TxDescriptor::len).collect(),
            flags: chain.iter().map(TxDescriptor::has_more).collect(),
        });
        self.transmitted.push(
            chain
                .iter()
                .map(|d| (d.data().to_vec(), d.has_more()))
                .collect(),
        );
        Ok(self.transmit_result.unwrap_or(1))
    }
}
