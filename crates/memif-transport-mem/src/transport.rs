//! `RingTransport` over a [`MemFabric`].

use std::time::Duration;

use memif::{
    ConnectionArgs, ConnectionEvent, ConnectionEventSink, RingTransport, RxDescriptor,
    SessionGeometry, SocketArgs, TransportError, TxDescriptor,
};
use tracing::trace;

use crate::doorbell::Doorbell;
use crate::fabric::{Direction, MemFabric, RingStats};
use crate::ring::Slot;

/// Socket handle issued by a [`MemTransport`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct MemSocket(u64);

/// Interface handle issued by a [`MemTransport`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct MemConnection(u64);

/// An in-process ring transport.
///
/// Each endpoint owns its own transport; endpoints on transports from the
/// same fabric can connect to each other.
///
/// Control events are never waited for: `poll_control_events` reports what is
/// pending and returns, whatever the timeout.
#[derive(Debug)]
pub struct MemTransport {
    fabric: MemFabric,
    /// Slots taken by the last receive burst.
    rx_held: Vec<Slot>,
    polled: Vec<ConnectionEvent>,
}

impl MemTransport {
    pub fn new(fabric: MemFabric) -> Self {
        Self {
            fabric,
            rx_held: Vec::new(),
            polled: Vec::new(),
        }
    }

    pub fn fabric(&self) -> &MemFabric {
        &self.fabric
    }

    /// A handle to the interrupt doorbell of receive queue `qid`.
    ///
    /// The doorbell belongs to the current session; after a reconnect it
    /// never rings again and a new one must be fetched.
    pub fn interrupt_doorbell(
        &self,
        conn: &MemConnection,
        qid: u16,
    ) -> Result<Doorbell, TransportError> {
        self.fabric.lock().interrupt_doorbell(conn.0, qid)
    }

    /// Occupancy of the ring `conn` receives on.
    pub fn rx_ring_stats(&self, conn: &MemConnection, qid: u16) -> Result<RingStats, TransportError> {
        self.fabric.lock().ring_stats(conn.0, qid, Direction::Rx)
    }

    /// Occupancy of the ring `conn` transmits on.
    pub fn tx_ring_stats(&self, conn: &MemConnection, qid: u16) -> Result<RingStats, TransportError> {
        self.fabric.lock().ring_stats(conn.0, qid, Direction::Tx)
    }
}

impl RingTransport for MemTransport {
    type Socket = MemSocket;
    type Connection = MemConnection;

    fn create_socket(&mut self, args: &SocketArgs) -> Result<MemSocket, TransportError> {
        let id = self.fabric.lock().add_socket(&args.path, &args.app_name);
        Ok(MemSocket(id))
    }

    fn create_connection(
        &mut self,
        socket: &MemSocket,
        args: &ConnectionArgs,
    ) -> Result<MemConnection, TransportError> {
        let id = self.fabric.lock().add_endpoint(socket.0, args)?;
        Ok(MemConnection(id))
    }

    fn delete_connection(&mut self, conn: MemConnection) -> Result<(), TransportError> {
        self.rx_held.clear();
        self.fabric.lock().remove_endpoint(conn.0)
    }

    fn delete_socket(&mut self, socket: MemSocket) -> Result<(), TransportError> {
        self.fabric.lock().remove_socket(socket.0)
    }

    fn poll_control_events(
        &mut self,
        socket: &MemSocket,
        timeout: Duration,
        events: &mut dyn ConnectionEventSink,
    ) -> Result<(), TransportError> {
        let mut polled = std::mem::take(&mut self.polled);
        polled.clear();
        self.fabric.lock().poll_socket(socket.0, &mut polled)?;
        if !polled.is_empty() {
            trace!(socket = socket.0, ?timeout, count = polled.len(), "control events");
        }

        // Lock released: the sink may call back into anything.
        for event in polled.drain(..) {
            match event {
                ConnectionEvent::Connected => events.on_connect(),
                ConnectionEvent::Disconnected => events.on_disconnect(),
                ConnectionEvent::Interrupt(qid) => events.on_interrupt(qid),
            }
        }
        self.polled = polled;
        Ok(())
    }

    fn request_connection(&mut self, conn: &MemConnection) -> Result<(), TransportError> {
        self.fabric.lock().request_connection(conn.0)
    }

    fn session_geometry(&self, conn: &MemConnection) -> Result<SessionGeometry, TransportError> {
        self.fabric.lock().geometry(conn.0)
    }

    fn receive_burst(
        &mut self,
        conn: &MemConnection,
        qid: u16,
        max: u16,
    ) -> Result<Vec<RxDescriptor<'_>>, TransportError> {
        self.rx_held.clear();
        self.fabric
            .lock()
            .receive(conn.0, qid, max, &mut self.rx_held)?;
        Ok(self
            .rx_held
            .iter()
            .map(|slot| RxDescriptor::new(slot.data(), slot.more))
            .collect())
    }

    fn refill_queue(
        &mut self,
        conn: &MemConnection,
        qid: u16,
        count: u16,
    ) -> Result<(), TransportError> {
        self.rx_held.clear();
        self.fabric.lock().refill(conn.0, qid, count)
    }

    fn allocate_buffer_chain(
        &mut self,
        conn: &MemConnection,
        qid: u16,
        segment_hint: u16,
        total_len: usize,
    ) -> Result<Vec<TxDescriptor>, TransportError> {
        self.fabric
            .lock()
            .allocate(conn.0, qid, segment_hint, total_len)
    }

    fn transmit_burst(
        &mut self,
        conn: &MemConnection,
        qid: u16,
        chain: Vec<TxDescriptor>,
    ) -> Result<u16, TransportError> {
        self.fabric.lock().transmit(conn.0, qid, chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memif::Role;

    #[derive(Default)]
    struct Recorded(Vec<ConnectionEvent>);

    impl ConnectionEventSink for Recorded {
        fn on_connect(&mut self) {
            self.0.push(ConnectionEvent::Connected);
        }
        fn on_disconnect(&mut self) {
            self.0.push(ConnectionEvent::Disconnected);
        }
        fn on_interrupt(&mut self, qid: u16) {
            self.0.push(ConnectionEvent::Interrupt(qid));
        }
    }

    struct Side {
        transport: MemTransport,
        socket: MemSocket,
        conn: MemConnection,
    }

    impl Side {
        fn new(fabric: &MemFabric, role: Role) -> Self {
            Self::with_geometry(fabric, role, 64, 3)
        }

        fn with_geometry(fabric: &MemFabric, role: Role, dataroom: u32, ring_size_log2: u8) -> Self {
            let mut transport = fabric.transport();
            let socket = transport
                .create_socket(&SocketArgs {
                    path: "/tmp/mem.sock".into(),
                    app_name: "test".into(),
                })
                .unwrap();
            let conn = transport
                .create_connection(
                    &socket,
                    &ConnectionArgs {
                        interface_id: 0,
                        role,
                        dataroom,
                        ring_size_log2,
                        queue_count: 1,
                    },
                )
                .unwrap();
            Self {
                transport,
                socket,
                conn,
            }
        }

        fn poll(&mut self) -> Vec<ConnectionEvent> {
            let mut rec = Recorded::default();
            self.transport
                .poll_control_events(&self.socket, Duration::ZERO, &mut rec)
                .unwrap();
            rec.0
        }
    }

    #[test]
    fn test_slave_request_without_master_stays_pending() {
        let fabric = MemFabric::new();
        let mut slave = Side::new(&fabric, Role::Slave);

        slave.transport.request_connection(&slave.conn).unwrap();
        assert!(slave.poll().is_empty());
        assert!(!fabric.is_connected("/tmp/mem.sock", 0));
        assert!(matches!(
            slave.transport.refill_queue(&slave.conn, 0, 1),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_handshake_and_one_packet() {
        let fabric = MemFabric::new();
        let mut master = Side::new(&fabric, Role::Master);
        let mut slave = Side::new(&fabric, Role::Slave);

        // A master's own request does not start a session.
        master.transport.request_connection(&master.conn).unwrap();
        assert!(master.poll().is_empty());

        slave.transport.request_connection(&slave.conn).unwrap();
        assert_eq!(master.poll(), vec![ConnectionEvent::Connected]);
        assert_eq!(slave.poll(), vec![ConnectionEvent::Connected]);

        // Nothing posted by the master yet.
        assert!(matches!(
            slave.transport.allocate_buffer_chain(&slave.conn, 0, 1, 10),
            Err(TransportError::NoBuffers { requested: 1, available: 0 })
        ));

        master.transport.refill_queue(&master.conn, 0, 8).unwrap();
        let mut chain = slave
            .transport
            .allocate_buffer_chain(&slave.conn, 0, 2, 100)
            .unwrap();
        assert_eq!(chain.len(), 2);
        chain[0].fill(&[1u8; 64]);
        chain[0].set_more(true);
        chain[1].fill(&[2u8; 36]);
        assert_eq!(slave.transport.transmit_burst(&slave.conn, 0, chain).unwrap(), 1);

        assert_eq!(master.poll(), vec![ConnectionEvent::Interrupt(0)]);
        let lens: Vec<(usize, bool)> = master
            .transport
            .receive_burst(&master.conn, 0, 16)
            .unwrap()
            .iter()
            .map(|d| (d.len(), d.has_more()))
            .collect();
        assert_eq!(lens, vec![(64, true), (36, false)]);

        let stats = master.transport.rx_ring_stats(&master.conn, 0).unwrap();
        assert_eq!(stats, RingStats { capacity: 8, posted: 6, ready: 0, held: 2 });
        master.transport.refill_queue(&master.conn, 0, 2).unwrap();
        let stats = master.transport.rx_ring_stats(&master.conn, 0).unwrap();
        assert_eq!((stats.posted, stats.held), (8, 0));
    }

    #[test]
    fn test_master_sizes_the_session() {
        let fabric = MemFabric::new();
        let mut master = Side::with_geometry(&fabric, Role::Master, 64, 3);
        let mut slave = Side::with_geometry(&fabric, Role::Slave, 256, 6);

        assert!(matches!(
            slave.transport.session_geometry(&slave.conn),
            Err(TransportError::NotConnected)
        ));
        slave.transport.request_connection(&slave.conn).unwrap();
        master.poll();
        slave.poll();

        let want = SessionGeometry {
            dataroom: 64,
            ring_capacity: 8,
            queue_count: 1,
        };
        assert_eq!(master.transport.session_geometry(&master.conn).unwrap(), want);
        assert_eq!(slave.transport.session_geometry(&slave.conn).unwrap(), want);

        // The slave's larger ring does not exist; its rx ring holds 8 slots.
        assert!(matches!(
            slave.transport.refill_queue(&slave.conn, 0, 64),
            Err(TransportError::NoBuffers { requested: 64, available: 8 })
        ));
        slave.transport.refill_queue(&slave.conn, 0, 8).unwrap();

        // 200 bytes at the session's 64-byte dataroom take 4 slots, not 1.
        assert!(matches!(
            master.transport.allocate_buffer_chain(&master.conn, 0, 1, 200),
            Err(TransportError::ChainTooShort { needed: 4, requested: 1, .. })
        ));
        let chain = master
            .transport
            .allocate_buffer_chain(&master.conn, 0, 4, 200)
            .unwrap();
        assert_eq!(chain.len(), 4);
        assert!(chain.iter().all(|d| d.capacity() == 64));
    }

    #[test]
    fn test_delete_notifies_peer() {
        let fabric = MemFabric::new();
        let mut master = Side::new(&fabric, Role::Master);
        let mut slave = Side::new(&fabric, Role::Slave);
        slave.transport.request_connection(&slave.conn).unwrap();
        master.poll();

        let Side {
            mut transport,
            socket,
            conn,
        } = slave;
        transport.delete_connection(conn).unwrap();
        transport.delete_socket(socket).unwrap();

        assert_eq!(master.poll(), vec![ConnectionEvent::Disconnected]);
        assert!(!fabric.is_connected("/tmp/mem.sock", 0));
    }

    #[test]
    fn test_duplicate_role_is_rejected() {
        let fabric = MemFabric::new();
        let _master = Side::new(&fabric, Role::Master);

        let mut transport = fabric.transport();
        let socket = transport
            .create_socket(&SocketArgs {
                path: "/tmp/mem.sock".into(),
                app_name: "dup".into(),
            })
            .unwrap();
        let err = transport
            .create_connection(
                &socket,
                &ConnectionArgs {
                    interface_id: 0,
                    role: Role::Master,
                    dataroom: 64,
                    ring_size_log2: 3,
                    queue_count: 1,
                },
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::AddrInUse));
    }

    #[test]
    fn test_fabric_disconnect_and_reconnect() {
        let fabric = MemFabric::new();
        let mut master = Side::new(&fabric, Role::Master);
        let mut slave = Side::new(&fabric, Role::Slave);
        slave.transport.request_connection(&slave.conn).unwrap();
        master.poll();
        slave.poll();

        assert!(fabric.disconnect("/tmp/mem.sock", 0));
        assert!(!fabric.disconnect("/tmp/mem.sock", 0));
        assert_eq!(master.poll(), vec![ConnectionEvent::Disconnected]);
        assert_eq!(slave.poll(), vec![ConnectionEvent::Disconnected]);

        slave.transport.request_connection(&slave.conn).unwrap();
        assert_eq!(slave.poll(), vec![ConnectionEvent::Connected]);
        assert!(fabric.is_connected("/tmp/mem.sock", 0));
    }

    #[test]
    fn test_stale_handles() {
        let fabric = MemFabric::new();
        let mut transport = fabric.transport();
        assert!(matches!(
            transport.delete_socket(MemSocket(42)),
            Err(TransportError::InvalidHandle)
        ));
        assert!(matches!(
            transport.request_connection(&MemConnection(42)),
            Err(TransportError::InvalidHandle)
        ));
    }
}

/// Conformance tests using memif-testkit.
#[cfg(test)]
mod conformance_tests {
    use super::*;
    use memif_testkit::TransportFactory;

    struct MemFactory;

    impl TransportFactory for MemFactory {
        type Medium = MemFabric;
        type Transport = MemTransport;

        fn medium() -> MemFabric {
            memif_testkit::init_tracing();
            MemFabric::new()
        }

        fn attach(medium: &MemFabric) -> MemTransport {
            medium.transport()
        }
    }

    #[test]
    fn rx_3000_splits_in_two() {
        memif_testkit::run_rx_3000_splits_in_two::<MemFactory>();
    }

    #[test]
    fn send_5000_takes_three_slots() {
        memif_testkit::run_send_5000_takes_three_slots::<MemFactory>();
    }

    #[test]
    fn send_while_down() {
        memif_testkit::run_send_while_down::<MemFactory>();
    }

    #[test]
    fn poll_without_peer() {
        memif_testkit::run_poll_without_peer::<MemFactory>();
    }

    #[test]
    fn mismatched_geometry() {
        memif_testkit::run_mismatched_geometry::<MemFactory>();
    }

    #[test]
    fn send_lengths() {
        memif_testkit::run_send_lengths::<MemFactory>();
    }

    #[test]
    fn send_too_large() {
        memif_testkit::run_send_too_large::<MemFactory>();
    }

    #[test]
    fn burst_bound() {
        memif_testkit::run_burst_bound::<MemFactory>();
    }

    #[test]
    fn close_twice() {
        memif_testkit::run_close_twice::<MemFactory>();
    }

    #[test]
    fn reconnect() {
        memif_testkit::run_reconnect::<MemFactory>();
    }

    #[tokio::test]
    async fn out_of_band_interrupt() {
        use memif::Role;

        let fabric = MemFactory::medium();
        let (mut master, _) = memif_testkit::open::<MemFactory>(&fabric, Role::Master).unwrap();
        let (mut slave, rx) = memif_testkit::open::<MemFactory>(&fabric, Role::Slave).unwrap();
        memif_testkit::poll_until_up(&mut master, &mut slave).unwrap();

        let bell = slave
            .transport()
            .interrupt_doorbell(slave.connection_handle().unwrap(), 0)
            .unwrap()
            .into_async()
            .unwrap();

        master.send(&[7u8; 3000]).unwrap();
        tokio::time::timeout(Duration::from_millis(100), bell.wait())
            .await
            .expect("timeout waiting for interrupt")
            .expect("wait failed");

        let summary = slave.handle_interrupt(0).unwrap();
        assert_eq!((summary.segments, summary.packets), (2, 1));
        assert_eq!(rx.layout(), vec![(2048, true), (952, false)]);

        let stats = slave
            .transport()
            .rx_ring_stats(slave.connection_handle().unwrap(), 0)
            .unwrap();
        assert_eq!((stats.posted, stats.held), (1024, 0));

        assert!(matches!(
            slave.handle_interrupt(1),
            Err(TransportError::InvalidQueue(1))
        ));
    }
}
