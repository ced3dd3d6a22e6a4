//! The owner-facing connection object.

use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{SendError, SetupError, TransportError};
use crate::metrics::ConnectionMetrics;
use crate::poll::EventPoller;
use crate::rx::{self, DrainSummary};
use crate::sink::PacketSink;
use crate::state::{ConnectionController, ConnectionState};
use crate::transport::RingTransport;
use crate::tx;

/// One shared-memory interface endpoint.
///
/// All operations are synchronous and non-blocking. A connection has a single
/// logical owner that serialises calls; it does no locking of its own.
///
/// ```ignore
/// let config = ConnectionConfig::new("/run/memif.sock", 0, Role::Slave);
/// let mut conn = Connection::open(transport, config, |seg: &[u8], more: bool| {
///     println!("{} {}", seg.len(), more);
/// })?;
///
/// loop {
///     conn.poll();
///     if conn.is_up() {
///         conn.send(&frame)?;
///     }
/// }
/// ```
pub struct Connection<T: RingTransport, S> {
    transport: T,
    config: ConnectionConfig,
    controller: ConnectionController<T>,
    poller: EventPoller,
    sink: S,
    metrics: ConnectionMetrics,
}

impl<T, S> Connection<T, S>
where
    T: RingTransport,
    S: PacketSink,
{
    /// Validate `config` and create the socket and connection handles.
    pub fn open(mut transport: T, config: ConnectionConfig, sink: S) -> Result<Self, SetupError> {
        let controller = ConnectionController::create(&mut transport, &config)?;
        Ok(Self {
            transport,
            config,
            controller,
            poller: EventPoller::new(),
            sink,
            metrics: ConnectionMetrics::default(),
        })
    }

    /// Pump control-channel events and request a connection while not up.
    pub fn poll(&mut self) {
        self.poller.poll(
            &mut self.transport,
            &mut self.controller,
            &mut self.sink,
            &mut self.metrics,
        );
    }

    /// Send one packet on queue 0.
    ///
    /// The size limit follows the session's dataroom, which the master
    /// chose, not necessarily this side's configured one.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), SendError> {
        let state = self.controller.state();
        let dataroom = self.controller.geometry().dataroom;
        let Some(conn) = self.controller.connection() else {
            // Only reachable when closed; let the state check reject it.
            return tx::check(state, payload.len(), dataroom)
                .map(|_| ())
                .map_err(SendError::from);
        };
        tx::send(
            &mut self.transport,
            conn,
            state,
            dataroom,
            payload,
            &mut self.metrics,
        )
    }

    /// Drain queue `qid` after an out-of-band interrupt.
    ///
    /// Failures are logged and counted as on the poll path, and also returned
    /// to the caller that routed the interrupt here.
    pub fn handle_interrupt(&mut self, qid: u16) -> Result<DrainSummary, TransportError> {
        let Some(conn) = self.controller.connection() else {
            trace!(qid, "interrupt on closed connection");
            return Ok(DrainSummary::default());
        };
        if qid >= self.controller.geometry().queue_count {
            return Err(TransportError::InvalidQueue(qid));
        }
        rx::drain(&mut self.transport, conn, qid, &mut self.sink, &mut self.metrics).map_err(
            |err| {
                warn!(qid, error = %err, "drain on interrupt");
                self.metrics.transport_errors += 1;
                err
            },
        )
    }
}

impl<T: RingTransport, S> Connection<T, S> {
    /// Release all handles. Idempotent; never fails.
    pub fn close(&mut self) {
        if !self.controller.state().has_handles() {
            return;
        }
        let errors = self.controller.close(&mut self.transport);
        if !errors.is_empty() {
            debug!(failures = errors.len(), "close completed with errors");
        }
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.controller.is_up()
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport's connection handle, while one exists.
    pub fn connection_handle(&self) -> Option<&T::Connection> {
        self.controller.connection()
    }
}

impl<T: RingTransport, S> Drop for Connection<T, S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::error::StateError;
    use crate::test_support::{Call, ScriptedEvent, ScriptedTransport};

    #[derive(Default)]
    struct Segments(Vec<(Vec<u8>, bool)>);

    impl PacketSink for Segments {
        fn deliver(&mut self, segment: &[u8], more: bool) {
            self.0.push((segment.to_vec(), more));
        }
    }

    fn open(
        transport: ScriptedTransport,
    ) -> Connection<ScriptedTransport, impl FnMut(&[u8], bool)> {
        let config = ConnectionConfig::new("/tmp/conn.sock", 9, Role::Slave).with_ring_size_log2(4);
        Connection::open(transport, config, |_: &[u8], _: bool| {}).unwrap()
    }

    #[test]
    fn test_send_before_up_fails_without_transport_calls() {
        let mut conn = open(ScriptedTransport::new());
        let calls_before = conn.transport().calls.len();

        let err = conn.send(b"early").unwrap_err();
        assert!(matches!(
            err,
            SendError::State(StateError::NotConnected { state: ConnectionState::Connecting })
        ));
        assert_eq!(conn.transport().calls.len(), calls_before);
    }

    #[test]
    fn test_lifecycle_through_poll() {
        let mut transport = ScriptedTransport::new();
        transport.raise(ScriptedEvent::Connect);
        let mut conn = open(transport);

        conn.poll();
        assert!(conn.is_up());
        conn.send(&[1u8; 3000]).unwrap();
        assert_eq!(conn.metrics().tx_packets, 1);
        assert_eq!(conn.metrics().connects, 1);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.connection_handle().is_none());

        let calls = conn.transport().calls.len();
        conn.close();
        assert_eq!(conn.transport().calls.len(), calls);

        let err = conn.send(b"late").unwrap_err();
        assert!(matches!(
            err,
            SendError::State(StateError::NotConnected { state: ConnectionState::Closed })
        ));
    }

    #[test]
    fn test_send_limit_follows_session_dataroom() {
        let mut transport = ScriptedTransport::new();
        transport.geometry = Some(crate::transport::SessionGeometry {
            dataroom: 2048,
            ring_capacity: 1024,
            queue_count: 1,
        });
        transport.raise(ScriptedEvent::Connect);
        let config = ConnectionConfig::new("/tmp/conn.sock", 9, Role::Slave).with_dataroom(4096);
        let mut conn = Connection::open(transport, config, |_: &[u8], _: bool| {}).unwrap();
        conn.poll();
        assert!(conn.is_up());

        let calls = conn.transport().calls.len();
        let err = conn.send(&[0u8; 20000]).unwrap_err();
        assert!(matches!(
            err,
            SendError::State(StateError::PacketTooLarge { len: 20000, max: 16383 })
        ));
        assert_eq!(conn.transport().calls.len(), calls);

        conn.send(&[0u8; 5000]).unwrap();
        assert_eq!(
            conn.transport().calls[calls],
            Call::Allocate { qid: 0, hint: 3, len: 5000 }
        );
    }

    #[test]
    fn test_handle_interrupt_drains_into_sink() {
        let mut transport = ScriptedTransport::new();
        transport.push_rx(0, vec![1u8; 16], true);
        transport.push_rx(0, vec![2u8; 4], false);
        let config = ConnectionConfig::new("/tmp/conn.sock", 9, Role::Master).with_dataroom(16);
        let mut conn = Connection::open(transport, config, Segments::default()).unwrap();

        let summary = conn.handle_interrupt(0).unwrap();
        assert_eq!(summary.segments, 2);
        assert_eq!(conn.sink().0.len(), 2);
        assert_eq!(conn.sink().0[0], (vec![1u8; 16], true));
        assert_eq!(conn.transport().calls.last(), Some(&Call::Refill { qid: 0, count: 2 }));

        assert!(matches!(conn.handle_interrupt(1), Err(TransportError::InvalidQueue(1))));
    }

    #[test]
    fn test_handle_interrupt_reports_failure() {
        let mut transport = ScriptedTransport::new();
        transport.fail_receive = true;
        let mut conn = open(transport);

        assert!(conn.handle_interrupt(0).is_err());
        assert_eq!(conn.metrics().transport_errors, 1);
    }

    #[test]
    fn test_drop_closes() {
        let conn = open(ScriptedTransport::new());
        let live = conn.transport().live_handles();
        drop(conn);
        assert_eq!(live.get(), 0);
    }
}
