//! Control-channel pump.

use std::time::Duration;

use tracing::{debug, warn};

use crate::metrics::ConnectionMetrics;
use crate::rx;
use crate::sink::PacketSink;
use crate::state::ConnectionController;
use crate::transport::{ConnectionEventSink, RingTransport};

/// An event raised by the transport during `poll_control_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Interrupt(u16),
}

/// Collects the events a transport raises and applies them, in order, once
/// the transport call has returned.
///
/// Applying after the call lets `on_connect` refill through the same
/// transport; it still happens inside `poll`, before anything else can
/// observe the connection.
#[derive(Debug, Default)]
pub struct EventPoller {
    pending: Vec<ConnectionEvent>,
}

impl ConnectionEventSink for EventPoller {
    fn on_connect(&mut self) {
        self.pending.push(ConnectionEvent::Connected);
    }

    fn on_disconnect(&mut self) {
        self.pending.push(ConnectionEvent::Disconnected);
    }

    fn on_interrupt(&mut self, qid: u16) {
        self.pending.push(ConnectionEvent::Interrupt(qid));
    }
}

impl EventPoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// One non-blocking step.
    ///
    /// 1. Without handles, nothing happens.
    /// 2. Pending control events are processed and applied.
    /// 3. If the connection is not up, a (re)connection is requested.
    ///
    /// Errors are logged and counted, never returned: nobody on this path
    /// asked for the work.
    pub fn poll<T, S>(
        &mut self,
        transport: &mut T,
        controller: &mut ConnectionController<T>,
        sink: &mut S,
        metrics: &mut ConnectionMetrics,
    ) where
        T: RingTransport,
        S: PacketSink + ?Sized,
    {
        let Some(socket) = controller.socket() else {
            return;
        };

        self.pending.clear();
        if let Err(err) = transport.poll_control_events(socket, Duration::ZERO, self) {
            warn!(error = %err, "poll control events");
            metrics.transport_errors += 1;
        }

        for event in std::mem::take(&mut self.pending) {
            self.apply(event, transport, controller, sink, metrics);
        }

        if controller.is_up() {
            return;
        }
        let Some(conn) = controller.connection() else {
            return;
        };
        metrics.connect_requests += 1;
        if let Err(err) = transport.request_connection(conn) {
            debug!(error = %err, state = ?controller.state(), "connection request failed");
            metrics.transport_errors += 1;
        }
    }

    fn apply<T, S>(
        &mut self,
        event: ConnectionEvent,
        transport: &mut T,
        controller: &mut ConnectionController<T>,
        sink: &mut S,
        metrics: &mut ConnectionMetrics,
    ) where
        T: RingTransport,
        S: PacketSink + ?Sized,
    {
        match event {
            ConnectionEvent::Connected => {
                let was_up = controller.is_up();
                if controller.on_connect(transport).is_err() {
                    metrics.transport_errors += 1;
                }
                if !was_up && controller.is_up() {
                    metrics.connects += 1;
                }
            }
            ConnectionEvent::Disconnected => {
                let was_up = controller.is_up();
                controller.on_disconnect();
                if was_up && !controller.is_up() {
                    metrics.disconnects += 1;
                }
            }
            ConnectionEvent::Interrupt(qid) => {
                let Some(conn) = controller.connection() else {
                    return;
                };
                if let Err(err) = rx::drain(transport, conn, qid, sink, metrics) {
                    warn!(qid, error = %err, "drain on interrupt");
                    metrics.transport_errors += 1;
                }
            }
        }
    }
}
