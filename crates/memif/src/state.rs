//! Connection lifecycle.
//!
//! ```text
//!            create                on_connect
//!   Closed ─────────► Connecting ─────────────► Up
//!     ▲                   │                    │ ▲
//!     │ close             │ close  on_disconnect│ │ on_connect
//!     └───────────────────┴──────── Down ◄─────┘ │
//!                                     └──────────┘
//! ```
//!
//! Only `create` and `close` are driven by the owner; every other transition
//! comes from an event raised by the ring transport.

use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, Role};
use crate::error::{SetupError, ShutdownError, TransportError};
use crate::transport::{ConnectionArgs, RingTransport, SessionGeometry, SocketArgs};

/// Lifecycle state of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No handles.
    Closed,
    /// Handles created, handshake not yet complete.
    Connecting,
    /// Handshake complete, data path usable.
    Up,
    /// Handles valid, handshake lost.
    Down,
}

impl ConnectionState {
    /// Whether socket and connection handles exist in this state.
    pub fn has_handles(self) -> bool {
        !matches!(self, ConnectionState::Closed)
    }
}

/// Socket and connection handles. The connection handle is always released
/// first; the socket outlives it.
struct Handles<T: RingTransport> {
    socket: T::Socket,
    conn: T::Connection,
}

/// Owns the lifecycle state and the transport handles of one interface.
pub struct ConnectionController<T: RingTransport> {
    state: ConnectionState,
    handles: Option<Handles<T>>,
    interface_id: u32,
    role: Role,
    /// What this side asked for.
    requested: SessionGeometry,
    /// What the transport reported on the last connect. Cleared on close.
    session: Option<SessionGeometry>,
}

impl<T: RingTransport> ConnectionController<T> {
    /// Create the socket, then the connection. Either failure leaves nothing
    /// behind: a socket created before a failed connection is deleted again.
    pub fn create(transport: &mut T, config: &ConnectionConfig) -> Result<Self, SetupError> {
        config.validate()?;

        let socket = transport
            .create_socket(&SocketArgs {
                path: config.socket_path.clone(),
                app_name: config.app_name.clone(),
            })
            .map_err(|source| SetupError::Socket {
                path: config.socket_path.clone(),
                source,
            })?;

        let args = ConnectionArgs {
            interface_id: config.interface_id,
            role: config.role,
            dataroom: config.dataroom,
            ring_size_log2: config.ring_size_log2,
            queue_count: config.queue_count,
        };

        let conn = match transport.create_connection(&socket, &args) {
            Ok(conn) => conn,
            Err(source) => {
                if let Err(err) = transport.delete_socket(socket) {
                    warn!(
                        interface_id = config.interface_id,
                        error = %ShutdownError::Socket(err),
                        "cleanup after failed interface creation"
                    );
                }
                return Err(SetupError::Connection {
                    interface_id: config.interface_id,
                    source,
                });
            }
        };

        info!(
            interface_id = config.interface_id,
            role = %config.role,
            socket = %config.socket_path,
            "interface created"
        );

        Ok(Self {
            state: ConnectionState::Connecting,
            handles: Some(Handles { socket, conn }),
            interface_id: config.interface_id,
            role: config.role,
            requested: SessionGeometry {
                dataroom: config.dataroom,
                // validate() caps the exponent at 14, so this fits.
                ring_capacity: config.ring_capacity() as u16,
                queue_count: config.queue_count,
            },
            session: None,
        })
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.state == ConnectionState::Up
    }

    pub fn socket(&self) -> Option<&T::Socket> {
        self.handles.as_ref().map(|h| &h.socket)
    }

    pub fn connection(&self) -> Option<&T::Connection> {
        self.handles.as_ref().map(|h| &h.conn)
    }

    /// Geometry the data path runs with: the session's once one has been
    /// established, the configured one before that.
    pub fn geometry(&self) -> SessionGeometry {
        self.session.unwrap_or(self.requested)
    }

    /// Handshake completed: post every slot of each receive queue, then go Up.
    ///
    /// Ring size, dataroom and queue count come from the session, which the
    /// master sized; if the transport cannot report them the configured values
    /// are used. The refill is best effort. A failure is returned for reporting but the
    /// transition still happens. Events that do not apply to the current state
    /// are ignored.
    pub fn on_connect(&mut self, transport: &mut T) -> Result<(), TransportError> {
        if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Down) {
            debug!(
                interface_id = self.interface_id,
                state = ?self.state,
                "ignoring connect event"
            );
            return Ok(());
        }
        let Some(handles) = self.handles.as_ref() else {
            return Ok(());
        };

        let mut first_err = None;
        let geometry = match transport.session_geometry(&handles.conn) {
            Ok(geometry) => {
                if geometry != self.requested {
                    debug!(
                        interface_id = self.interface_id,
                        requested = ?self.requested,
                        session = ?geometry,
                        "session geometry differs from configuration"
                    );
                }
                geometry
            }
            Err(err) => {
                warn!(
                    interface_id = self.interface_id,
                    error = %err,
                    "session geometry unavailable"
                );
                first_err.get_or_insert(err);
                self.requested
            }
        };
        self.session = Some(geometry);

        for qid in 0..geometry.queue_count {
            if let Err(err) = transport.refill_queue(&handles.conn, qid, geometry.ring_capacity) {
                warn!(
                    interface_id = self.interface_id,
                    qid,
                    error = %err,
                    "initial refill failed"
                );
                first_err.get_or_insert(err);
            }
        }

        self.state = ConnectionState::Up;
        info!(interface_id = self.interface_id, role = %self.role, "connected");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The peer went away. Handles stay; no refill.
    pub fn on_disconnect(&mut self) {
        if self.state != ConnectionState::Up {
            debug!(
                interface_id = self.interface_id,
                state = ?self.state,
                "ignoring disconnect event"
            );
            return;
        }
        self.state = ConnectionState::Down;
        info!(interface_id = self.interface_id, role = %self.role, "disconnected");
    }

    /// Release the connection handle, then the socket handle.
    ///
    /// Idempotent. Each failure is logged and returned, but both releases are
    /// always attempted and the state always ends `Closed`.
    pub fn close(&mut self, transport: &mut T) -> Vec<ShutdownError> {
        let mut errors = Vec::new();
        self.session = None;
        let Some(Handles { socket, conn }) = self.handles.take() else {
            self.state = ConnectionState::Closed;
            return errors;
        };

        if let Err(err) = transport.delete_connection(conn) {
            errors.push(ShutdownError::Connection(err));
        }
        if let Err(err) = transport.delete_socket(socket) {
            errors.push(ShutdownError::Socket(err));
        }

        for err in &errors {
            warn!(interface_id = self.interface_id, error = %err, "close");
        }

        self.state = ConnectionState::Closed;
        info!(interface_id = self.interface_id, "interface closed");
        errors
    }
}
