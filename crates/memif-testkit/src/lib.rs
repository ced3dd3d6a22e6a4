//! memif-testkit: Conformance scenarios for memif ring transports.
//!
//! Provides the `TransportFactory` trait and shared scenarios that every
//! transport must pass when driven through a [`memif::Connection`].
//!
//! # Usage
//!
//! ```ignore
//! use memif_testkit::TransportFactory;
//!
//! struct MyFactory;
//!
//! impl TransportFactory for MyFactory {
//!     type Medium = MyMedium;
//!     type Transport = MyTransport;
//!
//!     fn medium() -> MyMedium { MyMedium::new() }
//!     fn attach(medium: &MyMedium) -> MyTransport { medium.transport() }
//! }
//!
//! #[test]
//! fn my_transport_rx_3000() {
//!     memif_testkit::run_rx_3000_splits_in_two::<MyFactory>();
//! }
//! ```

use std::fmt::Debug;
use std::sync::Arc;

use memif::{
    Connection, ConnectionConfig, ConnectionState, PacketSink, RingTransport, Role, SendError,
    SetupError, StateError, MAX_SEGMENTS, RX_BURST_SIZE,
};
use parking_lot::Mutex;

/// Socket path every scenario uses.
pub const SOCKET_PATH: &str = "/run/memif-testkit.sock";
/// Dataroom every scenario uses.
pub const DATAROOM: u32 = 2048;

const MAX_TICKS: usize = 16;

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Connection construction failed.
    Setup(SetupError),
    /// A send that should have succeeded failed.
    Send(SendError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(e) => write!(f, "setup error: {}", e),
            TestError::Send(e) => write!(f, "send error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<SetupError> for TestError {
    fn from(e: SetupError) -> Self {
        TestError::Setup(e)
    }
}

impl From<SendError> for TestError {
    fn from(e: SendError) -> Self {
        TestError::Send(e)
    }
}

/// Factory trait for creating transports under test.
///
/// Transports attached to the same medium must be able to reach each other
/// through the socket path and interface id of their connections.
pub trait TransportFactory {
    /// Whatever connects the transports (a fabric, a directory, a host).
    type Medium;

    /// The transport type being tested.
    type Transport: RingTransport;

    fn medium() -> Self::Medium;

    fn attach(medium: &Self::Medium) -> Self::Transport;
}

/// A sink recording every segment, readable from outside the connection.
#[derive(Clone, Debug, Default)]
pub struct SegmentLog {
    segments: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
}

impl SegmentLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded (bytes, more) pairs in delivery order.
    pub fn segments(&self) -> Vec<(Vec<u8>, bool)> {
        self.segments.lock().clone()
    }

    /// Recorded (length, more) pairs in delivery order.
    pub fn layout(&self) -> Vec<(usize, bool)> {
        self.segments
            .lock()
            .iter()
            .map(|(data, more)| (data.len(), *more))
            .collect()
    }

    /// Complete packets, joined from their chains.
    pub fn packets(&self) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let mut current = Vec::new();
        for (data, more) in self.segments.lock().iter() {
            current.extend_from_slice(data);
            if !more {
                packets.push(std::mem::take(&mut current));
            }
        }
        packets
    }

    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.lock().is_empty()
    }

    pub fn clear(&self) {
        self.segments.lock().clear();
    }
}

impl PacketSink for SegmentLog {
    fn deliver(&mut self, segment: &[u8], more: bool) {
        self.segments.lock().push((segment.to_vec(), more));
    }
}

/// A connection under test.
pub type Endpoint<F> = Connection<<F as TransportFactory>::Transport, SegmentLog>;

/// Install a test-friendly subscriber. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The configuration scenarios run with.
pub fn config(role: Role) -> ConnectionConfig {
    ConnectionConfig::new(SOCKET_PATH, 0, role)
        .with_dataroom(DATAROOM)
        .with_ring_size_log2(10)
        .with_app_name("memif-testkit")
}

/// Open an endpoint on `medium` with a fresh segment log.
pub fn open<F: TransportFactory>(
    medium: &F::Medium,
    role: Role,
) -> Result<(Endpoint<F>, SegmentLog), TestError> {
    open_with::<F>(medium, config(role))
}

/// Like [`open`], with an explicit configuration.
pub fn open_with<F: TransportFactory>(
    medium: &F::Medium,
    config: ConnectionConfig,
) -> Result<(Endpoint<F>, SegmentLog), TestError> {
    let log = SegmentLog::new();
    let conn = Connection::open(F::attach(medium), config, log.clone())?;
    Ok((conn, log))
}

/// Poll both ends, in order, until both are up. Returns the ticks taken.
pub fn poll_until_up<T, S>(
    a: &mut Connection<T, S>,
    b: &mut Connection<T, S>,
) -> Result<usize, TestError>
where
    T: RingTransport,
    S: PacketSink,
{
    for tick in 1..=MAX_TICKS {
        a.poll();
        b.poll();
        if a.is_up() && b.is_up() {
            tracing::debug!(tick, "both ends up");
            return Ok(tick);
        }
    }
    Err(TestError::Assertion(format!(
        "not up after {} ticks ({:?}, {:?})",
        MAX_TICKS,
        a.state(),
        b.state()
    )))
}

fn expect_eq<T: PartialEq + Debug>(what: &str, got: T, want: T) -> Result<(), TestError> {
    if got != want {
        return Err(TestError::Assertion(format!(
            "{}: got {:?}, expected {:?}",
            what, got, want
        )));
    }
    Ok(())
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn finish(name: &str, result: Result<(), TestError>) {
    if let Err(e) = result {
        panic!("{} failed: {}", name, e);
    }
}

// ============================================================================
// Scenarios
// ============================================================================

/// A slave receives a 3000-byte packet as 2048 bytes with the continuation
/// flag, then 952 bytes without it.
pub fn run_rx_3000_splits_in_two<F: TransportFactory>() {
    finish("run_rx_3000_splits_in_two", rx_3000_inner::<F>());
}

fn rx_3000_inner<F: TransportFactory>() -> Result<(), TestError> {
    let medium = F::medium();
    let (mut master, _) = open::<F>(&medium, Role::Master)?;
    let (mut slave, rx) = open::<F>(&medium, Role::Slave)?;
    poll_until_up(&mut master, &mut slave)?;

    let payload = pattern(3000);
    master.send(&payload)?;
    slave.poll();

    expect_eq("segment layout", rx.layout(), vec![(2048, true), (952, false)])?;
    expect_eq("packets", rx.packets(), vec![payload])?;
    expect_eq("slots refilled", slave.metrics().rx_refilled, 2)?;
    Ok(())
}

/// A 5000-byte send goes out as one chain of 2048, 2048 and 904 bytes.
pub fn run_send_5000_takes_three_slots<F: TransportFactory>() {
    finish("run_send_5000_takes_three_slots", send_5000_inner::<F>());
}

fn send_5000_inner<F: TransportFactory>() -> Result<(), TestError> {
    let medium = F::medium();
    let (mut master, rx) = open::<F>(&medium, Role::Master)?;
    let (mut slave, _) = open::<F>(&medium, Role::Slave)?;
    poll_until_up(&mut master, &mut slave)?;

    let payload = pattern(5000);
    slave.send(&payload)?;
    expect_eq("tx packets", slave.metrics().tx_packets, 1)?;
    expect_eq("tx segments", slave.metrics().tx_segments, 3)?;

    master.poll();
    expect_eq(
        "segment layout",
        rx.layout(),
        vec![(2048, true), (2048, true), (904, false)],
    )?;
    expect_eq("packets", rx.packets(), vec![payload])?;
    Ok(())
}

/// Sending while down fails immediately and reaches no transport.
pub fn run_send_while_down<F: TransportFactory>() {
    finish("run_send_while_down", send_while_down_inner::<F>());
}

fn send_while_down_inner<F: TransportFactory>() -> Result<(), TestError> {
    let medium = F::medium();
    let (mut master, master_rx) = open::<F>(&medium, Role::Master)?;
    let (mut slave, _) = open::<F>(&medium, Role::Slave)?;
    poll_until_up(&mut master, &mut slave)?;

    drop(master);
    slave.poll();
    expect_eq("state after peer loss", slave.state(), ConnectionState::Down)?;

    let before = *slave.metrics();
    match slave.send(&pattern(100)) {
        Err(SendError::State(StateError::NotConnected {
            state: ConnectionState::Down,
        })) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected not-connected rejection, got {:?}",
                other
            )))
        }
    }
    expect_eq("metrics", *slave.metrics(), before)?;
    expect_eq("delivered", master_rx.len(), 0)?;
    Ok(())
}

/// Polling with no peer listening requests a connection every time and
/// never changes state.
pub fn run_poll_without_peer<F: TransportFactory>() {
    finish("run_poll_without_peer", poll_without_peer_inner::<F>());
}

fn poll_without_peer_inner<F: TransportFactory>() -> Result<(), TestError> {
    let medium = F::medium();
    let (mut slave, rx) = open::<F>(&medium, Role::Slave)?;

    for _ in 0..5 {
        slave.poll();
        expect_eq("state", slave.state(), ConnectionState::Connecting)?;
    }
    expect_eq("connect requests", slave.metrics().connect_requests, 5)?;
    expect_eq("connects", slave.metrics().connects, 0)?;
    expect_eq("delivered", rx.len(), 0)?;
    Ok(())
}

/// The master sizes the session. A slave configured with a different ring
/// size and dataroom posts exactly the session's ring and sends within the
/// session's dataroom.
pub fn run_mismatched_geometry<F: TransportFactory>() {
    finish("run_mismatched_geometry", mismatched_geometry_inner::<F>());
}

fn mismatched_geometry_inner<F: TransportFactory>() -> Result<(), TestError> {
    // (master ring exponent, slave ring exponent, slave dataroom)
    for (master_log2, slave_log2, slave_dataroom) in [(4u8, 10u8, 4096u32), (10, 4, 1024)] {
        let medium = F::medium();
        let (mut master, master_rx) =
            open_with::<F>(&medium, config(Role::Master).with_ring_size_log2(master_log2))?;
        let (mut slave, slave_rx) = open_with::<F>(
            &medium,
            config(Role::Slave)
                .with_ring_size_log2(slave_log2)
                .with_dataroom(slave_dataroom),
        )?;
        poll_until_up(&mut master, &mut slave)?;
        expect_eq("master transport errors", master.metrics().transport_errors, 0)?;
        expect_eq("slave transport errors", slave.metrics().transport_errors, 0)?;

        // The slave posted the whole session ring, no more and no less.
        let ring = 1usize << master_log2;
        for i in 0..ring {
            master.send(&[i as u8]).map_err(|e| {
                TestError::Assertion(format!("send {} of {} to slave: {}", i + 1, ring, e))
            })?;
        }
        match master.send(b"overflow") {
            Err(SendError::Transport(_)) => {}
            other => {
                return Err(TestError::Assertion(format!(
                    "send beyond the session ring: {:?}",
                    other
                )))
            }
        }
        while slave_rx.len() < ring {
            let before = slave_rx.len();
            slave.poll();
            if slave_rx.len() == before {
                return Err(TestError::Assertion(format!(
                    "slave stalled at {} of {} packets",
                    before, ring
                )));
            }
        }

        // Sends from the slave are limited and split by the session dataroom.
        let limit = MAX_SEGMENTS * DATAROOM as usize;
        match slave.send(&pattern(limit)) {
            Err(SendError::State(StateError::PacketTooLarge { max, .. })) if max == limit - 1 => {}
            other => {
                return Err(TestError::Assertion(format!(
                    "{} bytes from the slave: {:?}",
                    limit, other
                )))
            }
        }
        let payload = pattern(5000);
        slave.send(&payload)?;
        master.poll();
        expect_eq(
            "slave -> master layout",
            master_rx.layout(),
            vec![(2048, true), (2048, true), (904, false)],
        )?;
        expect_eq("slave -> master packets", master_rx.packets(), vec![payload])?;
    }
    Ok(())
}

// ============================================================================
// Properties
// ============================================================================

/// Every length below the limit arrives intact in the expected number of
/// segments.
pub fn run_send_lengths<F: TransportFactory>() {
    finish("run_send_lengths", send_lengths_inner::<F>());
}

fn send_lengths_inner<F: TransportFactory>() -> Result<(), TestError> {
    let medium = F::medium();
    let (mut master, rx) = open::<F>(&medium, Role::Master)?;
    let (mut slave, _) = open::<F>(&medium, Role::Slave)?;
    poll_until_up(&mut master, &mut slave)?;

    let dataroom = DATAROOM as usize;
    let max = MAX_SEGMENTS * dataroom - 1;
    for len in [0, 1, 100, dataroom - 1, dataroom, dataroom + 1, 5000, max] {
        let payload = pattern(len);
        slave.send(&payload)?;
        master.poll();

        let segments = len.div_ceil(dataroom).max(1);
        expect_eq("segments", rx.len(), segments)?;
        expect_eq("packets", rx.packets(), vec![payload])?;
        rx.clear();
    }
    Ok(())
}

/// A payload of exactly `MAX_SEGMENTS * dataroom` bytes is rejected before
/// reaching the transport.
pub fn run_send_too_large<F: TransportFactory>() {
    finish("run_send_too_large", send_too_large_inner::<F>());
}

fn send_too_large_inner<F: TransportFactory>() -> Result<(), TestError> {
    let medium = F::medium();
    let (mut master, rx) = open::<F>(&medium, Role::Master)?;
    let (mut slave, _) = open::<F>(&medium, Role::Slave)?;
    poll_until_up(&mut master, &mut slave)?;

    let len = MAX_SEGMENTS * DATAROOM as usize;
    match slave.send(&pattern(len)) {
        Err(SendError::State(StateError::PacketTooLarge { .. })) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected packet-too-large rejection, got {:?}",
                other
            )))
        }
    }
    master.poll();
    expect_eq("delivered", rx.len(), 0)?;
    expect_eq("tx failures", slave.metrics().tx_failures, 0)?;
    Ok(())
}

/// No poll delivers more than one burst per queue, and each drain refills
/// exactly what it delivered.
pub fn run_burst_bound<F: TransportFactory>() {
    finish("run_burst_bound", burst_bound_inner::<F>());
}

fn burst_bound_inner<F: TransportFactory>() -> Result<(), TestError> {
    let medium = F::medium();
    let (mut master, rx) = open::<F>(&medium, Role::Master)?;
    let (mut slave, _) = open::<F>(&medium, Role::Slave)?;
    poll_until_up(&mut master, &mut slave)?;

    let total = 40usize;
    for i in 0..total {
        slave.send(&[i as u8])?;
    }

    let burst = usize::from(RX_BURST_SIZE);
    let mut delivered = 0;
    while delivered < total {
        let before = *master.metrics();
        master.poll();
        let after = *master.metrics();

        let step = rx.len() - delivered;
        expect_eq("burst size", step, burst.min(total - delivered))?;
        expect_eq(
            "refilled this poll",
            after.rx_refilled - before.rx_refilled,
            step as u64,
        )?;
        delivered += step;
    }

    let firsts: Vec<u8> = rx.packets().iter().map(|p| p[0]).collect();
    expect_eq("order", firsts, (0..total).map(|i| i as u8).collect())?;
    Ok(())
}

/// Closing twice is harmless and leaves the connection closed for good.
pub fn run_close_twice<F: TransportFactory>() {
    finish("run_close_twice", close_twice_inner::<F>());
}

fn close_twice_inner<F: TransportFactory>() -> Result<(), TestError> {
    let medium = F::medium();
    let (mut master, _) = open::<F>(&medium, Role::Master)?;
    let (mut slave, _) = open::<F>(&medium, Role::Slave)?;
    poll_until_up(&mut master, &mut slave)?;

    slave.close();
    expect_eq("state", slave.state(), ConnectionState::Closed)?;
    slave.close();
    expect_eq("state", slave.state(), ConnectionState::Closed)?;

    let requests = slave.metrics().connect_requests;
    slave.poll();
    expect_eq("requests after close", slave.metrics().connect_requests, requests)?;

    match slave.send(b"late") {
        Err(SendError::State(StateError::NotConnected {
            state: ConnectionState::Closed,
        })) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected not-connected rejection, got {:?}",
                other
            )))
        }
    }

    master.poll();
    expect_eq("peer state", master.state(), ConnectionState::Down)?;
    Ok(())
}

/// After the peer goes away and comes back, polling alone restores the
/// session and traffic flows again.
pub fn run_reconnect<F: TransportFactory>() {
    finish("run_reconnect", reconnect_inner::<F>());
}

fn reconnect_inner<F: TransportFactory>() -> Result<(), TestError> {
    let medium = F::medium();
    let (mut master, _) = open::<F>(&medium, Role::Master)?;
    let (mut slave, _) = open::<F>(&medium, Role::Slave)?;
    poll_until_up(&mut master, &mut slave)?;

    drop(master);
    slave.poll();
    expect_eq("state", slave.state(), ConnectionState::Down)?;

    let (mut master, rx) = open::<F>(&medium, Role::Master)?;
    poll_until_up(&mut master, &mut slave)?;
    expect_eq("connects", slave.metrics().connects, 2)?;
    expect_eq("disconnects", slave.metrics().disconnects, 1)?;

    let payload = pattern(5000);
    slave.send(&payload)?;
    master.poll();
    expect_eq("packets", rx.packets(), vec![payload])?;
    Ok(())
}
