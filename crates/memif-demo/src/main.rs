//! memif-demo: a master and a slave exchanging packets on one fabric.
//!
//! Both ends are polled once per tick. Every `--every` ticks each end sends
//! `i` bytes of value `i % 256`; received segments are printed as hex with
//! their continuation flag.
//!
//! Run with: `cargo run -p memif-demo -- --iterations 100 --interval-ms 10`

use std::fmt::Write as _;
use std::time::Duration;

use clap::Parser;
use memif::{Connection, ConnectionConfig, PacketSink, Role};
use memif_transport_mem::{MemFabric, MemTransport};

#[derive(Parser, Debug)]
#[command(name = "memif-demo")]
#[command(about = "Exchange packets between a memif master and slave in one process")]
struct Args {
    /// Socket path both ends meet on
    #[arg(long, default_value = "/run/memif-demo.sock")]
    socket: String,

    /// Interface id
    #[arg(long, default_value_t = 0)]
    id: u32,

    /// Bytes per ring slot
    #[arg(long, default_value_t = 200)]
    dataroom: u32,

    /// Ring size exponent
    #[arg(long, default_value_t = 10)]
    ring_size_log2: u8,

    /// Number of ticks to run
    #[arg(long, default_value_t = 1000)]
    iterations: usize,

    /// Milliseconds between ticks
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Send every N ticks
    #[arg(long, default_value_t = 10)]
    every: usize,
}

/// Prints each segment as `<side> <hex> <more>`.
struct HexPrinter {
    side: Role,
    line: String,
}

impl HexPrinter {
    fn new(side: Role) -> Self {
        Self {
            side,
            line: String::new(),
        }
    }
}

impl PacketSink for HexPrinter {
    fn deliver(&mut self, segment: &[u8], more: bool) {
        self.line.clear();
        for b in segment {
            let _ = write!(self.line, "{:02x}", b);
        }
        println!("{} {} {}", self.side, self.line, more);
    }
}

type DemoConnection = Connection<MemTransport, HexPrinter>;

fn open(fabric: &MemFabric, args: &Args, role: Role) -> Result<DemoConnection, memif::SetupError> {
    let config = ConnectionConfig::new(args.socket.clone(), args.id, role)
        .with_dataroom(args.dataroom)
        .with_ring_size_log2(args.ring_size_log2)
        .with_app_name("memif-demo");
    Connection::open(fabric.transport(), config, HexPrinter::new(role))
}

fn send(conn: &mut DemoConnection, payload: &[u8]) {
    if let Err(e) = conn.send(payload) {
        tracing::debug!(role = %conn.config().role, len = payload.len(), error = %e, "send skipped");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let fabric = MemFabric::new();

    let mut master = open(&fabric, &args, Role::from_is_server(true))?;
    let mut slave = open(&fabric, &args, Role::from_is_server(false))?;

    let every = args.every.max(1);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    for i in 0..args.iterations {
        ticker.tick().await;
        master.poll();
        slave.poll();

        if i % every == 0 {
            let payload = vec![(i % 256) as u8; i];
            send(&mut master, &payload);
            send(&mut slave, &payload);
        }
    }

    tracing::info!(master = ?master.metrics(), slave = ?slave.metrics(), "done");
    master.close();
    slave.close();
    Ok(())
}
