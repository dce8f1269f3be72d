//! The metadata server binary: parses operator configuration, wires a
//! [`mke::Mke`] + [`llt::SyncedLeaseTable`] + [`dircontrol::DirectoryControlTable`]
//! together behind a [`transport::UdpTransport`], and serves until killed.
//!
//! This crate's errors are `anyhow::Error`: it is the human-facing edge,
//! not a library boundary, so a readable cause chain matters more than a
//! precise `thiserror` variant (§7).

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{App, Arg};
use dircontrol::DirectoryControlTable;
use llt::SyncedLeaseTable;
use mdtypes::{Clock, Error, MdsOptions, SystemClock};
use mke::Mke;
use parking_lot::RwLock;
use slog::{info, o, Drain, Logger};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use storage::{LocalFsBackend, StorageBackend};
use transport::{Handler, Transport, UdpTransport};

fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Forwards to whatever [`Handler`] is installed once server construction
/// finishes. `UdpTransport::bind` needs a handler at bind time, but the
/// handler (`DirectoryControlTable`) needs the transport it's bound to in
/// order to make outgoing split-ingest calls to peers — this slot breaks
/// that construction-order cycle.
struct HandlerSlot(RwLock<Option<Arc<dyn Handler>>>);

impl HandlerSlot {
    fn new() -> Arc<Self> {
        Arc::new(HandlerSlot(RwLock::new(None)))
    }

    fn install(&self, handler: Arc<dyn Handler>) {
        *self.0.write() = Some(handler);
    }
}

#[async_trait]
impl Handler for HandlerSlot {
    async fn handle(&self, op: u16, payload: Vec<u8>) -> mdtypes::Result<Vec<u8>> {
        let handler = self.0.read().clone();
        match handler {
            Some(h) => h.handle(op, payload).await,
            None => Err(Error::NotSupported("server is still starting up".into())),
        }
    }
}

struct Config {
    server_id: u32,
    data_dir: PathBuf,
    bind: SocketAddr,
    peers: Vec<(u32, String)>,
    options: MdsOptions,
}

fn parse_args() -> Result<Config> {
    let matches = App::new("mdserver")
        .about("Distributed file-system metadata server")
        .arg(
            Arg::with_name("server-id")
                .long("server-id")
                .value_name("ID")
                .help("This server's id within the partition ring")
                .required(true),
        )
        .arg(
            Arg::with_name("data-dir")
                .long("data-dir")
                .value_name("PATH")
                .help("Directory the metadata key-value engine stores its files in")
                .required(true),
        )
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("ADDR")
                .help("UDP address to listen on")
                .default_value("127.0.0.1:0"),
        )
        .arg(
            Arg::with_name("peer")
                .long("peer")
                .value_name("ID=ADDR")
                .help("A peer server reachable for directory-split ingest, repeatable")
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("num-servers")
                .long("num-servers")
                .value_name("N")
                .help("Live physical server count")
                .default_value("4"),
        )
        .arg(
            Arg::with_name("num-virtual-servers")
                .long("num-virtual-servers")
                .value_name("N")
                .help("Fixed virtual-server count a directory's partition ring is sized to")
                .default_value("1024"),
        )
        .get_matches();

    let server_id = matches
        .value_of("server-id")
        .unwrap()
        .parse()
        .context("--server-id must be a u32")?;
    let data_dir = PathBuf::from(matches.value_of("data-dir").unwrap());
    let bind = matches
        .value_of("bind")
        .unwrap()
        .parse()
        .context("--bind must be a socket address")?;
    let num_servers = matches
        .value_of("num-servers")
        .unwrap()
        .parse()
        .context("--num-servers must be a u32")?;
    let num_virtual_servers = matches
        .value_of("num-virtual-servers")
        .unwrap()
        .parse()
        .context("--num-virtual-servers must be a u32")?;

    let mut peers = Vec::new();
    if let Some(values) = matches.values_of("peer") {
        for v in values {
            let (id, addr) = v
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("--peer must be ID=ADDR, got {}", v))?;
            peers.push((id.parse().context("--peer id must be a u32")?, addr.to_string()));
        }
    }

    let options = MdsOptions {
        num_servers,
        num_virtual_servers,
        ..MdsOptions::default()
    }
    .clamped();

    Ok(Config {
        server_id,
        data_dir,
        bind,
        peers,
        options,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = parse_args()?;
    let logger = build_logger().new(o!("server_id" => config.server_id));

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    // Refuse to share a data directory with another live process; the MKE's
    // on-disk log and table files are not safe for concurrent writers.
    let storage_backend = LocalFsBackend::new();
    let _lock = storage_backend
        .lock_exclusive(&config.data_dir.join("LOCK"))
        .context("acquiring exclusive lock on data directory")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
    let mke = Arc::new(
        Mke::open(&config.data_dir, config.options.clone(), logger.new(o!("component" => "mke")))
            .context("opening metadata key-value engine")?,
    );
    let llt = Arc::new(SyncedLeaseTable::new(
        config.options.max_num_leases,
        config.options.max_lease_duration_us,
        clock.clone(),
    ));

    let handler_slot = HandlerSlot::new();
    let transport = UdpTransport::bind(
        config.bind,
        config.options.udp_max_msgsz,
        Some(handler_slot.clone() as Arc<dyn Handler>),
        logger.new(o!("component" => "transport")),
    )
    .await
    .context("binding UDP transport")?;

    info!(logger, "listening"; "addr" => transport.local_addr().to_string());

    let table = DirectoryControlTable::new(
        config.server_id,
        config.data_dir.clone(),
        config.options.clone(),
        mke,
        llt,
        transport.clone() as Arc<dyn Transport>,
        clock,
        logger.new(o!("component" => "dircontrol")),
    );
    for (peer_id, addr) in &config.peers {
        table.register_peer(*peer_id, addr.clone());
        info!(logger, "registered peer"; "peer_id" => peer_id, "addr" => addr);
    }
    handler_slot.install(table);

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!(logger, "shutting down");
    Ok(())
}
