use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use duraq::broker::{Manager, Reaper, Shutdown, Syncer};
use duraq::config::{self, Config};
use duraq::store::{Store, StoreOptions};
use duraq::telemetry;
use duraq::transport::TransportError;

#[derive(Parser, Debug)]
#[command(name = "duraq", version, about = "Durable at-least-once message broker")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Record log path; the in-flight companion file lives beside it.
    #[arg(long)]
    database: Option<String>,

    /// Consumer ack timeout in microseconds.
    #[arg(long)]
    ack_timeout: Option<u64>,

    /// Microseconds between expired in-flight sweeps.
    #[arg(long)]
    reaper_frequency: Option<u64>,

    /// Microseconds between store flushes.
    #[arg(long)]
    sync_frequency: Option<u64>,

    /// fsync on every store flush.
    #[arg(long)]
    hard_sync: bool,

    /// Byte cap for the in-flight index.
    #[arg(long)]
    inflight_size: Option<u64>,

    /// Producer-facing listen address.
    #[arg(long)]
    receive_addr: Option<String>,

    /// Consumer-facing listen address.
    #[arg(long)]
    send_addr: Option<String>,

    /// Monitoring listen address.
    #[arg(long)]
    monitor_addr: Option<String>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    telemetry::init(args.verbose);

    if let Err(e) = run(args) {
        tracing::error!("fatal: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> duraq::Result<()> {
    let mut config = match &args.config {
        Some(path) => config::load(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    let shutdown = Shutdown::new();
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, shutdown.flag()).map_err(TransportError::Io)?;
    }

    let store = Arc::new(Store::open(StoreOptions {
        path: PathBuf::from(&config.database),
        inflight_size: config.inflight_size,
        ack_timeout: config.ack_timeout,
        hard_sync: config.hard_sync,
    })?);
    tracing::info!(
        database = %config.database,
        messages = store.messages(),
        "store opened"
    );

    let reaper =
        Reaper::new(Arc::clone(&store), config.reaper_frequency, shutdown.clone()).spawn();
    let syncer =
        Syncer::new(Arc::clone(&store), config.sync_frequency, shutdown.clone()).spawn();

    let mut manager = Manager::bind(&config, Arc::clone(&store), shutdown.clone())
        .map_err(TransportError::Io)?;
    manager.run();

    let _ = reaper.join();
    let _ = syncer.join();
    tracing::info!("shutdown complete");
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(database) = &args.database {
        config.database = database.clone();
    }
    if let Some(ack_timeout) = args.ack_timeout {
        config.ack_timeout = ack_timeout;
    }
    if let Some(reaper_frequency) = args.reaper_frequency {
        config.reaper_frequency = reaper_frequency;
    }
    if let Some(sync_frequency) = args.sync_frequency {
        config.sync_frequency = sync_frequency;
    }
    if args.hard_sync {
        config.hard_sync = true;
    }
    if let Some(inflight_size) = args.inflight_size {
        config.inflight_size = inflight_size;
    }
    if let Some(receive_addr) = &args.receive_addr {
        config.receive_addr = receive_addr.clone();
    }
    if let Some(send_addr) = &args.send_addr {
        config.send_addr = send_addr.clone();
    }
    if let Some(monitor_addr) = &args.monitor_addr {
        config.monitor_addr = monitor_addr.clone();
    }
}
