//! conmux demo: an echo server on the connection manager.
//!
//! Accepts TCP (`host:port`) and local-domain (`unix:/path`) listeners,
//! echoes every byte back, and shuts down cleanly on SIGINT/SIGTERM through
//! the manager's signal bridge.

use std::path::PathBuf;

use clap::Parser;
use conmux::{ConArg, Config, ConnKind, Events, Manager};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the echo server.
#[derive(Parser, Debug)]
#[command(name = "conmux")]
#[command(about = "Echo server built on the conmux connection manager", long_about = None)]
struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen specs: host:port or unix:/path (repeatable)
    #[arg(short = 'l', long = "listen", default_value = "127.0.0.1:7777")]
    listen: Vec<String>,

    /// Number of worker threads (0 = available parallelism)
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    let mut config: Config = match &cli.config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    let default_filter = if config.debug_conmgr {
        "conmux=trace".to_string()
    } else {
        config.log_level.clone()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = ?cli.listen,
        workers = config.effective_workers(),
        "starting echo server"
    );

    let mgr = Manager::init(config)?;

    let events = Events::new()
        .on_connection(|con, _arg| {
            if let Ok(name) = con.name() {
                info!(conn = %name, "client connected");
            }
            Some(Box::new(()) as ConArg)
        })
        .on_data(|con, _arg| {
            let data = con.take_input()?;
            con.queue_write(data.freeze())
        })
        .on_finish(|con, _arg| {
            if let Ok(name) = con.name() {
                info!(conn = %name, "client disconnected");
            }
        });

    mgr.create_listen_sockets(ConnKind::Raw, &cli.listen, events, None)?;

    // SIGINT/SIGTERM wind the whole manager down
    for signo in [libc::SIGINT, libc::SIGTERM] {
        let shutdown = mgr.shutdown_handle();
        mgr.add_signal_work(signo, move |_status| {
            info!(signo, "shutdown signal received");
            shutdown.request();
        })?;
    }

    mgr.run();
    info!("echo server stopped");
    Ok(())
}
