// Loft node: serves world snapshots from a directory and fetches them from peers.

mod config;
mod node;
mod store;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::bail;
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::node::Node;

#[derive(Debug, Parser)]
#[command(name = "loft-node", version, about = "Large-object transfer node")]
struct Cli {
    /// Config file (default: ~/.config/loft/config.toml, then /etc/loft/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Snapshot directory; overrides config and LOFT_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Log more (-v info, -vv debug, -vvv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve snapshots to peers until interrupted.
    Serve {
        #[arg(long)]
        control_port: Option<u16>,
        #[arg(long)]
        stream_port: Option<u16>,
        /// Do not run a stream listener; peers fall back to fragmented delivery.
        #[arg(long)]
        no_streams: bool,
    },
    /// Fetch one snapshot from a serving peer into the data directory.
    Fetch {
        /// Peer control address, e.g. 10.0.0.2:47300.
        peer: SocketAddr,
        /// Snapshot name.
        name: String,
        /// Ask for fragmented delivery only.
        #[arg(long)]
        no_stream: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        cfg.data_dir = dir;
    }
    match cli.command {
        Command::Serve {
            control_port,
            stream_port,
            no_streams,
        } => {
            if let Some(p) = control_port {
                cfg.control_port = p;
            }
            if let Some(p) = stream_port {
                cfg.stream_port = p;
            }
            cfg.streams &= !no_streams;
            serve(cfg).await
        }
        Command::Fetch {
            peer,
            name,
            no_stream,
        } => {
            // The fetching side needs no well-known ports.
            cfg.control_port = 0;
            cfg.stream_port = 0;
            cfg.prefer_stream &= !no_stream;
            cfg.streams = cfg.prefer_stream;
            fetch(cfg, peer, name).await
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn serve(cfg: config::Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cfg.data_dir)?;
    let node = Node::start(&cfg).await?;
    println!(
        "loft-node {} serving {} on {}",
        env!("CARGO_PKG_VERSION"),
        cfg.data_dir.display(),
        node.control_addr
    );
    shutdown_signal().await?;
    info!(
        peers = node.network.peers().len(),
        stream_dials = node.network.stream_dials(),
        sessions = node.coordinator.sessions().len(),
        "shutting down"
    );
    node.cancel_all().await;
    Ok(())
}

async fn fetch(cfg: config::Config, peer_addr: SocketAddr, name: String) -> anyhow::Result<()> {
    let node = Node::start(&cfg).await?;
    let peer = node.network.connect(peer_addr).await?;
    let receive = node
        .coordinator
        .begin_receive(peer, &name, cfg.prefer_stream);
    tokio::pin!(receive);
    let outcome = tokio::select! {
        outcome = &mut receive => outcome,
        _ = shutdown_signal() => {
            node.cancel_all().await;
            receive.await
        }
    };
    match outcome.error {
        None => {
            println!(
                "{} installed in {}: {} bytes via {:?}{} in {:.1}s",
                name,
                cfg.data_dir.display(),
                outcome.total,
                outcome.strategy,
                if outcome.downgraded { " (downgraded)" } else { "" },
                outcome.elapsed.as_secs_f64()
            );
            Ok(())
        }
        Some(e) => bail!("fetching {} failed ({}): {}", name, e.kind(), e),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
