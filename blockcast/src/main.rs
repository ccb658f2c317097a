// Blockcast daemon: serve one file to a multicast group, or receive files from it.

mod channel;
mod config;
mod reactor;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use blockcast_core::{Distributor, HostIdentity, Receiver};
use clap::builder::NonEmptyStringValueParser;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, info_span};
use tracing_subscriber::EnvFilter;

use crate::channel::MulticastChannel;
use crate::config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Multicast group to join
    #[arg(long, global = true)]
    group: Option<Ipv4Addr>,

    /// UDP port shared by the group
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Send to this address instead of the group (unicast debugging)
    #[arg(long, global = true)]
    destination: Option<SocketAddr>,

    /// Config file to use instead of the default locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace); RUST_LOG applies otherwise
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve SOURCE; receivers store it at DEST_PATH
    Serve {
        source: PathBuf,
        #[arg(value_parser = NonEmptyStringValueParser::new())]
        dest_path: String,
    },
    /// Receive every file advertised on the group
    Receive {
        /// Directory for partial files
        #[arg(long)]
        staging_dir: Option<PathBuf>,

        /// Exit once a file is fully synchronized
        #[arg(long)]
        exit_when_synced: bool,
    },
    /// Log every datagram seen on the group
    Listen,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(group) = args.group {
        cfg.group = group;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Command::Receive {
        staging_dir,
        exit_when_synced,
    } = &args.command
    {
        if let Some(dir) = staging_dir {
            cfg.staging_dir = Some(dir.clone());
        }
        cfg.exit_when_synced |= *exit_when_synced;
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    rt.block_on(run(args.command, cfg, args.destination))
}

fn init_tracing(verbose: u8) -> anyhow::Result<()> {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

async fn run(
    command: Command,
    cfg: Config,
    destination: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let mut channel =
        MulticastChannel::open(cfg.group, cfg.port, cfg.multicast_ttl, cfg.multicast_loop)
            .with_context(|| format!("joining {}:{}", cfg.group, cfg.port))?;
    if let Some(destination) = destination {
        channel.set_destination(destination);
    }
    info!(
        local = ?channel.local_addr().ok(),
        destination = %channel.destination(),
        "channel open"
    );

    match command {
        Command::Serve { source, dest_path } => {
            let host = HostIdentity::random();
            let span = info_span!("distributor", %host);
            let mut distributor =
                Distributor::open(host, &source, dest_path, cfg.distributor_config(), span)
                    .with_context(|| format!("serving {}", source.display()))?;
            tokio::select! {
                r = reactor::run(&mut distributor, &mut channel, Some(cfg.probe_interval())) => {
                    r.context("distributor stopped")?;
                    info!("all participants finished");
                }
                r = shutdown_signal() => {
                    r?;
                    info!("shutting down");
                }
            }
        }
        Command::Receive { .. } => {
            let host = HostIdentity::from_process();
            let span = info_span!("receiver", %host);
            let config = cfg.receiver_config();
            std::fs::create_dir_all(&config.staging_dir)
                .with_context(|| format!("creating {}", config.staging_dir.display()))?;
            let mut receiver = Receiver::new(host, config, span)?;
            tokio::select! {
                r = reactor::run(&mut receiver, &mut channel, None) => {
                    r.context("receiver stopped")?;
                    info!("synchronized, exiting");
                }
                r = shutdown_signal() => {
                    r?;
                    info!("shutting down");
                }
            }
        }
        Command::Listen => {
            tokio::select! {
                r = reactor::listen(&mut channel, None) => {
                    r.context("listener stopped")?;
                }
                r = shutdown_signal() => {
                    r?;
                    info!("shutting down");
                }
            }
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
