use anyhow::Context;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// An EtherNet/IP CIP communication front-end: serves Logix-style tag
/// reads and writes, Forward Open connected sessions, and the discovery
/// commands, against attributes defined on the command line or in a
/// configuration file.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Interface to bind.
    #[arg(short, long, default_value = "0.0.0.0", env = "ENIP_ADDRESS")]
    address: IpAddr,
    /// Port to listen on.
    #[arg(short, long, default_value_t = enip::DEFAULT_PORT, env = "ENIP_PORT")]
    port: u16,
    /// Also answer ListIdentity/ListServices broadcasts over UDP.
    #[arg(long)]
    udp: bool,
    /// Socket receive timeout used to poll shutdown intent.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "500ms")]
    latency: std::time::Duration,
    /// Drop sessions idle for this long (default: never).
    #[arg(long, value_parser = humantime::parse_duration)]
    idle_session_timeout: Option<std::time::Duration>,
    /// How long each session may take to wind down at shutdown.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    grace: std::time::Duration,
    /// Maximum concurrently-served connections.
    #[arg(long, default_value = "256")]
    max_connections: usize,
    /// Configuration file with a [Simulator] tag section.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Tag definitions: Name=TYPE[len] or Name=TYPE=v1,v2,…
    #[arg(value_name = "TAG")]
    tags: Vec<String>,
    /// Increase logging verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn install_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    install_logging(cli.verbose);

    let device = Arc::new(cip::Device::with_standard_objects());

    if let Some(path) = &cli.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        for def in enip::config::parse_simulator(&text)? {
            let addr = device.define_tag(&def).context("defining configured tag")?;
            tracing::info!(tag = ?def.spec.name, ?addr, length = def.length, "configured tag");
        }
    }
    for tag in &cli.tags {
        let def = cip::symbol::parse_definition(tag)
            .with_context(|| format!("bad tag definition {tag:?}"))?;
        let addr = device.define_tag(&def).context("defining tag")?;
        tracing::info!(tag = ?def.spec.name, ?addr, length = def.length, "defined tag");
    }

    let options = enip::Options {
        bind: SocketAddr::new(cli.address, cli.port),
        udp: cli.udp,
        latency: cli.latency,
        idle_timeout: cli.idle_session_timeout,
        grace: cli.grace,
        max_connections: cli.max_connections,
    };

    let stop = tokio_util::sync::CancellationToken::new();
    let signalled = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signalled.cancel();
        }
    });

    enip::serve(device, options, stop).await
}
