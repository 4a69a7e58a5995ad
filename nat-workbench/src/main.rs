mod derp;
mod scenario;

use anyhow::Context;
use clap::Parser;
use in_memory_internet::{RelayCatalog, Server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{UnixDatagram, UnixListener};
use tracing::{debug, info};
use tracing_subscriber::fmt::Subscriber;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Serve a simulated Internet to guest VMs over a Unix socket")]
struct CliOpt {
    /// Path to the scenario JSON file describing networks and nodes.
    #[arg(long)]
    config: PathBuf,

    /// Unix socket to serve guests on.
    #[arg(long, default_value = "nat-workbench.sock")]
    listen: PathBuf,

    /// Serve one guest with datagram framing (one Ethernet frame per
    /// datagram) instead of accepting length-prefixed stream connections.
    /// Requires --peer.
    #[arg(long)]
    datagram: bool,

    /// Peer socket path the hypervisor receives datagrams on.
    #[arg(long, requires = "datagram")]
    peer: Option<PathBuf>,

    /// Command printing the relay map JSON used to populate bridged relay
    /// IPs (e.g. "tailscale debug derp-map"). Without it, the scenario
    /// file's static list is used.
    #[arg(long)]
    relay_cmd: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .init();

    let opt = CliOpt::parse();
    let scenario = scenario::load(&opt.config)?;

    let relay_ips = match &opt.relay_cmd {
        Some(cmd) => derp::RelayMapCommand::new(cmd.as_str())
            .list_relay_ipv4s()
            .context("populating relay IPs")?,
        None => scenario.relay_ipv4s.clone(),
    };
    info!(count = relay_ips.len(), "relay IPs populated");

    let server = Server::new(scenario.to_config()?, relay_ips)?;
    server.write_starting_banner(std::io::stdout().lock())?;

    let _ = std::fs::remove_file(&opt.listen);
    let serve = serve_guests(server.clone(), &opt);
    tokio::select! {
        res = serve => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
        }
    }

    server.shutdown();
    let _ = std::fs::remove_file(&opt.listen);
    Ok(())
}

async fn serve_guests(server: Arc<Server>, opt: &CliOpt) -> anyhow::Result<()> {
    if opt.datagram {
        let peer = opt
            .peer
            .as_ref()
            .context("--datagram requires --peer")?;
        let socket = UnixDatagram::bind(&opt.listen)
            .with_context(|| format!("binding {}", opt.listen.display()))?;
        socket
            .connect(peer)
            .with_context(|| format!("connecting to {}", peer.display()))?;
        server.serve_datagram(socket).await;
        return Ok(());
    }

    let listener = UnixListener::bind(&opt.listen)
        .with_context(|| format!("binding {}", opt.listen.display()))?;
    info!(path = %opt.listen.display(), "listening for guests");
    loop {
        let (stream, _addr) = listener.accept().await.context("accepting guest")?;
        debug!("guest connected");
        let server = server.clone();
        tokio::spawn(async move {
            server.serve_stream(stream).await;
            debug!("guest disconnected");
        });
    }
}
