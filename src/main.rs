use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use uconnect::{DEFAULT_KEY_PATH, DEFAULT_ROOM, Multiaddr, Node, NodeConfig, NodeEvent, PeerId, load_or_generate};

#[derive(Parser, Debug)]
#[command(name = "uconnect")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(long, env, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    listen_address: IpAddr,

    /// If known, the public IP of this node. Advertised on every transport.
    #[arg(long, env)]
    external_address: Option<IpAddr>,

    /// Nodes to connect to on startup. Can be given several times.
    #[arg(long, value_name = "MULTIADDR")]
    connect: Vec<Multiaddr>,

    #[arg(long, env, default_value_t = 9090)]
    tcp_port: u16,

    #[arg(long, env, default_value_t = 9091)]
    quic_port: u16,

    /// Where the identity key is kept. Created on first run.
    #[arg(long, env, default_value = DEFAULT_KEY_PATH)]
    key_path: PathBuf,

    /// Chat room to join.
    #[arg(long, env, default_value = DEFAULT_ROOM)]
    room: String,

    /// Name shown to other peers. Defaults to the short peer id.
    #[arg(long, env)]
    nick: Option<String>,

    /// Seconds between status log lines.
    #[arg(long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = load_or_generate(&args.key_path).context("failed to read identity")?;

    let config = NodeConfig {
        listen_addrs: vec![
            Multiaddr::tcp(SocketAddr::new(args.listen_address, args.tcp_port)),
            Multiaddr::quic(SocketAddr::new(args.listen_address, args.quic_port)),
        ],
        external_ip: args.external_address,
        bootstrap: args.connect.clone(),
        nick: args.nick.clone(),
        ..NodeConfig::default()
    };
    let node = Node::start(keypair, config).await?;
    for addr in node.addresses() {
        info!("Listening on {addr}");
    }

    let topic = node.join_room(&args.room).await?;
    info!(room = %args.room, topic = %topic, "joined room");

    let mut events = node.events().await?;
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut status = time::interval(Duration::from_secs(args.status_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            line = input.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Err(e) = handle_line(&node, &args.room, line.trim()).await {
                            warn!(error = %e, "command failed");
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed, exiting");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read stdin");
                        break;
                    }
                }
            }
            Some(event) = events.recv() => print_event(event),
            _ = status.tick() => {
                let snapshot = node.status().await;
                info!(
                    connected = snapshot.connected,
                    known_peers = snapshot.known_peers,
                    topics = snapshot.subscriptions.len(),
                    observed = ?snapshot.observed_addrs,
                    "status snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

/// `/share <path>`, `/fetch <peer> <file_id>`, `/peers`, or chat text.
async fn handle_line(node: &Node, room: &str, line: &str) -> Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    if let Some(path) = line.strip_prefix("/share ") {
        let data = tokio::fs::read(path.trim())
            .await
            .with_context(|| format!("failed to read {path}"))?;
        let id = node.share_file(data).await?;
        println!("shared {path} as {id}");
    } else if let Some(rest) = line.strip_prefix("/fetch ") {
        let (peer, id) = rest
            .trim()
            .split_once(' ')
            .context("usage: /fetch <peer> <file_id>")?;
        let peer = PeerId::from_hex(peer).context("invalid peer id")?;
        let data = node.fetch_file(&peer, id.trim()).await?;
        println!("fetched {} ({} bytes)", id.trim(), data.len());
    } else if line == "/peers" {
        for peer in node.connected_peers().await {
            println!("{peer}");
        }
    } else {
        node.send_chat(room, line).await?;
    }
    Ok(())
}

fn print_event(event: NodeEvent) {
    match event {
        NodeEvent::Chat { room, message, .. } => {
            println!("[{room}] {}: {}", message.sender, message.text);
        }
        NodeEvent::FileAnnounced { source, file_id } => {
            println!("{source} shared file {file_id}");
        }
        NodeEvent::Connected { peer, addr, .. } => info!("Connected to {peer} at {addr}"),
        NodeEvent::Disconnected { peer, reason } => info!("Connection to {peer} closed: {reason}"),
        NodeEvent::PeerRecord { .. } | NodeEvent::Message(_) => {}
    }
}
