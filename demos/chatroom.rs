use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use parking_lot::RwLock;
use tokio::io::AsyncBufReadExt;

use uconnect::{Keypair, Multiaddr, Node, NodeConfig, NodeEvent, PeerId};

#[derive(Parser, Debug)]
#[command(name = "chatroom")]
#[command(about = "A simple chatroom over uconnect rooms and file sharing")]
struct ChatArgs {
    #[arg(long, default_value = "anon")]
    name: String,

    #[arg(long, default_value = "lobby")]
    room: String,

    #[arg(long, default_value = "0")]
    port: u16,

    /// `/ip4/…/tcp/…/p2p/<peer>` printed by another chatroom.
    #[arg(short = 'B', long = "bootstrap")]
    bootstrap: Vec<Multiaddr>,
}

/// Nicknames seen in the room, by peer.
type PeerRegistry = Arc<RwLock<HashMap<PeerId, String>>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = ChatArgs::parse();

    let config = NodeConfig {
        listen_addrs: vec![Multiaddr::tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, args.port)))],
        enable_quic: false,
        bootstrap: args.bootstrap.clone(),
        nick: Some(args.name.clone()),
        ..NodeConfig::default()
    };
    let node = Node::start(Keypair::generate(), config).await?;
    let me = node.local_peer_id();

    println!("╔════════════════════════════════════════════════════════════════╗");
    println!("║                    uconnect Chatroom                           ║");
    println!("╠════════════════════════════════════════════════════════════════╣");
    println!("║ Nickname : {:<52} ║", args.name);
    println!("║ Room     : {:<52} ║", args.room);
    println!("║ Peer     : {:<52} ║", me.short());
    println!("╠════════════════════════════════════════════════════════════════╣");
    println!("║ Bootstrap address (copy this line):                            ║");
    println!("╚════════════════════════════════════════════════════════════════╝");
    for addr in node.addresses() {
        println!("{addr}");
    }

    node.join_room(&args.room).await?;
    println!("\nJoined room: {}", args.room);

    let peers: PeerRegistry = Arc::new(RwLock::new(HashMap::new()));
    let mut events = node.events().await?;
    let peers_for_events = peers.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::Chat { source, message, .. } => {
                    if source == me {
                        continue;
                    }
                    peers_for_events.write().insert(source, message.sender.clone());
                    println!("\x1b[32m[room]\x1b[0m {}: {}", message.sender, message.text);
                }
                NodeEvent::FileAnnounced { source, file_id } => {
                    println!("\x1b[35m[file]\x1b[0m {} shared {}", source.short(), file_id);
                }
                NodeEvent::Connected { peer, .. } => {
                    println!("\x1b[33m[peer]\x1b[0m connected {}", peer.short());
                }
                NodeEvent::Disconnected { peer, .. } => {
                    println!("\x1b[33m[peer]\x1b[0m disconnected {}", peer.short());
                }
                _ => {}
            }
        }
    });

    println!("\nCommands:");
    println!("  /share <path>             - Share a file with the room");
    println!("  /fetch <peer> <file_id>   - Download a shared file");
    println!("  /peers                    - List known peers");
    println!("  /quit                     - Exit");
    println!("Type anything else to broadcast to the room.\n");

    let stdin = tokio::io::stdin();
    let mut stdin_reader = tokio::io::BufReader::new(stdin).lines();

    while let Some(line) = stdin_reader.next_line().await? {
        let line = line.trim();

        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            println!("Goodbye!");
            break;
        }

        if line == "/peers" {
            let connected = node.connected_peers().await;
            if connected.is_empty() {
                println!("Not connected to anyone yet.");
            } else {
                let names = peers.read();
                println!("Connected peers:");
                for peer in connected {
                    let name = names.get(&peer).map(String::as_str).unwrap_or("?");
                    println!("  {} ({})", name, peer);
                }
            }
            continue;
        }

        if let Some(path) = line.strip_prefix("/share ") {
            match tokio::fs::read(path.trim()).await {
                Ok(data) => match node.share_file(data).await {
                    Ok(id) => println!("Shared {} as {}", path.trim(), id),
                    Err(e) => eprintln!("\x1b[31m[error]\x1b[0m {e}"),
                },
                Err(e) => eprintln!("\x1b[31m[error]\x1b[0m cannot read {}: {e}", path.trim()),
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("/fetch ") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() != 2 {
                println!("Usage: /fetch <peer_hex> <file_id>");
                continue;
            }
            let Ok(peer) = PeerId::from_hex(parts[0]) else {
                println!("Invalid peer id. Must be 64 hex characters.");
                continue;
            };
            match node.fetch_file(&peer, parts[1]).await {
                Ok(data) => println!("Fetched {} ({} bytes)", parts[1], data.len()),
                Err(e) => eprintln!("\x1b[31m[error]\x1b[0m {e}"),
            }
            continue;
        }

        match node.send_chat(&args.room, line).await {
            Ok(_) => println!("\x1b[32m[room]\x1b[0m {}: {}", args.name, line),
            Err(e) => eprintln!("Failed to send message: {e}"),
        }
    }

    node.shutdown().await;
    Ok(())
}
