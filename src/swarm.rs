//! # Connection Manager
//!
//! The swarm owns every live [`Connection`] and the tasks that serve it.
//!
//! ## Responsibilities
//!
//! - **Dialing**: addresses are ranked by transport, raced with a stagger
//!   ([`crate::dial`]), and concurrent dials to one peer share a single race.
//! - **Listening**: inbound raw connections are upgraded on their own task
//!   and then registered with the actor.
//! - **Deduplication**: at most one live connection per peer. When two
//!   connections to the same peer exist (simultaneous dial), both ends keep
//!   the one dialed by the peer with the smaller [`PeerId`], so they agree
//!   without coordination.
//! - **Stream dispatch**: every inbound stream is negotiated against
//!   [`SUPPORTED_PROTOCOLS`] and handed to gossip, identify or file exchange.
//! - **Gossip egress**: each connection has a bounded outbound queue drained
//!   by a writer task over one long-lived gossip stream.
//!
//! ## Events
//!
//! [`SwarmEvent`]s report peers connecting, disconnecting, and completing
//! identify. Replacing a duplicate connection is not reported; the peer
//! stays connected throughout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::{self, Connection, Direction, Stream, UpgradeConfig};
use crate::dial::{DialPolicy, race_dials};
use crate::error::DialError;
use crate::identity::{Keypair, PeerId};
use crate::messages::{
    FileRequest, FileResponse, GossipSubRequest, IdentifyInfo, MAX_ADVERTISED_ADDRS, MAX_GOSSIP_FRAME,
    deserialize_bounded, serialize,
};
use crate::multiaddr::{Host, Multiaddr};
use crate::negotiate::{DEFAULT_NEGOTIATION_TIMEOUT, select_inbound, select_outbound};
use crate::protocols::{
    AGENT_VERSION, FILE_EXCHANGE_PROTOCOL, GOSSIPSUB_PROTOCOL, GossipSubRpc, IDENTIFY_PROTOCOL, InboundHandler,
    PROTOCOL_VERSION, SUPPORTED_PROTOCOLS,
};
use crate::transport::TransportRegistry;

pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Outbound gossip messages buffered per connection.
pub const DEFAULT_GOSSIP_QUEUE_SIZE: usize = 256;

/// Bound on a request/response exchange (file exchange, identify).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest identify message read.
const MAX_IDENTIFY_SIZE: usize = 64 * 1024;

const MAX_IDENTIFY_PROTOCOLS: usize = 32;

const MAX_OBSERVED_ADDRS: usize = 8;

const EVENT_CHANNEL_SIZE: usize = 1024;

#[derive(Clone, Debug)]
pub struct SwarmConfig {
    pub dial_policy: DialPolicy,
    pub upgrade: UpgradeConfig,
    pub negotiation_timeout: Duration,
    pub request_timeout: Duration,
    pub gossip_queue_size: usize,
    pub max_connections: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            dial_policy: DialPolicy::default(),
            upgrade: UpgradeConfig::default(),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            gossip_queue_size: DEFAULT_GOSSIP_QUEUE_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

#[derive(Clone, Debug)]
pub enum SwarmEvent {
    Connected {
        peer: PeerId,
        /// Remote address as seen by the transport.
        addr: Multiaddr,
        direction: Direction,
    },
    Disconnected {
        peer: PeerId,
        reason: String,
    },
    Identified {
        peer: PeerId,
        info: IdentifyInfo,
    },
}

/// A successful dial.
#[derive(Clone, Debug)]
pub struct Dialed {
    pub connection: Connection,
    /// Attempts that failed before the winning one completed.
    pub failures: Vec<(Multiaddr, DialError)>,
}

/// Which of two connections to the same peer survives.
///
/// Connections in the same direction are not duplicates of a simultaneous
/// dial; the established one is kept. Otherwise the connection dialed by
/// the smaller peer id wins, which both ends compute identically.
fn keeps_new(existing: Direction, new: Direction, local: PeerId, remote: PeerId) -> bool {
    if existing == new {
        return false;
    }
    let preferred = if local < remote {
        Direction::Outbound
    } else {
        Direction::Inbound
    };
    new == preferred
}

fn is_unspecified(addr: &Multiaddr) -> bool {
    matches!(addr.host(), Some(Host::Ip(ip)) if ip.is_unspecified())
}

#[derive(Default)]
struct LocalAddresses {
    listen: Vec<Multiaddr>,
    external: Vec<Multiaddr>,
    observed: Vec<Multiaddr>,
}

/// State shared by the handle, the actor and the connection tasks.
struct SwarmShared {
    keypair: Keypair,
    local_peer: PeerId,
    registry: TransportRegistry,
    config: SwarmConfig,
    handler: OnceLock<Arc<dyn InboundHandler>>,
    addresses: RwLock<LocalAddresses>,
    event_tx: mpsc::Sender<SwarmEvent>,
    next_connection_id: AtomicU64,
}

impl SwarmShared {
    async fn dial_and_upgrade(&self, addr: &Multiaddr, expected: Option<PeerId>) -> Result<Connection, DialError> {
        let raw = self.registry.dial(addr).await?;
        let connection = connection::upgrade(
            self.connection_id(),
            raw,
            &self.keypair,
            Direction::Outbound,
            expected,
            &self.config.upgrade,
        )
        .await?;
        Ok(connection)
    }

    fn connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// External addresses first, then listen addresses that are not wildcards.
    fn advertised_addrs(&self) -> Vec<Multiaddr> {
        let addresses = self.addresses.read();
        let mut out: Vec<Multiaddr> = Vec::new();
        for addr in addresses.external.iter().chain(addresses.listen.iter()) {
            if !is_unspecified(addr) && !out.contains(addr) {
                out.push(addr.clone());
            }
        }
        out.truncate(MAX_ADVERTISED_ADDRS);
        out
    }

    fn identify_info(&self, observed: &Multiaddr) -> IdentifyInfo {
        IdentifyInfo {
            protocol_version: PROTOCOL_VERSION.to_string(),
            agent_version: AGENT_VERSION.to_string(),
            listen_addrs: self.advertised_addrs(),
            observed_addr: Some(observed.clone()),
            protocols: SUPPORTED_PROTOCOLS.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn record_observed(&self, addr: Multiaddr) {
        let mut addresses = self.addresses.write();
        if addresses.observed.contains(&addr) {
            return;
        }
        if addresses.observed.len() >= MAX_OBSERVED_ADDRS {
            addresses.observed.remove(0);
        }
        addresses.observed.push(addr);
    }

    fn emit(&self, event: SwarmEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!(error = %e, "swarm event dropped");
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

type DialReply = oneshot::Sender<Result<Dialed, DialError>>;

enum Command {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: DialReply,
    },
    DialFinished {
        peer: PeerId,
        result: Result<Dialed, DialError>,
    },
    Register {
        connection: Connection,
        reply: Option<oneshot::Sender<Result<Connection, DialError>>>,
    },
    ConnectionClosed {
        peer: PeerId,
        id: u64,
        reason: String,
    },
    SendGossip {
        peer: PeerId,
        message: GossipSubRequest,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    GetConnection(PeerId, oneshot::Sender<Option<Connection>>),
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
    Disconnect(PeerId),
    Quit,
}

// ============================================================================
// Swarm Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Swarm {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<SwarmShared>,
    listeners: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Swarm {
    pub fn new(
        keypair: Keypair,
        registry: TransportRegistry,
        config: SwarmConfig,
    ) -> (Self, mpsc::Receiver<SwarmEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let shared = Arc::new(SwarmShared {
            local_peer: keypair.peer_id(),
            keypair,
            registry,
            config,
            handler: OnceLock::new(),
            addresses: RwLock::new(LocalAddresses::default()),
            event_tx,
            next_connection_id: AtomicU64::new(1),
        });

        let actor = SwarmActor {
            shared: shared.clone(),
            cmd_tx: cmd_tx.downgrade(),
            connections: HashMap::new(),
            pending_dials: HashMap::new(),
        };
        tokio::spawn(actor.run(cmd_rx));

        (
            Self {
                cmd_tx,
                shared,
                listeners: Arc::new(Mutex::new(Vec::new())),
            },
            event_rx,
        )
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.shared.local_peer
    }

    /// Install the receiver of inbound gossip and file requests. Only the
    /// first call takes effect.
    pub fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        if self.shared.handler.set(handler).is_err() {
            warn!("inbound handler already installed");
        }
    }

    /// Listen on `addr` and return the bound address.
    pub async fn listen(&self, addr: &Multiaddr) -> anyhow::Result<Multiaddr> {
        let mut listener = self.shared.registry.listen(addr).await?;
        let bound = listener.local_addr().clone();
        self.shared.addresses.write().listen.push(bound.clone());

        let shared = self.shared.clone();
        let cmd_tx = self.cmd_tx.downgrade();
        let task = tokio::spawn(async move {
            while let Some(raw) = listener.accept().await {
                let Some(cmd_tx) = cmd_tx.upgrade() else {
                    break;
                };
                let shared = shared.clone();
                tokio::spawn(async move {
                    let remote = raw.remote_addr.clone();
                    let id = shared.connection_id();
                    match connection::upgrade(id, raw, &shared.keypair, Direction::Inbound, None, &shared.config.upgrade)
                        .await
                    {
                        Ok(connection) => {
                            let _ = cmd_tx.send(Command::Register { connection, reply: None }).await;
                        }
                        Err(e) => debug!(remote = %remote, error = %e, "inbound upgrade failed"),
                    }
                });
            }
        });
        self.listeners.lock().push(task);

        info!(addr = %bound.with_p2p(self.shared.local_peer), "listening");
        Ok(bound)
    }

    pub fn add_external_address(&self, addr: Multiaddr) {
        let addr = addr.without_p2p();
        let mut addresses = self.shared.addresses.write();
        if !addresses.external.contains(&addr) {
            info!(addr = %addr, "external address");
            addresses.external.push(addr);
        }
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.shared.addresses.read().listen.clone()
    }

    /// Addresses we tell other peers about.
    pub fn advertised_addrs(&self) -> Vec<Multiaddr> {
        self.shared.advertised_addrs()
    }

    /// Addresses remote peers reported seeing us at.
    pub fn observed_addrs(&self) -> Vec<Multiaddr> {
        self.shared.addresses.read().observed.clone()
    }

    /// Connect to `peer`, reusing a live connection if there is one.
    pub async fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<Dialed, DialError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Dial { peer, addrs, reply: tx })
            .await
            .map_err(|_| DialError::Shutdown)?;
        rx.await.map_err(|_| DialError::Shutdown)?
    }

    /// Dial a single address. The peer is taken from a `/p2p` suffix when
    /// present and learned from the handshake otherwise.
    pub async fn dial_addr(&self, addr: &Multiaddr) -> Result<Dialed, DialError> {
        if let Some(peer) = addr.peer_id() {
            return self.dial(peer, vec![addr.without_p2p()]).await;
        }
        let connection = self.shared.dial_and_upgrade(addr, None).await?;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register { connection, reply: Some(tx) })
            .await
            .map_err(|_| DialError::Shutdown)?;
        let connection = rx.await.map_err(|_| DialError::Shutdown)??;
        Ok(Dialed {
            connection,
            failures: Vec::new(),
        })
    }

    pub async fn connection(&self, peer: &PeerId) -> Option<Connection> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetConnection(*peer, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ConnectedPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        self.connection(peer).await.is_some()
    }

    pub async fn disconnect(&self, peer: &PeerId) {
        let _ = self.cmd_tx.send(Command::Disconnect(*peer)).await;
    }

    /// Fetch a shared file from a connected peer.
    pub async fn request_file(&self, peer: &PeerId, file_id: &str) -> anyhow::Result<FileResponse> {
        let connection = self
            .connection(peer)
            .await
            .with_context(|| format!("not connected to {}", peer.short()))?;
        let timeout = self.shared.config.request_timeout;
        let negotiation_timeout = self.shared.config.negotiation_timeout;
        let request = FileRequest::Get {
            file_id: file_id.to_string(),
        };

        let exchange = async {
            let mut stream = open_protocol_stream(&connection, FILE_EXCHANGE_PROTOCOL, negotiation_timeout).await?;
            stream.write_message(&serialize(&request)?).await?;
            stream.close();
            let bytes = stream
                .read_message(connection::MAX_STREAM_MESSAGE)
                .await?
                .context("stream closed before file response")?;
            let response: FileResponse = deserialize_bounded(&bytes)?;
            anyhow::Ok(response)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| anyhow::anyhow!("file request to {} timed out", peer.short()))?
    }

    /// Stop listening, close every connection and stop the actor.
    pub async fn quit(&self) {
        for task in self.listeners.lock().drain(..) {
            task.abort();
        }
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

#[async_trait]
impl GossipSubRpc for Swarm {
    async fn send_gossipsub(&self, to: &PeerId, message: GossipSubRequest) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendGossip {
                peer: *to,
                message,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("Swarm actor closed"))?
    }
}

// ============================================================================
// Swarm Actor (owns the connection table)
// ============================================================================

struct ConnectionEntry {
    connection: Connection,
    gossip_tx: mpsc::Sender<GossipSubRequest>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionEntry {
    fn shutdown(self, reason: &str) {
        for task in self.tasks {
            task.abort();
        }
        self.connection.close(reason);
    }
}

struct SwarmActor {
    shared: Arc<SwarmShared>,
    cmd_tx: mpsc::WeakSender<Command>,
    connections: HashMap<PeerId, ConnectionEntry>,
    /// Callers waiting on an in-flight dial, by peer.
    pending_dials: HashMap<PeerId, Vec<DialReply>>,
}

impl SwarmActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Dial { peer, addrs, reply } => self.start_dial(peer, addrs, reply),
                Command::DialFinished { peer, result } => self.finish_dial(peer, result),
                Command::Register { connection, reply } => {
                    let result = self.register(connection);
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Command::ConnectionClosed { peer, id, reason } => {
                    let current = self.connections.get(&peer).is_some_and(|e| e.connection.id() == id);
                    if current && let Some(entry) = self.connections.remove(&peer) {
                        entry.shutdown(&reason);
                        debug!(peer = %peer.short(), reason = %reason, "peer disconnected");
                        self.shared.emit(SwarmEvent::Disconnected { peer, reason });
                    }
                }
                Command::SendGossip { peer, message, reply } => {
                    let result = match self.connections.get(&peer) {
                        Some(entry) => entry.gossip_tx.try_send(message).map_err(|e| match e {
                            mpsc::error::TrySendError::Full(_) => {
                                anyhow::anyhow!("gossip queue to {} is full", peer.short())
                            }
                            mpsc::error::TrySendError::Closed(_) => {
                                anyhow::anyhow!("gossip writer for {} stopped", peer.short())
                            }
                        }),
                        None => Err(anyhow::anyhow!("not connected to {}", peer.short())),
                    };
                    let _ = reply.send(result);
                }
                Command::GetConnection(peer, reply) => {
                    let connection = self
                        .connections
                        .get(&peer)
                        .filter(|e| !e.connection.is_closed())
                        .map(|e| e.connection.clone());
                    let _ = reply.send(connection);
                }
                Command::ConnectedPeers(reply) => {
                    let _ = reply.send(self.connections.keys().copied().collect());
                }
                Command::Disconnect(peer) => {
                    if let Some(entry) = self.connections.get(&peer) {
                        entry.connection.close("disconnect requested");
                    }
                }
                Command::Quit => {
                    debug!("Swarm actor quitting");
                    break;
                }
            }
        }
        for (_, entry) in self.connections.drain() {
            entry.shutdown("swarm shut down");
        }
    }

    fn live_connection(&self, peer: &PeerId) -> Option<Connection> {
        self.connections
            .get(peer)
            .filter(|e| !e.connection.is_closed())
            .map(|e| e.connection.clone())
    }

    fn start_dial(&mut self, peer: PeerId, addrs: Vec<Multiaddr>, reply: DialReply) {
        if peer == self.shared.local_peer {
            let _ = reply.send(Err(DialError::SelfDial));
            return;
        }
        if let Some(connection) = self.live_connection(&peer) {
            let _ = reply.send(Ok(Dialed {
                connection,
                failures: Vec::new(),
            }));
            return;
        }
        if let Some(waiters) = self.pending_dials.get_mut(&peer) {
            trace!(peer = %peer.short(), "joining in-flight dial");
            waiters.push(reply);
            return;
        }
        if addrs.is_empty() {
            let _ = reply.send(Err(DialError::NoAddresses(peer)));
            return;
        }
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            let _ = reply.send(Err(DialError::Shutdown));
            return;
        };

        self.pending_dials.insert(peer, vec![reply]);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = dial_peer(shared, peer, addrs).await;
            let _ = cmd_tx.send(Command::DialFinished { peer, result }).await;
        });
    }

    fn finish_dial(&mut self, peer: PeerId, result: Result<Dialed, DialError>) {
        let result = match result {
            Ok(dialed) => self.register(dialed.connection).map(|connection| Dialed {
                connection,
                failures: dialed.failures,
            }),
            // An inbound connection may have arrived while we were dialing.
            Err(e) => match self.live_connection(&peer) {
                Some(connection) => Ok(Dialed {
                    connection,
                    failures: e.attempts().to_vec(),
                }),
                None => Err(e),
            },
        };
        for waiter in self.pending_dials.remove(&peer).unwrap_or_default() {
            let _ = waiter.send(result.clone());
        }
    }

    /// Adopt `connection` unless a preferred one to the same peer exists.
    /// Returns the connection that is live for the peer afterwards.
    fn register(&mut self, connection: Connection) -> Result<Connection, DialError> {
        let peer = connection.peer();
        if peer == self.shared.local_peer {
            connection.close("connected to self");
            return Err(DialError::SelfDial);
        }

        // A closed entry whose watcher has not reported yet.
        if self.connections.get(&peer).is_some_and(|e| e.connection.is_closed())
            && let Some(stale) = self.connections.remove(&peer)
        {
            stale.shutdown("connection closed");
            self.shared.emit(SwarmEvent::Disconnected {
                peer,
                reason: "connection closed".to_string(),
            });
        }

        if let Some(existing) = self.connections.get(&peer) {
            if existing.connection.id() == connection.id() {
                return Ok(connection);
            }
            let replace = keeps_new(
                existing.connection.direction(),
                connection.direction(),
                self.shared.local_peer,
                peer,
            );
            if !replace {
                debug!(peer = %peer.short(), "closing duplicate connection");
                connection.close("duplicate connection");
                return Ok(existing.connection.clone());
            }
            if let Some(old) = self.connections.remove(&peer) {
                debug!(peer = %peer.short(), old = old.connection.id(), new = connection.id(), "replacing duplicate connection");
                old.shutdown("duplicate connection");
            }
            self.install(connection.clone());
            return Ok(connection);
        }

        if self.connections.len() >= self.shared.config.max_connections {
            warn!(peer = %peer.short(), max = self.shared.config.max_connections, "connection limit reached");
            connection.close("connection limit");
            return Err(DialError::ConnectionLimit);
        }

        self.install(connection.clone());
        info!(
            peer = %peer.short(),
            addr = %connection.remote_addr(),
            direction = ?connection.direction(),
            "peer connected"
        );
        self.shared.emit(SwarmEvent::Connected {
            peer,
            addr: connection.remote_addr().clone(),
            direction: connection.direction(),
        });
        Ok(connection)
    }

    fn install(&mut self, connection: Connection) {
        let peer = connection.peer();
        let (gossip_tx, gossip_rx) = mpsc::channel(self.shared.config.gossip_queue_size.max(1));

        let acceptor = tokio::spawn(accept_streams(connection.clone(), self.shared.clone()));
        let writer = tokio::spawn(gossip_writer(
            connection.clone(),
            gossip_rx,
            self.shared.config.negotiation_timeout,
        ));
        let watcher = {
            let connection = connection.clone();
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let reason = connection.closed().await;
                if let Some(cmd_tx) = cmd_tx.upgrade() {
                    let _ = cmd_tx
                        .send(Command::ConnectionClosed {
                            peer: connection.peer(),
                            id: connection.id(),
                            reason,
                        })
                        .await;
                }
            })
        };
        tokio::spawn(identify_peer(connection.clone(), self.shared.clone()));

        self.connections.insert(peer, ConnectionEntry {
            connection,
            gossip_tx,
            tasks: vec![acceptor, writer, watcher],
        });
    }
}

async fn dial_peer(shared: Arc<SwarmShared>, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<Dialed, DialError> {
    let mut ranked: Vec<Multiaddr> = Vec::new();
    for addr in addrs {
        let addr = addr.without_p2p();
        if !ranked.contains(&addr) {
            ranked.push(addr);
        }
    }
    ranked.sort_by_key(|a| shared.registry.rank(a).unwrap_or(u8::MAX));

    let outcome = race_dials(ranked, &shared.config.dial_policy, |addr| {
        let shared = shared.clone();
        async move { shared.dial_and_upgrade(&addr, Some(peer)).await }
    })
    .await?;

    for (addr, error) in &outcome.failures {
        debug!(peer = %peer.short(), addr = %addr, error = %error, "dial attempt failed");
    }
    trace!(peer = %peer.short(), addr = %outcome.addr, "dial won");
    Ok(Dialed {
        connection: outcome.winner,
        failures: outcome.failures,
    })
}

// ============================================================================
// Per-connection tasks
// ============================================================================

async fn open_protocol_stream(
    connection: &Connection,
    protocol: &str,
    timeout: Duration,
) -> anyhow::Result<Stream> {
    let mut stream = connection.open_stream().await?;
    select_outbound(&mut stream, &[protocol], timeout).await?;
    Ok(stream)
}

async fn accept_streams(connection: Connection, shared: Arc<SwarmShared>) {
    let peer = connection.peer();
    loop {
        let stream = match connection.accept_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                trace!(peer = %peer.short(), error = %e, "stream acceptor stopped");
                return;
            }
        };
        let connection = connection.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(connection, stream, shared).await {
                debug!(peer = %peer.short(), error = %e, "inbound stream failed");
            }
        });
    }
}

async fn handle_stream(connection: Connection, mut stream: Stream, shared: Arc<SwarmShared>) -> anyhow::Result<()> {
    let peer = connection.peer();
    let protocol = select_inbound(&mut stream, SUPPORTED_PROTOCOLS, shared.config.negotiation_timeout).await?;

    match protocol.as_str() {
        GOSSIPSUB_PROTOCOL => {
            while let Some(bytes) = stream.read_message(MAX_GOSSIP_FRAME).await? {
                let message: GossipSubRequest = match deserialize_bounded(&bytes) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(peer = %peer.short(), error = %e, "malformed gossip frame");
                        stream.reset();
                        return Ok(());
                    }
                };
                if let Some(handler) = shared.handler.get() {
                    handler.on_gossip(peer, message).await;
                }
            }
            trace!(peer = %peer.short(), "inbound gossip stream ended");
        }
        IDENTIFY_PROTOCOL => {
            let info = shared.identify_info(connection.remote_addr());
            stream.write_message(&serialize(&info)?).await?;
            stream.close();
        }
        FILE_EXCHANGE_PROTOCOL => {
            let timeout = shared.config.request_timeout;
            let bytes = tokio::time::timeout(timeout, stream.read_message(MAX_IDENTIFY_SIZE))
                .await
                .map_err(|_| anyhow::anyhow!("file request read timed out"))??
                .context("stream closed before file request")?;
            let request: FileRequest = deserialize_bounded(&bytes)?;
            let response = match shared.handler.get() {
                Some(handler) => handler.on_file_request(peer, request).await,
                None => FileResponse::NotFound,
            };
            stream.write_message(&serialize(&response)?).await?;
            stream.close();
        }
        other => anyhow::bail!("negotiated unexpected protocol {other}"),
    }
    Ok(())
}

async fn identify_peer(connection: Connection, shared: Arc<SwarmShared>) {
    let peer = connection.peer();
    let exchange = async {
        let mut stream =
            open_protocol_stream(&connection, IDENTIFY_PROTOCOL, shared.config.negotiation_timeout).await?;
        stream.close();
        let bytes = stream
            .read_message(MAX_IDENTIFY_SIZE)
            .await?
            .context("stream closed before identify")?;
        let info: IdentifyInfo = deserialize_bounded(&bytes)?;
        anyhow::Ok(info)
    };
    let mut info = match tokio::time::timeout(shared.config.request_timeout, exchange).await {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            debug!(peer = %peer.short(), error = %e, "identify failed");
            return;
        }
        Err(_) => {
            debug!(peer = %peer.short(), "identify timed out");
            return;
        }
    };
    info.listen_addrs.truncate(MAX_ADVERTISED_ADDRS);
    info.protocols.truncate(MAX_IDENTIFY_PROTOCOLS);

    if let Some(observed) = &info.observed_addr {
        debug!(peer = %peer.short(), observed = %observed, "peer reports our address");
        shared.record_observed(observed.clone());
    }
    trace!(
        peer = %peer.short(),
        agent = %info.agent_version,
        addrs = info.listen_addrs.len(),
        "identified peer"
    );
    if shared.event_tx.send(SwarmEvent::Identified { peer, info }).await.is_err() {
        trace!("swarm event receiver dropped");
    }
}

/// Drain the connection's gossip queue over one long-lived stream, reopening
/// it once if a write fails.
async fn gossip_writer(connection: Connection, mut queue: mpsc::Receiver<GossipSubRequest>, timeout: Duration) {
    let peer = connection.peer();
    let mut stream: Option<Stream> = None;

    while let Some(message) = queue.recv().await {
        let bytes = match serialize(&message) {
            Ok(bytes) if bytes.len() <= MAX_GOSSIP_FRAME => bytes,
            Ok(bytes) => {
                debug!(peer = %peer.short(), size = bytes.len(), "gossip frame too large, dropped");
                continue;
            }
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "failed to encode gossip message");
                continue;
            }
        };

        let mut retried = false;
        loop {
            if stream.is_none() {
                match open_protocol_stream(&connection, GOSSIPSUB_PROTOCOL, timeout).await {
                    Ok(s) => stream = Some(s),
                    Err(e) => {
                        debug!(peer = %peer.short(), error = %e, "cannot open gossip stream");
                        if connection.is_closed() {
                            return;
                        }
                        break;
                    }
                }
            }
            let Some(s) = stream.as_mut() else {
                break;
            };
            match s.write_message(&bytes).await {
                Ok(()) => break,
                Err(e) => {
                    trace!(peer = %peer.short(), error = %e, "gossip stream write failed");
                    stream = None;
                    if retried || connection.is_closed() {
                        break;
                    }
                    retried = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::file_id;
    use crate::transport::{DEFAULT_DIAL_TIMEOUT, MemoryHub, MemoryTransport};

    const WAIT: Duration = Duration::from_secs(5);

    struct Recorder {
        gossip: mpsc::Sender<(PeerId, GossipSubRequest)>,
        file: Vec<u8>,
    }

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn on_gossip(&self, from: PeerId, message: GossipSubRequest) {
            let _ = self.gossip.send((from, message)).await;
        }

        async fn on_file_request(&self, _from: PeerId, request: FileRequest) -> FileResponse {
            let FileRequest::Get { file_id: wanted } = request;
            if wanted == file_id(&self.file) {
                FileResponse::Found { data: self.file.clone() }
            } else {
                FileResponse::NotFound
            }
        }
    }

    struct TestPeer {
        swarm: Swarm,
        events: mpsc::Receiver<SwarmEvent>,
        gossip: mpsc::Receiver<(PeerId, GossipSubRequest)>,
        addr: Multiaddr,
    }

    impl TestPeer {
        fn id(&self) -> PeerId {
            self.swarm.local_peer_id()
        }

        async fn next_event(&mut self, mut matches: impl FnMut(&SwarmEvent) -> bool) -> SwarmEvent {
            tokio::time::timeout(WAIT, async {
                loop {
                    let event = self.events.recv().await.expect("event channel open");
                    if matches(&event) {
                        return event;
                    }
                }
            })
            .await
            .expect("expected swarm event")
        }
    }

    async fn peer(hub: &Arc<MemoryHub>, file: &[u8]) -> TestPeer {
        let registry = TransportRegistry::new(DEFAULT_DIAL_TIMEOUT).with(MemoryTransport::new(hub.clone()));
        let (swarm, events) = Swarm::new(Keypair::generate(), registry, SwarmConfig::default());
        let (tx, gossip) = mpsc::channel(64);
        swarm.set_handler(Arc::new(Recorder {
            gossip: tx,
            file: file.to_vec(),
        }));
        let addr = swarm.listen(&Multiaddr::memory(0)).await.unwrap();
        TestPeer {
            swarm,
            events,
            gossip,
            addr,
        }
    }

    #[test]
    fn both_ends_keep_the_same_duplicate() {
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        let (small, large) = if a < b { (a, b) } else { (b, a) };

        // Connection dialed by `small`: outbound at small, inbound at large.
        // Connection dialed by `large`: inbound at small, outbound at large.
        assert!(keeps_new(Direction::Inbound, Direction::Outbound, small, large));
        assert!(!keeps_new(Direction::Outbound, Direction::Inbound, small, large));
        assert!(keeps_new(Direction::Outbound, Direction::Inbound, large, small));
        assert!(!keeps_new(Direction::Inbound, Direction::Outbound, large, small));
        assert!(!keeps_new(Direction::Outbound, Direction::Outbound, small, large));
    }

    #[tokio::test]
    async fn dial_connects_and_identifies() {
        let hub = MemoryHub::new();
        let mut a = peer(&hub, b"").await;
        let mut b = peer(&hub, b"").await;

        let dialed = b.swarm.dial(a.id(), vec![a.addr.clone()]).await.unwrap();
        assert_eq!(dialed.connection.peer(), a.id());
        assert!(dialed.failures.is_empty());

        let event = a.next_event(|e| matches!(e, SwarmEvent::Connected { .. })).await;
        assert!(matches!(event, SwarmEvent::Connected { peer, direction: Direction::Inbound, .. } if peer == b.id()));

        let event = b.next_event(|e| matches!(e, SwarmEvent::Identified { .. })).await;
        let SwarmEvent::Identified { peer, info } = event else { unreachable!() };
        assert_eq!(peer, a.id());
        assert_eq!(info.listen_addrs, vec![a.addr.clone()]);
        assert!(info.protocols.iter().any(|p| p == GOSSIPSUB_PROTOCOL));
        assert_eq!(info.agent_version, AGENT_VERSION);

        assert_eq!(a.swarm.connected_peers().await, vec![b.id()]);
        assert!(b.swarm.is_connected(&a.id()).await);
    }

    #[tokio::test]
    async fn connection_ids_are_numbered_per_swarm() {
        let hub = MemoryHub::new();
        let a = peer(&hub, b"").await;
        let b = peer(&hub, b"").await;
        let c = peer(&hub, b"").await;

        let from_b = b.swarm.dial(a.id(), vec![a.addr.clone()]).await.unwrap();
        let from_c = c.swarm.dial(a.id(), vec![a.addr.clone()]).await.unwrap();
        assert_eq!(from_b.connection.id(), 1);
        assert_eq!(from_c.connection.id(), 1);
    }

    #[tokio::test]
    async fn unreachable_address_is_recorded_but_reachable_wins() {
        let hub = MemoryHub::new();
        let a = peer(&hub, b"").await;
        let c = peer(&hub, b"").await;

        let unreachable = Multiaddr::memory(4242);
        let dialed = c
            .swarm
            .dial(a.id(), vec![unreachable.clone(), a.addr.clone()])
            .await
            .unwrap();
        assert_eq!(dialed.connection.peer(), a.id());
        assert_eq!(dialed.failures.len(), 1);
        assert_eq!(dialed.failures[0].0, unreachable);
    }

    #[tokio::test]
    async fn all_addresses_failing_reports_each() {
        let hub = MemoryHub::new();
        let c = peer(&hub, b"").await;
        let target = Keypair::generate().peer_id();
        let err = c
            .swarm
            .dial(target, vec![Multiaddr::memory(1), Multiaddr::memory(2)])
            .await
            .unwrap_err();
        assert_eq!(err.attempts().len(), 2);
        assert!(!c.swarm.is_connected(&target).await);
    }

    #[tokio::test]
    async fn self_and_addressless_dials_fail_fast() {
        let hub = MemoryHub::new();
        let a = peer(&hub, b"").await;
        assert_eq!(
            a.swarm.dial(a.id(), vec![a.addr.clone()]).await.unwrap_err(),
            DialError::SelfDial
        );
        let stranger = Keypair::generate().peer_id();
        assert_eq!(
            a.swarm.dial(stranger, vec![]).await.unwrap_err(),
            DialError::NoAddresses(stranger)
        );
    }

    #[tokio::test]
    async fn concurrent_dials_share_one_connection() {
        let hub = MemoryHub::new();
        let a = peer(&hub, b"").await;
        let b = peer(&hub, b"").await;

        let (first, second) = tokio::join!(
            b.swarm.dial(a.id(), vec![a.addr.clone()]),
            b.swarm.dial(a.id(), vec![a.addr.clone()]),
        );
        assert_eq!(first.unwrap().connection.id(), second.unwrap().connection.id());
        assert_eq!(b.swarm.connected_peers().await.len(), 1);
    }

    #[tokio::test]
    async fn simultaneous_dial_leaves_one_connection_per_side() {
        let hub = MemoryHub::new();
        let mut a = peer(&hub, b"").await;
        let mut b = peer(&hub, b"").await;

        let (ab, ba) = tokio::join!(
            a.swarm.dial(b.id(), vec![b.addr.clone()]),
            b.swarm.dial(a.id(), vec![a.addr.clone()]),
        );
        ab.unwrap();
        ba.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(a.swarm.connected_peers().await, vec![b.id()]);
        assert_eq!(b.swarm.connected_peers().await, vec![a.id()]);
        let ca = a.swarm.connection(&b.id()).await.unwrap();
        let cb = b.swarm.connection(&a.id()).await.unwrap();
        assert!(!ca.is_closed() && !cb.is_closed());
        assert_ne!(ca.direction(), cb.direction());

        // The surviving connection carries gossip both ways.
        let msg = GossipSubRequest::Subscribe { topic: "t".into() };
        a.swarm.send_gossipsub(&b.id(), msg.clone()).await.unwrap();
        b.swarm.send_gossipsub(&a.id(), msg.clone()).await.unwrap();
        let got_b = tokio::time::timeout(WAIT, b.gossip.recv()).await.unwrap().unwrap();
        let got_a = tokio::time::timeout(WAIT, a.gossip.recv()).await.unwrap().unwrap();
        assert_eq!(got_b, (a.id(), msg.clone()));
        assert_eq!(got_a, (b.id(), msg));
    }

    #[tokio::test]
    async fn gossip_frames_arrive_in_order() {
        let hub = MemoryHub::new();
        let a = peer(&hub, b"").await;
        let mut b = peer(&hub, b"").await;
        a.swarm.dial(b.id(), vec![b.addr.clone()]).await.unwrap();

        for i in 0..20 {
            a.swarm
                .send_gossipsub(&b.id(), GossipSubRequest::Graft { topic: format!("t{i}") })
                .await
                .unwrap();
        }
        for i in 0..20 {
            let (from, msg) = tokio::time::timeout(WAIT, b.gossip.recv()).await.unwrap().unwrap();
            assert_eq!(from, a.id());
            assert_eq!(msg, GossipSubRequest::Graft { topic: format!("t{i}") });
        }
    }

    #[tokio::test]
    async fn gossip_to_unknown_peer_fails() {
        let hub = MemoryHub::new();
        let a = peer(&hub, b"").await;
        let stranger = Keypair::generate().peer_id();
        assert!(
            a.swarm
                .send_gossipsub(&stranger, GossipSubRequest::Subscribe { topic: "t".into() })
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn disconnect_is_seen_by_both_sides() {
        let hub = MemoryHub::new();
        let mut a = peer(&hub, b"").await;
        let mut b = peer(&hub, b"").await;
        b.swarm.dial(a.id(), vec![a.addr.clone()]).await.unwrap();
        a.next_event(|e| matches!(e, SwarmEvent::Connected { .. })).await;

        b.swarm.disconnect(&a.id()).await;
        b.next_event(|e| matches!(e, SwarmEvent::Disconnected { .. })).await;
        a.next_event(|e| matches!(e, SwarmEvent::Disconnected { .. })).await;
        assert!(a.swarm.connected_peers().await.is_empty());
        assert!(b.swarm.connected_peers().await.is_empty());

        // Reconnecting creates a fresh connection.
        let again = b.swarm.dial(a.id(), vec![a.addr.clone()]).await.unwrap();
        assert!(!again.connection.is_closed());
    }

    #[tokio::test]
    async fn dial_addr_without_peer_suffix_learns_identity() {
        let hub = MemoryHub::new();
        let a = peer(&hub, b"").await;
        let b = peer(&hub, b"").await;
        let dialed = b.swarm.dial_addr(&a.addr).await.unwrap();
        assert_eq!(dialed.connection.peer(), a.id());

        let with_suffix = a.addr.with_p2p(a.id());
        let again = b.swarm.dial_addr(&with_suffix).await.unwrap();
        assert_eq!(again.connection.id(), dialed.connection.id());
    }

    #[tokio::test]
    async fn file_request_round_trip() {
        let hub = MemoryHub::new();
        let data = vec![7u8; 300_000];
        let a = peer(&hub, &data).await;
        let b = peer(&hub, b"").await;
        b.swarm.dial(a.id(), vec![a.addr.clone()]).await.unwrap();

        let found = b.swarm.request_file(&a.id(), &file_id(&data)).await.unwrap();
        assert_eq!(found, FileResponse::Found { data });
        let missing = b.swarm.request_file(&a.id(), &file_id(b"nope")).await.unwrap();
        assert_eq!(missing, FileResponse::NotFound);
    }

    #[tokio::test]
    async fn external_addresses_are_advertised_first() {
        let hub = MemoryHub::new();
        let a = peer(&hub, b"").await;
        let external: Multiaddr = "/ip4/203.0.113.9/tcp/9090".parse().unwrap();
        a.swarm.add_external_address(external.clone());
        a.swarm.add_external_address(external.clone());
        assert_eq!(a.swarm.advertised_addrs(), vec![external, a.addr.clone()]);
        assert!(is_unspecified(&"/ip4/0.0.0.0/tcp/1".parse().unwrap()));
    }
}
