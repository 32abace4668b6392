//! # High-Level Node API
//!
//! A [`Node`] combines the connection manager, the gossip overlay and peer
//! discovery into one handle, and layers chat rooms, signed peer records and
//! file sharing on top.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::start(Keypair::generate(), NodeConfig::default()).await?;
//! node.join_room("room1").await?;
//! node.send_chat("room1", "hello").await?;
//!
//! let mut events = node.events().await?;
//! while let Some(event) = events.recv().await {
//!     if let NodeEvent::Chat { message, .. } = event {
//!         println!("{}: {}", message.sender, message.text);
//!     }
//! }
//! ```
//!
//! ## Component Integration
//!
//! - **Swarm**: dials, accepts and deduplicates connections; dispatches streams
//! - **GossipSub**: topic meshes over the swarm's gossip streams
//! - **Discovery**: peer addresses, dial backoff and the maintenance tick
//!
//! Besides chat rooms every node joins two service topics:
//! [`PEER_DISCOVERY_TOPIC`] carries signed [`PeerRecord`]s and [`FILE_TOPIC`]
//! announces the ids of shared files.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::chat::{ChatMessage, MAX_CHAT_TEXT, room_for_topic, topic_for_room};
use crate::connection::Direction;
use crate::discovery::{AddressSource, Discovery, DiscoveryConfig, split_bootstrap};
use crate::gossipsub::{GossipSub, GossipSubConfig, PeerRequest, ReceivedMessage};
use crate::identity::{Keypair, PeerId};
use crate::messages::{
    FileRequest, FileResponse, GossipSubRequest, MAX_FILE_SIZE, MessageId, PeerRecord, deserialize_bounded, file_id,
    serialize,
};
use crate::multiaddr::{Host, Multiaddr};
use crate::protocols::InboundHandler;
use crate::swarm::{Swarm, SwarmConfig, SwarmEvent};
use crate::transport::{DEFAULT_DIAL_TIMEOUT, MemoryHub, MemoryTransport, QuicTransport, TcpTransport, TransportRegistry};

pub const FILE_TOPIC: &str = "universal-connectivity-file";

pub const PEER_DISCOVERY_TOPIC: &str = "universal-connectivity-browser-peer-discovery";

pub const DEFAULT_TCP_PORT: u16 = 9090;

pub const DEFAULT_QUIC_PORT: u16 = 9091;

/// How often the node republishes its signed peer record.
pub const DEFAULT_PEER_RECORD_INTERVAL: Duration = Duration::from_secs(30);

/// Files served at once. Sharing more fails until the node restarts.
pub const MAX_SHARED_FILES: usize = 64;

/// Minimum spacing between connection top-ups requested by the overlay.
const TOP_UP_INTERVAL: Duration = Duration::from_secs(5);

/// Node events buffered for a consumer that falls behind.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// A receiver that can be taken exactly once.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub listen_addrs: Vec<Multiaddr>,
    /// Addresses advertised in addition to the listen addresses.
    pub external_addrs: Vec<Multiaddr>,
    /// Public IP substituted into every listen address and advertised.
    pub external_ip: Option<IpAddr>,
    /// `/…/p2p/<peer>` addresses dialed at start. The peer suffix is
    /// optional.
    pub bootstrap: Vec<Multiaddr>,
    /// Sender name in outgoing chat messages. Defaults to the short peer id.
    pub nick: Option<String>,
    /// Enables the in-process transport when set.
    pub memory_hub: Option<Arc<MemoryHub>>,
    pub enable_tcp: bool,
    pub enable_quic: bool,
    pub dial_timeout: Duration,
    pub peer_record_interval: Duration,
    /// Capacity of the [`Node::events`] channel. Messages wait for room;
    /// connection events are dropped when it is full.
    pub event_buffer: usize,
    pub swarm: SwarmConfig,
    pub gossip: GossipSubConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![
                Multiaddr::tcp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_TCP_PORT))),
                Multiaddr::quic(SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_QUIC_PORT))),
            ],
            external_addrs: Vec::new(),
            external_ip: None,
            bootstrap: Vec::new(),
            nick: None,
            memory_hub: None,
            enable_tcp: true,
            enable_quic: true,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            peer_record_interval: DEFAULT_PEER_RECORD_INTERVAL,
            event_buffer: DEFAULT_EVENT_BUFFER,
            swarm: SwarmConfig::default(),
            gossip: GossipSubConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl NodeConfig {
    /// A node reachable only through `hub`, listening on a fresh memory port.
    pub fn memory(hub: Arc<MemoryHub>) -> Self {
        Self {
            listen_addrs: vec![Multiaddr::memory(0)],
            memory_hub: Some(hub),
            enable_tcp: false,
            enable_quic: false,
            ..Self::default()
        }
    }

    fn registry(&self, keypair: &Keypair) -> Result<TransportRegistry> {
        let mut registry = TransportRegistry::new(self.dial_timeout);
        if let Some(hub) = &self.memory_hub {
            registry.register(Arc::new(MemoryTransport::new(hub.clone())));
        }
        if self.enable_tcp {
            registry.register(Arc::new(TcpTransport::new()));
        }
        if self.enable_quic {
            let quic = QuicTransport::new(keypair).context("failed to set up QUIC transport")?;
            registry.register(Arc::new(quic));
        }
        Ok(registry)
    }
}

/// Something the node observed, in arrival order.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A chat message in a joined room.
    Chat {
        room: String,
        source: PeerId,
        message: ChatMessage,
    },
    /// A message on a subscribed topic that is not a chat room.
    Message(ReceivedMessage),
    FileAnnounced {
        source: PeerId,
        file_id: String,
    },
    /// A verified peer record arrived on the discovery topic.
    PeerRecord {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    },
    Connected {
        peer: PeerId,
        addr: Multiaddr,
        direction: Direction,
    },
    Disconnected {
        peer: PeerId,
        reason: String,
    },
}

#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub peer: PeerId,
    pub connected: usize,
    pub known_peers: usize,
    pub subscriptions: Vec<String>,
    pub listen_addrs: Vec<Multiaddr>,
    pub observed_addrs: Vec<Multiaddr>,
}

/// Blobs this node serves over the file exchange protocol.
#[derive(Default)]
struct SharedFiles {
    files: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl SharedFiles {
    fn insert(&self, data: Vec<u8>) -> Result<String> {
        let id = file_id(&data);
        let mut files = self.files.write();
        if !files.contains_key(&id) && files.len() >= MAX_SHARED_FILES {
            anyhow::bail!("already sharing {MAX_SHARED_FILES} files");
        }
        files.insert(id.clone(), Arc::new(data));
        Ok(id)
    }

    fn get(&self, id: &str) -> Option<Arc<Vec<u8>>> {
        self.files.read().get(id).cloned()
    }
}

/// Routes inbound stream traffic from the swarm to the overlay and the file
/// store.
struct NodeInbound {
    gossip: GossipSub<Swarm>,
    files: Arc<SharedFiles>,
}

#[async_trait]
impl InboundHandler for NodeInbound {
    async fn on_gossip(&self, from: PeerId, message: GossipSubRequest) {
        if let Err(e) = self.gossip.handle_message(&from, message).await {
            debug!(peer = %from.short(), error = %e, "gossip message not handled");
        }
    }

    async fn on_file_request(&self, from: PeerId, request: FileRequest) -> FileResponse {
        let FileRequest::Get { file_id } = request;
        match self.files.get(&file_id) {
            Some(data) => {
                debug!(peer = %from.short(), file_id = %file_id, size = data.len(), "serving file");
                FileResponse::Found { data: data.to_vec() }
            }
            None => {
                debug!(peer = %from.short(), file_id = %file_id, "requested file not shared");
                FileResponse::NotFound
            }
        }
    }
}

/// `bound` with its IP replaced by `ip`, for TCP and QUIC addresses.
fn with_external_ip(bound: &Multiaddr, ip: IpAddr) -> Option<Multiaddr> {
    let port = bound.socket_addr()?.port();
    let socket = SocketAddr::new(ip, port);
    match bound.transport_tag()? {
        "tcp" => Some(Multiaddr::tcp(socket)),
        "quic" => Some(Multiaddr::quic(socket)),
        _ => None,
    }
}

fn is_dialable(addr: &Multiaddr) -> bool {
    !matches!(addr.host(), Some(Host::Ip(ip)) if ip.is_unspecified())
}

pub struct Node {
    keypair: Keypair,
    nick: String,
    swarm: Swarm,
    gossip: GossipSub<Swarm>,
    discovery: Discovery,
    files: Arc<SharedFiles>,
    events: TakeOnce<NodeEvent>,
    driver: JoinHandle<()>,
}

impl Node {
    /// Listen on every configured address, join the service topics and dial
    /// the bootstrap peers. Bootstrap failures are logged, not returned.
    pub async fn start(keypair: Keypair, config: NodeConfig) -> Result<Self> {
        let local_peer = keypair.peer_id();
        let registry = config.registry(&keypair)?;
        let (swarm, swarm_events) = Swarm::new(keypair.clone(), registry, config.swarm.clone());

        let (peer_request_tx, peer_request_rx) = mpsc::channel(64);
        let (gossip, messages) = GossipSub::spawn(
            Arc::new(swarm.clone()),
            keypair.clone(),
            config.gossip.clone(),
            Some(peer_request_tx),
        );

        let files = Arc::new(SharedFiles::default());
        swarm.set_handler(Arc::new(NodeInbound {
            gossip: gossip.clone(),
            files: files.clone(),
        }));

        for addr in &config.listen_addrs {
            let bound = swarm
                .listen(addr)
                .await
                .with_context(|| format!("failed to listen on {addr}"))?;
            if let Some(ip) = config.external_ip
                && let Some(external) = with_external_ip(&bound, ip)
            {
                swarm.add_external_address(external);
            }
        }
        for addr in &config.external_addrs {
            swarm.add_external_address(addr.clone());
        }

        let (known, _) = split_bootstrap(&config.bootstrap);
        let discovery = Discovery::spawn(local_peer, config.discovery.clone(), known);

        gossip.subscribe(PEER_DISCOVERY_TOPIC).await?;
        gossip.subscribe(FILE_TOPIC).await?;

        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let driver = NodeDriver {
            keypair: keypair.clone(),
            local_peer,
            swarm: swarm.clone(),
            gossip: gossip.clone(),
            discovery: discovery.clone(),
            event_tx,
            dial_timeout: config.dial_timeout,
            target_connections: config.discovery.target_connections,
            last_top_up: None,
        };
        let driver = tokio::spawn(driver.run(
            swarm_events,
            messages,
            peer_request_rx,
            config.discovery.maintenance_interval,
            config.peer_record_interval,
        ));

        let node = Self {
            nick: config.nick.clone().unwrap_or_else(|| local_peer.short()),
            keypair,
            swarm,
            gossip,
            discovery,
            files,
            events: tokio::sync::Mutex::new(Some(event_rx)),
            driver,
        };
        info!(peer = %local_peer, nick = %node.nick, "node started");

        node.bootstrap(&config.bootstrap, config.discovery.bootstrap_timeout).await;
        Ok(node)
    }

    /// Dial every address concurrently, each bounded by `timeout`. Returns
    /// how many dials succeeded.
    pub async fn bootstrap(&self, addrs: &[Multiaddr], timeout: Duration) -> usize {
        if addrs.is_empty() {
            return 0;
        }
        let dials = addrs.iter().map(|addr| async move {
            match tokio::time::timeout(timeout, self.swarm.dial_addr(addr)).await {
                Ok(Ok(dialed)) => {
                    info!(peer = %dialed.connection.peer().short(), addr = %addr, "bootstrap peer connected");
                    true
                }
                Ok(Err(e)) => {
                    warn!(addr = %addr, error = %e, "bootstrap dial failed");
                    if let Some(peer) = addr.peer_id() {
                        self.discovery.report_dial_failure(peer).await;
                    }
                    false
                }
                Err(_) => {
                    warn!(addr = %addr, "bootstrap dial timed out");
                    if let Some(peer) = addr.peer_id() {
                        self.discovery.report_dial_failure(peer).await;
                    }
                    false
                }
            }
        });
        let connected = join_all(dials).await.into_iter().filter(|ok| *ok).count();
        info!(connected, attempted = addrs.len(), "bootstrap finished");
        connected
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.swarm.listen_addrs()
    }

    /// Advertised addresses with our `/p2p` suffix, ready to hand to another
    /// node's bootstrap list.
    pub fn addresses(&self) -> Vec<Multiaddr> {
        let peer = self.local_peer_id();
        self.swarm
            .advertised_addrs()
            .into_iter()
            .map(|a| a.with_p2p(peer))
            .collect()
    }

    /// Connect to `addr` and return the peer on the other end.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<PeerId> {
        match self.swarm.dial_addr(addr).await {
            Ok(dialed) => Ok(dialed.connection.peer()),
            Err(e) => {
                if let Some(peer) = addr.peer_id() {
                    self.discovery.report_dial_failure(peer).await;
                }
                Err(e).with_context(|| format!("failed to dial {addr}"))
            }
        }
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.swarm.connected_peers().await
    }

    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        self.swarm.is_connected(peer).await
    }

    pub async fn disconnect(&self, peer: &PeerId) {
        self.swarm.disconnect(peer).await;
    }

    // ------------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------------

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.gossip.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.gossip.unsubscribe(topic).await
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId> {
        self.gossip.publish(topic, data).await
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.gossip.subscriptions().await
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.gossip.mesh_peers(topic).await
    }

    pub async fn topic_peers(&self, topic: &str) -> Vec<PeerId> {
        self.gossip.topic_peers(topic).await
    }

    // ------------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------------

    /// Join a chat room and return its topic.
    pub async fn join_room(&self, room: &str) -> Result<String> {
        let topic = topic_for_room(room);
        self.gossip.subscribe(&topic).await?;
        Ok(topic)
    }

    pub async fn leave_room(&self, room: &str) -> Result<()> {
        self.gossip.unsubscribe(&topic_for_room(room)).await
    }

    pub async fn send_chat(&self, room: &str, text: &str) -> Result<MessageId> {
        if text.len() > MAX_CHAT_TEXT {
            anyhow::bail!("chat message too long: {} bytes (max {MAX_CHAT_TEXT})", text.len());
        }
        let payload = ChatMessage::new(self.nick.clone(), text).encode()?;
        self.gossip.publish(&topic_for_room(room), payload).await
    }

    // ------------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------------

    /// Serve `data` to peers and announce its id on [`FILE_TOPIC`].
    pub async fn share_file(&self, data: Vec<u8>) -> Result<String> {
        if data.len() > MAX_FILE_SIZE {
            anyhow::bail!("file too large: {} bytes (max {MAX_FILE_SIZE})", data.len());
        }
        let size = data.len();
        let id = self.files.insert(data)?;
        self.gossip.publish(FILE_TOPIC, id.clone().into_bytes()).await?;
        info!(file_id = %id, size, "sharing file");
        Ok(id)
    }

    /// Fetch a file from a connected peer and check it against its id.
    pub async fn fetch_file(&self, peer: &PeerId, id: &str) -> Result<Vec<u8>> {
        match self.swarm.request_file(peer, id).await? {
            FileResponse::Found { data } => {
                if file_id(&data) != id {
                    anyhow::bail!("file from {} does not match id {id}", peer.short());
                }
                debug!(peer = %peer.short(), file_id = %id, size = data.len(), "file fetched");
                Ok(data)
            }
            FileResponse::NotFound => anyhow::bail!("{} does not share file {id}", peer.short()),
        }
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Take the event stream. Only the first call succeeds.
    ///
    /// Received messages are never dropped for a slow reader; while the
    /// buffer is full, delivery of further messages waits.
    pub async fn events(&self) -> Result<mpsc::Receiver<NodeEvent>> {
        let mut guard = self.events.lock().await;
        guard.take().context("event receiver already taken")
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            peer: self.local_peer_id(),
            connected: self.swarm.connected_peers().await.len(),
            known_peers: self.discovery.known_peers().await,
            subscriptions: self.gossip.subscriptions().await,
            listen_addrs: self.swarm.listen_addrs(),
            observed_addrs: self.swarm.observed_addrs(),
        }
    }

    /// Current dial backoff for `peer`, if it is in one.
    pub async fn dial_backoff(&self, peer: &PeerId) -> Option<Duration> {
        self.discovery.backoff(peer).await
    }

    pub async fn shutdown(&self) {
        self.driver.abort();
        self.gossip.quit().await;
        self.discovery.quit().await;
        self.swarm.quit().await;
        info!(peer = %self.local_peer_id().short(), "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// ============================================================================
// Node driver (routes events between components)
// ============================================================================

struct NodeDriver {
    keypair: Keypair,
    local_peer: PeerId,
    swarm: Swarm,
    gossip: GossipSub<Swarm>,
    discovery: Discovery,
    event_tx: mpsc::Sender<NodeEvent>,
    dial_timeout: Duration,
    target_connections: usize,
    last_top_up: Option<Instant>,
}

impl NodeDriver {
    async fn run(
        mut self,
        mut swarm_events: mpsc::Receiver<SwarmEvent>,
        mut messages: mpsc::Receiver<ReceivedMessage>,
        mut peer_requests: mpsc::Receiver<PeerRequest>,
        maintenance_interval: Duration,
        record_interval: Duration,
    ) {
        let mut maintenance = tokio::time::interval_at(Instant::now() + maintenance_interval, maintenance_interval);
        let mut records = tokio::time::interval(record_interval);

        loop {
            tokio::select! {
                Some(event) = swarm_events.recv() => self.on_swarm_event(event).await,
                Some(message) = messages.recv() => self.on_message(message).await,
                Some(request) = peer_requests.recv() => self.on_peer_request(request).await,
                _ = maintenance.tick() => self.maintain().await,
                _ = records.tick() => self.publish_peer_record().await,
            }
        }
    }

    /// Hand over a received message, waiting while the consumer is behind.
    async fn deliver(&self, event: NodeEvent) {
        if self.event_tx.send(event).await.is_err() {
            trace!("node event receiver dropped");
        }
    }

    /// Connection events are advisory and dropped when the buffer is full.
    fn emit(&self, event: NodeEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            warn!(event = ?event, "node event buffer full, connection event dropped");
        }
    }

    async fn on_swarm_event(&mut self, event: SwarmEvent) {
        match event {
            SwarmEvent::Connected { peer, addr, direction } => {
                self.gossip.peer_connected(peer, direction == Direction::Outbound).await;
                // An inbound remote address is usually an ephemeral port.
                let dialable = (direction == Direction::Outbound).then(|| addr.clone());
                self.discovery.report_connected(peer, dialable).await;
                self.emit(NodeEvent::Connected { peer, addr, direction });
            }
            SwarmEvent::Disconnected { peer, reason } => {
                self.gossip.peer_disconnected(peer).await;
                self.discovery.report_disconnected(peer).await;
                self.emit(NodeEvent::Disconnected { peer, reason });
            }
            SwarmEvent::Identified { peer, info } => {
                let addrs: Vec<Multiaddr> = info.listen_addrs.into_iter().filter(is_dialable).collect();
                if !addrs.is_empty() {
                    self.discovery.add_addresses(peer, addrs, AddressSource::Identify).await;
                }
            }
        }
    }

    async fn on_message(&mut self, message: ReceivedMessage) {
        match message.topic.as_str() {
            PEER_DISCOVERY_TOPIC => self.on_peer_record(&message).await,
            FILE_TOPIC => {
                let Some(id) = std::str::from_utf8(&message.data)
                    .ok()
                    .map(str::trim)
                    .filter(|id| id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit()))
                else {
                    debug!(peer = %message.source.short(), "malformed file announcement");
                    return;
                };
                info!(peer = %message.source.short(), file_id = %id, "file announced");
                let event = NodeEvent::FileAnnounced {
                    source: message.source,
                    file_id: id.to_string(),
                };
                self.deliver(event).await;
            }
            _ => {
                let Some(room) = room_for_topic(&message.topic).map(str::to_string) else {
                    self.deliver(NodeEvent::Message(message)).await;
                    return;
                };
                match ChatMessage::decode(&message.data, &message.source) {
                    Some(chat) => {
                        debug!(room = %room, peer = %message.source.short(), sender = %chat.sender, "chat message");
                        self.deliver(NodeEvent::Chat {
                            room,
                            source: message.source,
                            message: chat,
                        })
                        .await;
                    }
                    None => debug!(room = %room, peer = %message.source.short(), "undecodable chat payload"),
                }
            }
        }
    }

    async fn on_peer_record(&mut self, message: &ReceivedMessage) {
        let record: PeerRecord = match deserialize_bounded(&message.data) {
            Ok(record) => record,
            Err(e) => {
                debug!(peer = %message.source.short(), error = %e, "malformed peer record");
                return;
            }
        };
        if record.peer != message.source {
            debug!(peer = %message.source.short(), record = %record.peer.short(), "peer record for another peer");
            return;
        }
        if let Err(e) = record.verify() {
            debug!(peer = %record.peer.short(), error = %e, "peer record signature invalid");
            return;
        }
        if record.peer == self.local_peer {
            return;
        }
        let addrs: Vec<Multiaddr> = record.addrs.into_iter().filter(is_dialable).collect();
        trace!(peer = %record.peer.short(), addrs = addrs.len(), "peer record");
        self.discovery
            .add_addresses(record.peer, addrs.clone(), AddressSource::PeerRecord)
            .await;
        self.deliver(NodeEvent::PeerRecord {
            peer: record.peer,
            addrs,
        })
        .await;
    }

    async fn on_peer_request(&mut self, request: PeerRequest) {
        match request {
            PeerRequest::MorePeers { topic, wanted } => {
                if self.last_top_up.is_some_and(|t| t.elapsed() < TOP_UP_INTERVAL) {
                    return;
                }
                self.last_top_up = Some(Instant::now());
                trace!(topic = %topic, wanted, "overlay wants more peers");
                self.dial_candidates(wanted).await;
            }
            PeerRequest::Exchange { topic, peers } => {
                for peer in peers {
                    if peer == self.local_peer || self.swarm.is_connected(&peer).await {
                        continue;
                    }
                    let addrs = self.discovery.resolve(&peer).await;
                    if addrs.is_empty() {
                        trace!(topic = %topic, peer = %peer.short(), "exchanged peer has no known address");
                        continue;
                    }
                    self.spawn_dial(peer, addrs);
                }
            }
        }
    }

    /// Periodic check: dial candidates while under the connection target.
    async fn maintain(&mut self) {
        let connected = self.swarm.connected_peers().await.len();
        let known = self.discovery.known_peers().await;
        debug!(connected, known, target = self.target_connections, "maintenance tick");
        if connected < self.target_connections {
            self.dial_candidates(self.target_connections - connected).await;
        }
    }

    async fn dial_candidates(&self, count: usize) {
        for peer in self.discovery.candidates(count).await {
            let addrs = self.discovery.resolve(&peer).await;
            if !addrs.is_empty() {
                self.spawn_dial(peer, addrs);
            }
        }
    }

    fn spawn_dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        let swarm = self.swarm.clone();
        let discovery = self.discovery.clone();
        let timeout = self.dial_timeout;
        tokio::spawn(async move {
            let error = match tokio::time::timeout(timeout, swarm.dial(peer, addrs)).await {
                Ok(Ok(_)) => return,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "timed out".to_string(),
            };
            let backoff = discovery.report_dial_failure(peer).await;
            debug!(peer = %peer.short(), error = %error, backoff = ?backoff, "dial failed");
        });
    }

    async fn publish_peer_record(&mut self) {
        let addrs = self.swarm.advertised_addrs();
        if addrs.is_empty() {
            return;
        }
        let record = PeerRecord::new_signed(&self.keypair, addrs);
        let bytes = match serialize(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode peer record");
                return;
            }
        };
        if let Err(e) = self.gossip.publish(PEER_DISCOVERY_TOPIC, bytes).await {
            debug!(error = %e, "failed to publish peer record");
        }
    }
}
