//! # Peer Discovery
//!
//! Address book mapping [`PeerId`] to the multiaddresses it may be reached
//! at, seeded from the bootstrap list and enriched by connections, identify
//! exchanges, signed peer records and gossip peer exchange.
//!
//! The book is owned by an actor; [`Discovery`] is a cheap handle.
//!
//! ## Dial Backoff
//!
//! Every failed dial doubles the peer's backoff, starting at
//! [`DEFAULT_INITIAL_BACKOFF`] and capped at [`DEFAULT_MAX_BACKOFF`]. A
//! successful connection resets it. Peers in backoff are never offered as
//! candidates, so one unreachable bootstrap entry never stalls discovery.
//!
//! ## Bounds
//!
//! | Table | Bound | Eviction |
//! |-------|-------|----------|
//! | Known peers | `max_peers` | least recently touched |
//! | Addresses per peer | `max_addrs_per_peer` | oldest address |

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Interval of the node's connectivity maintenance tick.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15);

/// Connections the maintenance tick tries to keep open.
pub const DEFAULT_TARGET_CONNECTIONS: usize = 8;

/// Bound on each bootstrap dial.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_MAX_PEERS: usize = 10_000;

pub const DEFAULT_MAX_ADDRS_PER_PEER: usize = 8;

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub maintenance_interval: Duration,
    pub target_connections: usize,
    pub bootstrap_timeout: Duration,
    pub max_peers: usize,
    pub max_addrs_per_peer: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            target_connections: DEFAULT_TARGET_CONNECTIONS,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            max_peers: DEFAULT_MAX_PEERS,
            max_addrs_per_peer: DEFAULT_MAX_ADDRS_PER_PEER,
        }
    }
}

/// Where an address was learned. Logged only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSource {
    Bootstrap,
    Connection,
    Identify,
    PeerRecord,
    PeerExchange,
}

/// Split `/…/p2p/<peer>` bootstrap addresses into peer and dialable address.
/// Entries without a peer suffix are returned separately.
pub fn split_bootstrap(addrs: &[Multiaddr]) -> (Vec<(PeerId, Multiaddr)>, Vec<Multiaddr>) {
    let mut known = Vec::new();
    let mut anonymous = Vec::new();
    for addr in addrs {
        match addr.peer_id() {
            Some(peer) => known.push((peer, addr.without_p2p())),
            None => anonymous.push(addr.clone()),
        }
    }
    (known, anonymous)
}

#[derive(Debug, Clone)]
struct PeerEntry {
    /// Newest first.
    addrs: VecDeque<Multiaddr>,
    connected: bool,
    failures: u32,
    backoff_until: Option<Instant>,
    last_failure: Option<Instant>,
}

impl PeerEntry {
    fn new() -> Self {
        Self {
            addrs: VecDeque::new(),
            connected: false,
            failures: 0,
            backoff_until: None,
            last_failure: None,
        }
    }

    fn add_addr(&mut self, addr: Multiaddr, max: usize) -> bool {
        if let Some(pos) = self.addrs.iter().position(|a| *a == addr) {
            // Refresh: move to front.
            self.addrs.remove(pos);
            self.addrs.push_front(addr);
            return false;
        }
        self.addrs.push_front(addr);
        self.addrs.truncate(max.max(1));
        true
    }

    fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }
}

fn backoff_for(failures: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(20);
    initial.saturating_mul(1u32 << exponent).min(max)
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    AddAddresses {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        source: AddressSource,
    },
    Candidates(usize, oneshot::Sender<Vec<PeerId>>),
    Resolve(PeerId, oneshot::Sender<Vec<Multiaddr>>),
    Connected(PeerId, Option<Multiaddr>),
    Disconnected(PeerId),
    DialFailed(PeerId, oneshot::Sender<Duration>),
    Backoff(PeerId, oneshot::Sender<Option<Duration>>),
    KnownPeers(oneshot::Sender<usize>),
    ConnectedCount(oneshot::Sender<usize>),
    Quit,
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct Discovery {
    cmd_tx: mpsc::Sender<Command>,
}

impl Discovery {
    /// Spawn the discovery actor, seeded with `bootstrap` peers.
    pub fn spawn(local_peer: PeerId, config: DiscoveryConfig, bootstrap: Vec<(PeerId, Multiaddr)>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let mut actor = DiscoveryActor::new(local_peer, config);
        for (peer, addr) in bootstrap {
            actor.add_addresses(peer, vec![addr], AddressSource::Bootstrap);
        }
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow::anyhow!("Discovery actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("Discovery actor closed"))
    }

    pub async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>, source: AddressSource) {
        let _ = self.cmd_tx.send(Command::AddAddresses { peer, addrs, source }).await;
    }

    /// Up to `count` known peers worth dialing: not connected, not the local
    /// peer, not in backoff, with at least one address. Peers that never
    /// failed come first, then the least recently failed.
    pub async fn candidates(&self, count: usize) -> Vec<PeerId> {
        self.request(|tx| Command::Candidates(count, tx)).await.unwrap_or_default()
    }

    /// Known addresses for `peer`, newest first.
    pub async fn resolve(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.request(|tx| Command::Resolve(*peer, tx)).await.unwrap_or_default()
    }

    /// Record a live connection; `addr` is remembered if the peer dialed
    /// from a reachable address.
    pub async fn report_connected(&self, peer: PeerId, addr: Option<Multiaddr>) {
        let _ = self.cmd_tx.send(Command::Connected(peer, addr)).await;
    }

    pub async fn report_disconnected(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::Disconnected(peer)).await;
    }

    /// Record a failed dial and return the backoff now in force.
    pub async fn report_dial_failure(&self, peer: PeerId) -> Duration {
        self.request(|tx| Command::DialFailed(peer, tx)).await.unwrap_or_default()
    }

    /// Remaining backoff for `peer`, if any.
    pub async fn backoff(&self, peer: &PeerId) -> Option<Duration> {
        self.request(|tx| Command::Backoff(*peer, tx)).await.ok().flatten()
    }

    pub async fn known_peers(&self) -> usize {
        self.request(Command::KnownPeers).await.unwrap_or_default()
    }

    pub async fn connected_count(&self) -> usize {
        self.request(Command::ConnectedCount).await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Actor
// ============================================================================

struct DiscoveryActor {
    local_peer: PeerId,
    config: DiscoveryConfig,
    peers: LruCache<PeerId, PeerEntry>,
}

impl DiscoveryActor {
    fn new(local_peer: PeerId, config: DiscoveryConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_peers.max(1)).expect("peer table size clamped to non-zero");
        Self {
            local_peer,
            config,
            peers: LruCache::new(cap),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::AddAddresses { peer, addrs, source } => {
                    self.add_addresses(peer, addrs, source);
                }
                Command::Candidates(count, reply) => {
                    let _ = reply.send(self.candidates(count));
                }
                Command::Resolve(peer, reply) => {
                    let addrs = self
                        .peers
                        .peek(&peer)
                        .map(|e| e.addrs.iter().cloned().collect())
                        .unwrap_or_default();
                    let _ = reply.send(addrs);
                }
                Command::Connected(peer, addr) => self.connected(peer, addr),
                Command::Disconnected(peer) => {
                    if let Some(entry) = self.peers.peek_mut(&peer) {
                        entry.connected = false;
                    }
                }
                Command::DialFailed(peer, reply) => {
                    let _ = reply.send(self.dial_failed(peer));
                }
                Command::Backoff(peer, reply) => {
                    let now = Instant::now();
                    let remaining = self
                        .peers
                        .peek(&peer)
                        .and_then(|e| e.backoff_until)
                        .filter(|until| now < *until)
                        .map(|until| until - now);
                    let _ = reply.send(remaining);
                }
                Command::KnownPeers(reply) => {
                    let _ = reply.send(self.peers.len());
                }
                Command::ConnectedCount(reply) => {
                    let _ = reply.send(self.peers.iter().filter(|(_, e)| e.connected).count());
                }
                Command::Quit => {
                    debug!("Discovery actor quitting");
                    break;
                }
            }
        }
    }

    fn add_addresses(&mut self, peer: PeerId, addrs: Vec<Multiaddr>, source: AddressSource) {
        if peer == self.local_peer {
            return;
        }
        let max = self.config.max_addrs_per_peer;
        let entry = self.peers.get_or_insert_mut(peer, PeerEntry::new);
        let mut added = 0;
        for addr in addrs {
            // A /p2p suffix naming someone else is a lie; drop the address.
            if addr.peer_id().is_some_and(|p| p != peer) {
                continue;
            }
            if entry.add_addr(addr.without_p2p(), max) {
                added += 1;
            }
        }
        if added > 0 {
            trace!(peer = %peer.short(), added, ?source, "learned addresses");
        }
    }

    fn candidates(&self, count: usize) -> Vec<PeerId> {
        let now = Instant::now();
        let mut eligible: Vec<(PeerId, Option<Instant>)> = self
            .peers
            .iter()
            .filter(|(peer, e)| {
                **peer != self.local_peer && !e.connected && !e.addrs.is_empty() && !e.in_backoff(now)
            })
            .map(|(peer, e)| (*peer, e.last_failure))
            .collect();
        // None sorts before Some: peers that never failed first.
        eligible.sort_by_key(|(_, last_failure)| *last_failure);
        eligible.into_iter().take(count).map(|(peer, _)| peer).collect()
    }

    fn connected(&mut self, peer: PeerId, addr: Option<Multiaddr>) {
        if peer == self.local_peer {
            return;
        }
        let max = self.config.max_addrs_per_peer;
        let entry = self.peers.get_or_insert_mut(peer, PeerEntry::new);
        entry.connected = true;
        entry.failures = 0;
        entry.backoff_until = None;
        entry.last_failure = None;
        if let Some(addr) = addr {
            entry.add_addr(addr.without_p2p(), max);
        }
    }

    fn dial_failed(&mut self, peer: PeerId) -> Duration {
        let now = Instant::now();
        let (initial, max) = (self.config.initial_backoff, self.config.max_backoff);
        let entry = self.peers.get_or_insert_mut(peer, PeerEntry::new);
        entry.failures = entry.failures.saturating_add(1);
        let backoff = backoff_for(entry.failures, initial, max);
        entry.backoff_until = Some(now + backoff);
        entry.last_failure = Some(now);
        debug!(
            peer = %peer.short(),
            failures = entry.failures,
            backoff_secs = backoff.as_secs(),
            "dial failed, backing off"
        );
        backoff
    }
}
