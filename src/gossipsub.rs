//! # GossipSub Topic Overlay
//!
//! Topic-based publish/subscribe over a partial mesh, after GossipSub v1.1.
//!
//! ## Overview
//!
//! For every topic the node tracks:
//! - `subscribers`: connected peers that announced interest in the topic
//! - `mesh`: the subset that receives full messages eagerly (target `D`)
//! - `fanout`: peers used to publish to a topic the node has not joined
//!
//! Subscribers outside the mesh learn about recent messages through IHAVE
//! announcements sent on every heartbeat and pull them with IWANT.
//!
//! ## Receive Pipeline
//!
//! ```text
//! graylist → size → dedup → signature → rate limit → replay window
//!          → mark seen → deliver locally → forward to mesh (minus sender)
//! ```
//!
//! Duplicates never reach the actor: [`GossipSub::handle_message`] consults
//! the shared [`SeenCache`] on the caller's task, so a flood of copies costs
//! one hash lookup each.
//!
//! ## Topic Membership
//!
//! ```text
//! NotJoined ──subscribe──► Joining ──mesh ≥ D_low──► Meshed
//!     ▲                       │                         │
//!     └── next heartbeat ◄── Leaving ◄──unsubscribe─────┘
//! ```
//!
//! ## Security
//!
//! | Threat | Mitigation |
//! |--------|------------|
//! | Forged messages | Ed25519 signature over source, topic, seqno and data |
//! | Replay | Seen cache plus a per-source sequence window |
//! | Flooding | Per-peer and local rate limits, behaviour penalty, cooldown |
//! | Mesh takeover | D_out outbound quota, PRUNE backoff, score-based selection |
//! | Memory exhaustion | Every table is an LRU or has a hard cap |

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::crypto::{GOSSIPSUB_SIGNATURE_DOMAIN, SignatureError, sign_with_domain, verify_with_domain};
use crate::identity::{Keypair, PeerId};
use crate::messages::{GossipSubRequest, MessageId, message_id};
use crate::protocols::GossipSubRpc;

// ============================================================================
// Timing and Caches
// ============================================================================

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// How long an IWANT may stay unanswered before another advertiser is asked.
pub const DEFAULT_IHAVE_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 10_000;

pub const DEFAULT_MESSAGE_CACHE_TTL: Duration = Duration::from_secs(120);

/// Retention of accepted message ids for deduplication.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);

/// Fanout state for a topic is forgotten this long after our last publish.
pub const DEFAULT_FANOUT_TTL: Duration = Duration::from_secs(60);

/// Mesh exclusion for peers whose score fell below the publish threshold.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Heartbeat windows of message ids kept per topic.
pub const DEFAULT_HISTORY_LENGTH: usize = 5;

/// Windows advertised in IHAVE.
pub const DEFAULT_HISTORY_GOSSIP: usize = 3;

pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 100;

// ============================================================================
// Limits
// ============================================================================

pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Local publishes per second.
pub const DEFAULT_PUBLISH_RATE_LIMIT: usize = 100;

/// Accepted messages per second from any one peer.
pub const DEFAULT_PER_PEER_RATE_LIMIT: usize = 50;

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

pub const MAX_TOPIC_LENGTH: usize = 256;

/// SECURITY: caps the topic table against peers announcing junk topics.
pub const MAX_TOPICS: usize = 10_000;

pub const MAX_SUBSCRIPTIONS_PER_PEER: usize = 100;

pub const MAX_PEERS_PER_TOPIC: usize = 1000;

/// Messages returned for a single IWANT.
pub const DEFAULT_MAX_IWANT_MESSAGES: usize = 10;

/// IWANT requests served per peer per second.
pub const DEFAULT_IWANT_RATE_LIMIT: usize = 5;

pub const MAX_IWANT_RESPONSE_BYTES: usize = 256 * 1024;

pub const MAX_RATE_LIMIT_ENTRIES: usize = 10_000;

pub const MAX_SEQNO_TRACKING_SOURCES: usize = 10_000;

/// Out-of-order tolerance for sequence numbers from one source.
pub const SEQNO_WINDOW_SIZE: usize = 128;

pub const MAX_MESSAGE_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Hard cap on the seen cache, well above what the rate limits admit
/// within one TTL. Reaching it with no expired entries forgets the oldest
/// live ids; a forgotten id that arrives again is still caught by the
/// per-source seqno window unless it fell out of that too.
pub const MAX_SEEN_ENTRIES: usize = 200_000;

const MAX_PENDING_IWANTS: usize = 100;

const MAX_GLOBAL_PENDING_IWANTS: usize = 1000;

const MAX_IWANT_RETRY_PEERS: usize = 10;

const MAX_BACKOFF_ENTRIES: usize = 10_000;

const MAX_PX_PEERS: usize = 16;

// ============================================================================
// Scoring Defaults
// ============================================================================

/// Below this score, everything from the peer is ignored.
pub const DEFAULT_GRAYLIST_THRESHOLD: f64 = -100.0;

/// Below this score, the peer is not published to and enters cooldown.
pub const DEFAULT_PUBLISH_THRESHOLD: f64 = -50.0;

/// Below this score, no IHAVE/IWANT is exchanged with the peer.
pub const DEFAULT_GOSSIP_THRESHOLD: f64 = -25.0;

pub const DEFAULT_DECAY_TO_ZERO: f64 = 0.01;

pub const DEFAULT_BEHAVIOUR_PENALTY_DECAY: f64 = 0.99;

pub const DEFAULT_P1_WEIGHT: f64 = 1.0;
pub const DEFAULT_P2_WEIGHT: f64 = 1.0;
pub const DEFAULT_P3_WEIGHT: f64 = 0.0;
pub const DEFAULT_P3B_WEIGHT: f64 = 0.0;
pub const DEFAULT_P4_WEIGHT: f64 = -100.0;
pub const DEFAULT_P7_WEIGHT: f64 = -10.0;

pub const DEFAULT_TIME_IN_MESH_QUANTUM: Duration = Duration::from_millis(100);
pub const DEFAULT_TIME_IN_MESH_CAP: f64 = 3600.0;
pub const DEFAULT_FIRST_MESSAGE_DELIVERIES_CAP: f64 = 100.0;

pub const MAX_SCORED_PEERS: usize = 10_000;

// ============================================================================
// Mesh Defaults
// ============================================================================

/// Target mesh degree (D).
pub const DEFAULT_MESH_N: usize = 6;

/// GRAFT below this (D_low).
pub const DEFAULT_MESH_N_LOW: usize = 5;

/// PRUNE above this (D_high).
pub const DEFAULT_MESH_N_HIGH: usize = 12;

/// Minimum outbound mesh peers kept when pruning (D_out).
/// SECURITY: an attacker that floods us with inbound GRAFTs cannot displace
/// the peers we chose ourselves.
pub const DEFAULT_MESH_OUTBOUND_MIN: usize = 2;

/// Peers outside the mesh that receive IHAVE per topic per heartbeat.
pub const DEFAULT_GOSSIP_LAZY: usize = 6;

pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct GossipSubConfig {
    pub mesh_n: usize,
    pub mesh_n_low: usize,
    pub mesh_n_high: usize,
    pub mesh_outbound_min: usize,
    pub gossip_lazy: usize,
    pub prune_backoff: Duration,
    pub fanout_ttl: Duration,
    pub cooldown: Duration,
    pub heartbeat_interval: Duration,
    pub history_length: usize,
    pub history_gossip: usize,
    pub ihave_timeout: Duration,
    pub message_cache_size: usize,
    pub message_cache_ttl: Duration,
    pub seen_ttl: Duration,
    pub max_message_size: usize,
    pub max_ihave_length: usize,
    pub max_iwant_messages: usize,
    pub iwant_rate_limit: usize,
    pub publish_rate_limit: usize,
    pub per_peer_rate_limit: usize,
    /// Publish own messages to every subscriber above the publish threshold,
    /// not just the mesh.
    pub flood_publish: bool,
    pub graylist_threshold: f64,
    pub publish_threshold: f64,
    pub gossip_threshold: f64,
    pub decay_to_zero: f64,
    pub behaviour_penalty_decay: f64,
    /// Applied to every topic.
    pub topic_score_params: TopicScoreParams,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            mesh_outbound_min: DEFAULT_MESH_OUTBOUND_MIN,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            fanout_ttl: DEFAULT_FANOUT_TTL,
            cooldown: DEFAULT_COOLDOWN,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            history_length: DEFAULT_HISTORY_LENGTH,
            history_gossip: DEFAULT_HISTORY_GOSSIP,
            ihave_timeout: DEFAULT_IHAVE_TIMEOUT,
            message_cache_size: DEFAULT_MESSAGE_CACHE_SIZE,
            message_cache_ttl: DEFAULT_MESSAGE_CACHE_TTL,
            seen_ttl: DEFAULT_SEEN_TTL,
            max_message_size: MAX_MESSAGE_SIZE,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            max_iwant_messages: DEFAULT_MAX_IWANT_MESSAGES,
            iwant_rate_limit: DEFAULT_IWANT_RATE_LIMIT,
            publish_rate_limit: DEFAULT_PUBLISH_RATE_LIMIT,
            per_peer_rate_limit: DEFAULT_PER_PEER_RATE_LIMIT,
            flood_publish: true,
            graylist_threshold: DEFAULT_GRAYLIST_THRESHOLD,
            publish_threshold: DEFAULT_PUBLISH_THRESHOLD,
            gossip_threshold: DEFAULT_GOSSIP_THRESHOLD,
            decay_to_zero: DEFAULT_DECAY_TO_ZERO,
            behaviour_penalty_decay: DEFAULT_BEHAVIOUR_PENALTY_DECAY,
            topic_score_params: TopicScoreParams::default(),
        }
    }
}

// ============================================================================
// Peer Scoring
// ============================================================================

#[derive(Clone, Debug)]
pub struct TopicScoreParams {
    pub topic_weight: f64,

    // P1: time in mesh
    pub time_in_mesh_weight: f64,
    pub time_in_mesh_quantum: Duration,
    pub time_in_mesh_cap: f64,

    // P2: first message deliveries
    pub first_message_deliveries_weight: f64,
    pub first_message_deliveries_decay: f64,
    pub first_message_deliveries_cap: f64,

    // P3: mesh message delivery deficit (0 weight disables)
    pub mesh_message_deliveries_weight: f64,
    pub mesh_message_deliveries_decay: f64,
    pub mesh_message_deliveries_threshold: f64,
    pub mesh_message_deliveries_activation: Duration,

    // P3b: deficit carried over when a peer leaves the mesh
    pub mesh_failure_penalty_weight: f64,
    pub mesh_failure_penalty_decay: f64,

    // P4: invalid messages
    pub invalid_message_deliveries_weight: f64,
    pub invalid_message_deliveries_decay: f64,
}

impl Default for TopicScoreParams {
    fn default() -> Self {
        Self {
            topic_weight: 1.0,
            time_in_mesh_weight: DEFAULT_P1_WEIGHT,
            time_in_mesh_quantum: DEFAULT_TIME_IN_MESH_QUANTUM,
            time_in_mesh_cap: DEFAULT_TIME_IN_MESH_CAP,
            first_message_deliveries_weight: DEFAULT_P2_WEIGHT,
            first_message_deliveries_decay: 0.5,
            first_message_deliveries_cap: DEFAULT_FIRST_MESSAGE_DELIVERIES_CAP,
            mesh_message_deliveries_weight: DEFAULT_P3_WEIGHT,
            mesh_message_deliveries_decay: 0.5,
            mesh_message_deliveries_threshold: 1.0,
            mesh_message_deliveries_activation: Duration::from_secs(60),
            mesh_failure_penalty_weight: DEFAULT_P3B_WEIGHT,
            mesh_failure_penalty_decay: 0.5,
            invalid_message_deliveries_weight: DEFAULT_P4_WEIGHT,
            invalid_message_deliveries_decay: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TopicScore {
    mesh_time: Option<Instant>,
    first_message_deliveries: f64,
    mesh_message_deliveries: f64,
    mesh_failure_penalty: f64,
    invalid_message_deliveries: f64,
}

impl TopicScore {
    fn calculate(&self, params: &TopicScoreParams) -> f64 {
        let mut score = 0.0;

        if let Some(mesh_time) = self.mesh_time {
            let quanta = mesh_time.elapsed().as_secs_f64() / params.time_in_mesh_quantum.as_secs_f64();
            score += params.time_in_mesh_weight * quanta.min(params.time_in_mesh_cap);
        }

        score += params.first_message_deliveries_weight
            * self.first_message_deliveries.min(params.first_message_deliveries_cap);

        if let Some(mesh_time) = self.mesh_time
            && mesh_time.elapsed() >= params.mesh_message_deliveries_activation
        {
            let deficit = params.mesh_message_deliveries_threshold - self.mesh_message_deliveries;
            if deficit > 0.0 {
                score += params.mesh_message_deliveries_weight * deficit * deficit;
            }
        }

        score += params.mesh_failure_penalty_weight * self.mesh_failure_penalty;

        score += params.invalid_message_deliveries_weight
            * self.invalid_message_deliveries
            * self.invalid_message_deliveries;

        params.topic_weight * score
    }

    fn decay(&mut self, params: &TopicScoreParams, decay_to_zero: f64) {
        let decay = |v: &mut f64, factor: f64| {
            *v *= factor;
            if v.abs() < decay_to_zero {
                *v = 0.0;
            }
        };
        decay(&mut self.first_message_deliveries, params.first_message_deliveries_decay);
        decay(&mut self.mesh_message_deliveries, params.mesh_message_deliveries_decay);
        decay(&mut self.mesh_failure_penalty, params.mesh_failure_penalty_decay);
        decay(&mut self.invalid_message_deliveries, params.invalid_message_deliveries_decay);
    }

    fn is_empty(&self) -> bool {
        self.mesh_time.is_none()
            && self.first_message_deliveries == 0.0
            && self.mesh_message_deliveries == 0.0
            && self.mesh_failure_penalty == 0.0
            && self.invalid_message_deliveries == 0.0
    }
}

/// Score state for one peer: per-topic components plus the P7 behaviour
/// penalty.
#[derive(Debug, Clone, Default)]
struct PeerScore {
    topic_scores: HashMap<String, TopicScore>,
    behaviour_penalty: f64,
}

impl PeerScore {
    fn calculate(&self, params: &TopicScoreParams) -> f64 {
        let topics: f64 = self.topic_scores.values().map(|t| t.calculate(params)).sum();
        topics + DEFAULT_P7_WEIGHT * self.behaviour_penalty * self.behaviour_penalty
    }

    fn decay(&mut self, params: &TopicScoreParams, behaviour_decay: f64, decay_to_zero: f64) {
        for topic_score in self.topic_scores.values_mut() {
            topic_score.decay(params, decay_to_zero);
        }
        self.topic_scores.retain(|_, t| !t.is_empty());

        self.behaviour_penalty *= behaviour_decay;
        if self.behaviour_penalty.abs() < decay_to_zero {
            self.behaviour_penalty = 0.0;
        }
    }

    fn mesh_joined(&mut self, topic: &str) {
        self.topic_scores.entry(topic.to_string()).or_default().mesh_time = Some(Instant::now());
    }

    fn mesh_left(&mut self, topic: &str, params: &TopicScoreParams) {
        if let Some(topic_score) = self.topic_scores.get_mut(topic) {
            if let Some(mesh_time) = topic_score.mesh_time
                && mesh_time.elapsed() >= params.mesh_message_deliveries_activation
            {
                let deficit =
                    params.mesh_message_deliveries_threshold - topic_score.mesh_message_deliveries;
                if deficit > 0.0 {
                    topic_score.mesh_failure_penalty += deficit * deficit;
                }
            }
            topic_score.mesh_time = None;
            topic_score.mesh_message_deliveries = 0.0;
        }
    }

    fn first_message_delivered(&mut self, topic: &str) {
        self.topic_scores.entry(topic.to_string()).or_default().first_message_deliveries += 1.0;
    }

    fn mesh_message_delivered(&mut self, topic: &str) {
        if let Some(topic_score) = self.topic_scores.get_mut(topic)
            && topic_score.mesh_time.is_some()
        {
            topic_score.mesh_message_deliveries += 1.0;
        }
    }

    fn invalid_message(&mut self, topic: &str) {
        self.topic_scores.entry(topic.to_string()).or_default().invalid_message_deliveries += 1.0;
    }

    fn add_behaviour_penalty(&mut self, penalty: f64) {
        self.behaviour_penalty += penalty;
    }
}

// ============================================================================
// Message Signing
// ============================================================================

/// Format: source(32) || topic_len(4, LE) || topic || seqno(8, LE) || data_len(4, LE) || data
pub(crate) fn signed_payload(source: &PeerId, topic: &str, seqno: u64, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + 4 + topic.len() + 8 + 4 + data.len());
    payload.extend_from_slice(source.as_bytes());
    payload.extend_from_slice(&(topic.len() as u32).to_le_bytes());
    payload.extend_from_slice(topic.as_bytes());
    payload.extend_from_slice(&seqno.to_le_bytes());
    payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
    payload.extend_from_slice(data);
    payload
}

pub(crate) fn sign_message(keypair: &Keypair, topic: &str, seqno: u64, data: &[u8]) -> Vec<u8> {
    let payload = signed_payload(&keypair.peer_id(), topic, seqno, data);
    sign_with_domain(keypair, GOSSIPSUB_SIGNATURE_DOMAIN, &payload)
}

fn verify_message(
    source: &PeerId,
    topic: &str,
    seqno: u64,
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let payload = signed_payload(source, topic, seqno, data);
    verify_with_domain(source, GOSSIPSUB_SIGNATURE_DOMAIN, &payload, signature)
}

/// Sequence numbers start at the wall clock in nanoseconds so a restarted
/// node is not mistaken for a replay of its previous run.
fn initial_seqno() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

// ============================================================================
// Seen Cache
// ============================================================================

/// Ids of accepted messages, retained for a TTL.
///
/// Shared between the actor (the only writer) and the inbound stream tasks,
/// which use it to drop duplicates before they are queued for the actor.
#[derive(Clone)]
pub struct SeenCache {
    inner: Arc<Mutex<SeenInner>>,
    ttl: Duration,
}

struct SeenInner {
    ids: HashSet<MessageId>,
    order: VecDeque<(Instant, MessageId)>,
    capacity: usize,
    live_evictions: u64,
}

impl SeenInner {
    fn expire(&mut self, ttl: Duration, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((at, id)) = self.order.front().copied() {
            if now.duration_since(at) < ttl {
                break;
            }
            self.order.pop_front();
            self.ids.remove(&id);
            removed += 1;
        }
        removed
    }
}

impl SeenCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SeenInner {
                ids: HashSet::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
                live_evictions: 0,
            })),
            ttl,
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.inner.lock().ids.contains(id)
    }

    /// Record `id`. Returns false if it was already present.
    ///
    /// At capacity, expired entries are dropped first. Only when every entry
    /// is still within the TTL is the oldest live id evicted.
    pub fn insert(&self, id: MessageId) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.ids.contains(&id) {
            return false;
        }
        if inner.ids.len() >= inner.capacity {
            inner.expire(self.ttl, now);
        }
        while inner.ids.len() >= inner.capacity {
            let Some((_, oldest)) = inner.order.pop_front() else {
                break;
            };
            inner.ids.remove(&oldest);
            inner.live_evictions += 1;
            if inner.live_evictions.is_power_of_two() {
                warn!(
                    evicted = inner.live_evictions,
                    capacity = inner.capacity,
                    "seen cache full, evicting ids before their TTL"
                );
            }
        }
        inner.ids.insert(id);
        inner.order.push_back((now, id));
        true
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn expire(&self) -> usize {
        self.inner.lock().expire(self.ttl, Instant::now())
    }

    /// Ids evicted while still within the TTL because the cache was full.
    pub fn live_evictions(&self) -> u64 {
        self.inner.lock().live_evictions
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Per-Topic and Per-Peer State
// ============================================================================

#[derive(Clone, Debug, Default)]
struct SeqnoTracker {
    highest_seen: u64,
    recent_seqnos: VecDeque<u64>,
}

impl SeqnoTracker {
    fn check_and_record(&mut self, seqno: u64) -> bool {
        if seqno > self.highest_seen {
            self.highest_seen = seqno;
            self.record_recent(seqno);
            return true;
        }

        if self.recent_seqnos.contains(&seqno) {
            return false;
        }

        if seqno.saturating_add(SEQNO_WINDOW_SIZE as u64) >= self.highest_seen {
            self.record_recent(seqno);
            return true;
        }

        false
    }

    fn record_recent(&mut self, seqno: u64) {
        if self.recent_seqnos.len() >= SEQNO_WINDOW_SIZE {
            self.recent_seqnos.pop_front();
        }
        self.recent_seqnos.push_back(seqno);
    }
}

#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub topic: String,
    pub source: PeerId,
    pub seqno: u64,
    pub data: Vec<u8>,
    pub msg_id: MessageId,
    /// The peer that handed us this copy.
    pub propagation_source: PeerId,
    pub received_at: Instant,
}

#[derive(Clone)]
struct CachedMessage {
    topic: String,
    source: PeerId,
    seqno: u64,
    data: Vec<u8>,
    signature: Vec<u8>,
    cached_at: Instant,
}

impl CachedMessage {
    fn size_bytes(&self) -> usize {
        self.topic.len() + self.data.len() + self.signature.len() + 64
    }

    fn to_request(&self) -> GossipSubRequest {
        GossipSubRequest::Publish {
            topic: self.topic.clone(),
            source: self.source,
            seqno: self.seqno,
            data: self.data.clone(),
            signature: self.signature.clone(),
        }
    }
}

/// An IWANT awaiting its message.
#[derive(Debug, Clone)]
struct PendingIWant {
    requested_at: Instant,
    /// Bounded by MAX_IWANT_RETRY_PEERS.
    tried_peers: Vec<PeerId>,
    /// Peers that announced the id but have not been asked yet.
    advertisers: Vec<PeerId>,
}

impl PendingIWant {
    fn new(peer: PeerId) -> Self {
        Self {
            requested_at: Instant::now(),
            tried_peers: vec![peer],
            advertisers: Vec::new(),
        }
    }

    fn add_advertiser(&mut self, peer: PeerId) {
        if self.tried_peers.contains(&peer) || self.advertisers.contains(&peer) {
            return;
        }
        if self.tried_peers.len() + self.advertisers.len() < MAX_IWANT_RETRY_PEERS {
            self.advertisers.push(peer);
        }
    }

    /// Next advertiser to ask, if any remain.
    fn next_peer(&mut self) -> Option<PeerId> {
        if self.advertisers.is_empty() {
            return None;
        }
        let peer = self.advertisers.remove(0);
        self.tried_peers.push(peer);
        self.requested_at = Instant::now();
        Some(peer)
    }
}

/// Our relationship with a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    NotJoined,
    /// Subscribed; the mesh has not yet reached D_low.
    Joining,
    Meshed,
    /// Unsubscribed; becomes NotJoined on the next heartbeat.
    Leaving,
}

impl Membership {
    pub fn is_joined(self) -> bool {
        matches!(self, Membership::Joining | Membership::Meshed)
    }
}

struct TopicState {
    membership: Membership,
    subscribers: HashSet<PeerId>,
    mesh: HashSet<PeerId>,
    /// Mesh peers we grafted ourselves.
    outbound: HashSet<PeerId>,
    fanout: HashSet<PeerId>,
    fanout_last_published: Option<Instant>,
    /// Message ids per heartbeat window, newest first.
    history: VecDeque<Vec<MessageId>>,
    /// SECURITY: bounded by MAX_PENDING_IWANTS.
    pending_iwants: LruCache<MessageId, PendingIWant>,
}

impl TopicState {
    fn new() -> Self {
        let mut history = VecDeque::new();
        history.push_front(Vec::new());
        Self {
            membership: Membership::NotJoined,
            subscribers: HashSet::new(),
            mesh: HashSet::new(),
            outbound: HashSet::new(),
            fanout: HashSet::new(),
            fanout_last_published: None,
            history,
            pending_iwants: LruCache::new(
                NonZeroUsize::new(MAX_PENDING_IWANTS).expect("MAX_PENDING_IWANTS must be non-zero"),
            ),
        }
    }

    fn remove_peer(&mut self, peer: &PeerId) -> bool {
        self.subscribers.remove(peer);
        self.fanout.remove(peer);
        self.outbound.remove(peer);
        self.mesh.remove(peer)
    }

    fn outbound_mesh_count(&self) -> usize {
        self.mesh.iter().filter(|p| self.outbound.contains(p)).count()
    }

    fn record_history(&mut self, id: MessageId) {
        if let Some(window) = self.history.front_mut() {
            window.push(id);
        }
    }

    fn shift_history(&mut self, length: usize) {
        self.history.push_front(Vec::new());
        self.history.truncate(length.max(1));
    }

    fn gossip_ids(&self, windows: usize, max: usize) -> Vec<MessageId> {
        self.history
            .iter()
            .take(windows)
            .flatten()
            .take(max)
            .copied()
            .collect()
    }

    /// Returns true if this is a new request that should be sent to `peer`.
    fn record_iwant(&mut self, msg_id: MessageId, peer: PeerId) -> bool {
        if let Some(pending) = self.pending_iwants.get_mut(&msg_id) {
            pending.add_advertiser(peer);
            return false;
        }
        self.pending_iwants.put(msg_id, PendingIWant::new(peer));
        true
    }

    fn message_received(&mut self, msg_id: &MessageId) {
        self.pending_iwants.pop(msg_id);
    }

    /// Timed-out requests, each paired with the next advertiser to try.
    /// Requests with no advertiser left are dropped.
    fn check_iwant_timeouts(&mut self, timeout: Duration) -> Vec<(MessageId, PeerId)> {
        let now = Instant::now();
        let expired: Vec<MessageId> = self
            .pending_iwants
            .iter()
            .filter(|(_, p)| now.duration_since(p.requested_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut retries = Vec::new();
        for id in expired {
            let next = self.pending_iwants.get_mut(&id).and_then(|p| p.next_peer());
            match next {
                Some(peer) => retries.push((id, peer)),
                None => {
                    self.pending_iwants.pop(&id);
                }
            }
        }
        retries
    }

    fn is_idle(&self) -> bool {
        self.membership == Membership::NotJoined
            && self.subscribers.is_empty()
            && self.fanout.is_empty()
    }
}

#[derive(Debug, Default)]
struct PeerRateLimit {
    publish_times: VecDeque<Instant>,
    iwant_times: VecDeque<Instant>,
}

impl PeerRateLimit {
    /// Returns true when the peer has exceeded `max_rate` messages in the window.
    fn check_and_record(&mut self, max_rate: usize) -> bool {
        window_exceeded(&mut self.publish_times, max_rate)
    }

    fn check_and_record_iwant(&mut self, max_rate: usize) -> bool {
        window_exceeded(&mut self.iwant_times, max_rate)
    }
}

fn window_exceeded(times: &mut VecDeque<Instant>, max_rate: usize) -> bool {
    let now = Instant::now();
    while let Some(front) = times.front() {
        if now.duration_since(*front) >= RATE_LIMIT_WINDOW {
            times.pop_front();
        } else {
            break;
        }
    }
    if times.len() >= max_rate {
        return true;
    }
    times.push_back(now);
    false
}

#[derive(Debug, Default)]
struct PeerInfo {
    outbound: bool,
    topics: HashSet<String>,
}

/// Why a message was refused, either for local publication or on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRejection {
    MessageTooLarge,
    TopicTooLong,
    /// Empty, or contains control characters.
    InvalidTopic,
    /// Local publish rate limit exceeded.
    RateLimited,
    /// The sending peer is graylisted.
    Graylisted,
    SignatureInvalid(SignatureError),
    /// The sending peer exceeded its per-peer rate.
    RateExceeded,
    /// Sequence number outside the source's replay window.
    Replay,
}

impl std::fmt::Display for MessageRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge => write!(f, "message size exceeds maximum allowed"),
            Self::TopicTooLong => write!(f, "topic name exceeds maximum length"),
            Self::InvalidTopic => write!(f, "topic name is empty or contains control characters"),
            Self::RateLimited => write!(f, "local publish rate limit exceeded"),
            Self::Graylisted => write!(f, "sender is graylisted"),
            Self::SignatureInvalid(e) => write!(f, "invalid signature: {e}"),
            Self::RateExceeded => write!(f, "sender exceeded its message rate"),
            Self::Replay => write!(f, "sequence number outside replay window"),
        }
    }
}

impl std::error::Error for MessageRejection {}

fn validate_topic(topic: &str) -> Result<(), MessageRejection> {
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(MessageRejection::TopicTooLong);
    }
    if topic.is_empty() || topic.chars().any(char::is_control) {
        return Err(MessageRejection::InvalidTopic);
    }
    Ok(())
}

/// Requests from the overlay to whoever manages connections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerRequest {
    /// A joined topic is below D_low and no eligible subscriber is connected.
    MorePeers { topic: String, wanted: usize },
    /// Candidates suggested by a peer that pruned us.
    Exchange { topic: String, peers: Vec<PeerId> },
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Subscribe(String, oneshot::Sender<anyhow::Result<()>>),
    Unsubscribe(String, oneshot::Sender<anyhow::Result<()>>),
    Publish(String, Vec<u8>, oneshot::Sender<anyhow::Result<MessageId>>),
    HandleMessage(PeerId, GossipSubRequest, oneshot::Sender<()>),
    PeerConnected { peer: PeerId, outbound: bool },
    PeerDisconnected(PeerId),
    GetSubscriptions(oneshot::Sender<Vec<String>>),
    GetMeshPeers(String, oneshot::Sender<Vec<PeerId>>),
    GetTopicPeers(String, oneshot::Sender<Vec<PeerId>>),
    GetMembership(String, oneshot::Sender<Membership>),
    GetPeerScore(PeerId, oneshot::Sender<f64>),
    Quit,
}

// ============================================================================
// GossipSub Handle (public API - cheap to clone)
// ============================================================================

pub struct GossipSub<N: GossipSubRpc> {
    cmd_tx: mpsc::Sender<Command>,
    seen: SeenCache,
    _phantom: std::marker::PhantomData<fn() -> N>,
}

impl<N: GossipSubRpc> Clone for GossipSub<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            seen: self.seen.clone(),
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<N: GossipSubRpc> GossipSub<N> {
    /// Spawn the overlay actor.
    ///
    /// `peer_requests` receives [`PeerRequest`]s when the overlay needs more
    /// connections than it has.
    pub fn spawn(
        network: Arc<N>,
        keypair: Keypair,
        config: GossipSubConfig,
        peer_requests: Option<mpsc::Sender<PeerRequest>>,
    ) -> (Self, mpsc::Receiver<ReceivedMessage>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(1000);
        let (msg_tx, msg_rx) = mpsc::channel(1000);
        let seen = SeenCache::new(config.seen_ttl, MAX_SEEN_ENTRIES);

        let actor = GossipSubActor::new(network, keypair, config, seen.clone(), msg_tx, peer_requests);
        tokio::spawn(actor.run(cmd_rx));

        (
            Self {
                cmd_tx,
                seen,
                _phantom: std::marker::PhantomData,
            },
            msg_rx,
        )
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("GossipSub actor closed"))
    }

    pub async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.request(|tx| Command::Subscribe(topic.to_string(), tx)).await?
    }

    pub async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.request(|tx| Command::Unsubscribe(topic.to_string(), tx)).await?
    }

    /// Sign and send `data` on `topic`. Succeeds with no connected peers;
    /// peers grafted later are sent IHAVE for it and pull it with IWANT
    /// while it stays in the message cache.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> anyhow::Result<MessageId> {
        self.request(|tx| Command::Publish(topic.to_string(), data, tx)).await?
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.request(Command::GetSubscriptions).await.unwrap_or_default()
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.request(|tx| Command::GetMeshPeers(topic.to_string(), tx))
            .await
            .unwrap_or_default()
    }

    /// Connected peers known to be subscribed to `topic`.
    pub async fn topic_peers(&self, topic: &str) -> Vec<PeerId> {
        self.request(|tx| Command::GetTopicPeers(topic.to_string(), tx))
            .await
            .unwrap_or_default()
    }

    pub async fn membership(&self, topic: &str) -> Membership {
        self.request(|tx| Command::GetMembership(topic.to_string(), tx))
            .await
            .unwrap_or(Membership::NotJoined)
    }

    pub async fn peer_score(&self, peer: &PeerId) -> f64 {
        self.request(|tx| Command::GetPeerScore(*peer, tx))
            .await
            .unwrap_or_default()
    }

    /// A connection to `peer` is up. `outbound` is true if we dialed it.
    pub async fn peer_connected(&self, peer: PeerId, outbound: bool) {
        let _ = self.cmd_tx.send(Command::PeerConnected { peer, outbound }).await;
    }

    pub async fn peer_disconnected(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::PeerDisconnected(peer)).await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    pub fn seen_cache(&self) -> &SeenCache {
        &self.seen
    }

    /// Handle an incoming gossip message. Already-seen publications are
    /// dropped here without involving the actor.
    pub async fn handle_message(&self, from: &PeerId, message: GossipSubRequest) -> anyhow::Result<()> {
        if let GossipSubRequest::Publish { source, seqno, .. } = &message
            && self.seen.contains(&message_id(source, *seqno))
        {
            trace!(peer = %from.short(), seqno, "duplicate message dropped");
            return Ok(());
        }
        self.request(|tx| Command::HandleMessage(*from, message, tx)).await
    }
}

// ============================================================================
// GossipSub Actor (owns state)
// ============================================================================

type BackoffKey = (PeerId, String);

struct GossipSubActor<N: GossipSubRpc> {
    network: Arc<N>,
    keypair: Keypair,
    local_peer: PeerId,
    config: GossipSubConfig,

    peers: HashMap<PeerId, PeerInfo>,
    topics: HashMap<String, TopicState>,

    seen: SeenCache,
    message_cache: LruCache<MessageId, CachedMessage>,
    message_cache_bytes: usize,

    seqno_trackers: LruCache<PeerId, SeqnoTracker>,
    rate_limits: LruCache<PeerId, PeerRateLimit>,
    publish_times: VecDeque<Instant>,
    scores: LruCache<PeerId, PeerScore>,
    /// When each (peer, topic) may be grafted again.
    backoff: LruCache<BackoffKey, Instant>,
    /// Peers excluded from mesh selection until the given instant.
    cooldown: LruCache<PeerId, Instant>,

    next_seqno: u64,
    message_tx: mpsc::Sender<ReceivedMessage>,
    peer_requests: Option<mpsc::Sender<PeerRequest>>,
}

impl<N: GossipSubRpc> GossipSubActor<N> {
    fn new(
        network: Arc<N>,
        keypair: Keypair,
        config: GossipSubConfig,
        seen: SeenCache,
        message_tx: mpsc::Sender<ReceivedMessage>,
        peer_requests: Option<mpsc::Sender<PeerRequest>>,
    ) -> Self {
        let cache_size = NonZeroUsize::new(config.message_cache_size.max(1))
            .expect("message cache size clamped to non-zero");
        let local_peer = keypair.peer_id();
        Self {
            network,
            keypair,
            local_peer,
            config,
            peers: HashMap::new(),
            topics: HashMap::new(),
            seen,
            message_cache: LruCache::new(cache_size),
            message_cache_bytes: 0,
            seqno_trackers: LruCache::new(
                NonZeroUsize::new(MAX_SEQNO_TRACKING_SOURCES).expect("MAX_SEQNO_TRACKING_SOURCES must be non-zero"),
            ),
            rate_limits: LruCache::new(
                NonZeroUsize::new(MAX_RATE_LIMIT_ENTRIES).expect("MAX_RATE_LIMIT_ENTRIES must be non-zero"),
            ),
            publish_times: VecDeque::new(),
            scores: LruCache::new(
                NonZeroUsize::new(MAX_SCORED_PEERS).expect("MAX_SCORED_PEERS must be non-zero"),
            ),
            backoff: LruCache::new(
                NonZeroUsize::new(MAX_BACKOFF_ENTRIES).expect("MAX_BACKOFF_ENTRIES must be non-zero"),
            ),
            cooldown: LruCache::new(
                NonZeroUsize::new(MAX_SCORED_PEERS).expect("MAX_SCORED_PEERS must be non-zero"),
            ),
            next_seqno: initial_seqno(),
            message_tx,
            peer_requests,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut heartbeat_interval = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Subscribe(topic, reply)) => {
                            let _ = reply.send(self.handle_subscribe_cmd(&topic).await);
                        }
                        Some(Command::Unsubscribe(topic, reply)) => {
                            let _ = reply.send(self.handle_unsubscribe_cmd(&topic).await);
                        }
                        Some(Command::Publish(topic, data, reply)) => {
                            let _ = reply.send(self.handle_publish_cmd(&topic, data).await);
                        }
                        Some(Command::HandleMessage(from, msg, reply)) => {
                            if let Err(rejection) = self.handle_message_internal(from, msg).await {
                                trace!(peer = %from.short(), %rejection, "message not handled");
                            }
                            let _ = reply.send(());
                        }
                        Some(Command::PeerConnected { peer, outbound }) => {
                            self.handle_peer_connected(peer, outbound).await;
                        }
                        Some(Command::PeerDisconnected(peer)) => {
                            self.handle_peer_disconnected(&peer);
                        }
                        Some(Command::GetSubscriptions(reply)) => {
                            let _ = reply.send(self.subscriptions());
                        }
                        Some(Command::GetMeshPeers(topic, reply)) => {
                            let peers = self.topics.get(&topic)
                                .map(|s| s.mesh.iter().copied().collect())
                                .unwrap_or_default();
                            let _ = reply.send(peers);
                        }
                        Some(Command::GetTopicPeers(topic, reply)) => {
                            let peers = self.topics.get(&topic)
                                .map(|s| s.subscribers.iter().copied().collect())
                                .unwrap_or_default();
                            let _ = reply.send(peers);
                        }
                        Some(Command::GetMembership(topic, reply)) => {
                            let membership = self.topics.get(&topic)
                                .map(|s| s.membership)
                                .unwrap_or(Membership::NotJoined);
                            let _ = reply.send(membership);
                        }
                        Some(Command::GetPeerScore(peer, reply)) => {
                            let _ = reply.send(self.peer_score(&peer));
                        }
                        Some(Command::Quit) => {
                            debug!("GossipSub actor quitting");
                            break;
                        }
                        None => {
                            debug!("GossipSub handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = heartbeat_interval.tick() => {
                    self.heartbeat().await;
                }
            }
        }
    }

    fn subscriptions(&self) -> Vec<String> {
        self.topics
            .iter()
            .filter(|(_, s)| s.membership.is_joined())
            .map(|(t, _)| t.clone())
            .collect()
    }

    fn is_joined(&self, topic: &str) -> bool {
        self.topics.get(topic).is_some_and(|s| s.membership.is_joined())
    }

    async fn send(&self, to: &PeerId, message: GossipSubRequest) {
        let kind = message.kind();
        if let Err(e) = self.network.send_gossipsub(to, message).await {
            trace!(peer = %to.short(), kind, error = %e, "failed to send gossip message");
        }
    }

    // ------------------------------------------------------------------------
    // Scoring
    // ------------------------------------------------------------------------

    fn peer_score(&self, peer: &PeerId) -> f64 {
        self.scores
            .peek(peer)
            .map(|s| s.calculate(&self.config.topic_score_params))
            .unwrap_or(0.0)
    }

    fn is_graylisted(&self, peer: &PeerId) -> bool {
        self.peer_score(peer) < self.config.graylist_threshold
    }

    fn is_below_publish_threshold(&self, peer: &PeerId) -> bool {
        self.peer_score(peer) < self.config.publish_threshold
    }

    fn is_below_gossip_threshold(&self, peer: &PeerId) -> bool {
        self.peer_score(peer) < self.config.gossip_threshold
    }

    fn in_cooldown(&self, peer: &PeerId) -> bool {
        self.cooldown.peek(peer).is_some_and(|until| Instant::now() < *until)
    }

    fn is_in_backoff(&self, peer: &PeerId, topic: &str) -> bool {
        self.backoff
            .peek(&(*peer, topic.to_string()))
            .is_some_and(|until| Instant::now() < *until)
    }

    fn eligible_for_mesh(&self, peer: &PeerId, topic: &str) -> bool {
        !self.is_in_backoff(peer, topic)
            && !self.in_cooldown(peer)
            && !self.is_below_publish_threshold(peer)
    }

    fn score_mesh_joined(&mut self, peer: &PeerId, topic: &str) {
        self.scores.get_or_insert_mut(*peer, PeerScore::default).mesh_joined(topic);
    }

    fn score_mesh_left(&mut self, peer: &PeerId, topic: &str) {
        if let Some(score) = self.scores.get_mut(peer) {
            score.mesh_left(topic, &self.config.topic_score_params);
        }
    }

    fn score_first_message_delivered(&mut self, peer: &PeerId, topic: &str) {
        self.scores
            .get_or_insert_mut(*peer, PeerScore::default)
            .first_message_delivered(topic);
    }

    fn score_invalid_message(&mut self, peer: &PeerId, topic: &str) {
        self.scores.get_or_insert_mut(*peer, PeerScore::default).invalid_message(topic);
        self.check_cooldown(peer);
    }

    fn score_add_penalty(&mut self, peer: &PeerId, penalty: f64) {
        self.scores
            .get_or_insert_mut(*peer, PeerScore::default)
            .add_behaviour_penalty(penalty);
        self.check_cooldown(peer);
    }

    fn check_cooldown(&mut self, peer: &PeerId) {
        if self.is_below_publish_threshold(peer) && !self.in_cooldown(peer) {
            let until = Instant::now() + self.config.cooldown;
            self.cooldown.put(*peer, until);
            debug!(
                peer = %peer.short(),
                score = self.peer_score(peer),
                cooldown_secs = self.config.cooldown.as_secs(),
                "peer entered cooldown"
            );
        }
    }

    fn decay_scores(&mut self) {
        let params = &self.config.topic_score_params;
        for (_, score) in self.scores.iter_mut() {
            score.decay(params, self.config.behaviour_penalty_decay, self.config.decay_to_zero);
        }
    }

    fn record_backoff(&mut self, peer: &PeerId, topic: &str, backoff_secs: Option<u64>) {
        let backoff = backoff_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.prune_backoff)
            .min(Duration::from_secs(3600));
        self.backoff.put((*peer, topic.to_string()), Instant::now() + backoff);
    }

    fn cleanup_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<BackoffKey> = self
            .backoff
            .iter()
            .filter(|(_, until)| now >= **until)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.backoff.pop(&key);
        }

        let cooled: Vec<PeerId> = self
            .cooldown
            .iter()
            .filter(|(_, until)| now >= **until)
            .map(|(p, _)| *p)
            .collect();
        for peer in cooled {
            self.cooldown.pop(&peer);
            trace!(peer = %peer.short(), "cooldown ended");
        }
    }

    /// Other well-scored subscribers of `topic` to suggest to a pruned peer.
    fn peer_exchange(&self, topic: &str, exclude: &PeerId) -> Vec<PeerId> {
        let Some(state) = self.topics.get(topic) else {
            return Vec::new();
        };
        let mut peers: Vec<PeerId> = state
            .mesh
            .iter()
            .chain(state.subscribers.iter().filter(|p| !state.mesh.contains(p)))
            .filter(|p| *p != exclude && self.peer_score(p) >= 0.0)
            .copied()
            .collect();
        peers.truncate(MAX_PX_PEERS);
        peers
    }

    fn request_peers(&self, request: PeerRequest) {
        if let Some(tx) = &self.peer_requests
            && let Err(e) = tx.try_send(request)
        {
            trace!(error = %e, "peer request dropped");
        }
    }

    // ------------------------------------------------------------------------
    // Mesh changes
    // ------------------------------------------------------------------------

    /// Eligible subscribers of `topic` outside the mesh, best score first.
    fn mesh_candidates(&self, topic: &str) -> Vec<PeerId> {
        let Some(state) = self.topics.get(topic) else {
            return Vec::new();
        };
        let mut candidates: Vec<PeerId> = state
            .subscribers
            .iter()
            .filter(|p| !state.mesh.contains(p) && self.eligible_for_mesh(p, topic))
            .copied()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.sort_by(|a, b| self.peer_score(b).total_cmp(&self.peer_score(a)));
        candidates
    }

    async fn graft_peers(&mut self, topic: &str, peers: Vec<PeerId>) {
        for peer in peers {
            let Some(state) = self.topics.get_mut(topic) else {
                return;
            };
            if !state.mesh.insert(peer) {
                continue;
            }
            state.outbound.insert(peer);
            self.score_mesh_joined(&peer, topic);
            self.send(&peer, GossipSubRequest::Graft { topic: topic.to_string() }).await;
            trace!(peer = %peer.short(), topic = %topic, "GRAFT sent");
            self.advertise_cached(topic, &peer).await;
        }
        self.update_membership(topic);
    }

    /// Send a new mesh member IHAVE for every cached message on `topic`, so
    /// messages published before it joined are still pulled with IWANT.
    async fn advertise_cached(&mut self, topic: &str, peer: &PeerId) {
        if self.is_below_gossip_threshold(peer) {
            return;
        }
        let msg_ids: Vec<MessageId> = self
            .message_cache
            .iter()
            .filter(|(_, cached)| cached.topic == topic)
            .map(|(id, _)| *id)
            .take(self.config.max_ihave_length)
            .collect();
        if msg_ids.is_empty() {
            return;
        }
        trace!(peer = %peer.short(), topic = %topic, ids = msg_ids.len(), "IHAVE sent to new mesh peer");
        self.send(peer, GossipSubRequest::IHave {
            topic: topic.to_string(),
            msg_ids,
        })
        .await;
    }

    async fn prune_peer(&mut self, topic: &str, peer: PeerId, with_px: bool) {
        let removed = self.topics.get_mut(topic).is_some_and(|state| {
            state.outbound.remove(&peer);
            state.mesh.remove(&peer)
        });
        if !removed {
            return;
        }
        self.score_mesh_left(&peer, topic);
        self.record_backoff(&peer, topic, None);
        let peers = if with_px { self.peer_exchange(topic, &peer) } else { Vec::new() };
        self.send(&peer, GossipSubRequest::Prune {
            topic: topic.to_string(),
            peers,
            backoff_secs: Some(self.config.prune_backoff.as_secs()),
        })
        .await;
        trace!(peer = %peer.short(), topic = %topic, "PRUNE sent");
    }

    fn update_membership(&mut self, topic: &str) {
        let mesh_n_low = self.config.mesh_n_low;
        if let Some(state) = self.topics.get_mut(topic)
            && state.membership == Membership::Joining
            && state.mesh.len() >= mesh_n_low
        {
            state.membership = Membership::Meshed;
            debug!(topic = %topic, mesh_size = state.mesh.len(), "topic mesh established");
        }
    }

    // ------------------------------------------------------------------------
    // Local commands
    // ------------------------------------------------------------------------

    async fn handle_subscribe_cmd(&mut self, topic: &str) -> anyhow::Result<()> {
        validate_topic(topic)?;
        if !self.topics.contains_key(topic) && self.topics.len() >= MAX_TOPICS {
            anyhow::bail!("topic limit {} reached", MAX_TOPICS);
        }

        let state = self.topics.entry(topic.to_string()).or_insert_with(TopicState::new);
        if state.membership.is_joined() {
            return Ok(());
        }
        state.membership = Membership::Joining;
        let fanout: Vec<PeerId> = state.fanout.drain().collect();
        state.fanout_last_published = None;

        let mut joining: Vec<PeerId> = fanout
            .into_iter()
            .filter(|p| self.eligible_for_mesh(p, topic))
            .take(self.config.mesh_n)
            .collect();
        let needed = self.config.mesh_n.saturating_sub(joining.len());
        let extra: Vec<PeerId> = self
            .mesh_candidates(topic)
            .into_iter()
            .filter(|p| !joining.contains(p))
            .take(needed)
            .collect();
        joining.extend(extra);
        let grafted = joining.len();
        self.graft_peers(topic, joining).await;

        let connected: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in &connected {
            self.send(peer, GossipSubRequest::Subscribe { topic: topic.to_string() }).await;
        }

        info!(topic = %topic, grafted, announced = connected.len(), "subscribed");
        Ok(())
    }

    async fn handle_unsubscribe_cmd(&mut self, topic: &str) -> anyhow::Result<()> {
        let mesh: Vec<PeerId> = match self.topics.get_mut(topic) {
            Some(state) if state.membership.is_joined() => {
                state.membership = Membership::Leaving;
                state.mesh.iter().copied().collect()
            }
            _ => return Ok(()),
        };

        for peer in mesh {
            self.prune_peer(topic, peer, true).await;
        }

        let connected: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in &connected {
            self.send(peer, GossipSubRequest::Unsubscribe { topic: topic.to_string() }).await;
        }

        info!(topic = %topic, "unsubscribed");
        Ok(())
    }

    async fn handle_publish_cmd(&mut self, topic: &str, data: Vec<u8>) -> anyhow::Result<MessageId> {
        validate_topic(topic)?;
        if data.len() > self.config.max_message_size {
            return Err(MessageRejection::MessageTooLarge.into());
        }
        if window_exceeded(&mut self.publish_times, self.config.publish_rate_limit) {
            return Err(MessageRejection::RateLimited.into());
        }
        if !self.topics.contains_key(topic) && self.topics.len() >= MAX_TOPICS {
            anyhow::bail!("topic limit {} reached", MAX_TOPICS);
        }

        let seqno = self.next_seqno;
        self.next_seqno = self.next_seqno.wrapping_add(1);
        let signature = sign_message(&self.keypair, topic, seqno, &data);
        let msg_id = message_id(&self.local_peer, seqno);

        self.seen.insert(msg_id);
        let cached = CachedMessage {
            topic: topic.to_string(),
            source: self.local_peer,
            seqno,
            data,
            signature,
            cached_at: Instant::now(),
        };
        let request = cached.to_request();
        self.cache_message(msg_id, cached);

        let targets = self.publish_targets(topic);
        if let Some(state) = self.topics.get_mut(topic) {
            state.record_history(msg_id);
        }

        if targets.is_empty() {
            debug!(topic = %topic, seqno, "published with no connected topic peers");
        }
        for peer in &targets {
            self.send(peer, request.clone()).await;
        }

        trace!(topic = %topic, seqno, recipients = targets.len(), "published");
        Ok(msg_id)
    }

    /// Recipients of a locally published message: the mesh when joined,
    /// otherwise the fanout (selected on first use), plus every acceptable
    /// subscriber under flood publishing.
    fn publish_targets(&mut self, topic: &str) -> Vec<PeerId> {
        let joined = self.is_joined(topic);
        if !joined {
            let fanout_empty = self.topics.get(topic).is_none_or(|s| s.fanout.is_empty());
            let fresh: Vec<PeerId> = if fanout_empty {
                self.topics
                    .get(topic)
                    .map(|s| {
                        let mut peers: Vec<PeerId> = s
                            .subscribers
                            .iter()
                            .filter(|p| !self.is_below_publish_threshold(p))
                            .copied()
                            .collect();
                        peers.shuffle(&mut rand::thread_rng());
                        peers.truncate(self.config.mesh_n);
                        peers
                    })
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            let state = self.topics.entry(topic.to_string()).or_insert_with(TopicState::new);
            state.fanout.extend(fresh);
            state.fanout_last_published = Some(Instant::now());
        }

        let Some(state) = self.topics.get(topic) else {
            return Vec::new();
        };
        let mut targets: HashSet<PeerId> = if joined {
            state.mesh.clone()
        } else {
            state.fanout.clone()
        };
        if self.config.flood_publish {
            targets.extend(
                state
                    .subscribers
                    .iter()
                    .filter(|p| !self.is_below_publish_threshold(p))
                    .copied(),
            );
        }
        targets.into_iter().collect()
    }

    fn cache_message(&mut self, msg_id: MessageId, message: CachedMessage) {
        let size = message.size_bytes();
        while self.message_cache_bytes + size > MAX_MESSAGE_CACHE_BYTES {
            match self.message_cache.pop_lru() {
                Some((_, evicted)) => {
                    self.message_cache_bytes = self.message_cache_bytes.saturating_sub(evicted.size_bytes());
                }
                None => break,
            }
        }
        if let Some((_, evicted)) = self.message_cache.push(msg_id, message) {
            self.message_cache_bytes = self.message_cache_bytes.saturating_sub(evicted.size_bytes());
        }
        self.message_cache_bytes += size;
    }

    fn evict_expired_cache_entries(&mut self) {
        let ttl = self.config.message_cache_ttl;
        while let Some((_, oldest)) = self.message_cache.peek_lru() {
            if oldest.cached_at.elapsed() < ttl {
                break;
            }
            if let Some((_, evicted)) = self.message_cache.pop_lru() {
                self.message_cache_bytes = self.message_cache_bytes.saturating_sub(evicted.size_bytes());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------------

    async fn handle_peer_connected(&mut self, peer: PeerId, outbound: bool) {
        if peer == self.local_peer {
            return;
        }
        self.peers.entry(peer).or_default().outbound = outbound;
        for topic in self.subscriptions() {
            self.send(&peer, GossipSubRequest::Subscribe { topic }).await;
        }
        trace!(peer = %peer.short(), outbound, "gossip peer connected");
    }

    fn handle_peer_disconnected(&mut self, peer: &PeerId) {
        if self.peers.remove(peer).is_none() {
            return;
        }
        let mut left_mesh = Vec::new();
        for (topic, state) in self.topics.iter_mut() {
            if state.remove_peer(peer) {
                left_mesh.push(topic.clone());
            }
        }
        for topic in &left_mesh {
            self.score_mesh_left(peer, topic);
        }
        self.topics.retain(|_, s| !s.is_idle());
        trace!(peer = %peer.short(), meshes = left_mesh.len(), "gossip peer disconnected");
    }

    // ------------------------------------------------------------------------
    // Remote messages
    // ------------------------------------------------------------------------

    async fn handle_message_internal(&mut self, from: PeerId, msg: GossipSubRequest) -> Result<(), MessageRejection> {
        if from == self.local_peer {
            return Ok(());
        }
        if self.is_graylisted(&from) {
            return Err(MessageRejection::Graylisted);
        }
        self.peers.entry(from).or_default();

        match msg {
            GossipSubRequest::Subscribe { topic } => self.handle_subscribe(from, &topic).await,
            GossipSubRequest::Unsubscribe { topic } => self.handle_unsubscribe(&from, &topic),
            GossipSubRequest::Graft { topic } => self.handle_graft(from, &topic).await,
            GossipSubRequest::Prune { topic, peers, backoff_secs } => {
                self.handle_prune(&from, &topic, peers, backoff_secs)
            }
            GossipSubRequest::Publish { topic, source, seqno, data, signature } => {
                if let Err(rejection) = self
                    .handle_publish(from, topic, source, seqno, data, signature)
                    .await
                {
                    debug!(peer = %from.short(), source = %source.short(), seqno, %rejection, "message rejected");
                    return Err(rejection);
                }
            }
            GossipSubRequest::IHave { topic, msg_ids } => self.handle_ihave(from, &topic, msg_ids).await,
            GossipSubRequest::IWant { msg_ids } => self.handle_iwant(from, msg_ids).await,
        }
        Ok(())
    }

    async fn handle_subscribe(&mut self, from: PeerId, topic: &str) {
        if validate_topic(topic).is_err() {
            trace!(peer = %from.short(), "ignoring subscription to invalid topic");
            return;
        }
        let Some(info) = self.peers.get_mut(&from) else {
            return;
        };
        if !info.topics.contains(topic) && info.topics.len() >= MAX_SUBSCRIPTIONS_PER_PEER {
            warn!(peer = %from.short(), "peer exceeded subscription limit");
            return;
        }
        if !self.topics.contains_key(topic) && self.topics.len() >= MAX_TOPICS {
            return;
        }
        let state = self.topics.entry(topic.to_string()).or_insert_with(TopicState::new);
        if state.subscribers.len() >= MAX_PEERS_PER_TOPIC {
            return;
        }
        state.subscribers.insert(from);
        let wants_graft = state.membership.is_joined()
            && !state.mesh.contains(&from)
            && state.mesh.len() < self.config.mesh_n_low;
        info.topics.insert(topic.to_string());

        if wants_graft && self.eligible_for_mesh(&from, topic) {
            self.graft_peers(topic, vec![from]).await;
        }
        trace!(peer = %from.short(), topic = %topic, "peer subscribed");
    }

    fn handle_unsubscribe(&mut self, from: &PeerId, topic: &str) {
        if let Some(info) = self.peers.get_mut(from) {
            info.topics.remove(topic);
        }
        let was_mesh = match self.topics.get_mut(topic) {
            Some(state) => state.remove_peer(from),
            None => return,
        };
        if was_mesh {
            self.score_mesh_left(from, topic);
        }
        if self.topics.get(topic).is_some_and(|s| s.is_idle()) {
            self.topics.remove(topic);
        }
        trace!(peer = %from.short(), topic = %topic, "peer unsubscribed");
    }

    async fn handle_graft(&mut self, from: PeerId, topic: &str) {
        let reject = |backoff_secs| GossipSubRequest::Prune {
            topic: topic.to_string(),
            peers: Vec::new(),
            backoff_secs: Some(backoff_secs),
        };
        let backoff_secs = self.config.prune_backoff.as_secs();

        if !self.is_joined(topic) {
            trace!(peer = %from.short(), topic = %topic, "GRAFT for topic not joined");
            self.send(&from, reject(backoff_secs)).await;
            return;
        }
        if self.is_in_backoff(&from, topic) {
            debug!(peer = %from.short(), topic = %topic, "GRAFT during backoff");
            self.score_add_penalty(&from, 1.0);
            self.record_backoff(&from, topic, None);
            self.send(&from, reject(backoff_secs)).await;
            return;
        }
        if self.in_cooldown(&from) || self.is_below_publish_threshold(&from) {
            self.send(&from, reject(backoff_secs)).await;
            return;
        }

        if let Some(state) = self.topics.get_mut(topic) {
            state.subscribers.insert(from);
            if !state.mesh.insert(from) {
                return;
            }
        }
        if let Some(info) = self.peers.get_mut(&from) {
            info.topics.insert(topic.to_string());
        }
        self.score_mesh_joined(&from, topic);
        self.update_membership(topic);
        trace!(peer = %from.short(), topic = %topic, "accepted GRAFT");
        self.advertise_cached(topic, &from).await;
    }

    fn handle_prune(&mut self, from: &PeerId, topic: &str, peers: Vec<PeerId>, backoff_secs: Option<u64>) {
        let was_mesh = self.topics.get_mut(topic).is_some_and(|state| {
            state.outbound.remove(from);
            state.mesh.remove(from)
        });
        if was_mesh {
            self.score_mesh_left(from, topic);
        }
        self.record_backoff(from, topic, backoff_secs);

        if self.peer_score(from) < 0.0 || peers.is_empty() {
            return;
        }
        let suggestions: Vec<PeerId> = peers
            .into_iter()
            .filter(|p| *p != self.local_peer && !self.peers.contains_key(p))
            .take(MAX_PX_PEERS)
            .collect();
        if !suggestions.is_empty() {
            debug!(peer = %from.short(), topic = %topic, count = suggestions.len(), "peer exchange from PRUNE");
            self.request_peers(PeerRequest::Exchange {
                topic: topic.to_string(),
                peers: suggestions,
            });
        }
    }

    async fn handle_publish(
        &mut self,
        from: PeerId,
        topic: String,
        source: PeerId,
        seqno: u64,
        data: Vec<u8>,
        signature: Vec<u8>,
    ) -> Result<(), MessageRejection> {
        if data.len() > self.config.max_message_size {
            self.score_invalid_message(&from, &topic);
            return Err(MessageRejection::MessageTooLarge);
        }
        validate_topic(&topic)?;

        let msg_id = message_id(&source, seqno);
        if self.seen.contains(&msg_id) {
            if let Some(score) = self.scores.get_mut(&from) {
                score.mesh_message_delivered(&topic);
            }
            return Ok(());
        }

        if let Err(e) = verify_message(&source, &topic, seqno, &data, &signature) {
            self.score_invalid_message(&from, &topic);
            return Err(MessageRejection::SignatureInvalid(e));
        }

        let exceeded = self
            .rate_limits
            .get_or_insert_mut(from, PeerRateLimit::default)
            .check_and_record(self.config.per_peer_rate_limit);
        if exceeded {
            self.score_add_penalty(&from, 1.0);
            return Err(MessageRejection::RateExceeded);
        }

        if !self
            .seqno_trackers
            .get_or_insert_mut(source, SeqnoTracker::default)
            .check_and_record(seqno)
        {
            return Err(MessageRejection::Replay);
        }

        if !self.seen.insert(msg_id) {
            return Ok(());
        }
        self.score_first_message_delivered(&from, &topic);

        let cached = CachedMessage {
            topic: topic.clone(),
            source,
            seqno,
            data,
            signature,
            cached_at: Instant::now(),
        };
        let request = cached.to_request();
        let data = cached.data.clone();
        self.cache_message(msg_id, cached);

        let joined = self.is_joined(&topic);
        let forward_to: Vec<PeerId> = match self.topics.get_mut(&topic) {
            Some(state) => {
                state.message_received(&msg_id);
                state.record_history(msg_id);
                if joined {
                    state
                        .mesh
                        .iter()
                        .filter(|p| **p != from && **p != source)
                        .copied()
                        .collect()
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        };

        if joined {
            let received = ReceivedMessage {
                topic: topic.clone(),
                source,
                seqno,
                data,
                msg_id,
                propagation_source: from,
                received_at: Instant::now(),
            };
            if self.message_tx.send(received).await.is_err() {
                trace!("message receiver dropped");
            }
        }

        for peer in &forward_to {
            self.send(peer, request.clone()).await;
        }
        trace!(
            topic = %topic,
            source = %source.short(),
            seqno,
            forwarded = forward_to.len(),
            "accepted message"
        );
        Ok(())
    }

    async fn handle_ihave(&mut self, from: PeerId, topic: &str, msg_ids: Vec<MessageId>) {
        if self.is_below_gossip_threshold(&from) || !self.is_joined(topic) {
            return;
        }
        let global_pending: usize = self.topics.values().map(|s| s.pending_iwants.len()).sum();
        let budget = MAX_GLOBAL_PENDING_IWANTS.saturating_sub(global_pending);

        let mut wanted = Vec::new();
        for id in msg_ids.into_iter().take(self.config.max_ihave_length) {
            if self.seen.contains(&id) || self.message_cache.contains(&id) {
                continue;
            }
            let Some(state) = self.topics.get_mut(topic) else {
                return;
            };
            if !state.pending_iwants.contains(&id) && wanted.len() >= budget {
                break;
            }
            if state.record_iwant(id, from) {
                wanted.push(id);
            }
        }

        if !wanted.is_empty() {
            trace!(peer = %from.short(), topic = %topic, count = wanted.len(), "IWANT sent");
            self.send(&from, GossipSubRequest::IWant { msg_ids: wanted }).await;
        }
    }

    async fn handle_iwant(&mut self, from: PeerId, msg_ids: Vec<MessageId>) {
        if self.is_below_gossip_threshold(&from) {
            return;
        }
        let limited = self
            .rate_limits
            .get_or_insert_mut(from, PeerRateLimit::default)
            .check_and_record_iwant(self.config.iwant_rate_limit);
        if limited {
            trace!(peer = %from.short(), "IWANT rate limited");
            return;
        }

        let mut budget = MAX_IWANT_RESPONSE_BYTES;
        let mut replies = Vec::new();
        for id in msg_ids.iter().take(self.config.max_iwant_messages) {
            let Some(cached) = self.message_cache.peek(id) else {
                continue;
            };
            let size = cached.size_bytes();
            if size > budget {
                break;
            }
            budget -= size;
            replies.push(cached.to_request());
        }
        for reply in replies {
            self.send(&from, reply).await;
        }
    }

    // ------------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------------

    async fn heartbeat(&mut self) {
        let topics: Vec<String> = self.topics.keys().cloned().collect();
        for topic in &topics {
            self.maintain_topic(topic).await;
        }

        self.retry_iwants().await;
        self.decay_scores();
        self.cleanup_expired();
        let expired = self.seen.expire();
        if expired > 0 {
            trace!(expired, remaining = self.seen.len(), "seen cache expired entries");
        }
        self.evict_expired_cache_entries();
        self.topics.retain(|_, s| !s.is_idle());
    }

    async fn maintain_topic(&mut self, topic: &str) {
        let Some(state) = self.topics.get_mut(topic) else {
            return;
        };
        if state.membership == Membership::Leaving {
            state.membership = Membership::NotJoined;
            debug!(topic = %topic, "left topic");
        }

        if self.is_joined(topic) {
            self.maintain_mesh(topic).await;
        } else {
            self.maintain_fanout(topic);
        }
        self.emit_gossip(topic).await;

        let history_length = self.config.history_length;
        if let Some(state) = self.topics.get_mut(topic) {
            state.shift_history(history_length);
        }
    }

    async fn maintain_mesh(&mut self, topic: &str) {
        let in_cooldown: Vec<PeerId> = self
            .topics
            .get(topic)
            .map(|s| s.mesh.iter().filter(|p| self.in_cooldown(p)).copied().collect())
            .unwrap_or_default();
        for peer in in_cooldown {
            debug!(peer = %peer.short(), topic = %topic, "pruning peer in cooldown");
            self.prune_peer(topic, peer, false).await;
        }

        let mesh_len = self.topics.get(topic).map_or(0, |s| s.mesh.len());

        // Too few: graft the best eligible subscribers up to D.
        if mesh_len < self.config.mesh_n_low {
            let needed = self.config.mesh_n - mesh_len;
            let candidates: Vec<PeerId> = self.mesh_candidates(topic).into_iter().take(needed).collect();
            let grafted = candidates.len();
            self.graft_peers(topic, candidates).await;
            if grafted > 0 {
                debug!(topic = %topic, grafted, mesh_size = mesh_len + grafted, "mesh maintenance: GRAFT");
            }
            if mesh_len + grafted < self.config.mesh_n_low {
                self.request_peers(PeerRequest::MorePeers {
                    topic: topic.to_string(),
                    wanted: self.config.mesh_n - (mesh_len + grafted),
                });
            }
        }

        // Too many: prune down to D, inbound and worst scores first, keeping D_out.
        let (mesh_len, outbound_count) = self
            .topics
            .get(topic)
            .map_or((0, 0), |s| (s.mesh.len(), s.outbound_mesh_count()));
        if mesh_len > self.config.mesh_n_high {
            let excess = mesh_len - self.config.mesh_n;
            let mut ranked: Vec<(PeerId, f64, bool)> = self
                .topics
                .get(topic)
                .map(|s| {
                    s.mesh
                        .iter()
                        .map(|p| (*p, self.peer_score(p), s.outbound.contains(p)))
                        .collect()
                })
                .unwrap_or_default();
            ranked.shuffle(&mut rand::thread_rng());
            ranked.sort_by(|a, b| match (a.2, b.2) {
                (false, true) => std::cmp::Ordering::Less,
                (true, false) => std::cmp::Ordering::Greater,
                _ => a.1.total_cmp(&b.1),
            });

            let mut current_outbound = outbound_count;
            let mut to_prune = Vec::new();
            for (peer, _, is_outbound) in ranked {
                if to_prune.len() >= excess {
                    break;
                }
                if is_outbound && current_outbound <= self.config.mesh_outbound_min {
                    continue;
                }
                if is_outbound {
                    current_outbound -= 1;
                }
                to_prune.push(peer);
            }
            let pruned = to_prune.len();
            for peer in to_prune {
                self.prune_peer(topic, peer, true).await;
            }
            debug!(topic = %topic, pruned, mesh_size = mesh_len - pruned, "mesh maintenance: PRUNE");
        }

        // Keep at least D_out peers we chose ourselves.
        let (mesh_len, outbound_count) = self
            .topics
            .get(topic)
            .map_or((0, 0), |s| (s.mesh.len(), s.outbound_mesh_count()));
        if mesh_len >= self.config.mesh_n_low && outbound_count < self.config.mesh_outbound_min {
            let needed = self.config.mesh_outbound_min - outbound_count;
            let candidates: Vec<PeerId> = self
                .mesh_candidates(topic)
                .into_iter()
                .filter(|p| self.peers.get(p).is_some_and(|i| i.outbound))
                .take(needed)
                .collect();
            self.graft_peers(topic, candidates).await;
        }

        self.update_membership(topic);
    }

    fn maintain_fanout(&mut self, topic: &str) {
        let ttl = self.config.fanout_ttl;
        let expired = self
            .topics
            .get(topic)
            .and_then(|s| s.fanout_last_published)
            .is_some_and(|at| at.elapsed() >= ttl);
        if expired {
            if let Some(state) = self.topics.get_mut(topic) {
                state.fanout.clear();
                state.fanout_last_published = None;
            }
            trace!(topic = %topic, "fanout expired");
            return;
        }

        let Some(state) = self.topics.get(topic) else {
            return;
        };
        if state.fanout_last_published.is_none() {
            return;
        }
        let keep: HashSet<PeerId> = state
            .fanout
            .iter()
            .filter(|p| state.subscribers.contains(p) && !self.is_below_publish_threshold(p))
            .copied()
            .collect();
        let mut extra: Vec<PeerId> = state
            .subscribers
            .iter()
            .filter(|p| !keep.contains(p) && !self.is_below_publish_threshold(p))
            .copied()
            .collect();
        extra.shuffle(&mut rand::thread_rng());
        extra.truncate(self.config.mesh_n.saturating_sub(keep.len()));

        if let Some(state) = self.topics.get_mut(topic) {
            state.fanout = keep;
            state.fanout.extend(extra);
        }
    }

    async fn emit_gossip(&mut self, topic: &str) {
        let Some(state) = self.topics.get(topic) else {
            return;
        };
        if !state.membership.is_joined() && state.fanout.is_empty() {
            return;
        }
        let msg_ids = state.gossip_ids(self.config.history_gossip, self.config.max_ihave_length);
        if msg_ids.is_empty() {
            return;
        }
        let mut targets: Vec<PeerId> = state
            .subscribers
            .iter()
            .filter(|p| {
                !state.mesh.contains(p)
                    && !state.fanout.contains(p)
                    && !self.is_below_gossip_threshold(p)
            })
            .copied()
            .collect();
        targets.shuffle(&mut rand::thread_rng());
        targets.truncate(self.config.gossip_lazy);

        for peer in &targets {
            self.send(peer, GossipSubRequest::IHave {
                topic: topic.to_string(),
                msg_ids: msg_ids.clone(),
            })
            .await;
        }
        if !targets.is_empty() {
            trace!(topic = %topic, ids = msg_ids.len(), peers = targets.len(), "IHAVE sent");
        }
    }

    async fn retry_iwants(&mut self) {
        let timeout = self.config.ihave_timeout;
        let mut retries = Vec::new();
        for state in self.topics.values_mut() {
            retries.extend(state.check_iwant_timeouts(timeout));
        }
        for (msg_id, peer) in retries {
            if self.seen.contains(&msg_id) {
                continue;
            }
            trace!(peer = %peer.short(), "retrying IWANT with another advertiser");
            self.send(&peer, GossipSubRequest::IWant { msg_ids: vec![msg_id] }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct MockNetwork {
        sent: Mutex<Vec<(PeerId, GossipSubRequest)>>,
    }

    impl MockNetwork {
        fn take(&self) -> Vec<(PeerId, GossipSubRequest)> {
            std::mem::take(&mut *self.sent.lock())
        }

        fn sent_to(&self, peer: &PeerId) -> Vec<GossipSubRequest> {
            self.sent
                .lock()
                .iter()
                .filter(|(to, _)| to == peer)
                .map(|(_, m)| m.clone())
                .collect()
        }

        fn count(&self, kind: &str) -> usize {
            self.sent.lock().iter().filter(|(_, m)| m.kind() == kind).count()
        }
    }

    #[async_trait]
    impl GossipSubRpc for MockNetwork {
        async fn send_gossipsub(&self, to: &PeerId, message: GossipSubRequest) -> anyhow::Result<()> {
            self.sent.lock().push((*to, message));
            Ok(())
        }
    }

    struct Harness {
        gossip: GossipSub<MockNetwork>,
        network: Arc<MockNetwork>,
        messages: mpsc::Receiver<ReceivedMessage>,
        peer_requests: mpsc::Receiver<PeerRequest>,
    }

    fn spawn_with(config: GossipSubConfig) -> Harness {
        let network = Arc::new(MockNetwork::default());
        let (req_tx, peer_requests) = mpsc::channel(64);
        let (gossip, messages) =
            GossipSub::spawn(network.clone(), Keypair::generate(), config, Some(req_tx));
        Harness {
            gossip,
            network,
            messages,
            peer_requests,
        }
    }

    fn spawn() -> Harness {
        spawn_with(GossipSubConfig::default())
    }

    fn signed_publish(kp: &Keypair, topic: &str, seqno: u64, data: &[u8]) -> GossipSubRequest {
        GossipSubRequest::Publish {
            topic: topic.to_string(),
            source: kp.peer_id(),
            seqno,
            data: data.to_vec(),
            signature: sign_message(kp, topic, seqno, data),
        }
    }

    /// Connect `n` fresh peers and have each announce `topic`.
    async fn add_subscribers(h: &Harness, topic: &str, n: usize) -> Vec<PeerId> {
        let mut peers = Vec::new();
        for _ in 0..n {
            let peer = Keypair::generate().peer_id();
            h.gossip.peer_connected(peer, true).await;
            h.gossip
                .handle_message(&peer, GossipSubRequest::Subscribe { topic: topic.into() })
                .await
                .unwrap();
            peers.push(peer);
        }
        peers
    }

    #[test]
    fn signed_payload_binds_every_field() {
        let kp = Keypair::generate();
        let base = signed_payload(&kp.peer_id(), "t", 1, b"x");
        assert_ne!(base, signed_payload(&kp.peer_id(), "u", 1, b"x"));
        assert_ne!(base, signed_payload(&kp.peer_id(), "t", 2, b"x"));
        assert_ne!(base, signed_payload(&kp.peer_id(), "t", 1, b"y"));

        let sig = sign_message(&kp, "t", 1, b"x");
        assert!(verify_message(&kp.peer_id(), "t", 1, b"x", &sig).is_ok());
        assert!(verify_message(&kp.peer_id(), "t", 1, b"y", &sig).is_err());
    }

    #[test]
    fn seqno_window_rejects_replays_and_stale_numbers() {
        let mut tracker = SeqnoTracker::default();
        assert!(tracker.check_and_record(1000));
        assert!(!tracker.check_and_record(1000));
        assert!(tracker.check_and_record(999));
        assert!(tracker.check_and_record(1001));
        assert!(!tracker.check_and_record(1001 - SEQNO_WINDOW_SIZE as u64 - 1));
    }

    #[test]
    fn rate_limit_window() {
        let mut limit = PeerRateLimit::default();
        for _ in 0..3 {
            assert!(!limit.check_and_record(3));
        }
        assert!(limit.check_and_record(3));
        assert!(!limit.check_and_record_iwant(1));
        assert!(limit.check_and_record_iwant(1));
    }

    #[test]
    fn invalid_messages_dominate_score() {
        let params = TopicScoreParams::default();
        let mut score = PeerScore::default();
        score.first_message_delivered("t");
        assert!(score.calculate(&params) > 0.0);
        score.invalid_message("t");
        assert!(score.calculate(&params) < DEFAULT_PUBLISH_THRESHOLD);
        for _ in 0..20 {
            score.decay(&params, DEFAULT_BEHAVIOUR_PENALTY_DECAY, DEFAULT_DECAY_TO_ZERO);
        }
        assert_eq!(score.calculate(&params), 0.0);
    }

    #[test]
    fn topic_validation() {
        assert!(validate_topic("universal-connectivity").is_ok());
        assert_eq!(validate_topic(""), Err(MessageRejection::InvalidTopic));
        assert_eq!(validate_topic("a\nb"), Err(MessageRejection::InvalidTopic));
        assert_eq!(
            validate_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)),
            Err(MessageRejection::TopicTooLong)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn seen_cache_expires_after_ttl() {
        let cache = SeenCache::new(Duration::from_secs(10), 100);
        assert!(cache.insert([1; 32]));
        assert!(!cache.insert([1; 32]));
        assert!(cache.contains(&[1; 32]));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.insert([2; 32]));
        assert_eq!(cache.expire(), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.expire(), 1);
        assert!(!cache.contains(&[1; 32]));
        assert!(cache.contains(&[2; 32]));
    }

    #[test]
    fn seen_cache_capacity_evicts_oldest() {
        let cache = SeenCache::new(Duration::from_secs(60), 2);
        cache.insert([1; 32]);
        cache.insert([2; 32]);
        cache.insert([3; 32]);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&[1; 32]));
        assert_eq!(cache.live_evictions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_seen_cache_drops_expired_ids_before_live_ones() {
        let cache = SeenCache::new(Duration::from_secs(10), 3);
        cache.insert([1; 32]);
        cache.insert([2; 32]);
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.insert([3; 32]);

        assert!(cache.insert([4; 32]));
        assert!(cache.insert([5; 32]));
        assert_eq!(cache.live_evictions(), 0);
        assert!(!cache.contains(&[1; 32]));
        assert!(!cache.contains(&[2; 32]));
        for id in [[3; 32], [4; 32], [5; 32]] {
            assert!(cache.contains(&id));
        }

        assert!(cache.insert([6; 32]));
        assert_eq!(cache.live_evictions(), 1);
        assert!(!cache.contains(&[3; 32]));
        assert!(!cache.insert([5; 32]));
    }

    #[test]
    fn pending_iwant_rotates_through_advertisers() {
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        let mut pending = PendingIWant::new(a);
        pending.add_advertiser(a);
        pending.add_advertiser(b);
        pending.add_advertiser(b);
        assert_eq!(pending.next_peer(), Some(b));
        assert_eq!(pending.next_peer(), None);
    }

    #[tokio::test]
    async fn subscribe_announces_and_grafts() {
        let h = spawn();
        let peers = add_subscribers(&h, "t", 3).await;
        let bystander = Keypair::generate().peer_id();
        h.gossip.peer_connected(bystander, false).await;

        h.gossip.subscribe("t").await.unwrap();
        assert_eq!(h.gossip.subscriptions().await, vec!["t".to_string()]);
        assert_eq!(h.gossip.membership("t").await, Membership::Joining);

        let mesh = h.gossip.mesh_peers("t").await;
        assert_eq!(mesh.len(), 3);
        for peer in &peers {
            assert!(mesh.contains(peer));
            let sent = h.network.sent_to(peer);
            assert!(sent.contains(&GossipSubRequest::Graft { topic: "t".into() }));
            assert!(sent.contains(&GossipSubRequest::Subscribe { topic: "t".into() }));
        }
        assert_eq!(
            h.network.sent_to(&bystander),
            vec![GossipSubRequest::Subscribe { topic: "t".into() }]
        );
    }

    #[tokio::test]
    async fn late_connection_learns_subscriptions() {
        let h = spawn();
        h.gossip.subscribe("a").await.unwrap();
        let peer = Keypair::generate().peer_id();
        h.gossip.peer_connected(peer, true).await;
        h.gossip.subscriptions().await;
        assert_eq!(
            h.network.sent_to(&peer),
            vec![GossipSubRequest::Subscribe { topic: "a".into() }]
        );
    }

    #[tokio::test]
    async fn graft_for_unjoined_topic_is_pruned() {
        let h = spawn();
        let peer = Keypair::generate().peer_id();
        h.gossip.peer_connected(peer, false).await;
        h.gossip
            .handle_message(&peer, GossipSubRequest::Graft { topic: "x".into() })
            .await
            .unwrap();

        assert!(matches!(
            h.network.sent_to(&peer).as_slice(),
            [GossipSubRequest::Prune { topic, backoff_secs: Some(_), .. }] if topic == "x"
        ));
        assert!(h.gossip.mesh_peers("x").await.is_empty());
    }

    #[tokio::test]
    async fn graft_is_accepted_once_joined() {
        let h = spawn();
        h.gossip.subscribe("t").await.unwrap();
        let peer = Keypair::generate().peer_id();
        h.gossip.peer_connected(peer, false).await;
        h.gossip
            .handle_message(&peer, GossipSubRequest::Graft { topic: "t".into() })
            .await
            .unwrap();
        assert_eq!(h.gossip.mesh_peers("t").await, vec![peer]);
        assert_eq!(h.gossip.topic_peers("t").await, vec![peer]);
    }

    #[tokio::test]
    async fn publish_without_peers_succeeds() {
        let h = spawn();
        h.gossip.subscribe("lonely").await.unwrap();
        let id = h.gossip.publish("lonely", b"anyone?".to_vec()).await.unwrap();
        assert!(h.gossip.seen_cache().contains(&id));
        assert_eq!(h.network.count("publish"), 0);
    }

    #[tokio::test]
    async fn peers_grafted_after_publish_are_offered_cached_messages() {
        let h = spawn();
        h.gossip.subscribe("t").await.unwrap();
        let id = h.gossip.publish("t", b"early".to_vec()).await.unwrap();
        h.gossip.publish("other", b"elsewhere".to_vec()).await.unwrap();

        // We graft a subscriber that shows up late.
        let joiner = add_subscribers(&h, "t", 1).await[0];
        // A peer grafts us.
        let grafter = Keypair::generate().peer_id();
        h.gossip.peer_connected(grafter, false).await;
        h.gossip
            .handle_message(&grafter, GossipSubRequest::Graft { topic: "t".into() })
            .await
            .unwrap();
        assert_eq!(h.gossip.mesh_peers("t").await.len(), 2);

        for peer in [joiner, grafter] {
            let sent = h.network.sent_to(&peer);
            assert!(sent.contains(&GossipSubRequest::IHave {
                topic: "t".into(),
                msg_ids: vec![id],
            }));
        }

        h.network.take();
        h.gossip
            .handle_message(&joiner, GossipSubRequest::IWant { msg_ids: vec![id] })
            .await
            .unwrap();
        h.gossip.subscriptions().await;
        assert!(matches!(
            h.network.sent_to(&joiner).as_slice(),
            [GossipSubRequest::Publish { data, .. }] if data == b"early"
        ));
    }

    #[tokio::test]
    async fn publish_rejects_oversized_payloads() {
        let h = spawn();
        let err = h
            .gossip
            .publish("t", vec![0; MAX_MESSAGE_SIZE + 1])
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<MessageRejection>(),
            Some(&MessageRejection::MessageTooLarge)
        );
    }

    #[tokio::test]
    async fn publish_reaches_mesh_with_valid_signature() {
        let h = spawn();
        let peers = add_subscribers(&h, "t", 2).await;
        h.gossip.subscribe("t").await.unwrap();
        h.network.take();

        h.gossip.publish("t", b"hi".to_vec()).await.unwrap();
        let sent = h.network.take();
        assert_eq!(sent.len(), 2);
        for (to, msg) in sent {
            assert!(peers.contains(&to));
            let GossipSubRequest::Publish { topic, source, seqno, data, signature } = msg else {
                panic!("expected publish");
            };
            assert_eq!(data, b"hi");
            verify_message(&source, &topic, seqno, &data, &signature).unwrap();
        }
    }

    #[tokio::test]
    async fn remote_message_is_delivered_and_forwarded() {
        let mut h = spawn();
        let peers = add_subscribers(&h, "t", 3).await;
        h.gossip.subscribe("t").await.unwrap();
        h.network.take();

        let author = Keypair::generate();
        let msg = signed_publish(&author, "t", 7, b"hello");
        h.gossip.handle_message(&peers[0], msg.clone()).await.unwrap();

        let received = h.messages.recv().await.unwrap();
        assert_eq!(received.data, b"hello");
        assert_eq!(received.source, author.peer_id());
        assert_eq!(received.propagation_source, peers[0]);
        assert_eq!(received.msg_id, message_id(&author.peer_id(), 7));

        let sent = h.network.take();
        let recipients: HashSet<PeerId> = sent.iter().map(|(to, _)| *to).collect();
        assert_eq!(recipients, HashSet::from([peers[1], peers[2]]));
        assert!(sent.iter().all(|(_, m)| *m == msg));
    }

    #[tokio::test]
    async fn thousand_duplicates_delivered_once_forwarded_once() {
        let mut h = spawn();
        let peers = add_subscribers(&h, "t", 4).await;
        h.gossip.subscribe("t").await.unwrap();
        h.network.take();

        let author = Keypair::generate();
        let msg = signed_publish(&author, "t", 1, b"flood");
        for _ in 0..1000 {
            h.gossip.handle_message(&peers[0], msg.clone()).await.unwrap();
        }

        assert!(h.messages.recv().await.is_some());
        assert!(h.messages.try_recv().is_err());

        let forwarded: Vec<PeerId> = h
            .network
            .take()
            .into_iter()
            .filter(|(_, m)| m.kind() == "publish")
            .map(|(to, _)| to)
            .collect();
        assert_eq!(forwarded.len(), 3);
        assert!(!forwarded.contains(&peers[0]));
        // The sender is not penalised for relaying duplicates.
        assert!(h.gossip.peer_score(&peers[0]).await >= 0.0);
    }

    #[tokio::test]
    async fn bad_signature_is_dropped_and_sender_cooled_down() {
        let mut h = spawn();
        h.gossip.subscribe("t").await.unwrap();
        let liar = Keypair::generate().peer_id();
        h.gossip.peer_connected(liar, false).await;
        h.network.take();

        let author = Keypair::generate();
        let GossipSubRequest::Publish { topic, source, seqno, signature, .. } =
            signed_publish(&author, "t", 1, b"real")
        else {
            unreachable!()
        };
        let forged = GossipSubRequest::Publish {
            topic,
            source,
            seqno,
            data: b"fake".to_vec(),
            signature,
        };
        h.gossip.handle_message(&liar, forged).await.unwrap();

        assert!(h.messages.try_recv().is_err());
        assert!(!h.gossip.seen_cache().contains(&message_id(&author.peer_id(), 1)));
        assert!(h.gossip.peer_score(&liar).await < DEFAULT_PUBLISH_THRESHOLD);
        assert_eq!(h.network.count("publish"), 0);

        // Cooldown keeps the peer out of the mesh even if it asks.
        h.gossip
            .handle_message(&liar, GossipSubRequest::Graft { topic: "t".into() })
            .await
            .unwrap();
        assert!(!h.gossip.mesh_peers("t").await.contains(&liar));
        assert!(h.network.sent_to(&liar).iter().any(|m| m.kind() == "prune"));
    }

    #[tokio::test]
    async fn graylisted_peer_is_ignored() {
        let h = spawn();
        h.gossip.subscribe("t").await.unwrap();
        let liar = Keypair::generate().peer_id();
        h.gossip.peer_connected(liar, false).await;

        let author = Keypair::generate();
        for seqno in 1..=2 {
            let GossipSubRequest::Publish { topic, source, signature, .. } =
                signed_publish(&author, "t", seqno, b"real")
            else {
                unreachable!()
            };
            let forged = GossipSubRequest::Publish {
                topic,
                source,
                seqno,
                data: b"fake".to_vec(),
                signature,
            };
            h.gossip.handle_message(&liar, forged).await.unwrap();
        }
        assert!(h.gossip.peer_score(&liar).await < DEFAULT_GRAYLIST_THRESHOLD);

        h.gossip
            .handle_message(&liar, GossipSubRequest::Subscribe { topic: "t".into() })
            .await
            .unwrap();
        assert!(!h.gossip.topic_peers("t").await.contains(&liar));
    }

    #[tokio::test]
    async fn flooding_peer_is_rate_limited() {
        let config = GossipSubConfig {
            per_peer_rate_limit: 5,
            ..Default::default()
        };
        let mut h = spawn_with(config);
        let peers = add_subscribers(&h, "t", 1).await;
        h.gossip.subscribe("t").await.unwrap();

        let author = Keypair::generate();
        for seqno in 1..=10 {
            h.gossip
                .handle_message(&peers[0], signed_publish(&author, "t", seqno, b"spam"))
                .await
                .unwrap();
        }
        let mut delivered = 0;
        while h.messages.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 5);
        assert!(h.gossip.peer_score(&peers[0]).await < 0.0);
    }

    #[tokio::test]
    async fn messages_for_unjoined_topics_are_not_delivered() {
        let mut h = spawn();
        let peer = Keypair::generate().peer_id();
        h.gossip.peer_connected(peer, false).await;
        let author = Keypair::generate();
        h.gossip
            .handle_message(&peer, signed_publish(&author, "other", 1, b"x"))
            .await
            .unwrap();
        assert!(h.messages.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_grafts_into_band() {
        let h = spawn();
        h.gossip.subscribe("t").await.unwrap();
        add_subscribers(&h, "t", 20).await;

        // Subscriptions arriving while below D_low are grafted immediately.
        let mesh = h.gossip.mesh_peers("t").await;
        assert!(mesh.len() >= DEFAULT_MESH_N_LOW);

        tokio::time::sleep(DEFAULT_HEARTBEAT_INTERVAL * 2).await;
        let mesh = h.gossip.mesh_peers("t").await;
        assert!(mesh.len() >= DEFAULT_MESH_N_LOW && mesh.len() <= DEFAULT_MESH_N_HIGH);
        assert_eq!(h.gossip.membership("t").await, Membership::Meshed);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_prunes_oversized_mesh() {
        let h = spawn();
        h.gossip.subscribe("t").await.unwrap();

        let mut grafters = Vec::new();
        for _ in 0..20 {
            let peer = Keypair::generate().peer_id();
            h.gossip.peer_connected(peer, false).await;
            h.gossip
                .handle_message(&peer, GossipSubRequest::Graft { topic: "t".into() })
                .await
                .unwrap();
            grafters.push(peer);
        }
        assert_eq!(h.gossip.mesh_peers("t").await.len(), 20);

        tokio::time::sleep(DEFAULT_HEARTBEAT_INTERVAL * 2).await;
        let mesh = h.gossip.mesh_peers("t").await;
        assert!(mesh.len() <= DEFAULT_MESH_N_HIGH);
        assert!(mesh.len() >= DEFAULT_MESH_N_LOW);

        let pruned = grafters.iter().find(|p| !mesh.contains(p)).copied().unwrap();
        let prunes: Vec<_> = h
            .network
            .sent_to(&pruned)
            .into_iter()
            .filter(|m| matches!(m, GossipSubRequest::Prune { .. }))
            .collect();
        assert_eq!(prunes.len(), 1);

        // A pruned peer that grafts again during backoff is refused.
        h.gossip
            .handle_message(&pruned, GossipSubRequest::Graft { topic: "t".into() })
            .await
            .unwrap();
        assert!(!h.gossip.mesh_peers("t").await.contains(&pruned));
    }

    #[tokio::test(start_paused = true)]
    async fn sparse_topic_asks_for_more_peers() {
        let mut h = spawn();
        add_subscribers(&h, "t", 1).await;
        h.gossip.subscribe("t").await.unwrap();

        tokio::time::sleep(DEFAULT_HEARTBEAT_INTERVAL * 2).await;
        let request = h.peer_requests.recv().await.unwrap();
        assert!(matches!(request, PeerRequest::MorePeers { topic, wanted } if topic == "t" && wanted > 0));
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_prunes_and_leaves() {
        let h = spawn();
        let peers = add_subscribers(&h, "t", 2).await;
        h.gossip.subscribe("t").await.unwrap();
        h.network.take();

        h.gossip.unsubscribe("t").await.unwrap();
        assert_eq!(h.gossip.membership("t").await, Membership::Leaving);
        assert!(h.gossip.subscriptions().await.is_empty());
        for peer in &peers {
            let sent = h.network.sent_to(peer);
            assert!(sent.iter().any(|m| matches!(m, GossipSubRequest::Prune { .. })));
            assert!(sent.contains(&GossipSubRequest::Unsubscribe { topic: "t".into() }));
        }

        tokio::time::sleep(DEFAULT_HEARTBEAT_INTERVAL * 2).await;
        assert_eq!(h.gossip.membership("t").await, Membership::NotJoined);
    }

    #[tokio::test(start_paused = true)]
    async fn fanout_publish_and_expiry() {
        let config = GossipSubConfig {
            flood_publish: false,
            ..Default::default()
        };
        let h = spawn_with(config);
        add_subscribers(&h, "news", 10).await;

        h.gossip.publish("news", b"1".to_vec()).await.unwrap();
        let first: HashSet<PeerId> = h.network.take().into_iter().map(|(to, _)| to).collect();
        assert_eq!(first.len(), DEFAULT_MESH_N);

        h.gossip.publish("news", b"2".to_vec()).await.unwrap();
        let second: HashSet<PeerId> = h
            .network
            .take()
            .into_iter()
            .filter(|(_, m)| m.kind() == "publish")
            .map(|(to, _)| to)
            .collect();
        assert_eq!(first, second);
        assert_eq!(h.gossip.membership("news").await, Membership::NotJoined);

        tokio::time::sleep(DEFAULT_FANOUT_TTL + DEFAULT_HEARTBEAT_INTERVAL * 2).await;
        h.network.take();
        // After expiry a new fanout is chosen; it still has D members.
        h.gossip.publish("news", b"3".to_vec()).await.unwrap();
        assert_eq!(h.network.count("publish"), DEFAULT_MESH_N);
    }

    #[tokio::test]
    async fn subscribing_adopts_fanout_peers() {
        let config = GossipSubConfig {
            flood_publish: false,
            ..Default::default()
        };
        let h = spawn_with(config);
        add_subscribers(&h, "news", 3).await;
        h.gossip.publish("news", b"1".to_vec()).await.unwrap();
        h.gossip.subscribe("news").await.unwrap();
        assert_eq!(h.gossip.mesh_peers("news").await.len(), 3);
    }

    #[tokio::test]
    async fn ihave_triggers_iwant_and_iwant_is_served() {
        let mut h = spawn();
        let peers = add_subscribers(&h, "t", 1).await;
        h.gossip.subscribe("t").await.unwrap();
        let advertiser = peers[0];
        h.network.take();

        let author = Keypair::generate();
        let id = message_id(&author.peer_id(), 3);
        h.gossip
            .handle_message(&advertiser, GossipSubRequest::IHave { topic: "t".into(), msg_ids: vec![id] })
            .await
            .unwrap();
        assert_eq!(
            h.network.sent_to(&advertiser),
            vec![GossipSubRequest::IWant { msg_ids: vec![id] }]
        );

        h.gossip
            .handle_message(&advertiser, signed_publish(&author, "t", 3, b"pulled"))
            .await
            .unwrap();
        assert_eq!(h.messages.recv().await.unwrap().data, b"pulled");

        // Now we can serve it to someone else.
        let asker = Keypair::generate().peer_id();
        h.gossip.peer_connected(asker, false).await;
        h.gossip
            .handle_message(&asker, GossipSubRequest::IWant { msg_ids: vec![id, [9; 32]] })
            .await
            .unwrap();
        let served: Vec<_> = h
            .network
            .sent_to(&asker)
            .into_iter()
            .filter(|m| m.kind() == "publish")
            .collect();
        assert_eq!(served.len(), 1);
        assert!(matches!(&served[0], GossipSubRequest::Publish { data, .. } if data == b"pulled"));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_iwant_moves_to_next_advertiser() {
        let h = spawn();
        let peers = add_subscribers(&h, "t", 2).await;
        h.gossip.subscribe("t").await.unwrap();
        h.network.take();

        let id = [5u8; 32];
        for peer in &peers {
            h.gossip
                .handle_message(peer, GossipSubRequest::IHave { topic: "t".into(), msg_ids: vec![id] })
                .await
                .unwrap();
        }
        let want = GossipSubRequest::IWant { msg_ids: vec![id] };
        assert_eq!(h.network.sent_to(&peers[0]), vec![want.clone()]);
        assert!(h.network.sent_to(&peers[1]).is_empty());

        tokio::time::sleep(DEFAULT_IHAVE_TIMEOUT + DEFAULT_HEARTBEAT_INTERVAL * 2).await;
        h.gossip.subscriptions().await;
        assert!(h.network.sent_to(&peers[1]).contains(&want));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_gossips_to_non_mesh_subscribers() {
        let config = GossipSubConfig {
            mesh_n: 1,
            mesh_n_low: 1,
            mesh_n_high: 1,
            mesh_outbound_min: 0,
            flood_publish: false,
            ..Default::default()
        };
        let h = spawn_with(config);
        let peers = add_subscribers(&h, "t", 3).await;
        h.gossip.subscribe("t").await.unwrap();
        let id = h.gossip.publish("t", b"gossip me".to_vec()).await.unwrap();
        let mesh = h.gossip.mesh_peers("t").await;
        assert_eq!(mesh.len(), 1);

        tokio::time::sleep(DEFAULT_HEARTBEAT_INTERVAL * 2).await;
        h.gossip.subscriptions().await;
        for peer in peers.iter().filter(|p| !mesh.contains(p)) {
            assert!(h.network.sent_to(peer).iter().any(
                |m| matches!(m, GossipSubRequest::IHave { msg_ids, .. } if msg_ids.contains(&id))
            ));
        }
    }

    #[tokio::test]
    async fn prune_with_peer_exchange_requests_connections() {
        let mut h = spawn();
        let peers = add_subscribers(&h, "t", 1).await;
        h.gossip.subscribe("t").await.unwrap();
        let suggested = Keypair::generate().peer_id();

        h.gossip
            .handle_message(&peers[0], GossipSubRequest::Prune {
                topic: "t".into(),
                peers: vec![suggested],
                backoff_secs: Some(30),
            })
            .await
            .unwrap();
        assert!(h.gossip.mesh_peers("t").await.is_empty());
        loop {
            match h.peer_requests.recv().await.unwrap() {
                PeerRequest::MorePeers { .. } => continue,
                exchange => {
                    assert_eq!(exchange, PeerRequest::Exchange { topic: "t".into(), peers: vec![suggested] });
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn disconnect_removes_peer_everywhere() {
        let h = spawn();
        let peers = add_subscribers(&h, "t", 2).await;
        h.gossip.subscribe("t").await.unwrap();
        h.gossip.peer_disconnected(peers[0]).await;
        assert_eq!(h.gossip.mesh_peers("t").await, vec![peers[1]]);
        assert_eq!(h.gossip.topic_peers("t").await, vec![peers[1]]);
    }
}
