//! # Wire Protocol Messages
//!
//! Serializable message types for every stream protocol the node speaks.
//! Messages are bincode-encoded and carried as u32 length-prefixed frames on
//! a negotiated stream. Deserialization is always size-bounded.
//!
//! | Protocol | Message types |
//! |----------|---------------|
//! | `/meshsub/1.1.0` | [`GossipSubRequest`] (one frame per message) |
//! | `/ipfs/id/1.0.0` | [`IdentifyInfo`] (one frame each way) |
//! | `/universal-connectivity-file/1` | [`FileRequest`] → [`FileResponse`] |
//!
//! [`PeerRecord`] travels as gossip payload on the peer discovery topic.
//!
//! ## Message IDs
//!
//! Gossip messages are identified by `blake3(source ‖ seqno)`. The id is
//! recomputed by every receiver and never taken from the wire.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::crypto::{PEER_RECORD_SIGNATURE_DOMAIN, SignatureError, sign_with_domain, verify_with_domain};
use crate::identity::{Keypair, PeerId, now_ms};
use crate::multiaddr::Multiaddr;

pub type MessageId = [u8; 32];

/// Largest file served over the file exchange protocol.
pub const MAX_FILE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization, with room for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_FILE_SIZE as u64) + 4096;

/// Largest single gossip frame.
pub const MAX_GOSSIP_FRAME: usize = 256 * 1024;

/// Addresses carried per identify message or peer record.
pub const MAX_ADVERTISED_ADDRS: usize = 16;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub fn message_id(source: &PeerId, seqno: u64) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(&seqno.to_be_bytes());
    *hasher.finalize().as_bytes()
}

// ============================================================================
// Gossip
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipSubRequest {
    /// The sender is interested in `topic`.
    Subscribe { topic: String },
    /// The sender is no longer interested in `topic`.
    Unsubscribe { topic: String },
    /// GRAFT - request to join the sender's mesh for a topic.
    Graft { topic: String },
    /// PRUNE - the sender dropped us from its mesh.
    Prune {
        topic: String,
        /// Peer exchange: other subscribers the pruned peer could mesh with.
        peers: Vec<PeerId>,
        /// Seconds before the pruned peer may GRAFT again. `None` means the
        /// receiver's default backoff.
        backoff_secs: Option<u64>,
    },
    /// Full message.
    Publish {
        topic: String,
        source: PeerId,
        seqno: u64,
        data: Vec<u8>,
        signature: Vec<u8>,
    },
    /// IHAVE - ids of recent messages the sender can serve for a topic.
    IHave { topic: String, msg_ids: Vec<MessageId> },
    /// IWANT - request full messages by id.
    IWant { msg_ids: Vec<MessageId> },
}

impl GossipSubRequest {
    pub fn topic(&self) -> Option<&str> {
        match self {
            GossipSubRequest::Subscribe { topic } => Some(topic),
            GossipSubRequest::Unsubscribe { topic } => Some(topic),
            GossipSubRequest::Graft { topic } => Some(topic),
            GossipSubRequest::Prune { topic, .. } => Some(topic),
            GossipSubRequest::Publish { topic, .. } => Some(topic),
            GossipSubRequest::IHave { topic, .. } => Some(topic),
            GossipSubRequest::IWant { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GossipSubRequest::Subscribe { .. } => "subscribe",
            GossipSubRequest::Unsubscribe { .. } => "unsubscribe",
            GossipSubRequest::Graft { .. } => "graft",
            GossipSubRequest::Prune { .. } => "prune",
            GossipSubRequest::Publish { .. } => "publish",
            GossipSubRequest::IHave { .. } => "ihave",
            GossipSubRequest::IWant { .. } => "iwant",
        }
    }
}

// ============================================================================
// Identify
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyInfo {
    pub protocol_version: String,
    pub agent_version: String,
    /// Addresses the sender listens on or was told it is reachable at.
    pub listen_addrs: Vec<Multiaddr>,
    /// The address the sender sees us connecting from.
    pub observed_addr: Option<Multiaddr>,
    /// Stream protocols the sender accepts.
    pub protocols: Vec<String>,
}

// ============================================================================
// File exchange
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileRequest {
    Get { file_id: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileResponse {
    Found { data: Vec<u8> },
    NotFound,
}

/// Content address of a shared file: hex-encoded blake3 of its bytes.
pub fn file_id(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

// ============================================================================
// Signed peer records
// ============================================================================

/// A peer's self-signed claim of where it can be reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
}

impl PeerRecord {
    pub fn new_signed(keypair: &Keypair, addrs: Vec<Multiaddr>) -> Self {
        let peer = keypair.peer_id();
        let addrs: Vec<Multiaddr> = addrs
            .into_iter()
            .take(MAX_ADVERTISED_ADDRS)
            .map(|a| a.without_p2p())
            .collect();
        let timestamp_ms = now_ms();
        let payload = Self::signed_payload(&peer, &addrs, timestamp_ms);
        let signature = sign_with_domain(keypair, PEER_RECORD_SIGNATURE_DOMAIN, &payload);
        Self {
            peer,
            addrs,
            timestamp_ms,
            signature,
        }
    }

    /// Format: peer(32) || timestamp(8) || count(4) || (len(4) || addr)*
    fn signed_payload(peer: &PeerId, addrs: &[Multiaddr], timestamp_ms: u64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32 + 8 + 4 + addrs.len() * 32);
        payload.extend_from_slice(peer.as_bytes());
        payload.extend_from_slice(&timestamp_ms.to_be_bytes());
        payload.extend_from_slice(&(addrs.len() as u32).to_be_bytes());
        for addr in addrs {
            let text = addr.to_string();
            payload.extend_from_slice(&(text.len() as u32).to_be_bytes());
            payload.extend_from_slice(text.as_bytes());
        }
        payload
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        if self.addrs.len() > MAX_ADVERTISED_ADDRS {
            return Err(SignatureError::VerificationFailed);
        }
        let payload = Self::signed_payload(&self.peer, &self.addrs, self.timestamp_ms);
        verify_with_domain(&self.peer, PEER_RECORD_SIGNATURE_DOMAIN, &payload, &self.signature)
    }
}
