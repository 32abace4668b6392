//! # uconnect - Transport-Agnostic Peer-to-Peer Overlay
//!
//! uconnect lets independent processes find each other, connect over
//! whichever transport reaches, and chat through a brokerless gossip mesh:
//!
//! - **Identity**: Ed25519 keypairs; the 32-byte public key is the PeerId
//! - **Transport**: pluggable TCP, QUIC and in-process memory drivers behind
//!   a tag-dispatched registry, with staggered dial races
//! - **Security**: X25519 + ChaCha20-Poly1305 handshake on byte streams,
//!   TLS 1.3 with Ed25519 certificates on QUIC
//! - **Multiplexing**: credit-based streams over one secured connection,
//!   with multistream-style protocol negotiation per stream
//! - **PubSub**: GossipSub meshes with scoring and IHAVE/IWANT repair
//! - **Chat**: JSON messages on `universal-connectivity` room topics
//!
//! ## Architecture
//!
//! Stateful components follow the actor pattern:
//! - Each component (Swarm, GossipSub, Discovery) has a public handle and a
//!   private actor
//! - Handles are cheap to clone and communicate via async channels
//! - Actors own all mutable state and process commands sequentially
//!
//! Shared tables (memory hub, discovery, connection manager) are values
//! passed in at construction; nothing is process-global.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs, PeerIds, persisted key material |
//! | `multiaddr` | Self-describing addresses |
//! | `transport` | Transport drivers and the registry |
//! | `dial` | Staggered dial races |
//! | `security` | Stream transport handshake and encrypted framing |
//! | `muxer` | Stream multiplexer |
//! | `connection` | Upgrade pipeline and the unified `Connection` |
//! | `negotiate` | Per-stream protocol selection |
//! | `swarm` | Connection manager and stream dispatch |
//! | `discovery` | Peer addresses, backoff and bootstrap |
//! | `gossipsub` | Epidemic broadcast for PubSub |
//! | `chat` | Chat payloads and room topics |
//! | `crypto` | Signatures and TLS certificate handling |
//! | `protocols` | Protocol ids and the traits between layers |
//! | `messages` | Serialization types for all wire protocols |

mod chat;
mod connection;
mod crypto;
mod dial;
mod discovery;
mod error;
mod gossipsub;
mod identity;
mod messages;
mod multiaddr;
mod muxer;
mod negotiate;
mod node;
mod protocols;
mod security;
mod swarm;
mod transport;

pub use chat::{CHAT_TOPIC, ChatMessage, DEFAULT_ROOM, MAX_CHAT_TEXT, room_for_topic, topic_for_room};
pub use connection::{Connection, Direction, Stream, UpgradeConfig, upgrade};
pub use crypto::SignatureError;
pub use dial::{DialOutcome, DialPolicy, TieBreak, race_dials};
pub use discovery::{AddressSource, Discovery, DiscoveryConfig, split_bootstrap};
pub use error::{DialError, MuxerError, NegotiationError, SecurityError, TransportError};
pub use gossipsub::{GossipSub, GossipSubConfig, Membership, MessageRejection, PeerRequest, ReceivedMessage, SeenCache};
pub use identity::{DEFAULT_KEY_PATH, Keypair, PeerId, load_or_generate};
pub use messages::{FileRequest, FileResponse, GossipSubRequest, IdentifyInfo, MessageId, PeerRecord, file_id};
pub use multiaddr::{Host, Multiaddr, MultiaddrError, Protocol};
pub use muxer::MuxerConfig;
pub use negotiate::{select_inbound, select_outbound};
pub use node::{DEFAULT_EVENT_BUFFER, FILE_TOPIC, Node, NodeConfig, NodeEvent, NodeStatus, PEER_DISCOVERY_TOPIC};
pub use protocols::{
    FILE_EXCHANGE_PROTOCOL, GOSSIPSUB_PROTOCOL, GossipSubRpc, IDENTIFY_PROTOCOL, InboundHandler, SUPPORTED_PROTOCOLS,
};
pub use swarm::{Dialed, Swarm, SwarmConfig, SwarmEvent};
pub use transport::{
    Listener, MemoryHub, MemoryTransport, QuicTransport, RawConnection, RawIo, TcpTransport, Transport,
    TransportRegistry,
};
