//! Stream protocol identifiers and the traits that decouple the overlay from
//! the connection layer.
//!
//! | Protocol | Id | Handled by |
//! |----------|----|------------|
//! | Gossip | [`GOSSIPSUB_PROTOCOL`] | [`crate::gossipsub`] via [`GossipSubRpc`] |
//! | Identify | [`IDENTIFY_PROTOCOL`] | [`crate::swarm`] |
//! | File exchange | [`FILE_EXCHANGE_PROTOCOL`] | [`crate::node`] |
//!
//! The gossip overlay only depends on [`GossipSubRpc`], so it can be driven
//! by the real swarm or by an in-memory fake in tests. In the other
//! direction the swarm hands inbound application traffic to an
//! [`InboundHandler`] installed by the node.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::PeerId;
use crate::messages::{FileRequest, FileResponse, GossipSubRequest};

pub const GOSSIPSUB_PROTOCOL: &str = "/meshsub/1.1.0";

pub const IDENTIFY_PROTOCOL: &str = "/ipfs/id/1.0.0";

pub const FILE_EXCHANGE_PROTOCOL: &str = "/universal-connectivity-file/1";

/// Version string exchanged in identify.
pub const PROTOCOL_VERSION: &str = "/uconnect/1.0.0";

pub const AGENT_VERSION: &str = concat!("uconnect/", env!("CARGO_PKG_VERSION"));

/// Every protocol an inbound stream may negotiate.
pub const SUPPORTED_PROTOCOLS: &[&str] = &[
    GOSSIPSUB_PROTOCOL,
    IDENTIFY_PROTOCOL,
    FILE_EXCHANGE_PROTOCOL,
];

/// Outbound path for gossip control and data messages.
#[async_trait]
pub trait GossipSubRpc: Send + Sync + 'static {
    /// Queue a gossip message for `to`. Fails if there is no live connection
    /// or the peer's outbound queue is full; the message is not retried.
    async fn send_gossipsub(&self, to: &PeerId, message: GossipSubRequest) -> Result<()>;
}

/// Receiver of inbound application traffic, installed on the swarm once the
/// components that consume it exist.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn on_gossip(&self, from: PeerId, message: GossipSubRequest);

    async fn on_file_request(&self, from: PeerId, request: FileRequest) -> FileResponse;
}
