//! Error taxonomy for the connection stack.
//!
//! Each layer has its own enum so callers can tell a refused socket from a
//! failed handshake or a protocol the remote does not speak. None of these
//! are fatal to the node; they close at most one connection or stream.

use thiserror::Error;

use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no transport can handle {0}")]
    NoTransport(Multiaddr),
    #[error("{addr} unreachable: {reason}")]
    Unreachable { addr: Multiaddr, reason: String },
    #[error("dial to {0} timed out")]
    Timeout(Multiaddr),
    #[error("connection to {0} refused")]
    Refused(Multiaddr),
    #[error("cannot listen on {addr}: {reason}")]
    Listen { addr: Multiaddr, reason: String },
}

impl TransportError {
    /// Classify an I/O failure from a dial attempt.
    pub fn from_io(addr: &Multiaddr, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportError::Refused(addr.clone()),
            std::io::ErrorKind::TimedOut => TransportError::Timeout(addr.clone()),
            _ => TransportError::Unreachable {
                addr: addr.clone(),
                reason: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("security handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("remote identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: PeerId, actual: PeerId },
    #[error("security handshake timed out")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxerError {
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("stream reset by peer")]
    StreamReset,
    #[error("stream already closed for writing")]
    StreamClosed,
    #[error("too many concurrent streams")]
    TooManyStreams,
    #[error("stream i/o: {0}")]
    Io(String),
}

impl MuxerError {
    pub fn io(err: impl std::fmt::Display) -> Self {
        MuxerError::Io(err.to_string())
    }
}

impl From<MuxerError> for std::io::Error {
    fn from(err: MuxerError) -> Self {
        let kind = match err {
            MuxerError::ConnectionClosed(_) => std::io::ErrorKind::ConnectionAborted,
            MuxerError::StreamReset => std::io::ErrorKind::ConnectionReset,
            MuxerError::StreamClosed => std::io::ErrorKind::BrokenPipe,
            MuxerError::TooManyStreams => std::io::ErrorKind::WouldBlock,
            MuxerError::Io(_) => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("no common protocol")]
    NoCommonProtocol,
    #[error("protocol negotiation timed out")]
    NegotiationTimeout,
    #[error("malformed negotiation message: {0}")]
    Malformed(String),
    #[error(transparent)]
    Stream(#[from] MuxerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialError {
    #[error("no known addresses for {0}")]
    NoAddresses(PeerId),
    #[error("refusing to dial the local peer")]
    SelfDial,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error("all {} dial attempts failed", .0.len())]
    AllDialsFailed(Vec<(Multiaddr, DialError)>),
    #[error("connection limit reached")]
    ConnectionLimit,
    #[error("connection manager shut down")]
    Shutdown,
}

impl DialError {
    /// Per-address reasons when this is an `AllDialsFailed`.
    pub fn attempts(&self) -> &[(Multiaddr, DialError)] {
        match self {
            DialError::AllDialsFailed(attempts) => attempts,
            _ => &[],
        }
    }
}
