//! Secured, multiplexed connections with one API for every transport.
//!
//! Byte-stream transports go through the security handshake and the
//! multiplexer; QUIC connections only confirm the peer certificate and use
//! native streams. Either way callers get a [`Connection`] and [`Stream`]s.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{MuxerError, SecurityError};
use crate::identity::{Keypair, PeerId};
use crate::multiaddr::Multiaddr;
use crate::muxer::{MuxedConnection, MuxedStream, MuxerConfig};
use crate::security::{self, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::transport::{RawConnection, RawIo};

pub use crate::muxer::Direction;

/// Largest length-prefixed message accepted by [`Stream::read_message`]
/// unless the caller asks for less. Fits a maximum-size file response.
pub const MAX_STREAM_MESSAGE: usize = crate::messages::MAX_DESERIALIZE_SIZE as usize;

#[derive(Clone, Debug)]
pub struct UpgradeConfig {
    pub handshake_timeout: Duration,
    pub muxer: MuxerConfig,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            muxer: MuxerConfig::default(),
        }
    }
}

/// Secure and multiplex a raw connection.
///
/// `expected` is checked on outbound connections when the dialer knows who
/// it is calling. `id` is assigned by the owner and only needs to be unique
/// among its own connections.
pub async fn upgrade(
    id: u64,
    raw: RawConnection,
    keypair: &Keypair,
    direction: Direction,
    expected: Option<PeerId>,
    config: &UpgradeConfig,
) -> Result<Connection, SecurityError> {
    let RawConnection { remote_addr, io } = raw;
    let (peer, io) = match io {
        RawIo::Stream(stream) => {
            let secure = match direction {
                Direction::Outbound => {
                    security::upgrade_outbound(stream, keypair, expected, config.handshake_timeout)
                        .await?
                }
                Direction::Inbound => {
                    security::upgrade_inbound(stream, keypair, config.handshake_timeout).await?
                }
            };
            let peer = secure.remote_peer();
            let muxed = MuxedConnection::new(secure, direction, config.muxer.clone());
            (peer, ConnectionIo::Muxed(muxed))
        }
        RawIo::Quic(connection) => {
            let expected = match direction {
                Direction::Outbound => expected,
                Direction::Inbound => None,
            };
            let peer = security::confirm_quic(&connection, expected)?;
            (peer, ConnectionIo::Quic(connection))
        }
    };

    Ok(Connection {
        inner: Arc::new(ConnectionInner {
            id,
            peer,
            remote_addr,
            direction,
            io,
        }),
    })
}

// ============================================================================
// Connection
// ============================================================================

enum ConnectionIo {
    Muxed(MuxedConnection),
    Quic(quinn::Connection),
}

struct ConnectionInner {
    id: u64,
    peer: PeerId,
    remote_addr: Multiaddr,
    direction: Direction,
    io: ConnectionIo,
}

/// Authenticated connection to one remote peer. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

fn quic_closed(err: quinn::ConnectionError) -> MuxerError {
    MuxerError::ConnectionClosed(err.to_string())
}

impl Connection {
    /// Process-unique id; distinguishes a replacement connection to the same
    /// peer from the one it replaced.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer(&self) -> PeerId {
        self.inner.peer
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.inner.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub async fn open_stream(&self) -> Result<Stream, MuxerError> {
        match &self.inner.io {
            ConnectionIo::Muxed(muxed) => Ok(Stream::muxed(muxed.open_stream().await?)),
            ConnectionIo::Quic(conn) => {
                let (send, recv) = conn.open_bi().await.map_err(quic_closed)?;
                Ok(Stream::quic(send, recv))
            }
        }
    }

    pub async fn accept_stream(&self) -> Result<Stream, MuxerError> {
        match &self.inner.io {
            ConnectionIo::Muxed(muxed) => Ok(Stream::muxed(muxed.accept_stream().await?)),
            ConnectionIo::Quic(conn) => {
                let (send, recv) = conn.accept_bi().await.map_err(quic_closed)?;
                Ok(Stream::quic(send, recv))
            }
        }
    }

    /// Close the connection; every stream on it fails with `reason`.
    pub fn close(&self, reason: &str) {
        debug!(peer = %self.inner.peer.short(), id = self.inner.id, reason, "closing connection");
        match &self.inner.io {
            ConnectionIo::Muxed(muxed) => muxed.close(reason),
            ConnectionIo::Quic(conn) => conn.close(0u32.into(), reason.as_bytes()),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner.io {
            ConnectionIo::Muxed(muxed) => muxed.close_reason().is_some(),
            ConnectionIo::Quic(conn) => conn.close_reason().is_some(),
        }
    }

    /// Resolves with the reason once the connection has closed.
    pub async fn closed(&self) -> String {
        match &self.inner.io {
            ConnectionIo::Muxed(muxed) => muxed.closed().await,
            ConnectionIo::Quic(conn) => conn.closed().await.to_string(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("remote_addr", &self.inner.remote_addr)
            .field("direction", &self.inner.direction)
            .finish()
    }
}

// ============================================================================
// Stream
// ============================================================================

enum StreamIo {
    Muxed(MuxedStream),
    Quic {
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    },
}

/// Bidirectional logical channel inside a [`Connection`].
pub struct Stream {
    io: StreamIo,
}

impl Stream {
    fn muxed(stream: MuxedStream) -> Self {
        Self {
            io: StreamIo::Muxed(stream),
        }
    }

    fn quic(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self {
            io: StreamIo::Quic { send, recv },
        }
    }

    pub fn id(&self) -> u64 {
        match &self.io {
            StreamIo::Muxed(s) => s.id() as u64,
            StreamIo::Quic { send, .. } => send.id().index(),
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), MuxerError> {
        match &mut self.io {
            StreamIo::Muxed(s) => s.write_all(data).await,
            StreamIo::Quic { send, .. } => send.write_all(data).await.map_err(|e| match e {
                quinn::WriteError::Stopped(_) => MuxerError::StreamReset,
                quinn::WriteError::ConnectionLost(e) => quic_closed(e),
                quinn::WriteError::ClosedStream => MuxerError::StreamClosed,
                other => MuxerError::io(other),
            }),
        }
    }

    /// `Ok(0)` means the remote finished its side.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MuxerError> {
        match &mut self.io {
            StreamIo::Muxed(s) => s.read(buf).await,
            StreamIo::Quic { recv, .. } => match recv.read(buf).await {
                Ok(Some(n)) => Ok(n),
                Ok(None) => Ok(0),
                Err(quinn::ReadError::Reset(_)) => Err(MuxerError::StreamReset),
                Err(quinn::ReadError::ConnectionLost(e)) => Err(quic_closed(e)),
                Err(other) => Err(MuxerError::io(other)),
            },
        }
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), MuxerError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(MuxerError::Io("unexpected end of stream".into()));
            }
            filled += n;
        }
        Ok(())
    }

    /// Write one u32 big-endian length-prefixed message.
    pub async fn write_message(&mut self, payload: &[u8]) -> Result<(), MuxerError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| MuxerError::Io("message too large".into()))?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(payload);
        self.write_all(&frame).await
    }

    /// Read one length-prefixed message. `Ok(None)` on a clean end of stream
    /// at a message boundary.
    pub async fn read_message(&mut self, max_len: usize) -> Result<Option<Vec<u8>>, MuxerError> {
        let mut len_buf = [0u8; 4];
        let first = self.read(&mut len_buf).await?;
        if first == 0 {
            return Ok(None);
        }
        if first < len_buf.len() {
            self.read_exact(&mut len_buf[first..]).await?;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_len.min(MAX_STREAM_MESSAGE) {
            return Err(MuxerError::Io(format!("message of {len} bytes exceeds limit")));
        }
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }

    /// Finish the write side. The remote reads end-of-stream.
    pub fn close(&mut self) {
        match &mut self.io {
            StreamIo::Muxed(s) => s.close(),
            StreamIo::Quic { send, .. } => {
                let _ = send.finish();
            }
        }
    }

    /// Abort both directions.
    pub fn reset(self) {
        match self.io {
            StreamIo::Muxed(s) => s.reset(),
            StreamIo::Quic { mut send, mut recv } => {
                let _ = send.reset(0u32.into());
                let _ = recv.stop(0u32.into());
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.io {
            StreamIo::Muxed(_) => "muxed",
            StreamIo::Quic { .. } => "quic",
        };
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("kind", &kind)
            .finish()
    }
}

/// Two connected peers over a fresh memory hub.
#[cfg(test)]
pub(crate) async fn test_pair() -> (Connection, Connection) {
    use crate::transport::{MemoryHub, MemoryTransport, Transport};

    let transport = MemoryTransport::new(MemoryHub::new());
    let mut listener = transport
        .listen(&Multiaddr::memory(0))
        .await
        .expect("listen");
    let addr = listener.local_addr().clone();
    let (a, b) = (Keypair::generate(), Keypair::generate());
    let config = UpgradeConfig::default();
    let outbound = transport.dial(&addr).await.expect("dial");
    let inbound = listener.accept().await.expect("accept");
    let (ca, cb) = tokio::join!(
        upgrade(1, outbound, &a, Direction::Outbound, None, &config),
        upgrade(2, inbound, &b, Direction::Inbound, None, &config)
    );
    (ca.expect("outbound upgrade"), cb.expect("inbound upgrade"))
}
