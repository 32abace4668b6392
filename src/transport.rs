//! # Transport Drivers
//!
//! A transport turns a [`Multiaddr`] into a raw bidirectional connection and
//! accepts raw connections on a listen address. Drivers know nothing about
//! peers, encryption or streams; that is layered on top by the security
//! upgrade and the multiplexer.
//!
//! ```text
//!                   ┌───────────────────┐
//!  Multiaddr ──────►│ TransportRegistry │── tag "tcp"    ──► TcpTransport
//!                   │  (tag dispatch)   │── tag "quic"   ──► QuicTransport
//!                   └───────────────────┘── tag "memory" ──► MemoryTransport
//! ```
//!
//! Dispatch is by the transport tag each driver claims. An address no
//! driver claims fails fast with [`TransportError::NoTransport`].
//!
//! QUIC connections are already encrypted and multiplexed, so they surface
//! as [`RawIo::Quic`]; everything else is a byte stream ([`RawIo::Stream`]).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::crypto::{self, TLS_SERVER_NAME};
use crate::error::TransportError;
use crate::identity::Keypair;
use crate::multiaddr::{Host, Multiaddr, Protocol};

/// Inbound connections buffered per listener before accept backpressure.
const LISTENER_BACKLOG: usize = 64;

/// In-memory pipe capacity per direction.
const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

/// Default bound on a single dial attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// The physical channel underneath a connection.
pub enum RawIo {
    /// Plain byte stream. Needs the security upgrade and the multiplexer.
    Stream(BoxedStream),
    /// Established QUIC connection. Already encrypted and multiplexed.
    Quic(quinn::Connection),
}

/// A freshly dialed or accepted connection, before any upgrade.
pub struct RawConnection {
    pub remote_addr: Multiaddr,
    pub io: RawIo,
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.io {
            RawIo::Stream(_) => "stream",
            RawIo::Quic(_) => "quic",
        };
        f.debug_struct("RawConnection")
            .field("remote_addr", &self.remote_addr)
            .field("kind", &kind)
            .finish()
    }
}

/// A bound listen address and the connections arriving on it.
///
/// Dropping the listener stops accepting.
pub struct Listener {
    local_addr: Multiaddr,
    incoming: mpsc::Receiver<RawConnection>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    fn new(
        local_addr: Multiaddr,
        incoming: mpsc::Receiver<RawConnection>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            local_addr,
            incoming,
            task,
        }
    }

    pub fn local_addr(&self) -> &Multiaddr {
        &self.local_addr
    }

    /// Next inbound connection, or `None` once the listener is closed.
    pub async fn accept(&mut self) -> Option<RawConnection> {
        self.incoming.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Tag this driver claims; matched against [`Multiaddr::transport_tag`].
    fn tag(&self) -> &'static str;

    /// Dial preference when a peer has several addresses. Lower dials first.
    fn rank(&self) -> u8;

    async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection, TransportError>;

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError>;
}

// ============================================================================
// Registry
// ============================================================================

/// Capability-tagged set of transport drivers.
#[derive(Clone)]
pub struct TransportRegistry {
    drivers: Vec<Arc<dyn Transport>>,
    dial_timeout: Duration,
}

impl TransportRegistry {
    pub fn new(dial_timeout: Duration) -> Self {
        Self {
            drivers: Vec::new(),
            dial_timeout,
        }
    }

    pub fn with(mut self, driver: impl Transport) -> Self {
        self.register(Arc::new(driver));
        self
    }

    pub fn register(&mut self, driver: Arc<dyn Transport>) {
        self.drivers.retain(|d| d.tag() != driver.tag());
        self.drivers.push(driver);
    }

    pub fn tags(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.tag()).collect()
    }

    fn driver_for(&self, addr: &Multiaddr) -> Result<&Arc<dyn Transport>, TransportError> {
        let tag = addr
            .transport_tag()
            .ok_or_else(|| TransportError::NoTransport(addr.clone()))?;
        self.drivers
            .iter()
            .find(|d| d.tag() == tag)
            .ok_or_else(|| TransportError::NoTransport(addr.clone()))
    }

    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        self.driver_for(addr).is_ok()
    }

    /// Dial rank of the driver claiming `addr`, if any.
    pub fn rank(&self, addr: &Multiaddr) -> Option<u8> {
        self.driver_for(addr).ok().map(|d| d.rank())
    }

    /// Dial `addr` with the driver claiming it, bounded by the dial timeout.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection, TransportError> {
        let driver = self.driver_for(addr)?;
        let dial_addr = addr.without_p2p();
        trace!(addr = %dial_addr, transport = driver.tag(), "dialing");
        match tokio::time::timeout(self.dial_timeout, driver.dial(&dial_addr)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(dial_addr)),
        }
    }

    pub async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
        let driver = self.driver_for(addr)?;
        driver.listen(addr).await
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("drivers", &self.tags())
            .field("dial_timeout", &self.dial_timeout)
            .finish()
    }
}

async fn resolve(addr: &Multiaddr, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
    match addr.host() {
        Some(Host::Ip(ip)) => Ok(vec![SocketAddr::new(ip, port)]),
        Some(Host::Dns(name)) => {
            let want_v4 = addr.iter().any(|p| matches!(p, Protocol::Dns4(_)));
            let want_v6 = addr.iter().any(|p| matches!(p, Protocol::Dns6(_)));
            let resolved: Vec<SocketAddr> = tokio::net::lookup_host((name.as_str(), port))
                .await
                .map_err(|e| TransportError::from_io(addr, &e))?
                .filter(|sa| (!want_v4 || sa.is_ipv4()) && (!want_v6 || sa.is_ipv6()))
                .collect();
            if resolved.is_empty() {
                return Err(TransportError::Unreachable {
                    addr: addr.clone(),
                    reason: format!("{name} did not resolve"),
                });
            }
            Ok(resolved)
        }
        None => Err(TransportError::NoTransport(addr.clone())),
    }
}

fn listen_socket_addr(addr: &Multiaddr, port: Option<u16>) -> Result<SocketAddr, TransportError> {
    match (addr.host(), port) {
        (Some(Host::Ip(ip)), Some(port)) => Ok(SocketAddr::new(ip, port)),
        _ => Err(TransportError::Listen {
            addr: addr.clone(),
            reason: "listen address needs an ip4/ip6 host and a port".into(),
        }),
    }
}

// ============================================================================
// TCP
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn tag(&self) -> &'static str {
        "tcp"
    }

    fn rank(&self) -> u8 {
        1
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection, TransportError> {
        let port = addr
            .tcp_port()
            .ok_or_else(|| TransportError::NoTransport(addr.clone()))?;
        let targets = resolve(addr, port).await?;

        let mut last_err = None;
        for target in targets {
            match tokio::net::TcpStream::connect(target).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(RawConnection {
                        remote_addr: Multiaddr::tcp(target),
                        io: RawIo::Stream(Box::new(stream)),
                    });
                }
                Err(e) => last_err = Some(TransportError::from_io(addr, &e)),
            }
        }
        Err(last_err.unwrap_or_else(|| TransportError::Unreachable {
            addr: addr.clone(),
            reason: "no addresses".into(),
        }))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
        let bind = listen_socket_addr(addr, addr.tcp_port())?;
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .map_err(|e| TransportError::Listen {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let local = listener.local_addr().map_err(|e| TransportError::Listen {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let _ = stream.set_nodelay(true);
                        let raw = RawConnection {
                            remote_addr: Multiaddr::tcp(remote),
                            io: RawIo::Stream(Box::new(stream)),
                        };
                        if tx.send(raw).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });

        debug!(addr = %Multiaddr::tcp(local), "tcp listening");
        Ok(Listener::new(Multiaddr::tcp(local), rx, Some(task)))
    }
}

// ============================================================================
// In-process memory transport
// ============================================================================

/// Listener table shared by every [`MemoryTransport`] that should be able to
/// reach the others. Construct one per test or embedding and hand it to each
/// node.
#[derive(Debug)]
pub struct MemoryHub {
    listeners: Mutex<HashMap<u64, mpsc::Sender<RawConnection>>>,
    next_port: AtomicU64,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            // Ports handed out for `/memory/0` start high to stay clear of
            // explicitly chosen ones.
            next_port: AtomicU64::new(1 << 32),
        }
    }
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn allocate_port(&self) -> u64 {
        self.next_port.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn tag(&self) -> &'static str {
        "memory"
    }

    fn rank(&self) -> u8 {
        0
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection, TransportError> {
        let port = addr
            .memory_port()
            .ok_or_else(|| TransportError::NoTransport(addr.clone()))?;

        let sender = {
            let listeners = self.hub.listeners.lock().await;
            listeners.get(&port).cloned()
        };
        let Some(sender) = sender else {
            return Err(TransportError::Refused(addr.clone()));
        };

        let (local, remote) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        let dialer_port = self.hub.allocate_port();
        let inbound = RawConnection {
            remote_addr: Multiaddr::memory(dialer_port),
            io: RawIo::Stream(Box::new(remote)),
        };
        if sender.send(inbound).await.is_err() {
            self.hub.listeners.lock().await.remove(&port);
            return Err(TransportError::Refused(addr.clone()));
        }

        Ok(RawConnection {
            remote_addr: Multiaddr::memory(port),
            io: RawIo::Stream(Box::new(local)),
        })
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
        let requested = addr
            .memory_port()
            .ok_or_else(|| TransportError::NoTransport(addr.clone()))?;

        let mut listeners = self.hub.listeners.lock().await;
        listeners.retain(|_, tx| !tx.is_closed());

        let port = if requested == 0 {
            self.hub.allocate_port()
        } else {
            requested
        };
        if listeners.contains_key(&port) {
            return Err(TransportError::Listen {
                addr: addr.clone(),
                reason: "memory port in use".into(),
            });
        }

        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        listeners.insert(port, tx);
        Ok(Listener::new(Multiaddr::memory(port), rx, None))
    }
}

// ============================================================================
// QUIC
// ============================================================================

/// QUIC over UDP. TLS 1.3 with self-signed Ed25519 certificates whose key
/// is the local PeerId.
///
/// The first listening endpoint of each address family is reused for
/// outbound dials; otherwise a client-only endpoint is bound on demand.
pub struct QuicTransport {
    server_config: quinn::ServerConfig,
    client_config: quinn::ClientConfig,
    endpoints: Mutex<Vec<quinn::Endpoint>>,
}

impl QuicTransport {
    pub fn new(keypair: &Keypair) -> anyhow::Result<Self> {
        let (certs, key) = crypto::generate_ed25519_cert(keypair)?;
        let server_config = crypto::create_server_config(certs.clone(), key.clone_key())?;
        let client_config = crypto::create_client_config(certs, key)?;
        Ok(Self {
            server_config,
            client_config,
            endpoints: Mutex::new(Vec::new()),
        })
    }

    async fn endpoint_for(&self, target: &SocketAddr) -> std::io::Result<quinn::Endpoint> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(ep) = endpoints.iter().find(|ep| {
            ep.local_addr()
                .map(|a| a.is_ipv4() == target.is_ipv4())
                .unwrap_or(false)
        }) {
            return Ok(ep.clone());
        }
        let unspecified: IpAddr = if target.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let endpoint = quinn::Endpoint::client(SocketAddr::new(unspecified, 0))?;
        endpoints.push(endpoint.clone());
        Ok(endpoint)
    }
}

impl std::fmt::Debug for QuicTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicTransport").finish_non_exhaustive()
    }
}

fn map_quic_error(addr: &Multiaddr, err: quinn::ConnectionError) -> TransportError {
    match err {
        quinn::ConnectionError::TimedOut => TransportError::Timeout(addr.clone()),
        quinn::ConnectionError::ConnectionClosed(_) | quinn::ConnectionError::Reset => {
            TransportError::Refused(addr.clone())
        }
        other => TransportError::Unreachable {
            addr: addr.clone(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn tag(&self) -> &'static str {
        "quic"
    }

    fn rank(&self) -> u8 {
        0
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection, TransportError> {
        let port = addr
            .udp_port()
            .ok_or_else(|| TransportError::NoTransport(addr.clone()))?;
        let targets = resolve(addr, port).await?;

        let mut last_err = None;
        for target in targets {
            let endpoint = self
                .endpoint_for(&target)
                .await
                .map_err(|e| TransportError::from_io(addr, &e))?;
            let connecting =
                match endpoint.connect_with(self.client_config.clone(), target, TLS_SERVER_NAME) {
                    Ok(c) => c,
                    Err(e) => {
                        last_err = Some(TransportError::Unreachable {
                            addr: addr.clone(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };
            match connecting.await {
                Ok(connection) => {
                    return Ok(RawConnection {
                        remote_addr: Multiaddr::quic(target),
                        io: RawIo::Quic(connection),
                    });
                }
                Err(e) => last_err = Some(map_quic_error(addr, e)),
            }
        }
        Err(last_err.unwrap_or_else(|| TransportError::Unreachable {
            addr: addr.clone(),
            reason: "no addresses".into(),
        }))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
        let bind = listen_socket_addr(addr, addr.udp_port())?;
        let listen_err = |e: std::io::Error| TransportError::Listen {
            addr: addr.clone(),
            reason: e.to_string(),
        };
        let mut endpoint =
            quinn::Endpoint::server(self.server_config.clone(), bind).map_err(listen_err)?;
        endpoint.set_default_client_config(self.client_config.clone());
        let local = endpoint.local_addr().map_err(listen_err)?;
        self.endpoints.lock().await.insert(0, endpoint.clone());

        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        let task = tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => {
                            let raw = RawConnection {
                                remote_addr: Multiaddr::quic(connection.remote_address()),
                                io: RawIo::Quic(connection),
                            };
                            let _ = tx.send(raw).await;
                        }
                        Err(e) => debug!(error = %e, "quic handshake failed"),
                    }
                });
            }
        });

        debug!(addr = %Multiaddr::quic(local), "quic listening");
        Ok(Listener::new(Multiaddr::quic(local), rx, Some(task)))
    }
}
