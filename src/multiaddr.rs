//! # Multiaddresses
//!
//! A [`Multiaddr`] is a `/`-separated chain of `(protocol, value)` components
//! such as `/ip4/10.0.0.1/tcp/9092/p2p/<peer-hex>`. Only the transport driver
//! that claims an address interprets its network components; every other
//! layer treats it as an opaque value with an optional trailing `/p2p`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::identity::PeerId;

/// Upper bound on the textual length accepted by the parser.
pub const MAX_MULTIADDR_LEN: usize = 512;

/// Upper bound on components in one address.
const MAX_COMPONENTS: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Dns(String),
    Dns4(String),
    Dns6(String),
    Tcp(u16),
    Udp(u16),
    QuicV1,
    Memory(u64),
    P2p(PeerId),
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Protocol::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Protocol::Dns(host) => write!(f, "/dns/{host}"),
            Protocol::Dns4(host) => write!(f, "/dns4/{host}"),
            Protocol::Dns6(host) => write!(f, "/dns6/{host}"),
            Protocol::Tcp(port) => write!(f, "/tcp/{port}"),
            Protocol::Udp(port) => write!(f, "/udp/{port}"),
            Protocol::QuicV1 => write!(f, "/quic-v1"),
            Protocol::Memory(n) => write!(f, "/memory/{n}"),
            Protocol::P2p(peer) => write!(f, "/p2p/{peer}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MultiaddrError {
    #[error("multiaddr is empty")]
    Empty,
    #[error("multiaddr must start with '/'")]
    MissingLeadingSlash,
    #[error("multiaddr exceeds {MAX_MULTIADDR_LEN} bytes")]
    TooLong,
    #[error("multiaddr has too many components")]
    TooManyComponents,
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("protocol '{0}' is missing its value")]
    MissingValue(&'static str),
    #[error("invalid value '{value}' for protocol '{protocol}'")]
    InvalidValue { protocol: &'static str, value: String },
}

/// Where a multiaddr points, in the terms a transport driver cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Dns(String),
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Multiaddr {
    components: Vec<Protocol>,
}

impl Multiaddr {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, protocol: Protocol) -> Self {
        self.components.push(protocol);
        self
    }

    pub fn push(&mut self, protocol: Protocol) {
        self.components.push(protocol);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.components.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// `/ip4|ip6/<ip>/tcp/<port>` for a socket address.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip()).with(Protocol::Tcp(addr.port()))
    }

    /// `/ip4|ip6/<ip>/udp/<port>/quic-v1` for a socket address.
    pub fn quic(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip())
            .with(Protocol::Udp(addr.port()))
            .with(Protocol::QuicV1)
    }

    /// `/memory/<n>`.
    pub fn memory(n: u64) -> Self {
        Self::empty().with(Protocol::Memory(n))
    }

    fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::empty().with(Protocol::Ip4(v4)),
            IpAddr::V6(v6) => Self::empty().with(Protocol::Ip6(v6)),
        }
    }

    /// The PeerId named by a trailing `/p2p` component, if any.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.components.last() {
            Some(Protocol::P2p(peer)) => Some(*peer),
            _ => None,
        }
    }

    /// This address with its `/p2p` suffix replaced by `peer`.
    pub fn with_p2p(&self, peer: PeerId) -> Self {
        let mut out = self.without_p2p();
        out.push(Protocol::P2p(peer));
        out
    }

    /// This address with any trailing `/p2p` component removed.
    pub fn without_p2p(&self) -> Self {
        let mut components = self.components.clone();
        if matches!(components.last(), Some(Protocol::P2p(_))) {
            components.pop();
        }
        Self { components }
    }

    /// Transport tag a driver claims this address by:
    /// `"memory"`, `"quic"` or `"tcp"`.
    pub fn transport_tag(&self) -> Option<&'static str> {
        let mut tag = None;
        for p in &self.components {
            match p {
                Protocol::Memory(_) => return Some("memory"),
                Protocol::QuicV1 => return Some("quic"),
                Protocol::Tcp(_) => tag = Some("tcp"),
                _ => {}
            }
        }
        tag
    }

    /// Leading host component (`ip4`, `ip6`, `dns*`).
    pub fn host(&self) -> Option<Host> {
        match self.components.first()? {
            Protocol::Ip4(ip) => Some(Host::Ip(IpAddr::V4(*ip))),
            Protocol::Ip6(ip) => Some(Host::Ip(IpAddr::V6(*ip))),
            Protocol::Dns(h) | Protocol::Dns4(h) | Protocol::Dns6(h) => Some(Host::Dns(h.clone())),
            _ => None,
        }
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.components.iter().find_map(|p| match p {
            Protocol::Tcp(port) => Some(*port),
            _ => None,
        })
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.components.iter().find_map(|p| match p {
            Protocol::Udp(port) => Some(*port),
            _ => None,
        })
    }

    pub fn memory_port(&self) -> Option<u64> {
        self.components.iter().find_map(|p| match p {
            Protocol::Memory(n) => Some(*n),
            _ => None,
        })
    }

    /// Socket address for `ip*/tcp` or `ip*/udp` addresses; `None` for DNS.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let Some(Host::Ip(ip)) = self.host() else {
            return None;
        };
        let port = self.tcp_port().or_else(|| self.udp_port())?;
        Some(SocketAddr::new(ip, port))
    }

    /// True for loopback, private and link-local IPs.
    pub fn is_private(&self) -> bool {
        match self.host() {
            Some(Host::Ip(IpAddr::V4(v4))) => {
                v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
            }
            Some(Host::Ip(IpAddr::V6(v6))) => v6.is_loopback() || v6.is_unspecified(),
            _ => false,
        }
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in &self.components {
            write!(f, "{p}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({self})")
    }
}

fn parse_value<T: FromStr>(protocol: &'static str, value: Option<&str>) -> Result<T, MultiaddrError> {
    let value = value.ok_or(MultiaddrError::MissingValue(protocol))?;
    value.parse().map_err(|_| MultiaddrError::InvalidValue {
        protocol,
        value: value.to_string(),
    })
}

fn parse_host(protocol: &'static str, value: Option<&str>) -> Result<String, MultiaddrError> {
    let value = value.ok_or(MultiaddrError::MissingValue(protocol))?;
    if value.is_empty() || value.len() > 253 {
        return Err(MultiaddrError::InvalidValue {
            protocol,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

impl FromStr for Multiaddr {
    type Err = MultiaddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(MultiaddrError::Empty);
        }
        if s.len() > MAX_MULTIADDR_LEN {
            return Err(MultiaddrError::TooLong);
        }
        let rest = s
            .strip_prefix('/')
            .ok_or(MultiaddrError::MissingLeadingSlash)?;

        let mut parts = rest.split('/').filter(|p| !p.is_empty());
        let mut components = Vec::new();
        while let Some(name) = parts.next() {
            if components.len() >= MAX_COMPONENTS {
                return Err(MultiaddrError::TooManyComponents);
            }
            let protocol = match name {
                "ip4" => Protocol::Ip4(parse_value("ip4", parts.next())?),
                "ip6" => Protocol::Ip6(parse_value("ip6", parts.next())?),
                "dns" => Protocol::Dns(parse_host("dns", parts.next())?),
                "dns4" => Protocol::Dns4(parse_host("dns4", parts.next())?),
                "dns6" => Protocol::Dns6(parse_host("dns6", parts.next())?),
                "tcp" => Protocol::Tcp(parse_value("tcp", parts.next())?),
                "udp" => Protocol::Udp(parse_value("udp", parts.next())?),
                "quic-v1" => Protocol::QuicV1,
                "memory" => Protocol::Memory(parse_value("memory", parts.next())?),
                "p2p" => Protocol::P2p(parse_value("p2p", parts.next())?),
                other => return Err(MultiaddrError::UnknownProtocol(other.to_string())),
            };
            components.push(protocol);
        }

        if components.is_empty() {
            return Err(MultiaddrError::Empty);
        }
        Ok(Self { components })
    }
}

impl Serialize for Multiaddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Multiaddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn parses_and_displays_tcp_with_peer() {
        let peer = Keypair::generate().peer_id();
        let text = format!("/ip4/127.0.0.1/tcp/9092/p2p/{peer}");
        let addr: Multiaddr = text.parse().expect("parse");

        assert_eq!(addr.to_string(), text);
        assert_eq!(addr.peer_id(), Some(peer));
        assert_eq!(addr.transport_tag(), Some("tcp"));
        assert_eq!(addr.socket_addr(), Some("127.0.0.1:9092".parse().unwrap()));
    }

    #[test]
    fn parses_quic_and_memory() {
        let quic: Multiaddr = "/ip6/::1/udp/9091/quic-v1".parse().expect("parse");
        assert_eq!(quic.transport_tag(), Some("quic"));
        assert_eq!(quic.udp_port(), Some(9091));

        let mem: Multiaddr = "/memory/42".parse().expect("parse");
        assert_eq!(mem.transport_tag(), Some("memory"));
        assert_eq!(mem.memory_port(), Some(42));
    }

    #[test]
    fn dns_host_has_no_socket_addr() {
        let addr: Multiaddr = "/dns4/example.com/tcp/443".parse().expect("parse");
        assert_eq!(addr.host(), Some(Host::Dns("example.com".into())));
        assert_eq!(addr.socket_addr(), None);
    }

    #[test]
    fn unknown_transport_has_no_tag() {
        let addr: Multiaddr = "/ip4/1.2.3.4/udp/5".parse().expect("parse");
        assert_eq!(addr.transport_tag(), None);
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!("".parse::<Multiaddr>(), Err(MultiaddrError::Empty));
        assert_eq!(
            "ip4/1.2.3.4".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingLeadingSlash)
        );
        assert!(matches!(
            "/ip4/999.0.0.1".parse::<Multiaddr>(),
            Err(MultiaddrError::InvalidValue { .. })
        ));
        assert!(matches!(
            "/tcp".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingValue("tcp"))
        ));
        assert!(matches!(
            "/bluetooth/aa".parse::<Multiaddr>(),
            Err(MultiaddrError::UnknownProtocol(_))
        ));
        assert!(matches!(
            "/p2p/nothex".parse::<Multiaddr>(),
            Err(MultiaddrError::InvalidValue { .. })
        ));
    }

    #[test]
    fn p2p_suffix_helpers() {
        let peer = Keypair::generate().peer_id();
        let base = Multiaddr::tcp("10.0.0.1:4001".parse().unwrap());
        let full = base.with_p2p(peer);
        assert_eq!(full.peer_id(), Some(peer));
        assert_eq!(full.without_p2p(), base);

        let other = Keypair::generate().peer_id();
        assert_eq!(full.with_p2p(other).peer_id(), Some(other));
    }

    #[test]
    fn serde_uses_string_form() {
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/80".parse().expect("parse");
        let json = serde_json::to_string(&addr).expect("serialize");
        assert_eq!(json, "\"/ip4/1.2.3.4/tcp/80\"");
        let back: Multiaddr = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, addr);
    }

    #[test]
    fn private_detection() {
        let private: Multiaddr = "/ip4/192.168.1.5/tcp/1".parse().unwrap();
        let public: Multiaddr = "/ip4/8.8.8.8/tcp/1".parse().unwrap();
        assert!(private.is_private());
        assert!(!public.is_private());
    }
}
