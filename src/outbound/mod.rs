//! Outbound datagram connections.
//!
//! The NTP client never opens sockets itself: it asks an [`AsyncOutbound`]
//! dialer for an [`AsyncUdpConn`]. The only dialer shipped is [`Socks5`],
//! which relays every datagram through a SOCKS5 UDP ASSOCIATE.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CheckerError, OutboundErrorKind, Result};

mod socks5;

pub use socks5::Socks5;

/// Network address with optional DNS resolution info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    /// Hostname or IP address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Optional DNS resolution result
    pub resolve_info: Option<ResolveInfo>,
}

impl Addr {
    /// Create a new Addr
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            resolve_info: None,
        }
    }

    /// Create an Addr from a SocketAddr, pre-populating resolve info.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let resolve_info = match addr.ip() {
            IpAddr::V4(v4) => ResolveInfo::from_ipv4(v4),
            IpAddr::V6(v6) => ResolveInfo::from_ipv6(v6),
        };
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            resolve_info: Some(resolve_info),
        }
    }

    /// Parse `host[:port]`, using `default_port` when the port is omitted.
    ///
    /// IPv6 literals must be bracketed when a port is given (`[::1]:123`).
    pub fn parse_host_port(s: &str, default_port: u16) -> Result<Self> {
        let invalid = || {
            CheckerError::outbound(
                OutboundErrorKind::InvalidInput,
                format!("invalid address: {:?}", s),
            )
        };

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail {
                "" => (host, None),
                _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else if s.parse::<Ipv6Addr>().is_ok() {
            (s, None)
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None => default_port,
        };

        Ok(Self::new(host, port))
    }

    /// Create a new Addr with resolve info
    pub fn with_resolve_info(mut self, info: ResolveInfo) -> Self {
        self.resolve_info = Some(info);
        self
    }

    /// Get the resolved socket address, preferring IPv4.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let info = self.resolve_info.as_ref()?;
        info.ipv4
            .map(IpAddr::V4)
            .or(info.ipv6.map(IpAddr::V6))
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Get the network address for dialing.
    /// Returns the resolved IP if available, otherwise Host.
    pub fn network_addr(&self) -> String {
        match self.socket_addr() {
            Some(addr) => addr.to_string(),
            None => self.to_string(),
        }
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// DNS resolution results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveInfo {
    /// Resolved IPv4 address, if any
    pub ipv4: Option<Ipv4Addr>,
    /// Resolved IPv6 address, if any
    pub ipv6: Option<Ipv6Addr>,
    /// Error message that occurred during resolution, if any
    pub error: Option<String>,
}

impl ResolveInfo {
    /// Create ResolveInfo from IPv4 address
    pub fn from_ipv4(ipv4: Ipv4Addr) -> Self {
        Self {
            ipv4: Some(ipv4),
            ipv6: None,
            error: None,
        }
    }

    /// Create ResolveInfo from IPv6 address
    pub fn from_ipv6(ipv6: Ipv6Addr) -> Self {
        Self {
            ipv4: None,
            ipv6: Some(ipv6),
            error: None,
        }
    }

    /// Create ResolveInfo with error
    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            ipv4: None,
            ipv6: None,
            error: Some(error.into()),
        }
    }
}

/// Datagram dialer interface.
///
/// The NTP client calls [`dial_udp`](AsyncOutbound::dial_udp) once for the
/// server it wants to reach; every packet of the exchange goes through the
/// returned connection.
#[async_trait]
pub trait AsyncOutbound: Send + Sync {
    /// Create a UDP connection for the given address.
    ///
    /// Implementations may fill in `addr.resolve_info`.
    async fn dial_udp(&self, addr: &mut Addr) -> Result<Box<dyn AsyncUdpConn>>;
}

/// Async UDP connection interface.
#[async_trait]
pub trait AsyncUdpConn: Send + Sync {
    /// Read one datagram, returning its payload length and source address
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Addr)>;

    /// Write one datagram to the given address
    async fn write_to(&self, buf: &[u8], addr: &Addr) -> Result<usize>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Run `fut` under `timeout`, where `None` waits forever.
pub(crate) async fn with_timeout<T>(
    timeout: Option<Duration>,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(dur) => tokio::time::timeout(dur, fut).await.map_err(|_| {
            CheckerError::outbound(OutboundErrorKind::Timeout, format!("{} timeout", what))
        })?,
        None => fut.await,
    }
}

/// Resolve `addr.host` into `addr.resolve_info` if not already present.
pub(crate) async fn resolve(addr: &mut Addr) {
    if addr.resolve_info.is_some() {
        return;
    }

    if let Ok(ip) = addr.host.parse::<IpAddr>() {
        addr.resolve_info = Some(match ip {
            IpAddr::V4(v4) => ResolveInfo::from_ipv4(v4),
            IpAddr::V6(v6) => ResolveInfo::from_ipv6(v6),
        });
        return;
    }

    match tokio::net::lookup_host((addr.host.as_str(), addr.port)).await {
        Ok(addrs) => {
            let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            let (ipv4, ipv6) = split_ipv4_ipv6(&ips);
            if ipv4.is_none() && ipv6.is_none() {
                addr.resolve_info = Some(ResolveInfo::from_error("no address found"));
            } else {
                addr.resolve_info = Some(ResolveInfo {
                    ipv4,
                    ipv6,
                    error: None,
                });
            }
        }
        Err(e) => {
            addr.resolve_info = Some(ResolveInfo::from_error(e.to_string()));
        }
    }
}

/// Split IP addresses into IPv4 and IPv6
pub(crate) fn split_ipv4_ipv6(ips: &[IpAddr]) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
    let mut ipv4 = None;
    let mut ipv6 = None;

    for ip in ips {
        match ip {
            IpAddr::V4(v4) if ipv4.is_none() => ipv4 = Some(*v4),
            IpAddr::V6(v6) if ipv6.is_none() => ipv6 = Some(*v6),
            _ => {}
        }
        if ipv4.is_some() && ipv6.is_some() {
            break;
        }
    }

    (ipv4, ipv6)
}
