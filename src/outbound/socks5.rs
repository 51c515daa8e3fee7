//! SOCKS5 UDP relay implementation.
//!
//! Opens a UDP ASSOCIATE through a SOCKS5 proxy and wraps every datagram in
//! the RFC 1928 UDP request header.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::{CheckerError, OutboundErrorKind, Result};

use super::{resolve, with_timeout, Addr, AsyncOutbound, AsyncUdpConn};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
const SOCKS5_AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const SOCKS5_AUTH_PASSWORD_VERSION: u8 = 0x01;

const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

const SOCKS5_REP_SUCCESS: u8 = 0x00;

/// Largest datagram the relay hands back.
const MAX_DATAGRAM_SIZE: usize = 65536;

/// SOCKS5 proxy client.
///
/// Credentials are offered iff the username is non-empty. Timeouts are whole
/// seconds; zero disables the corresponding timeout.
#[derive(Debug, Clone)]
pub struct Socks5 {
    /// Proxy server address
    addr: String,
    /// Username for authentication
    username: Option<String>,
    /// Password for authentication
    password: Option<String>,
    /// Timeout for the TCP control connection (connect and each handshake step)
    tcp_timeout: Option<Duration>,
    /// Timeout for a single relayed datagram read
    udp_timeout: Option<Duration>,
}

impl Socks5 {
    /// Create a new SOCKS5 client.
    ///
    /// Fails if `addr` is not `host:port` or a credential exceeds 255 bytes.
    pub fn new(
        addr: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        tcp_timeout: u64,
        udp_timeout: u64,
    ) -> Result<Self> {
        let addr = addr.into();
        let username = username.into();
        let password = password.into();

        let parsed = Addr::parse_host_port(&addr, 0)?;
        if parsed.port == 0 {
            return Err(CheckerError::outbound(
                OutboundErrorKind::InvalidInput,
                format!("missing or zero port in proxy address {:?}", addr),
            ));
        }
        if username.len() > 255 || password.len() > 255 {
            return Err(CheckerError::outbound(
                OutboundErrorKind::InvalidInput,
                "username and password must be at most 255 bytes",
            ));
        }

        let (username, password) = if username.is_empty() {
            (None, None)
        } else {
            (Some(username), Some(password))
        };

        Ok(Self {
            addr,
            username,
            password,
            tcp_timeout: seconds(tcp_timeout),
            udp_timeout: seconds(udp_timeout),
        })
    }

    /// Proxy address this client dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Check if the client will offer username/password authentication.
    pub fn has_auth(&self) -> bool {
        self.username.is_some()
    }

    /// Connect to the proxy and perform negotiation.
    async fn dial_and_negotiate(&self) -> Result<TcpStream> {
        let mut stream = with_timeout(self.tcp_timeout, "Connection", async {
            TcpStream::connect(self.addr.as_str()).await.map_err(|e| {
                CheckerError::outbound(
                    OutboundErrorKind::ConnectionFailed,
                    format!("Failed to connect to proxy {}: {}", self.addr, e),
                )
            })
        })
        .await?;
        debug!("connected to SOCKS5 proxy {}", self.addr);

        let auth_methods = if self.username.is_some() && self.password.is_some() {
            vec![SOCKS5_AUTH_NONE, SOCKS5_AUTH_PASSWORD]
        } else {
            vec![SOCKS5_AUTH_NONE]
        };

        let mut req = vec![SOCKS5_VERSION, auth_methods.len() as u8];
        req.extend(&auth_methods);

        let resp = with_timeout(self.tcp_timeout, "Negotiation", async {
            stream.write_all(&req).await.map_err(|e| {
                io_error(format!("Failed to send negotiation: {}", e))
            })?;
            let mut resp = [0u8; 2];
            stream.read_exact(&mut resp).await.map_err(|e| {
                io_error(format!("Failed to read negotiation response: {}", e))
            })?;
            Ok(resp)
        })
        .await?;

        if resp[0] != SOCKS5_VERSION {
            return Err(protocol_error(format!("Invalid SOCKS version: {}", resp[0])));
        }

        match resp[1] {
            SOCKS5_AUTH_NONE => {}
            SOCKS5_AUTH_PASSWORD => {
                let (username, password) = match (&self.username, &self.password) {
                    (Some(username), Some(password)) => (username, password),
                    _ => {
                        return Err(CheckerError::outbound(
                            OutboundErrorKind::AuthFailed,
                            "Server requires authentication but no credentials provided",
                        ))
                    }
                };

                let mut auth_req = vec![SOCKS5_AUTH_PASSWORD_VERSION];
                auth_req.push(username.len() as u8);
                auth_req.extend(username.as_bytes());
                auth_req.push(password.len() as u8);
                auth_req.extend(password.as_bytes());

                let auth_resp = with_timeout(self.tcp_timeout, "Authentication", async {
                    stream.write_all(&auth_req).await.map_err(|e| {
                        io_error(format!("Failed to send auth: {}", e))
                    })?;
                    let mut auth_resp = [0u8; 2];
                    stream.read_exact(&mut auth_resp).await.map_err(|e| {
                        io_error(format!("Failed to read auth response: {}", e))
                    })?;
                    Ok(auth_resp)
                })
                .await?;

                if auth_resp[1] != 0x00 {
                    return Err(CheckerError::outbound(
                        OutboundErrorKind::AuthFailed,
                        "SOCKS5 authentication failed",
                    ));
                }
                debug!("authenticated to SOCKS5 proxy as {}", username);
            }
            SOCKS5_AUTH_NO_ACCEPTABLE => {
                return Err(CheckerError::outbound(
                    OutboundErrorKind::AuthFailed,
                    "No acceptable authentication method",
                ));
            }
            method => {
                return Err(protocol_error(format!(
                    "Unsupported authentication method: {}",
                    method
                )));
            }
        }

        Ok(stream)
    }

    /// Send a UDP ASSOCIATE request and return the relay address.
    async fn udp_associate(&self, stream: &mut TcpStream) -> Result<SocketAddr> {
        // 0.0.0.0:0: the client's datagram source is not known yet.
        let mut req = vec![SOCKS5_VERSION, SOCKS5_CMD_UDP_ASSOCIATE, 0x00];
        req.extend(encode_addr(&Addr::new(Ipv4Addr::UNSPECIFIED.to_string(), 0)));

        let (bound_host, bound_port) = with_timeout(self.tcp_timeout, "Request", async {
            stream
                .write_all(&req)
                .await
                .map_err(|e| io_error(format!("Failed to send request: {}", e)))?;
            read_reply(stream).await
        })
        .await?;

        let mut bound = Addr::new(bound_host, bound_port);
        resolve(&mut bound).await;
        let relay = bound.socket_addr().ok_or_else(|| {
            protocol_error(format!("Cannot resolve relay address {}", bound))
        })?;

        if relay.ip().is_unspecified() {
            let peer = stream
                .peer_addr()
                .map_err(|e| io_error(format!("Failed to read proxy address: {}", e)))?;
            warn!(
                "SOCKS5 server returned unspecified relay address, using server IP {}",
                peer.ip()
            );
            return Ok(SocketAddr::new(peer.ip(), relay.port()));
        }

        Ok(relay)
    }
}

#[async_trait]
impl AsyncOutbound for Socks5 {
    async fn dial_udp(&self, addr: &mut Addr) -> Result<Box<dyn AsyncUdpConn>> {
        resolve(addr).await;
        if addr.socket_addr().is_none() {
            let reason = addr
                .resolve_info
                .as_ref()
                .and_then(|info| info.error.clone())
                .unwrap_or_else(|| "no address found".to_string());
            return Err(CheckerError::outbound(
                OutboundErrorKind::DnsFailed,
                format!("lookup {}: {}", addr.host, reason),
            ));
        }

        let mut stream = self.dial_and_negotiate().await?;
        let relay = self.udp_associate(&mut stream).await?;
        debug!("SOCKS5 UDP relay for {} at {}", addr, relay);

        let bind_addr = match relay {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let udp_socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| io_error(format!("Failed to bind UDP: {}", e)))?;
        udp_socket
            .connect(relay)
            .await
            .map_err(|e| io_error(format!("Failed to connect UDP: {}", e)))?;

        Ok(Box::new(Socks5UdpConn {
            _tcp_conn: stream,
            udp_socket,
            udp_timeout: self.udp_timeout,
        }))
    }
}

/// SOCKS5 UDP connection wrapper.
struct Socks5UdpConn {
    _tcp_conn: TcpStream, // The relay lives as long as the control connection
    udp_socket: UdpSocket,
    udp_timeout: Option<Duration>,
}

#[async_trait]
impl AsyncUdpConn for Socks5UdpConn {
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Addr)> {
        let mut recv_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let n = with_timeout(self.udp_timeout, "UDP read", async {
                self.udp_socket
                    .recv(&mut recv_buf)
                    .await
                    .map_err(|e| io_error(format!("UDP recv error: {}", e)))
            })
            .await?;

            let (addr, header_len) = decode_udp_header(&recv_buf[..n])?;
            if recv_buf[2] != 0x00 {
                debug!("dropping fragmented SOCKS5 datagram (FRAG={})", recv_buf[2]);
                continue;
            }

            let copy_len = (n - header_len).min(buf.len());
            buf[..copy_len].copy_from_slice(&recv_buf[header_len..header_len + copy_len]);
            return Ok((copy_len, addr));
        }
    }

    async fn write_to(&self, buf: &[u8], addr: &Addr) -> Result<usize> {
        let mut packet = encode_udp_header(addr);
        packet.extend(buf);

        self.udp_socket
            .send(&packet)
            .await
            .map_err(|e| io_error(format!("UDP send error: {}", e)))?;

        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn io_error(message: String) -> CheckerError {
    CheckerError::outbound(OutboundErrorKind::Io, message)
}

fn protocol_error(message: String) -> CheckerError {
    CheckerError::outbound(OutboundErrorKind::Protocol, message)
}

/// Convert reply code to string.
fn rep_to_string(rep: u8) -> &'static str {
    match rep {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "undefined",
    }
}

/// Encode ATYP + address + port, using the resolved IP when available.
fn encode_addr(addr: &Addr) -> Vec<u8> {
    let mut data = Vec::new();
    let ip = addr
        .socket_addr()
        .map(|s| s.ip())
        .or_else(|| addr.host.parse::<IpAddr>().ok());

    match ip {
        Some(IpAddr::V4(v4)) => {
            data.push(SOCKS5_ATYP_IPV4);
            data.extend(&v4.octets());
        }
        Some(IpAddr::V6(v6)) => {
            data.push(SOCKS5_ATYP_IPV6);
            data.extend(&v6.octets());
        }
        None => {
            let domain = addr.host.as_bytes();
            data.push(SOCKS5_ATYP_DOMAIN);
            data.push(domain.len() as u8);
            data.extend(domain);
        }
    }

    data.extend(&addr.port.to_be_bytes());
    data
}

/// Build the RSV + FRAG + address header that prefixes a relayed datagram.
fn encode_udp_header(addr: &Addr) -> Vec<u8> {
    let mut data = vec![0x00, 0x00, 0x00];
    data.extend(encode_addr(addr));
    data
}

/// Parse the header of a relayed datagram, returning source and header length.
fn decode_udp_header(data: &[u8]) -> Result<(Addr, usize)> {
    if data.len() < 4 {
        return Err(protocol_error("Invalid SOCKS5 datagram".to_string()));
    }

    let atyp = data[3];
    let mut offset = 4;

    let host = match atyp {
        SOCKS5_ATYP_IPV4 => {
            if data.len() < offset + 6 {
                return Err(protocol_error("Invalid IPv4 datagram".to_string()));
            }
            let ip = Ipv4Addr::new(
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            );
            offset += 4;
            IpAddr::V4(ip).to_string()
        }
        SOCKS5_ATYP_IPV6 => {
            if data.len() < offset + 18 {
                return Err(protocol_error("Invalid IPv6 datagram".to_string()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[offset..offset + 16]);
            offset += 16;
            IpAddr::V6(Ipv6Addr::from(octets)).to_string()
        }
        SOCKS5_ATYP_DOMAIN => {
            if data.len() < offset + 1 {
                return Err(protocol_error("Invalid domain datagram".to_string()));
            }
            let len = data[offset] as usize;
            offset += 1;
            if data.len() < offset + len + 2 {
                return Err(protocol_error("Invalid domain datagram".to_string()));
            }
            let domain = String::from_utf8_lossy(&data[offset..offset + len]).to_string();
            offset += len;
            domain
        }
        _ => {
            return Err(protocol_error(format!("Unknown address type: {}", atyp)));
        }
    };

    let port = u16::from_be_bytes([data[offset], data[offset + 1]]);
    offset += 2;

    let mut addr = Addr::new(host, port);
    if let Ok(ip) = addr.host.parse::<IpAddr>() {
        addr = Addr::from_socket_addr(SocketAddr::new(ip, port));
    }
    Ok((addr, offset))
}

/// Read a SOCKS5 reply and return the bound address.
async fn read_reply(stream: &mut TcpStream) -> Result<(String, u16)> {
    let mut resp_header = [0u8; 4];
    stream
        .read_exact(&mut resp_header)
        .await
        .map_err(|e| io_error(format!("Failed to read response: {}", e)))?;

    if resp_header[0] != SOCKS5_VERSION {
        return Err(protocol_error(format!(
            "Invalid SOCKS version in response: {}",
            resp_header[0]
        )));
    }

    if resp_header[1] != SOCKS5_REP_SUCCESS {
        return Err(protocol_error(format!(
            "SOCKS5 request failed: {}",
            rep_to_string(resp_header[1])
        )));
    }

    let host = match resp_header[3] {
        SOCKS5_ATYP_IPV4 => {
            let mut addr_buf = [0u8; 4];
            stream
                .read_exact(&mut addr_buf)
                .await
                .map_err(|e| io_error(format!("Failed to read IPv4 address: {}", e)))?;
            Ipv4Addr::from(addr_buf).to_string()
        }
        SOCKS5_ATYP_IPV6 => {
            let mut addr_buf = [0u8; 16];
            stream
                .read_exact(&mut addr_buf)
                .await
                .map_err(|e| io_error(format!("Failed to read IPv6 address: {}", e)))?;
            Ipv6Addr::from(addr_buf).to_string()
        }
        SOCKS5_ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| io_error(format!("Failed to read domain length: {}", e)))?;
            let mut domain = vec![0u8; len_buf[0] as usize];
            stream
                .read_exact(&mut domain)
                .await
                .map_err(|e| io_error(format!("Failed to read domain: {}", e)))?;
            String::from_utf8_lossy(&domain).to_string()
        }
        atyp => {
            return Err(protocol_error(format!("Unknown address type: {}", atyp)));
        }
    };

    let mut port_buf = [0u8; 2];
    stream
        .read_exact(&mut port_buf)
        .await
        .map_err(|e| io_error(format!("Failed to read port: {}", e)))?;

    Ok((host, u16::from_be_bytes(port_buf)))
}
