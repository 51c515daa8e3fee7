//! One-shot SNTP client.
//!
//! The client has no socket of its own. Every query asks the caller's
//! [`AsyncOutbound`] dialer for a datagram connection to the server, so the
//! whole exchange travels wherever the dialer sends it.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;

use crate::error::{CheckerError, NtpErrorKind, Result};
use crate::outbound::{Addr, AsyncOutbound};

mod packet;

pub use packet::{LeapIndicator, Packet, ShortFormat, Timestamp, PACKET_SIZE};
use packet::{unix_now_nanos, MODE_SERVER};

/// Default NTP server port.
pub const DEFAULT_PORT: u16 = 123;
/// Default protocol version placed in requests.
pub const DEFAULT_VERSION: u8 = 4;
/// Default time allowed for the reply to arrive.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for [`query_with_options`].
#[derive(Clone, Copy)]
pub struct QueryOptions<'a> {
    /// Dialer providing the datagram connection to the server
    pub dialer: &'a dyn AsyncOutbound,
    /// Time allowed between sending the request and receiving the reply
    pub timeout: Duration,
    /// NTP version number written into the request (1-4)
    pub version: u8,
    /// Port used when the target does not name one
    pub port: u16,
}

impl<'a> QueryOptions<'a> {
    pub fn new(dialer: &'a dyn AsyncOutbound) -> Self {
        Self {
            dialer,
            timeout: DEFAULT_TIMEOUT,
            version: DEFAULT_VERSION,
            port: DEFAULT_PORT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }
}

/// Result of one SNTP exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Server transmit time (T3)
    pub server_time: DateTime<Utc>,
    /// Round-trip delay excluding server processing time
    pub round_trip_time: Duration,
    /// Estimated offset of the server clock from the local clock
    pub clock_offset: TimeDelta,
    pub stratum: u8,
    /// Non-empty iff the server answered with a kiss-of-death; a reference
    /// id with no printable byte is shown in hex
    pub kiss_code: String,
    pub leap_indicator: LeapIndicator,
    pub version: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: Duration,
    pub root_dispersion: Duration,
    pub reference_id: u32,
    pub reference_time: Option<DateTime<Utc>>,
}

impl Response {
    pub fn is_kiss_of_death(&self) -> bool {
        self.stratum == 0
    }

    /// Upper bound on the error of the server clock relative to its primary
    /// reference, as seen from this client.
    pub fn root_distance(&self) -> Duration {
        self.round_trip_time / 2 + self.root_delay / 2 + self.root_dispersion
    }
}

/// Query `target` (`host[:port]`) with default options over `dialer`.
pub async fn query(target: &str, dialer: &dyn AsyncOutbound) -> Result<Response> {
    query_with_options(target, QueryOptions::new(dialer)).await
}

/// Run one SNTP exchange with `target`.
///
/// Errors raised by the dialer while opening the connection are returned
/// unchanged. Everything after that is reported as an NTP error.
pub async fn query_with_options(target: &str, opts: QueryOptions<'_>) -> Result<Response> {
    let mut addr = Addr::parse_host_port(target, opts.port).map_err(|_| {
        CheckerError::ntp(
            NtpErrorKind::InvalidTarget,
            format!("invalid NTP server address {:?}", target),
        )
    })?;

    let conn = opts.dialer.dial_udp(&mut addr).await?;
    debug!("NTP query to {} via {}", target, addr.network_addr());

    let exchange = async {
        let t1 = unix_now_nanos();
        let origin = Timestamp::from_unix_nanos(t1);
        let request = Packet::client_request(opts.version, origin).to_bytes();
        conn.write_to(&request, &addr)
            .await
            .map_err(|e| CheckerError::ntp(NtpErrorKind::Io, e.to_string()))?;

        let mut buf = [0u8; 1024];
        let (n, source) = conn
            .read_from(&mut buf)
            .await
            .map_err(|e| CheckerError::ntp(NtpErrorKind::Io, e.to_string()))?;
        let t4 = unix_now_nanos();

        check_source(&addr, &source)?;
        let packet = Packet::from_bytes(&buf[..n])?;
        parse_response(&packet, origin, t1, t4)
    };

    let result = match tokio::time::timeout(opts.timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(CheckerError::ntp(
            NtpErrorKind::Timeout,
            format!("read from {}: i/o timeout", addr),
        )),
    };

    if let Err(e) = conn.close().await {
        debug!("closing NTP connection: {}", e);
    }
    result
}

fn check_source(dialed: &Addr, source: &Addr) -> Result<()> {
    let matches = match (dialed.socket_addr(), source.host.parse::<IpAddr>()) {
        (Some(expected), Ok(ip)) => canonical(expected.ip()) == canonical(ip),
        _ => dialed.host.eq_ignore_ascii_case(&source.host),
    };

    if matches && source.port == dialed.port {
        Ok(())
    } else {
        Err(CheckerError::ntp(
            NtpErrorKind::InvalidResponse,
            format!("response from unexpected source {} (expected {})", source, dialed.network_addr()),
        ))
    }
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

fn parse_response(packet: &Packet, origin: Timestamp, t1: i128, t4: i128) -> Result<Response> {
    let invalid = |msg: String| CheckerError::ntp(NtpErrorKind::InvalidResponse, msg);

    if packet.mode != MODE_SERVER {
        return Err(invalid(format!("invalid mode in response: {}", packet.mode)));
    }
    if packet.origin_timestamp != origin {
        return Err(invalid("server response mismatch".to_string()));
    }

    let kiss = packet.stratum == 0;
    if !kiss && packet.transmit_timestamp.is_zero() {
        return Err(invalid("invalid transmit time in response".to_string()));
    }

    let t2 = packet.receive_timestamp.to_unix_nanos(t1);
    let t3 = packet.transmit_timestamp.to_unix_nanos(t1);

    let offset = ((t2 - t1) + (t3 - t4)) / 2;
    let rtt = ((t4 - t1) - (t3 - t2)).max(0);

    let server_time = datetime_from_nanos(t3)
        .ok_or_else(|| invalid("server time out of range".to_string()))?;
    let reference_time = (!packet.reference_timestamp.is_zero())
        .then(|| datetime_from_nanos(packet.reference_timestamp.to_unix_nanos(t1)))
        .flatten();

    Ok(Response {
        server_time,
        round_trip_time: Duration::from_nanos(u64::try_from(rtt).unwrap_or(u64::MAX)),
        clock_offset: TimeDelta::nanoseconds(i64::try_from(offset).unwrap_or(if offset < 0 {
            i64::MIN
        } else {
            i64::MAX
        })),
        stratum: packet.stratum,
        kiss_code: if kiss { packet.kiss_code() } else { String::new() },
        leap_indicator: packet.leap_indicator,
        version: packet.version,
        poll: packet.poll,
        precision: packet.precision,
        root_delay: packet.root_delay.to_duration(),
        root_dispersion: packet.root_dispersion.to_duration(),
        reference_id: packet.reference_id,
        reference_time,
    })
}

fn datetime_from_nanos(nanos: i128) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(nanos.div_euclid(1_000_000_000)).ok()?;
    let sub = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, sub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OutboundErrorKind;
    use crate::outbound::AsyncUdpConn;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    /// Dials plain loopback UDP; stands in for a relay in unit tests.
    struct LoopbackDialer;

    struct LoopbackConn(UdpSocket);

    #[async_trait]
    impl AsyncOutbound for LoopbackDialer {
        async fn dial_udp(&self, addr: &mut Addr) -> Result<Box<dyn AsyncUdpConn>> {
            crate::outbound::resolve(addr).await;
            let target = addr.socket_addr().ok_or_else(|| {
                CheckerError::outbound(OutboundErrorKind::DnsFailed, "lookup failed")
            })?;
            let socket = UdpSocket::bind("127.0.0.1:0").await?;
            socket.connect(target).await?;
            Ok(Box::new(LoopbackConn(socket)))
        }
    }

    #[async_trait]
    impl AsyncUdpConn for LoopbackConn {
        async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Addr)> {
            let n = self.0.recv(buf).await?;
            Ok((n, Addr::from_socket_addr(self.0.peer_addr()?)))
        }

        async fn write_to(&self, buf: &[u8], _addr: &Addr) -> Result<usize> {
            Ok(self.0.send(buf).await?)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Answer one request, letting `mutate` tweak the reply.
    async fn spawn_server(mutate: impl FnOnce(&mut Packet) + Send + 'static) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = Packet::from_bytes(&buf[..n]).unwrap();
            let now = Timestamp::from_unix_nanos(unix_now_nanos());
            let mut reply = Packet {
                version: request.version,
                mode: MODE_SERVER,
                stratum: 2,
                poll: 4,
                precision: -20,
                reference_id: u32::from_be_bytes([192, 0, 2, 1]),
                reference_timestamp: now,
                origin_timestamp: request.transmit_timestamp,
                receive_timestamp: now,
                transmit_timestamp: now,
                ..Packet::default()
            };
            mutate(&mut reply);
            socket.send_to(&reply.to_bytes(), peer).await.unwrap();
        });
        addr
    }

    fn ntp_kind(err: &CheckerError) -> NtpErrorKind {
        match err {
            CheckerError::NtpError { kind, .. } => *kind,
            other => panic!("expected NtpError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_success() {
        let server = spawn_server(|_| {}).await;
        let resp = query(&server.to_string(), &LoopbackDialer).await.unwrap();

        assert_eq!(resp.stratum, 2);
        assert!(!resp.is_kiss_of_death());
        assert!(resp.kiss_code.is_empty());
        assert_eq!(resp.version, 4);
        assert!(resp.round_trip_time < Duration::from_secs(1));
        assert!(resp.clock_offset.num_milliseconds().abs() < 1000);
        assert!(resp.reference_time.is_some());
        assert!((Utc::now() - resp.server_time).num_seconds().abs() < 5);
    }

    #[tokio::test]
    async fn test_query_kiss_of_death_is_success() {
        let server = spawn_server(|p| {
            p.stratum = 0;
            p.reference_id = u32::from_be_bytes(*b"RATE");
            p.transmit_timestamp = Timestamp::default();
        })
        .await;
        let resp = query(&server.to_string(), &LoopbackDialer).await.unwrap();

        assert!(resp.is_kiss_of_death());
        assert_eq!(resp.kiss_code, "RATE");
    }

    #[tokio::test]
    async fn test_query_kiss_of_death_with_blank_reference_id() {
        let server = spawn_server(|p| {
            p.stratum = 0;
            p.reference_id = 0;
        })
        .await;
        let resp = query(&server.to_string(), &LoopbackDialer).await.unwrap();

        assert!(resp.is_kiss_of_death());
        assert_eq!(resp.kiss_code, "0x00000000");
    }

    #[tokio::test]
    async fn test_query_rejects_origin_mismatch() {
        let server = spawn_server(|p| p.origin_timestamp = Timestamp { seconds: 1, fraction: 2 }).await;
        let err = query(&server.to_string(), &LoopbackDialer).await.unwrap_err();
        assert_eq!(ntp_kind(&err), NtpErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn test_query_rejects_wrong_mode() {
        let server = spawn_server(|p| p.mode = 5).await;
        let err = query(&server.to_string(), &LoopbackDialer).await.unwrap_err();
        assert_eq!(ntp_kind(&err), NtpErrorKind::InvalidResponse);
        assert!(err.to_string().contains("mode"));
    }

    #[tokio::test]
    async fn test_query_rejects_zero_transmit() {
        let server = spawn_server(|p| p.transmit_timestamp = Timestamp::default()).await;
        let err = query(&server.to_string(), &LoopbackDialer).await.unwrap_err();
        assert_eq!(ntp_kind(&err), NtpErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn test_query_timeout() {
        // Bound but silent.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap().to_string();
        let opts = QueryOptions::new(&LoopbackDialer).with_timeout(Duration::from_millis(100));

        let err = query_with_options(&target, opts).await.unwrap_err();
        assert_eq!(ntp_kind(&err), NtpErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_query_invalid_target() {
        for target in ["", "host:notaport", "bad host:123"] {
            let err = query(target, &LoopbackDialer).await.unwrap_err();
            assert_eq!(ntp_kind(&err), NtpErrorKind::InvalidTarget, "target {:?}", target);
        }
    }

    #[test]
    fn test_check_source() {
        let dialed = Addr::new("127.0.0.1", 123)
            .with_resolve_info(crate::outbound::ResolveInfo::from_ipv4("127.0.0.1".parse().unwrap()));
        assert!(check_source(&dialed, &Addr::new("127.0.0.1", 123)).is_ok());
        assert!(check_source(&dialed, &Addr::new("::ffff:127.0.0.1", 123)).is_ok());
        assert!(check_source(&dialed, &Addr::new("127.0.0.2", 123)).is_err());
        assert!(check_source(&dialed, &Addr::new("127.0.0.1", 124)).is_err());
    }

    #[test]
    fn test_root_distance() {
        let resp = Response {
            server_time: Utc::now(),
            round_trip_time: Duration::from_millis(20),
            clock_offset: TimeDelta::zero(),
            stratum: 1,
            kiss_code: String::new(),
            leap_indicator: LeapIndicator::NoWarning,
            version: 4,
            poll: 0,
            precision: 0,
            root_delay: Duration::from_millis(10),
            root_dispersion: Duration::from_millis(3),
            reference_id: 0,
            reference_time: None,
        };
        assert_eq!(resp.root_distance(), Duration::from_millis(18));
    }
}
