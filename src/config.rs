//! Tunables for the checker.
//!
//! There is no config file or flag: everything here is a compiled-in default.

use std::time::Duration;

use crate::ntp;

/// Value handed to the SOCKS5 client for both timeouts, in seconds.
pub const SOCKS5_TIMEOUT: u64 = 1000;

/// Checker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerConfig {
    /// Initial value of the proxy input
    pub default_proxy: String,
    /// Initial value of the NTP server input
    pub default_ntp_server: String,
    /// SOCKS5 control-connection timeout (seconds, 0 = none)
    pub socks5_tcp_timeout: u64,
    /// SOCKS5 relayed-datagram read timeout (seconds, 0 = none)
    pub socks5_udp_timeout: u64,
    /// Time allowed for the NTP reply
    pub ntp_timeout: Duration,
    /// NTP version placed in requests
    pub ntp_version: u8,
    /// UI redraw and spinner interval
    pub tick_rate: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            default_proxy: "socks5://localhost:1080".to_string(),
            default_ntp_server: "time.google.com:123".to_string(),
            socks5_tcp_timeout: SOCKS5_TIMEOUT,
            socks5_udp_timeout: SOCKS5_TIMEOUT,
            ntp_timeout: ntp::DEFAULT_TIMEOUT,
            ntp_version: ntp::DEFAULT_VERSION,
            tick_rate: Duration::from_millis(100),
        }
    }
}
