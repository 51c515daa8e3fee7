use crate::ntp::Response;
use crate::error::CheckerError;

/// Canonical SOCKS5 proxy endpoint produced by the proxy-string parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// Proxy address in host:port format
    pub address: String,
    /// Username for authentication (empty for anonymous)
    pub username: String,
    /// Password for authentication (empty for anonymous)
    pub password: String,
}

impl ProxyEndpoint {
    /// Create an anonymous endpoint
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            username: String::new(),
            password: String::new(),
        }
    }

    /// Create an authenticated endpoint
    pub fn with_auth(
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check if the endpoint carries credentials
    pub fn is_authenticated(&self) -> bool {
        !self.username.is_empty()
    }
}

/// One probe to run: where the proxy is and which time server to ask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub endpoint: ProxyEndpoint,
    /// NTP target in host[:port] format, passed through unmodified
    pub ntp_target: String,
}

impl ProbeRequest {
    pub fn new(endpoint: ProxyEndpoint, ntp_target: impl Into<String>) -> Self {
        Self {
            endpoint,
            ntp_target: ntp_target.into(),
        }
    }
}

/// Outcome of one probe.
pub type ProbeResult = std::result::Result<Response, CheckerError>;
