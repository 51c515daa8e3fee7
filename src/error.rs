use thiserror::Error;

/// Classifies SOCKS5 outbound errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundErrorKind {
    /// Connection to the proxy failed
    ConnectionFailed,
    /// Operation timed out
    Timeout,
    /// DNS resolution of the relay target failed
    DnsFailed,
    /// Authentication failed or was rejected
    AuthFailed,
    /// Protocol-level error (invalid reply, unsupported version, etc.)
    Protocol,
    /// I/O error during data transfer
    Io,
    /// Input validation failed (bad address, oversized field, etc.)
    InvalidInput,
}

/// Classifies NTP client errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtpErrorKind {
    /// Target string is not a usable `host[:port]`
    InvalidTarget,
    /// No response within the query timeout
    Timeout,
    /// Send or receive on the datagram connection failed
    Io,
    /// Response failed validation (short, wrong mode, origin mismatch, ...)
    InvalidResponse,
}

/// Coarse error taxonomy shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Proxy input string was empty
    Empty,
    /// Proxy input matched no accepted form
    Malformed,
    /// SOCKS5 client construction or relay setup failed
    Proxy,
    /// NTP query failed
    Ntp,
    /// Local I/O failure outside the probe
    Io,
}

/// Checker error types
#[derive(Error, Debug)]
pub enum CheckerError {
    #[error("empty input string")]
    EmptyInput,

    #[error("invalid format")]
    InvalidFormat,

    #[error("{message}")]
    OutboundError {
        kind: OutboundErrorKind,
        message: String,
    },

    #[error("{message}")]
    NtpError { kind: NtpErrorKind, message: String },

    #[error("failed to create SOCKS5 client: {0}")]
    ProxyFailed(#[source] Box<CheckerError>),

    #[error("NTP request failed: {0}")]
    QueryFailed(#[source] Box<CheckerError>),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CheckerError {
    pub(crate) fn outbound(kind: OutboundErrorKind, message: impl Into<String>) -> Self {
        CheckerError::OutboundError {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn ntp(kind: NtpErrorKind, message: impl Into<String>) -> Self {
        CheckerError::NtpError {
            kind,
            message: message.into(),
        }
    }

    /// Map this error onto the operator-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckerError::EmptyInput => ErrorKind::Empty,
            CheckerError::InvalidFormat => ErrorKind::Malformed,
            CheckerError::OutboundError { .. } | CheckerError::ProxyFailed(_) => ErrorKind::Proxy,
            CheckerError::NtpError { .. } | CheckerError::QueryFailed(_) => ErrorKind::Ntp,
            CheckerError::IoError(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, CheckerError>;
