//! Probe driver: one NTP query tunneled through one SOCKS5 proxy.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::config::CheckerConfig;
use crate::error::{CheckerError, OutboundErrorKind, Result};
use crate::ntp::{self, QueryOptions, Response};
use crate::outbound::{AsyncOutbound, Socks5};
use crate::types::{ProbeRequest, ProbeResult, ProxyEndpoint};

/// Builds the dialer that carries the NTP exchange.
pub trait ProxyConnector: Send + Sync {
    fn connect(&self, endpoint: &ProxyEndpoint) -> Result<Box<dyn AsyncOutbound>>;
}

/// Runs one time query over a dialer.
#[async_trait]
pub trait TimeQuerier: Send + Sync {
    async fn query(&self, target: &str, dialer: &dyn AsyncOutbound) -> Result<Response>;
}

/// Production connector: a [`Socks5`] client per endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Socks5Connector {
    pub tcp_timeout: u64,
    pub udp_timeout: u64,
}

impl Default for Socks5Connector {
    fn default() -> Self {
        let config = CheckerConfig::default();
        Self {
            tcp_timeout: config.socks5_tcp_timeout,
            udp_timeout: config.socks5_udp_timeout,
        }
    }
}

impl ProxyConnector for Socks5Connector {
    fn connect(&self, endpoint: &ProxyEndpoint) -> Result<Box<dyn AsyncOutbound>> {
        let client = Socks5::new(
            endpoint.address.as_str(),
            endpoint.username.as_str(),
            endpoint.password.as_str(),
            self.tcp_timeout,
            self.udp_timeout,
        )?;
        Ok(Box::new(client))
    }
}

/// Production querier backed by [`ntp::query_with_options`].
#[derive(Debug, Clone, Copy)]
pub struct SntpQuerier {
    pub timeout: Duration,
    pub version: u8,
}

impl Default for SntpQuerier {
    fn default() -> Self {
        let config = CheckerConfig::default();
        Self {
            timeout: config.ntp_timeout,
            version: config.ntp_version,
        }
    }
}

#[async_trait]
impl TimeQuerier for SntpQuerier {
    async fn query(&self, target: &str, dialer: &dyn AsyncOutbound) -> Result<Response> {
        let opts = QueryOptions::new(dialer)
            .with_timeout(self.timeout)
            .with_version(self.version);
        ntp::query_with_options(target, opts).await
    }
}

/// Runs probes with a given connector and querier.
#[derive(Debug, Clone, Default)]
pub struct Prober<C = Socks5Connector, Q = SntpQuerier> {
    connector: C,
    querier: Q,
}

impl<C: ProxyConnector, Q: TimeQuerier> Prober<C, Q> {
    pub fn new(connector: C, querier: Q) -> Self {
        Self { connector, querier }
    }

    /// Run one probe and classify its failure.
    ///
    /// Failures of the proxy itself (bad address, connect, greeting,
    /// authentication, ASSOCIATE) become [`CheckerError::ProxyFailed`].
    /// Anything else, including DNS failure of the NTP host, becomes
    /// [`CheckerError::QueryFailed`].
    pub async fn run(&self, request: &ProbeRequest) -> ProbeResult {
        let endpoint = &request.endpoint;
        info!(
            "probing {} via {} ({})",
            request.ntp_target,
            endpoint.address,
            if endpoint.is_authenticated() { "authenticated" } else { "no auth" }
        );

        let dialer = self
            .connector
            .connect(endpoint)
            .map_err(|e| CheckerError::ProxyFailed(Box::new(e)))?;

        match self.querier.query(&request.ntp_target, dialer.as_ref()).await {
            Ok(response) => {
                debug!(
                    "probe ok: stratum={} rtt={:?} offset={}",
                    response.stratum, response.round_trip_time, response.clock_offset
                );
                Ok(response)
            }
            Err(e) => {
                warn!("probe failed: {}", e);
                Err(classify(e))
            }
        }
    }
}

fn classify(err: CheckerError) -> CheckerError {
    match err {
        CheckerError::OutboundError { kind, .. } if kind != OutboundErrorKind::DnsFailed => {
            CheckerError::ProxyFailed(Box::new(err))
        }
        other => CheckerError::QueryFailed(Box::new(other)),
    }
}

/// Run one probe with the production SOCKS5 client and SNTP querier.
pub async fn run(request: ProbeRequest) -> ProbeResult {
    Prober::<Socks5Connector, SntpQuerier>::default().run(&request).await
}
