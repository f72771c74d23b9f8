//! Hostname resolution
//!
//! [`Resolve`] is the capability the dispatcher and the UDP relay call with a
//! deadline. Which transport answers the query is a configuration choice:
//!
//! - [`SystemResolver`] asks the operating system (`getaddrinfo`)
//! - [`UpstreamResolver`] queries a configured DNS server with hickory
//! - [`StaticResolver`] answers from a fixed table
//!
//! The address-family policy lives in [`Resolve::resolve`] so every
//! transport picks addresses the same way.

use crate::config::{DnsConfig, IpPreference};
use crate::error::ResolutionError;
use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{LookupIpStrategy, NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait Resolve: Send + Sync {
    /// lookup returns every address the name resolves to, in the order the
    /// transport produced them
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolutionError>;

    /// resolve looks a name up within `timeout` and picks one address
    async fn resolve(
        &self,
        host: &str,
        timeout: Duration,
        prefer: IpPreference,
    ) -> Result<IpAddr, ResolutionError> {
        let addrs = match tokio::time::timeout(timeout, self.lookup(host)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ResolutionError::Timeout {
                    host: host.to_string(),
                });
            }
        };

        let picked = select_address(&addrs, prefer).ok_or_else(|| ResolutionError::NoAddress {
            host: host.to_string(),
        })?;

        debug!(host, %picked, candidates = addrs.len(), "resolved");
        Ok(picked)
    }
}

/// select_address returns the first address of the preferred family, falling
/// back to the first address of the other family
pub fn select_address(addrs: &[IpAddr], prefer: IpPreference) -> Option<IpAddr> {
    let wanted = |ip: &&IpAddr| match prefer {
        IpPreference::Ipv4 => ip.is_ipv4(),
        IpPreference::Ipv6 => ip.is_ipv6(),
    };

    addrs.iter().find(wanted).or_else(|| addrs.first()).copied()
}

/// from_config builds the resolver named by the DNS section
pub fn from_config(config: &DnsConfig) -> Arc<dyn Resolve> {
    match config.upstream {
        Some(upstream) => Arc::new(UpstreamResolver::new(upstream, config.timeout())),
        None => Arc::new(SystemResolver),
    }
}

/// SystemResolver defers to the operating system resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| ResolutionError::Lookup {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// UpstreamResolver sends queries to one DNS server instead of the system
/// configuration
pub struct UpstreamResolver {
    upstream: SocketAddr,
    resolver: TokioResolver,
}

impl UpstreamResolver {
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        // Plain DNS, UDP with TCP fallback on truncation
        let servers = NameServerConfigGroup::from_ips_clear(&[upstream.ip()], upstream.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], servers);

        let resolver = TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(upstream_options(timeout))
            .build();

        Self { upstream, resolver }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }
}

/// upstream_options gives hickory one attempt within the whole deadline, so
/// its own errors surface instead of the caller's timeout
fn upstream_options(timeout: Duration) -> ResolverOpts {
    let mut opts = ResolverOpts::default();
    opts.timeout = timeout;
    opts.attempts = 1;
    opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
    opts.cache_size = 0;
    opts
}

#[async_trait]
impl Resolve for UpstreamResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ResolutionError::Lookup {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        Ok(lookup.iter().collect())
    }
}

/// StaticResolver answers from a fixed host table; unknown names resolve to
/// nothing
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, addrs: Vec<IpAddr>) -> Self {
        self.hosts.insert(host.into().to_ascii_lowercase(), addrs);
        self
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        Ok(self
            .hosts
            .get(&host.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}
