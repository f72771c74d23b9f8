//! Server configuration
//!
//! Everything here has a default so an empty TOML document (or no file at
//! all) yields a working no-auth server on `127.0.0.1:1080`.

use crate::auth::UserPass;
use crate::protocol::Command;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:1080";

/// ServerConfig is read once at startup and shared read-only by all sessions
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listener address
    pub listen: String,

    /// Local IP for outbound connections and the BIND / UDP relay sockets.
    /// Defaults to the IP the client reached us on
    pub bind_ip: Option<IpAddr>,

    pub auth: AuthConfig,
    pub dns: DnsConfig,
    pub timeouts: TimeoutConfig,
    pub rules: RuleSet,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            bind_ip: None,
            auth: AuthConfig::default(),
            dns: DnsConfig::default(),
            timeouts: TimeoutConfig::default(),
            rules: RuleSet::default(),
        }
    }
}

/// AuthConfig holds the credential store and whether it is mandatory
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// With users configured, refuse clients that only offer NO AUTH
    pub required: bool,
    pub users: Vec<UserPass>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required: true,
            users: Vec::new(),
        }
    }
}

/// IpPreference picks which family wins when a name has both
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpPreference {
    #[default]
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DnsConfig {
    /// Upstream DNS server; the system resolver is used when unset
    pub upstream: Option<SocketAddr>,
    pub timeout_secs: u64,
    pub prefer: IpPreference,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            upstream: None,
            timeout_secs: 5,
            prefer: IpPreference::Ipv4,
        }
    }
}

impl DnsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub connect_secs: u64,
    pub bind_accept_secs: u64,
    pub udp_idle_secs: u64,
    pub relay_linger_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 3,
            bind_accept_secs: 60,
            udp_idle_secs: 60,
            relay_linger_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn bind_accept(&self) -> Duration {
        Duration::from_secs(self.bind_accept_secs)
    }

    pub fn udp_idle(&self) -> Duration {
        Duration::from_secs(self.udp_idle_secs)
    }

    pub fn relay_linger(&self) -> Duration {
        Duration::from_secs(self.relay_linger_secs)
    }
}

/// RuleSet lists the commands clients may issue; a disabled command is
/// answered with "connection not allowed by ruleset"
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleSet {
    pub connect: bool,
    pub bind: bool,
    pub udp_associate: bool,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            connect: true,
            bind: true,
            udp_associate: true,
        }
    }
}

impl RuleSet {
    pub fn permits(&self, command: Command) -> bool {
        match command {
            Command::Connect => self.connect,
            Command::Bind => self.bind,
            Command::UdpAssociate => self.udp_associate,
        }
    }
}

impl ServerConfig {
    /// load reads and validates a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {:?}", path.as_ref()))?;

        Self::parse(&content)
    }

    /// parse deserializes and validates a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: ServerConfig =
            toml::from_str(content).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// validate rejects settings the wire protocol or the timers cannot honour
    pub fn validate(&self) -> Result<()> {
        for user in &self.auth.users {
            // ULEN and PLEN are single bytes and must be at least 1
            if user.username.is_empty() || user.username.len() > 255 {
                bail!("[ERR] username must be 1 to 255 bytes long");
            }
            if user.password.is_empty() || user.password.len() > 255 {
                bail!("[ERR] password for {} must be 1 to 255 bytes long", user.username);
            }
        }

        let t = &self.timeouts;
        if self.dns.timeout_secs == 0
            || t.connect_secs == 0
            || t.bind_accept_secs == 0
            || t.udp_idle_secs == 0
            || t.relay_linger_secs == 0
        {
            bail!("[ERR] timeouts must be greater than zero");
        }

        Ok(())
    }

    /// auth_enabled reports whether a credential store is configured
    pub fn auth_enabled(&self) -> bool {
        !self.auth.users.is_empty()
    }
}
