//! Configuration management for a Clustore daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration for a Clustore daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Control-plane timeouts.
    pub timeouts: TimeoutConfig,
    /// Keepalive tracker configuration.
    pub keepalive: KeepaliveConfig,
    /// Proxy bootstrap configuration.
    pub proxy: ProxyConfig,
    /// Local node identity and persistence.
    pub node: NodeConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the control-plane listener to.
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1:8080".parse().expect("valid default address") }
    }
}

/// Control-plane timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Outer deadline for discovery and each election round.
    #[serde(with = "humantime_serde")]
    pub startup_time: Duration,
    /// Deadline for a single control-plane operation (one metasync send,
    /// one vote request).
    #[serde(with = "humantime_serde")]
    pub cplane_operation: Duration,
    /// Upper bound on a keepalive round including retries.
    #[serde(with = "humantime_serde")]
    pub max_keepalive: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_time: Duration::from_secs(60),
            cplane_operation: Duration::from_secs(2),
            max_keepalive: Duration::from_secs(4),
        }
    }
}

/// Per-role heartbeat tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveTrackerConfig {
    /// Heartbeat period.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Missed beats before a peer is suspected.
    pub factor: u32,
}

impl Default for KeepaliveTrackerConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(1), factor: 3 }
    }
}

/// Keepalive tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Proxy-side tracker tuning.
    pub proxy: KeepaliveTrackerConfig,
    /// Target-side tracker tuning.
    pub target: KeepaliveTrackerConfig,
    /// Probe attempts for a suspected peer before escalating.
    pub retry_factor: u32,
    /// Extra multiplier past the suspect window before a peer is dead.
    pub timeout_factor: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            proxy: KeepaliveTrackerConfig::default(),
            target: KeepaliveTrackerConfig::default(),
            retry_factor: 2,
            timeout_factor: 3,
        }
    }
}

/// Proxy bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// URL of the known primary, if any.
    pub primary_url: String,
    /// URL probed during discovery in addition to the persisted map.
    pub discovery_url: String,
    /// URL this proxy was originally deployed with.
    pub original_url: String,
    /// If true, this proxy never becomes primary.
    pub non_electable: bool,
}

impl ProxyConfig {
    /// The non-empty bootstrap URLs, in probe order.
    #[must_use]
    pub fn candidate_urls(&self) -> Vec<&str> {
        [&self.primary_url, &self.discovery_url, &self.original_url]
            .into_iter()
            .map(String::as_str)
            .filter(|u| !u.is_empty())
            .collect()
    }
}

/// Local node identity and metadata persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable daemon ID; empty means generate one and persist it.
    pub id: String,
    /// Role this daemon plays.
    pub role: crate::types::NodeRole,
    /// Filesystem roots holding persisted metadata copies.
    pub mountpaths: Vec<PathBuf>,
    /// Persisted copies per snapshot.
    pub copies: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            role: crate::types::NodeRole::Proxy,
            mountpaths: Vec::new(),
            copies: 3,
        }
    }
}
