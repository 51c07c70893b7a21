//! Node descriptors and cluster roles.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Role a daemon plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Stateless request router and metadata custodian.
    Proxy,
    /// Stateful object server with local filesystems.
    Target,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proxy => write!(f, "proxy"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// One of a node's three network endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetEndpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl NetEndpoint {
    /// Creates an endpoint from host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Builds an `http://host:port{path}` URL for this endpoint.
    ///
    /// `path` must start with `/`.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    /// Parses `host:port`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRequest` on a malformed address.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidRequest(format!("endpoint '{s}' missing port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::InvalidRequest(format!("endpoint '{s}': {e}")))?;
        if host.is_empty() {
            return Err(Error::InvalidRequest(format!("endpoint '{s}' missing host")));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for NetEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-node flag bitset carried in the cluster map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeFlags(u8);

impl NodeFlags {
    /// Proxy may become primary.
    pub const ELECTABLE: Self = Self(1);
    /// Node is under maintenance: keeps its Smap entry, skipped for work.
    pub const MAINTENANCE: Self = Self(1 << 1);
    /// Node is being removed from the cluster.
    pub const DECOMMISSIONING: Self = Self(1 << 2);
    /// Proxy participates in the information-center subset.
    pub const IC_MEMBER: Self = Self(1 << 3);

    /// The empty flag set.
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    /// True if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the set with `other` added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns the set with `other` removed.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

/// Descriptor of one cluster node, as carried in the Smap.
///
/// Two descriptors refer to the same node iff their IDs and all three
/// endpoints match; flags are cluster state, not identity, and are excluded
/// from equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snode {
    /// Stable daemon ID, unique across the cluster.
    pub id: String,
    /// Proxy or target.
    pub role: NodeRole,
    /// Endpoint serving user requests.
    pub public_net: NetEndpoint,
    /// Endpoint for cluster-control traffic (metasync, vote, keepalive).
    pub intra_control_net: NetEndpoint,
    /// Endpoint for bulk intra-cluster data transfer.
    pub intra_data_net: NetEndpoint,
    /// Flag bitset, see [`NodeFlags`].
    #[serde(default)]
    pub flags: NodeFlags,
}

impl Snode {
    /// Creates a descriptor with all three endpoints set to `endpoint`.
    ///
    /// Single-NIC deployments and tests use one address for everything.
    #[must_use]
    pub fn new(id: impl Into<String>, role: NodeRole, endpoint: NetEndpoint) -> Self {
        Self {
            id: id.into(),
            role,
            public_net: endpoint.clone(),
            intra_control_net: endpoint.clone(),
            intra_data_net: endpoint,
            flags: match role {
                NodeRole::Proxy => NodeFlags::ELECTABLE,
                NodeRole::Target => NodeFlags::none(),
            },
        }
    }

    /// Replaces the flag set.
    #[must_use]
    pub fn with_flags(mut self, flags: NodeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// True for proxy nodes.
    #[must_use]
    pub fn is_proxy(&self) -> bool {
        self.role == NodeRole::Proxy
    }

    /// True if this proxy may become primary.
    #[must_use]
    pub fn is_electable(&self) -> bool {
        self.is_proxy() && self.flags.contains(NodeFlags::ELECTABLE)
    }

    /// True if the node is flagged under maintenance or decommissioning;
    /// such nodes keep their entry but are skipped for new work.
    #[must_use]
    pub fn in_maintenance(&self) -> bool {
        self.flags.contains(NodeFlags::MAINTENANCE)
            || self.flags.contains(NodeFlags::DECOMMISSIONING)
    }

    /// Checks that all three endpoints are well-formed.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRequest` naming the offending endpoint.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidRequest("empty daemon ID".into()));
        }
        for (name, ep) in [
            ("public", &self.public_net),
            ("intra-control", &self.intra_control_net),
            ("intra-data", &self.intra_data_net),
        ] {
            if ep.host.is_empty() || ep.port == 0 {
                return Err(Error::InvalidRequest(format!(
                    "node {}: malformed {name} endpoint '{ep}'",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

impl PartialEq for Snode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.role == other.role
            && self.public_net == other.public_net
            && self.intra_control_net == other.intra_control_net
            && self.intra_data_net == other.intra_data_net
    }
}

impl Eq for Snode {}

impl fmt::Display for Snode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            NodeRole::Proxy => write!(f, "p[{}]", self.id),
            NodeRole::Target => write!(f, "t[{}]", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, port: u16) -> Snode {
        Snode::new(id, NodeRole::Proxy, NetEndpoint::new("127.0.0.1", port))
    }

    #[test]
    fn test_endpoint_parse() {
        let ep = NetEndpoint::parse("10.0.0.1:8080").unwrap();
        assert_eq!(ep.host, "10.0.0.1");
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.url("/v1/health"), "http://10.0.0.1:8080/v1/health");

        assert!(NetEndpoint::parse("nohost").is_err());
        assert!(NetEndpoint::parse(":8080").is_err());
        assert!(NetEndpoint::parse("host:notaport").is_err());
    }

    #[test]
    fn test_flags() {
        let f = NodeFlags::ELECTABLE.with(NodeFlags::MAINTENANCE);
        assert!(f.contains(NodeFlags::ELECTABLE));
        assert!(f.contains(NodeFlags::MAINTENANCE));
        assert!(!f.contains(NodeFlags::IC_MEMBER));
        assert!(!f.without(NodeFlags::MAINTENANCE).contains(NodeFlags::MAINTENANCE));
    }

    #[test]
    fn test_equality_ignores_flags() {
        let a = node("p1", 8080);
        let b = node("p1", 8080).with_flags(NodeFlags::none());
        assert_eq!(a, b);

        let c = node("p1", 8081);
        assert_ne!(a, c);
    }

    #[test]
    fn test_electable_requires_proxy() {
        let t = Snode::new("t1", NodeRole::Target, NetEndpoint::new("127.0.0.1", 9090))
            .with_flags(NodeFlags::ELECTABLE);
        assert!(!t.is_electable());

        let p = node("p1", 8080);
        assert!(p.is_electable());
        assert!(!p.with_flags(NodeFlags::none()).is_electable());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let bad = Snode::new("p1", NodeRole::Proxy, NetEndpoint::new("127.0.0.1", 0));
        assert!(bad.validate().is_err());
        assert!(node("p1", 8080).validate().is_ok());
    }

    #[test]
    fn test_serde_round_trip() {
        let n = node("p1", 8080).with_flags(NodeFlags::ELECTABLE.with(NodeFlags::IC_MEMBER));
        let json = serde_json::to_string(&n).unwrap();
        let back: Snode = serde_json::from_str(&json).unwrap();
        assert_eq!(n, back);
        assert_eq!(back.flags, n.flags);
    }
}
