//! Engine configuration.
//!
//! `NodeConfig` is usually embedded in the daemon's TOML file; every field has
//! a default so a minimal file only needs `storage_path`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::network::{Ipv4Cidr, NetworkId};

fn default_udp_port() -> u16 {
    9993
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_peer_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_ipv4_pool() -> Option<String> {
    Some("10.147.0.0/16".to_string())
}

/// Configuration for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the identity and caches.
    pub storage_path: PathBuf,

    /// UDP port for peer traffic (0 picks an ephemeral port).
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Local address to bind the UDP socket to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root endpoints (`host:port`). Roots answer WHOIS queries and relay
    /// traffic; while any are configured the node is online only when one of
    /// them is directly reachable.
    #[serde(default)]
    pub roots: Vec<String>,

    /// Static peer endpoints contacted at startup. Unlike roots they do not
    /// affect online status.
    #[serde(default)]
    pub bootstrap: Vec<String>,

    /// Interval between keepalives and discovery rounds.
    #[serde(with = "humantime_serde", default = "default_keepalive_interval")]
    pub keepalive_interval: Duration,

    /// A path that has been silent this long is considered dead.
    #[serde(with = "humantime_serde", default = "default_peer_timeout")]
    pub peer_timeout: Duration,

    /// How long a blocking `connect` waits for the handshake.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Persist known peers to `peers.toml` and reload them on start.
    #[serde(default = "default_true")]
    pub allow_peer_caching: bool,

    /// Persist joined networks to `networks.toml` and rejoin them on start.
    #[serde(default)]
    pub allow_network_caching: bool,

    /// Settings used for networks without an explicit entry.
    #[serde(default)]
    pub default_network: NetworkSettings,

    /// Per-network overrides.
    #[serde(default)]
    pub network_settings: HashMap<NetworkId, NetworkSettings>,

    /// Physical addresses never used as a direct path to the given peer.
    /// Traffic to it goes through a root instead.
    #[serde(default)]
    pub path_blacklist: HashMap<NodeId, Vec<IpAddr>>,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

impl NodeConfig {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            udp_port: default_udp_port(),
            bind_addr: default_bind_addr(),
            roots: Vec::new(),
            bootstrap: Vec::new(),
            keepalive_interval: default_keepalive_interval(),
            peer_timeout: default_peer_timeout(),
            connect_timeout: default_connect_timeout(),
            allow_peer_caching: true,
            allow_network_caching: false,
            default_network: NetworkSettings::default(),
            network_settings: HashMap::new(),
            path_blacklist: HashMap::new(),
        }
    }

    /// Reject settings that would otherwise silently disable an address
    /// family.
    pub fn validate(&self) -> Result<()> {
        self.default_network
            .validate()
            .map_err(|e| Error::argument(format!("default_network: {e}")))?;
        for (id, settings) in &self.network_settings {
            settings
                .validate()
                .map_err(|e| Error::argument(format!("network {id}: {e}")))?;
        }
        Ok(())
    }

    /// Whether `endpoint` may carry direct traffic to `peer`.
    pub fn path_allowed(&self, peer: NodeId, endpoint: std::net::SocketAddr) -> bool {
        !self
            .path_blacklist
            .get(&peer)
            .is_some_and(|ips| ips.contains(&endpoint.ip()))
    }

    pub fn settings_for(&self, id: NetworkId) -> NetworkSettings {
        self.network_settings
            .get(&id)
            .cloned()
            .unwrap_or_else(|| self.default_network.clone())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new("vnet-data")
    }
}

/// Address assignment for one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Static IPv4 address. Takes precedence over `ipv4_pool`.
    #[serde(default)]
    pub ipv4_addr: Option<Ipv4Addr>,

    /// Prefix length used with `ipv4_addr`.
    #[serde(default = "default_ipv4_prefix")]
    pub ipv4_prefix: u8,

    /// CIDR pool from which an IPv4 address is derived from the node address.
    #[serde(default = "default_ipv4_pool")]
    pub ipv4_pool: Option<String>,

    /// Assign the RFC4193 IPv6 address.
    #[serde(default = "default_true")]
    pub rfc4193: bool,

    /// Assign the 6PLANE IPv6 address.
    #[serde(default)]
    pub sixplane: bool,
}

fn default_ipv4_prefix() -> u8 {
    24
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            ipv4_addr: None,
            ipv4_prefix: default_ipv4_prefix(),
            ipv4_pool: default_ipv4_pool(),
            rfc4193: true,
            sixplane: false,
        }
    }
}

impl NetworkSettings {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.ipv4_addr.is_some() && Ipv4Cidr::new(Ipv4Addr::UNSPECIFIED, self.ipv4_prefix).is_none() {
            return Err(format!("invalid ipv4_prefix {}", self.ipv4_prefix));
        }
        if let Some(pool) = &self.ipv4_pool {
            pool.parse::<Ipv4Cidr>()
                .map_err(|e| format!("invalid ipv4_pool: {e}"))?;
        }
        Ok(())
    }

    /// The IPv4 subnet that belongs to this network, if any.
    pub fn ipv4_subnet(&self) -> Option<Ipv4Cidr> {
        match self.ipv4_addr {
            Some(addr) => Ipv4Cidr::new(addr, self.ipv4_prefix),
            None => self.ipv4_pool.as_deref().and_then(|p| p.parse().ok()),
        }
    }

    /// IPv4 address for `node`, if this network assigns one.
    pub fn ipv4_for(&self, node: NodeId) -> Option<Ipv4Addr> {
        if let Some(addr) = self.ipv4_addr {
            return Some(addr);
        }
        self.ipv4_pool
            .as_deref()
            .and_then(|p| p.parse::<Ipv4Cidr>().ok())
            .map(|pool| pool.host_for(node))
    }
}
