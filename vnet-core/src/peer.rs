//! Peer directory: who we know, how to reach them, and what addresses they
//! hold on each network.
//!
//! Peers are created on first contact and never removed while the node runs.
//! Each peer keeps a small set of UDP paths scored by recency and RTT; a peer
//! is `Direct` while at least one path is alive and falls back to `Relay`
//! when they all expire.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::event::Event;
use crate::identity::{self, NodeId, KEY_SIZE};
use crate::network::NetworkId;
use crate::storage::CachedPeer;
use crate::transport::PacketCrypto;

/// Weight of a new RTT sample in the moving average.
const RTT_ALPHA: f64 = 0.2;

/// Paths remembered per peer.
const MAX_PATHS: usize = 4;

/// How a peer is currently reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unknown,
    Relay,
    Direct,
}

/// One UDP endpoint a peer has been heard on.
#[derive(Debug, Clone)]
pub struct PeerPath {
    pub endpoint: SocketAddr,
    pub last_heard: Instant,
    /// Smoothed round-trip time, once a HELLO exchange has been timed.
    pub rtt: Option<Duration>,
}

impl PeerPath {
    fn new(endpoint: SocketAddr, now: Instant) -> Self {
        Self {
            endpoint,
            last_heard: now,
            rtt: None,
        }
    }

    /// Update RTT with exponential moving average
    pub fn update_rtt(&mut self, sample: Duration) {
        self.rtt = Some(match self.rtt {
            None => sample,
            Some(old) => {
                let secs =
                    RTT_ALPHA * sample.as_secs_f64() + (1.0 - RTT_ALPHA) * old.as_secs_f64();
                Duration::from_secs_f64(secs)
            }
        });
    }

    pub fn is_alive(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heard) < timeout
    }

    /// Higher is better: recently heard, low-latency paths win.
    fn score(&self, now: Instant) -> f64 {
        let age = now.saturating_duration_since(self.last_heard).as_secs_f64();
        let rtt_ms = self.rtt.map(|r| r.as_secs_f64() * 1000.0).unwrap_or(100.0);
        1000.0 / rtt_ms.max(1.0) - age
    }
}

/// A known peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub address: NodeId,
    pub reachability: Reachability,
    pub is_root: bool,
    public_key: Option<[u8; KEY_SIZE]>,
    link: Option<PacketCrypto>,
    paths: Vec<PeerPath>,
    addresses: HashMap<NetworkId, Vec<IpAddr>>,
}

impl Peer {
    fn new(address: NodeId) -> Self {
        Self {
            address,
            reachability: Reachability::Unknown,
            is_root: false,
            public_key: None,
            link: None,
            paths: Vec::new(),
            addresses: HashMap::new(),
        }
    }

    pub fn public_key(&self) -> Option<&[u8; KEY_SIZE]> {
        self.public_key.as_ref()
    }

    /// Link cipher, present once the peer's key is known.
    pub fn link(&self) -> Option<&PacketCrypto> {
        self.link.as_ref()
    }

    pub fn paths(&self) -> &[PeerPath] {
        &self.paths
    }

    pub fn addresses(&self, network: NetworkId) -> &[IpAddr] {
        self.addresses
            .get(&network)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_direct(&self) -> bool {
        self.reachability == Reachability::Direct
    }
}

/// Read-only view of a peer for callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: NodeId,
    pub reachability: Reachability,
    pub is_root: bool,
    pub endpoints: Vec<SocketAddr>,
    pub rtt: Option<Duration>,
}

/// All peers known to this node.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<NodeId, Peer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: NodeId) -> Option<&Peer> {
        self.peers.get(&address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn entry(&mut self, address: NodeId) -> &mut Peer {
        self.peers
            .entry(address)
            .or_insert_with(|| Peer::new(address))
    }

    /// Record a verified public key and its link cipher.
    pub fn learn_key(&mut self, address: NodeId, public_key: [u8; KEY_SIZE], link: PacketCrypto) {
        let peer = self.entry(address);
        if peer.public_key != Some(public_key) {
            peer.public_key = Some(public_key);
            peer.link = Some(link);
        }
    }

    pub fn set_root(&mut self, address: NodeId) {
        self.entry(address).is_root = true;
    }

    /// Note that `address` was heard on `endpoint`. Returns true when the path
    /// is new.
    pub fn learn_endpoint(&mut self, address: NodeId, endpoint: SocketAddr, now: Instant) -> bool {
        let peer = self.entry(address);
        if let Some(path) = peer.paths.iter_mut().find(|p| p.endpoint == endpoint) {
            path.last_heard = now;
            return false;
        }
        if peer.paths.len() >= MAX_PATHS {
            // Replace the stalest path.
            if let Some(idx) = peer
                .paths
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.last_heard)
                .map(|(i, _)| i)
            {
                peer.paths.remove(idx);
            }
        }
        peer.paths.push(PeerPath::new(endpoint, now));
        true
    }

    /// Refresh an existing path without creating one. Returns false if the
    /// endpoint is not a known path of `address`.
    pub fn touch(&mut self, address: NodeId, endpoint: SocketAddr, now: Instant) -> bool {
        match self
            .peers
            .get_mut(&address)
            .and_then(|p| p.paths.iter_mut().find(|p| p.endpoint == endpoint))
        {
            Some(path) => {
                path.last_heard = now;
                true
            }
            None => false,
        }
    }

    /// Feed a timed HELLO round trip into the path's RTT.
    pub fn record_rtt(&mut self, address: NodeId, endpoint: SocketAddr, sample: Duration) {
        if let Some(path) = self
            .peers
            .get_mut(&address)
            .and_then(|p| p.paths.iter_mut().find(|p| p.endpoint == endpoint))
        {
            path.update_rtt(sample);
        }
    }

    /// Mark `address` directly reachable. Always yields an event, even when
    /// the peer was already direct.
    pub fn mark_direct(&mut self, address: NodeId) -> Event {
        self.entry(address).reachability = Reachability::Direct;
        Event::PeerDirect(address)
    }

    /// Mark `address` reachable only through a relay. Always yields an event.
    pub fn mark_relay(&mut self, address: NodeId) -> Event {
        self.entry(address).reachability = Reachability::Relay;
        Event::PeerRelay(address)
    }

    /// Drop dead paths. Returns the direct peers that have no path left; the
    /// caller demotes them.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<NodeId> {
        let mut lost = Vec::new();
        for peer in self.peers.values_mut() {
            peer.paths.retain(|p| p.is_alive(now, timeout));
            if peer.paths.is_empty() && peer.reachability == Reachability::Direct {
                lost.push(peer.address);
            }
        }
        lost.sort();
        lost
    }

    /// Best live endpoint for `address`.
    pub fn best_endpoint(&self, address: NodeId, now: Instant) -> Option<SocketAddr> {
        let peer = self.peers.get(&address)?;
        peer.paths
            .iter()
            .max_by(|a, b| {
                a.score(now)
                    .partial_cmp(&b.score(now))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|p| p.endpoint)
    }

    /// Replace the addresses `address` advertises on `network`.
    pub fn set_addresses(&mut self, address: NodeId, network: NetworkId, addrs: Vec<IpAddr>) {
        self.entry(address).addresses.insert(network, addrs);
    }

    /// Peer that advertised `ip` on `network`.
    pub fn resolve(&self, network: NetworkId, ip: &IpAddr) -> Option<NodeId> {
        self.peers
            .values()
            .find(|p| p.addresses(network).contains(ip))
            .map(|p| p.address)
    }

    /// Directly reachable roots, best first.
    pub fn direct_roots(&self, now: Instant) -> Vec<(NodeId, SocketAddr)> {
        let mut roots: Vec<_> = self
            .peers
            .values()
            .filter(|p| p.is_root && p.is_direct())
            .filter_map(|p| self.best_endpoint(p.address, now).map(|ep| (p.address, ep)))
            .collect();
        roots.sort_by_key(|(id, _)| *id);
        roots
    }

    pub fn any_root_direct(&self) -> bool {
        self.peers.values().any(|p| p.is_root && p.is_direct())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut out: Vec<_> = self
            .peers
            .values()
            .map(|p| PeerInfo {
                address: p.address,
                reachability: p.reachability,
                is_root: p.is_root,
                endpoints: p.paths.iter().map(|path| path.endpoint).collect(),
                rtt: p.paths.iter().filter_map(|path| path.rtt).min(),
            })
            .collect();
        out.sort_by_key(|p| p.address);
        out
    }

    /// Peers worth remembering across restarts.
    pub fn to_cache(&self) -> Vec<CachedPeer> {
        let mut out: Vec<_> = self
            .peers
            .values()
            .filter_map(|p| {
                p.public_key.map(|key| CachedPeer {
                    address: p.address,
                    public_key: identity::encode_key(&key),
                    endpoints: p.paths.iter().map(|path| path.endpoint).collect(),
                })
            })
            .collect();
        out.sort_by_key(|p| p.address);
        out
    }
}
