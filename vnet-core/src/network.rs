//! Network membership state machine and address assignment.
//!
//! Each joined network moves `Unjoined -> Joining -> Joined`. Once joined
//! (and only while the node is online) addresses are configured, and each
//! address family's transport-ready flag flips true exactly once per join
//! epoch, yielding one `NetworkReadyIpv4` / `NetworkReadyIpv6` event.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::config::NetworkSettings;
use crate::event::Event;
use crate::identity::NodeId;

/// 64-bit virtual network identifier, printed as sixteen hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(pub u64);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16).map(Self)
    }
}

impl Serialize for NetworkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NetworkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Membership status of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    Unjoined,
    Joining,
    Joined,
}

/// IPv4 prefix such as `10.147.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    base: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(base: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 30 {
            return None;
        }
        let mask = Self::mask_for(prefix);
        Some(Self {
            base: Ipv4Addr::from(u32::from(base) & mask),
            prefix,
        })
    }

    fn mask_for(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_for(self.prefix) == u32::from(self.base)
    }

    /// Host address for `node`, skipping the network and broadcast addresses.
    pub fn host_for(&self, node: NodeId) -> Ipv4Addr {
        let hosts = (1u64 << (32 - self.prefix)) - 2;
        let offset = 1 + node.as_u64() % hosts;
        Ipv4Addr::from(u32::from(self.base) + offset as u32)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("missing prefix length in {s}"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|e| format!("{s}: {e}"))?;
        let prefix: u8 = prefix.parse().map_err(|e| format!("{s}: {e}"))?;
        Self::new(addr, prefix).ok_or_else(|| format!("prefix too long in {s}"))
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

/// RFC4193 address: `fd` + network id + `99 93` + node address.
pub fn rfc4193_addr(network: NetworkId, node: NodeId) -> Ipv6Addr {
    let mut b = [0u8; 16];
    b[0] = 0xfd;
    b[1..9].copy_from_slice(&network.0.to_be_bytes());
    b[9] = 0x99;
    b[10] = 0x93;
    b[11..16].copy_from_slice(&node.to_bytes());
    Ipv6Addr::from(b)
}

/// 6PLANE address: `fc` + folded network id + node address + `::1`.
pub fn sixplane_addr(network: NetworkId, node: NodeId) -> Ipv6Addr {
    let folded = ((network.0 >> 32) ^ network.0) as u32;
    let mut b = [0u8; 16];
    b[0] = 0xfc;
    b[1..5].copy_from_slice(&folded.to_be_bytes());
    b[5..10].copy_from_slice(&node.to_bytes());
    b[15] = 0x01;
    Ipv6Addr::from(b)
}

/// Node embedded in an RFC4193 or 6PLANE address of `network`.
pub fn embedded_node(network: NetworkId, ip: &Ipv6Addr) -> Option<NodeId> {
    let o = ip.octets();
    let rfc = rfc4193_addr(network, NodeId::new(0)).octets();
    if o[..11] == rfc[..11] {
        return Some(NodeId::from_bytes([o[11], o[12], o[13], o[14], o[15]]));
    }
    let plane = sixplane_addr(network, NodeId::new(0)).octets();
    if o[..5] == plane[..5] {
        return Some(NodeId::from_bytes([o[5], o[6], o[7], o[8], o[9]]));
    }
    None
}

/// One network's membership record.
#[derive(Debug, Clone)]
pub struct Membership {
    pub id: NetworkId,
    pub status: MembershipStatus,
    /// Incremented on every fresh join.
    pub epoch: u64,
    pub ready_v4: bool,
    pub ready_v6: bool,
    pub addr_v4: Option<Ipv4Addr>,
    pub addrs_v6: Vec<Ipv6Addr>,
    settings: NetworkSettings,
}

impl Membership {
    pub fn is_ready(&self, family: Family) -> bool {
        match family {
            Family::Ipv4 => self.ready_v4,
            Family::Ipv6 => self.ready_v6,
        }
    }

    /// Addresses that are configured and usable.
    pub fn ready_addresses(&self) -> Vec<IpAddr> {
        let mut out = Vec::new();
        if self.ready_v4 {
            out.extend(self.addr_v4.map(IpAddr::V4));
        }
        if self.ready_v6 {
            out.extend(self.addrs_v6.iter().copied().map(IpAddr::V6));
        }
        out
    }

    /// Whether `ip` falls inside this network's address space.
    pub fn routes(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self
                .settings
                .ipv4_subnet()
                .map(|net| net.contains(*v4))
                .unwrap_or(false),
            IpAddr::V6(v6) => embedded_node(self.id, v6).is_some(),
        }
    }

    pub fn owns(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.addr_v4 == Some(*v4),
            IpAddr::V6(v6) => self.addrs_v6.contains(v6),
        }
    }

    fn configure(&mut self, node: NodeId) {
        self.addr_v4 = self.settings.ipv4_for(node);
        self.addrs_v6.clear();
        if self.settings.rfc4193 {
            self.addrs_v6.push(rfc4193_addr(self.id, node));
        }
        if self.settings.sixplane {
            self.addrs_v6.push(sixplane_addr(self.id, node));
        }
    }
}

/// All networks this node has asked to join.
#[derive(Debug, Default)]
pub struct NetworkTable {
    networks: HashMap<NetworkId, Membership>,
    epochs: u64,
}

impl NetworkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start joining `id`. Returns false if already joining or joined.
    pub fn join(&mut self, id: NetworkId, settings: NetworkSettings) -> bool {
        if self.networks.contains_key(&id) {
            return false;
        }
        self.epochs += 1;
        self.networks.insert(
            id,
            Membership {
                id,
                status: MembershipStatus::Joining,
                epoch: self.epochs,
                ready_v4: false,
                ready_v6: false,
                addr_v4: None,
                addrs_v6: Vec::new(),
                settings,
            },
        );
        true
    }

    /// Leave `id`. Returns false if it was not joined.
    pub fn leave(&mut self, id: NetworkId) -> bool {
        self.networks.remove(&id).is_some()
    }

    /// Move joining networks to joined, configure their addresses and flip
    /// ready flags. Does nothing while the node is offline.
    pub fn advance(&mut self, node: NodeId, online: bool) -> Vec<Event> {
        let mut events = Vec::new();
        if !online {
            return events;
        }

        let mut ids: Vec<_> = self.networks.keys().copied().collect();
        ids.sort();
        for id in ids {
            let Some(net) = self.networks.get_mut(&id) else {
                continue;
            };
            if net.status == MembershipStatus::Joining {
                net.status = MembershipStatus::Joined;
                net.configure(node);
            }
            if !net.ready_v4 && net.addr_v4.is_some() {
                net.ready_v4 = true;
                events.push(Event::NetworkReadyIpv4(id));
            }
            if !net.ready_v6 && !net.addrs_v6.is_empty() {
                net.ready_v6 = true;
                events.push(Event::NetworkReadyIpv6(id));
            }
        }
        events
    }

    pub fn get(&self, id: NetworkId) -> Option<&Membership> {
        self.networks.get(&id)
    }

    pub fn status(&self, id: NetworkId) -> MembershipStatus {
        self.networks
            .get(&id)
            .map(|n| n.status)
            .unwrap_or(MembershipStatus::Unjoined)
    }

    pub fn is_joined(&self, id: NetworkId) -> bool {
        self.status(id) == MembershipStatus::Joined
    }

    pub fn is_ready(&self, id: NetworkId, family: Family) -> bool {
        self.networks
            .get(&id)
            .map(|n| n.is_ready(family))
            .unwrap_or(false)
    }

    /// First usable address of `family` on `id`.
    pub fn address(&self, id: NetworkId, family: Family) -> Option<IpAddr> {
        let net = self.networks.get(&id)?;
        if !net.is_ready(family) {
            return None;
        }
        match family {
            Family::Ipv4 => net.addr_v4.map(IpAddr::V4),
            Family::Ipv6 => net.addrs_v6.first().copied().map(IpAddr::V6),
        }
    }

    /// Network that has configured `ip` as a local address.
    pub fn owner_of(&self, ip: &IpAddr) -> Option<&Membership> {
        self.networks.values().find(|n| n.owns(ip))
    }

    /// Network whose address space contains `ip`.
    pub fn route_for(&self, ip: &IpAddr) -> Option<&Membership> {
        self.networks
            .values()
            .filter(|n| n.status == MembershipStatus::Joined)
            .find(|n| n.routes(ip))
    }

    pub fn any_ready(&self, family: Family) -> bool {
        self.networks.values().any(|n| n.is_ready(family))
    }

    pub fn ids(&self) -> Vec<NetworkId> {
        let mut ids: Vec<_> = self.networks.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Membership> {
        self.networks.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET: NetworkId = NetworkId(0x8056c2e21c000001);

    fn node() -> NodeId {
        NodeId::new(0x12_34_56_78_9a)
    }

    fn v4_events(events: &[Event]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, Event::NetworkReadyIpv4(_)))
            .count()
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut table = NetworkTable::new();
        assert!(table.join(NET, NetworkSettings::default()));
        assert!(!table.join(NET, NetworkSettings::default()));

        let first = table.advance(node(), true);
        assert_eq!(v4_events(&first), 1);

        for _ in 0..5 {
            assert!(!table.join(NET, NetworkSettings::default()));
            assert!(table.advance(node(), true).is_empty());
        }
    }

    #[test]
    fn test_not_ready_while_offline() {
        let mut table = NetworkTable::new();
        table.join(NET, NetworkSettings::default());
        assert!(table.advance(node(), false).is_empty());
        assert_eq!(table.status(NET), MembershipStatus::Joining);
        assert!(!table.is_ready(NET, Family::Ipv4));

        let events = table.advance(node(), true);
        assert_eq!(
            events,
            vec![Event::NetworkReadyIpv4(NET), Event::NetworkReadyIpv6(NET)]
        );
        assert_eq!(table.status(NET), MembershipStatus::Joined);
    }

    #[test]
    fn test_leave_and_rejoin_starts_new_epoch() {
        let mut table = NetworkTable::new();
        table.join(NET, NetworkSettings::default());
        table.advance(node(), true);
        let first_epoch = table.get(NET).unwrap().epoch;
        assert!(table.is_ready(NET, Family::Ipv4));

        assert!(table.leave(NET));
        assert!(!table.leave(NET));
        assert_eq!(table.status(NET), MembershipStatus::Unjoined);

        assert!(table.join(NET, NetworkSettings::default()));
        assert!(!table.is_ready(NET, Family::Ipv4));
        assert!(!table.is_ready(NET, Family::Ipv6));
        assert!(table.get(NET).unwrap().epoch > first_epoch);

        let events = table.advance(node(), true);
        assert_eq!(v4_events(&events), 1);
    }

    #[test]
    fn test_ipv6_only_network() {
        let mut table = NetworkTable::new();
        let settings = NetworkSettings {
            ipv4_pool: None,
            ..Default::default()
        };
        table.join(NET, settings);
        let events = table.advance(node(), true);
        assert_eq!(events, vec![Event::NetworkReadyIpv6(NET)]);
        assert_eq!(table.address(NET, Family::Ipv4), None);
    }

    #[test]
    fn test_rfc4193_layout() {
        let addr = rfc4193_addr(NET, node());
        assert_eq!(addr.to_string(), "fd80:56c2:e21c:0:199:9312:3456:789a");
        assert_eq!(embedded_node(NET, &addr), Some(node()));
        assert_eq!(embedded_node(NetworkId(1), &addr), None);
    }

    #[test]
    fn test_sixplane_embeds_node() {
        let addr = sixplane_addr(NET, node());
        assert_eq!(addr.octets()[0], 0xfc);
        assert_eq!(addr.octets()[15], 0x01);
        assert_eq!(embedded_node(NET, &addr), Some(node()));
    }

    #[test]
    fn test_ipv4_pool_assignment() {
        let pool: Ipv4Cidr = "10.147.0.0/16".parse().unwrap();
        let ip = pool.host_for(node());
        assert!(pool.contains(ip));
        assert_ne!(ip, Ipv4Addr::new(10, 147, 0, 0));
        assert_ne!(ip, Ipv4Addr::new(10, 147, 255, 255));
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/31".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_owner_and_route() {
        let mut table = NetworkTable::new();
        table.join(NET, NetworkSettings::default());
        table.advance(node(), true);

        let local = table.address(NET, Family::Ipv6).unwrap();
        assert_eq!(table.owner_of(&local).map(|n| n.id), Some(NET));

        let other = IpAddr::V6(rfc4193_addr(NET, NodeId::new(0x0a_0b_0c_0d_0e)));
        assert!(table.owner_of(&other).is_none());
        assert_eq!(table.route_for(&other).map(|n| n.id), Some(NET));
    }
}
