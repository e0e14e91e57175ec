//! Service control loop.
//!
//! Runs on the node's service thread. One `select!` loop drives discovery
//! and keepalives, reads the UDP socket, ships frames produced by the virtual
//! stack, advances network membership and emits lifecycle events.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::event::{Event, EventBus};
use crate::identity::{self, Identity, NodeId, KEY_SIZE};
use crate::network::{NetworkId, NetworkTable};
use crate::peer::{PeerDirectory, Reachability};
use crate::proto::{Message, Packet, PacketFlags, PacketHeader, PacketKind, MAX_PACKET_SIZE};
use crate::stack::{FrameSink, Stack};
use crate::storage::Storage;
use crate::transport::{PacketCrypto, PeerSocket};

/// How often the virtual stack's timers run.
const STACK_TICK: Duration = Duration::from_millis(100);

/// Interval between peer cache writes.
const PERSIST_INTERVAL: Duration = Duration::from_secs(60);

const UDP_RECV_BUF_SIZE: usize = 2048;

/// Destination used when the receiver's address is not known yet.
const ANY_NODE: NodeId = NodeId::new(0);

/// An unanswered HELLO, keyed by the endpoint it went to.
#[derive(Debug, Clone, Copy)]
struct Challenge {
    value: u64,
    sent: Instant,
}

/// A frame the virtual stack wants delivered to a peer.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub network: NetworkId,
    pub dest: NodeId,
    pub frame: Vec<u8>,
}

/// `FrameSink` feeding the service loop.
pub(crate) struct FrameQueue(pub mpsc::UnboundedSender<Outbound>);

impl FrameSink for FrameQueue {
    fn send_frame(&self, network: NetworkId, dest: NodeId, frame: Vec<u8>) {
        if self.0.send(Outbound { network, dest, frame }).is_err() {
            trace!(%network, %dest, "service loop gone; dropping frame");
        }
    }
}

/// State shared between the service loop and the caller-facing `Node`.
pub(crate) struct Shared {
    pub networks: Arc<Mutex<NetworkTable>>,
    pub peers: Arc<Mutex<PeerDirectory>>,
    pub stack: Arc<Stack>,
    pub online: AtomicBool,
    /// Set by `join`/`leave` so membership changes are handled promptly.
    pub wake: Notify,
}

pub(crate) struct Service {
    identity: Identity,
    config: NodeConfig,
    storage: Storage,
    socket: PeerSocket,
    shared: Arc<Shared>,
    events: EventBus,
    frames: mpsc::UnboundedReceiver<Outbound>,
    roots: Vec<SocketAddr>,
    bootstrap: Vec<SocketAddr>,
    sequence: u64,
    online: bool,
    /// Join epoch whose addresses have been announced, per network.
    announced: HashMap<NetworkId, u64>,
    cached_networks: Vec<NetworkId>,
    /// A path is only promoted when its endpoint answers one of these.
    challenges: HashMap<SocketAddr, Challenge>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Identity,
        config: NodeConfig,
        storage: Storage,
        socket: PeerSocket,
        shared: Arc<Shared>,
        events: EventBus,
        frames: mpsc::UnboundedReceiver<Outbound>,
        roots: Vec<SocketAddr>,
        bootstrap: Vec<SocketAddr>,
    ) -> Self {
        Self {
            identity,
            config,
            storage,
            socket,
            shared,
            events,
            frames,
            roots,
            bootstrap,
            // Random start so nonces are not reused across restarts.
            sequence: rand::random::<u64>() >> 1,
            online: false,
            announced: HashMap::new(),
            cached_networks: Vec::new(),
            challenges: HashMap::new(),
        }
    }

    fn me(&self) -> NodeId {
        self.identity.address()
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut buf = [0u8; UDP_RECV_BUF_SIZE];
        let mut tick = tokio::time::interval(self.config.keepalive_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stack_tick = tokio::time::interval(STACK_TICK);
        stack_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_persist = Instant::now();
        let shared = Arc::clone(&self.shared);

        info!(node = %self.me(), roots = self.roots.len(), "service loop started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.on_tick().await;
                    if last_persist.elapsed() >= PERSIST_INTERVAL {
                        self.persist_peers();
                        last_persist = Instant::now();
                    }
                }
                _ = stack_tick.tick() => {
                    self.shared.stack.poll_timers(Instant::now());
                }
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((n, from)) => self.on_datagram(&buf[..n], from).await,
                        // ICMP errors surface here on some platforms.
                        Err(e) => debug!("UDP receive failed: {e}"),
                    }
                }
                Some(out) = self.frames.recv() => {
                    self.send_frame(out).await;
                }
                _ = shared.wake.notified() => {
                    self.update_membership().await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("stop requested");
                        break;
                    }
                }
            }
        }

        if self.online {
            self.online = false;
            self.shared.online.store(false, Ordering::Release);
            self.events.emit(Event::NodeOffline(self.me())).await;
        }
        self.persist_peers();
        self.persist_networks();
        info!(node = %self.me(), "service loop stopped");
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let timeout = self.config.peer_timeout;
        self.challenges
            .retain(|_, c| now.saturating_duration_since(c.sent) < timeout);
        self.discover(now).await;

        let lost = self.shared.peers.lock().expire(now, self.config.peer_timeout);
        let demoted: Vec<Event> = {
            let mut peers = self.shared.peers.lock();
            lost.into_iter().map(|id| peers.mark_relay(id)).collect()
        };
        for event in &demoted {
            info!(%event, "peer lost its direct path");
        }
        self.events.emit_all(demoted).await;

        let online = self.roots.is_empty() || self.shared.peers.lock().any_root_direct();
        if online != self.online {
            self.online = online;
            self.shared.online.store(online, Ordering::Release);
            let event = if online {
                Event::NodeOnline(self.me())
            } else {
                Event::NodeOffline(self.me())
            };
            info!(%event, "node status changed");
            self.events.emit(event).await;
        }

        self.update_membership().await;
    }

    /// HELLO to configured endpoints and to known peers without a direct
    /// path; keepalives to direct peers.
    async fn discover(&mut self, now: Instant) {
        let mut hellos: Vec<(NodeId, SocketAddr)> = Vec::new();
        let mut keepalives: Vec<(NodeId, SocketAddr)> = Vec::new();
        {
            let peers = self.shared.peers.lock();
            for ep in self.roots.iter().chain(self.bootstrap.iter()) {
                let known = peers
                    .iter()
                    .find(|p| p.paths().iter().any(|path| path.endpoint == *ep))
                    .map(|p| p.address);
                // Direct peers are kept alive below.
                if known.is_some_and(|id| peers.get(id).is_some_and(|p| p.is_direct())) {
                    continue;
                }
                hellos.push((known.unwrap_or(ANY_NODE), *ep));
            }
            for peer in peers.iter() {
                if peer.is_direct() {
                    if let Some(ep) = peers.best_endpoint(peer.address, now) {
                        keepalives.push((peer.address, ep));
                    }
                } else {
                    for path in peer.paths() {
                        if !hellos.iter().any(|(_, ep)| *ep == path.endpoint) {
                            hellos.push((peer.address, path.endpoint));
                        }
                    }
                }
            }
        }

        for (dest, ep) in hellos {
            self.send_hello(dest, ep).await;
        }
        for (dest, ep) in keepalives {
            self.send_sealed_to(dest, ep, Message::Keepalive, false).await;
        }
    }

    /// Advance membership and announce fresh addresses. Only progresses
    /// while online, which keeps `NodeOnline` ahead of any ready event.
    async fn update_membership(&mut self) {
        let (events, fresh, ids) = {
            let mut networks = self.shared.networks.lock();
            let events = networks.advance(self.me(), self.online);
            let fresh: Vec<NetworkId> = networks
                .iter()
                .filter(|n| !n.ready_addresses().is_empty())
                .filter(|n| self.announced.get(&n.id) != Some(&n.epoch))
                .map(|n| n.id)
                .collect();
            for id in &fresh {
                if let Some(net) = networks.get(*id) {
                    self.announced.insert(*id, net.epoch);
                }
            }
            (events, fresh, networks.ids())
        };
        self.announced.retain(|id, _| ids.contains(id));

        for event in &events {
            info!(%event, "network transport ready");
        }
        self.events.emit_all(events).await;

        if !fresh.is_empty() {
            let targets: Vec<NodeId> = self
                .shared
                .peers
                .lock()
                .iter()
                .filter(|p| p.link().is_some() && p.reachability != Reachability::Unknown)
                .map(|p| p.address)
                .collect();
            for peer in targets {
                self.announce(peer, &fresh).await;
            }
        }

        if ids != self.cached_networks {
            self.cached_networks = ids;
            self.persist_networks();
        }
    }

    async fn announce(&mut self, peer: NodeId, networks: &[NetworkId]) {
        let messages: Vec<Message> = {
            let table = self.shared.networks.lock();
            networks
                .iter()
                .filter_map(|id| table.get(*id))
                .map(|net| Message::Announce {
                    network: net.id,
                    addrs: net.ready_addresses(),
                })
                .filter(|m| matches!(m, Message::Announce { addrs, .. } if !addrs.is_empty()))
                .collect()
        };
        for msg in messages {
            self.send_sealed(peer, msg).await;
        }
    }

    async fn announce_all(&mut self, peer: NodeId) {
        let ids = self.shared.networks.lock().ids();
        self.announce(peer, &ids).await;
    }

    async fn on_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                trace!(%from, "ignoring datagram: {e}");
                return;
            }
        };
        let header = &packet.header;
        if header.source == self.me() {
            return;
        }

        if header.dest != self.me() && header.dest != ANY_NODE {
            self.relay(&packet, data, from).await;
            return;
        }

        match header.kind {
            kind if kind.is_sealed() => {
                if header.dest == self.me() {
                    self.on_sealed(&packet, from).await;
                }
            }
            PacketKind::Hello => match Message::decode(header.kind, &packet.payload) {
                Ok(Message::Hello {
                    public_key,
                    challenge,
                }) => self.on_hello(header.source, public_key, challenge, from).await,
                Ok(_) => {}
                Err(e) => debug!(%from, "bad HELLO payload: {e}"),
            },
            PacketKind::HelloAck if header.dest == self.me() => self.on_hello_ack(&packet, from).await,
            _ => {}
        }
    }

    /// Forward a packet that is not addressed to us, unchanged, to a peer we
    /// reach directly.
    async fn relay(&mut self, packet: &Packet, raw: &[u8], from: SocketAddr) {
        let dest = packet.header.dest;
        let target = {
            let peers = self.shared.peers.lock();
            peers
                .get(dest)
                .filter(|p| p.is_direct())
                .and_then(|_| peers.best_endpoint(dest, Instant::now()))
        };
        match target {
            Some(ep) if ep != from => {
                trace!(src = %packet.header.source, %dest, "relaying {} bytes", raw.len());
                if let Err(e) = self.socket.send_to(raw, ep).await {
                    debug!(%ep, "relay send failed: {e}");
                }
            }
            _ => trace!(%dest, "cannot relay: no direct path"),
        }
    }

    /// Link cipher for `source` if `public_key` really hashes to it.
    fn link_for(&self, source: NodeId, public_key: &[u8; KEY_SIZE], from: SocketAddr) -> Option<PacketCrypto> {
        let derived = identity::address_from_public_key(public_key);
        if derived != source || source.is_reserved() || source == self.me() {
            warn!(%from, claimed = %source, %derived, "HELLO key does not match address");
            return None;
        }
        let known = self
            .shared
            .peers
            .lock()
            .get(source)
            .filter(|p| p.public_key() == Some(public_key))
            .and_then(|p| p.link().cloned());
        Some(known.unwrap_or_else(|| PacketCrypto::new(&self.identity.agree(public_key))))
    }

    /// Answer with an authenticated HELLO_ACK and challenge the sender back.
    /// A HELLO alone proves nothing about the endpoint, so no path is
    /// created here.
    async fn on_hello(&mut self, source: NodeId, public_key: [u8; KEY_SIZE], challenge: u64, from: SocketAddr) {
        if !self.config.path_allowed(source, from) {
            trace!(%source, %from, "ignoring HELLO on blacklisted path");
            return;
        }
        let Some(link) = self.link_for(source, &public_key, from) else {
            return;
        };
        let live_path = {
            let mut peers = self.shared.peers.lock();
            peers.learn_key(source, public_key, link.clone());
            peers
                .get(source)
                .is_some_and(|p| p.is_direct() && p.paths().iter().any(|path| path.endpoint == from))
        };

        self.send_hello_ack(source, from, challenge, &link).await;

        let now = Instant::now();
        let waiting = self
            .challenges
            .get(&from)
            .is_some_and(|c| now.saturating_duration_since(c.sent) < self.config.keepalive_interval);
        if !live_path && !waiting {
            self.send_hello(source, from).await;
        }
    }

    /// Promote `from` to a direct path once it answers our challenge under
    /// the link key.
    async fn on_hello_ack(&mut self, packet: &Packet, from: SocketAddr) {
        let source = packet.header.source;
        let (public_key, challenge) = match Message::decode(PacketKind::HelloAck, &packet.payload) {
            Ok(Message::HelloAck {
                public_key,
                challenge,
            }) => (public_key, challenge),
            Ok(_) => return,
            Err(e) => {
                debug!(%from, "bad HELLO_ACK payload: {e}");
                return;
            }
        };
        match self.challenges.get(&from) {
            Some(c) if c.value == challenge => {}
            _ => {
                debug!(%from, claimed = %source, "unsolicited HELLO_ACK");
                return;
            }
        }
        if !self.config.path_allowed(source, from) {
            debug!(%source, %from, "ignoring HELLO_ACK on blacklisted path");
            return;
        }
        let Some(link) = self.link_for(source, &public_key, from) else {
            return;
        };
        if let Err(e) = link.verify_packet(packet) {
            warn!(%from, claimed = %source, "HELLO_ACK failed authentication: {e}");
            return;
        }
        let Some(sent) = self.challenges.remove(&from).map(|c| c.sent) else {
            return;
        };

        let now = Instant::now();
        let (became_direct, event) = {
            let mut peers = self.shared.peers.lock();
            peers.learn_key(source, public_key, link);
            let new_path = peers.learn_endpoint(source, from, now);
            if self.roots.contains(&from) {
                peers.set_root(source);
            }
            peers.record_rtt(source, from, now.saturating_duration_since(sent));
            let was_direct = peers.get(source).is_some_and(|p| p.is_direct());
            if new_path || !was_direct {
                (!was_direct, Some(peers.mark_direct(source)))
            } else {
                (false, None)
            }
        };

        if let Some(event) = event {
            info!(%event, endpoint = %from, "direct path");
            self.events.emit(event).await;
        }
        if became_direct {
            self.announce_all(source).await;
        }
    }

    async fn on_sealed(&mut self, packet: &Packet, from: SocketAddr) {
        let source = packet.header.source;
        let link = self.shared.peers.lock().get(source).and_then(|p| p.link().cloned());
        let Some(link) = link else {
            debug!(%source, "packet from unknown peer; asking roots");
            self.whois(source).await;
            return;
        };
        let payload = match link.open_packet(packet) {
            Ok(p) => p,
            Err(e) => {
                debug!(%source, %from, "dropping packet: {e}");
                return;
            }
        };
        let msg = match Message::decode(packet.header.kind, &payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%source, "bad {} payload: {e}", packet.header.kind);
                return;
            }
        };

        let now = Instant::now();
        // Relayed packets say nothing about the direct path.
        if !packet.header.flags.is_set(PacketFlags::VIA_RELAY) {
            let known = self.shared.peers.lock().touch(source, from, now);
            if !known && !self.challenges.contains_key(&from) {
                // Heard on a new endpoint; it becomes a path once it answers.
                self.send_hello(source, from).await;
            }
        }

        match msg {
            Message::Keepalive => {}
            Message::Frame { network, data } => {
                if self.shared.networks.lock().is_joined(network) {
                    self.shared.stack.input(network, source, &data);
                } else {
                    trace!(%network, %source, "frame for a network we are not in");
                }
            }
            Message::Whois { address } => {
                let reply = {
                    let peers = self.shared.peers.lock();
                    peers.get(address).and_then(|p| {
                        p.public_key().map(|key| Message::WhoisReply {
                            address,
                            public_key: *key,
                            endpoint: peers.best_endpoint(address, now),
                        })
                    })
                };
                if let Some(reply) = reply {
                    self.send_sealed(source, reply).await;
                }
            }
            Message::WhoisReply {
                address,
                public_key,
                endpoint,
            } => self.on_whois_reply(address, public_key, endpoint).await,
            Message::Announce { network, addrs } => {
                debug!(peer = %source, %network, ?addrs, "addresses announced");
                self.shared.peers.lock().set_addresses(source, network, addrs);
            }
            Message::Hello { .. } | Message::HelloAck { .. } => {}
        }
    }

    async fn on_whois_reply(&mut self, address: NodeId, public_key: [u8; KEY_SIZE], endpoint: Option<SocketAddr>) {
        if identity::address_from_public_key(&public_key) != address || address == self.me() {
            warn!(%address, "WHOIS reply key does not match address");
            return;
        }
        let link = PacketCrypto::new(&self.identity.agree(&public_key));
        let event = {
            let mut peers = self.shared.peers.lock();
            peers.learn_key(address, public_key, link);
            match peers.get(address).map(|p| p.reachability) {
                Some(Reachability::Unknown) => Some(peers.mark_relay(address)),
                _ => None,
            }
        };
        if let Some(event) = event {
            info!(%event, "peer resolved through root");
            self.events.emit(event).await;
            self.announce_all(address).await;
        }
        // Try for a direct path as well.
        if let Some(ep) = endpoint {
            self.send_hello(address, ep).await;
        }
    }

    async fn whois(&mut self, address: NodeId) {
        let roots = self.shared.peers.lock().direct_roots(Instant::now());
        if let Some((root, ep)) = roots.into_iter().find(|(id, _)| *id != address) {
            self.send_sealed_to(root, ep, Message::Whois { address }, false).await;
        }
    }

    async fn send_frame(&mut self, out: Outbound) {
        if out.dest == self.me() {
            self.shared.stack.input(out.network, out.dest, &out.frame);
            return;
        }
        let known = self
            .shared
            .peers
            .lock()
            .get(out.dest)
            .is_some_and(|p| p.link().is_some());
        if !known {
            // The stack retransmits; by then WHOIS may have answered.
            self.whois(out.dest).await;
            return;
        }
        self.send_sealed(
            out.dest,
            Message::Frame {
                network: out.network,
                data: out.frame,
            },
        )
        .await;
    }

    /// Seal `msg` for `dest` and send it directly when possible, otherwise
    /// through a root.
    async fn send_sealed(&mut self, dest: NodeId, msg: Message) {
        let now = Instant::now();
        let route = {
            let peers = self.shared.peers.lock();
            let direct = peers
                .get(dest)
                .filter(|p| p.is_direct())
                .and_then(|_| peers.best_endpoint(dest, now));
            match direct {
                Some(ep) => Some((ep, false)),
                None => peers
                    .direct_roots(now)
                    .into_iter()
                    .find(|(root, _)| *root != dest)
                    .map(|(_, ep)| (ep, true)),
            }
        };
        match route {
            Some((ep, via_relay)) => self.send_sealed_to(dest, ep, msg, via_relay).await,
            None => trace!(%dest, "no route to peer; dropping {}", msg.kind()),
        }
    }

    async fn send_sealed_to(&mut self, dest: NodeId, ep: SocketAddr, msg: Message, via_relay: bool) {
        let link = self.shared.peers.lock().get(dest).and_then(|p| p.link().cloned());
        let Some(link) = link else {
            return;
        };
        let mut header = PacketHeader::new(msg.kind(), dest, self.me(), self.next_sequence());
        if via_relay {
            header.flags.set(PacketFlags::VIA_RELAY);
        }
        let packet = match link.seal_packet(header, &msg.encode()) {
            Ok(p) => p,
            Err(e) => {
                warn!(%dest, "failed to seal packet: {e}");
                return;
            }
        };
        if packet.total_size() > MAX_PACKET_SIZE {
            warn!(%dest, size = packet.total_size(), "packet too large; dropping");
            return;
        }
        if let Err(e) = self.socket.send_to(&packet.encode(), ep).await {
            debug!(%dest, %ep, "send failed: {e}");
        }
    }

    async fn send_hello(&mut self, dest: NodeId, ep: SocketAddr) {
        if !self.config.path_allowed(dest, ep) {
            return;
        }
        let challenge = Challenge {
            value: rand::random(),
            sent: Instant::now(),
        };
        self.challenges.insert(ep, challenge);
        let msg = Message::Hello {
            public_key: self.identity.public_key(),
            challenge: challenge.value,
        };
        let header = PacketHeader::new(msg.kind(), dest, self.me(), self.next_sequence());
        let packet = Packet::new(header, msg.encode());
        if let Err(e) = self.socket.send_to(&packet.encode(), ep).await {
            debug!(%ep, "HELLO send failed: {e}");
        }
    }

    async fn send_hello_ack(&mut self, dest: NodeId, ep: SocketAddr, challenge: u64, link: &PacketCrypto) {
        let msg = Message::HelloAck {
            public_key: self.identity.public_key(),
            challenge,
        };
        let header = PacketHeader::new(msg.kind(), dest, self.me(), self.next_sequence());
        let packet = match link.sign_packet(header, &msg.encode()) {
            Ok(p) => p,
            Err(e) => {
                warn!(%dest, "failed to sign HELLO_ACK: {e}");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&packet.encode(), ep).await {
            debug!(%ep, "HELLO_ACK send failed: {e}");
        }
    }

    fn persist_peers(&self) {
        if !self.config.allow_peer_caching {
            return;
        }
        let cache = self.shared.peers.lock().to_cache();
        if let Err(e) = self.storage.save_peers(&cache) {
            warn!("failed to save peer cache: {e}");
        }
    }

    fn persist_networks(&self) {
        if !self.config.allow_network_caching {
            return;
        }
        let ids = self.shared.networks.lock().ids();
        if let Err(e) = self.storage.save_networks(&ids) {
            warn!("failed to save network cache: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_queue_forwards_to_loop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = FrameQueue(tx);
        sink.send_frame(NetworkId(7), NodeId::new(9), vec![1, 2, 3]);

        let out = rx.try_recv().unwrap();
        assert_eq!(out.network, NetworkId(7));
        assert_eq!(out.dest, NodeId::new(9));
        assert_eq!(out.frame, vec![1, 2, 3]);
    }

    #[test]
    fn test_frame_queue_tolerates_closed_loop() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        FrameQueue(tx).send_frame(NetworkId(1), NodeId::new(2), Vec::new());
    }
}
