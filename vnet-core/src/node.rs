//! The engine context.
//!
//! A [`Node`] owns everything a running instance needs: identity, storage,
//! the peer directory, network memberships, the virtual stack and the
//! service thread. Handles are cheap to clone; several nodes can run in one
//! process.

use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::error::{Error, Result, ServiceFault};
use crate::event::{EventBus, EventObserver, ObserverRegistry};
use crate::identity::{self, NodeId};
use crate::network::{Family, MembershipStatus, NetworkId, NetworkTable};
use crate::peer::{PeerDirectory, PeerInfo};
use crate::service::{FrameQueue, Service, Shared};
use crate::socket::SocketLayer;
use crate::stack::Stack;
use crate::storage::Storage;
use crate::transport::{PacketCrypto, PeerSocket};

const SERVICE_THREAD: &str = "vnet-service";

struct Inner {
    id: NodeId,
    shared: Arc<Shared>,
    sockets: SocketLayer,
    config: NodeConfig,
    observers: ObserverRegistry,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    local_udp: SocketAddr,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

/// Handle to a running node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    /// Load or create the identity, bind the UDP socket and start the
    /// service thread. Storage and socket failures are returned here rather
    /// than reported later.
    pub fn start(config: NodeConfig, observer: Option<Arc<dyn EventObserver>>) -> Result<Self> {
        config.validate()?;
        let storage = Storage::open(&config.storage_path)?;
        let identity = storage.load_or_create_identity()?;
        let id = identity.address();

        let roots = resolve_endpoints(&config.roots)?;
        let bootstrap = resolve_endpoints(&config.bootstrap)?;

        let bind = format!("{}:{}", config.bind_addr, config.udp_port);
        let udp = std::net::UdpSocket::bind(&bind)
            .map_err(|e| Error::General(format!("failed to bind UDP socket to {bind}: {e}")))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::General(format!("failed to build runtime: {e}")))?;
        let socket = {
            let _guard = runtime.enter();
            PeerSocket::from_std(udp)
                .map_err(|e| Error::General(format!("failed to register UDP socket: {e}")))?
        };
        let local_udp = socket
            .local_addr()
            .map_err(|e| Error::General(format!("failed to read UDP address: {e}")))?;

        let mut peers = PeerDirectory::new();
        if config.allow_peer_caching {
            load_cached_peers(&storage, &identity, &mut peers);
        }
        let mut networks = NetworkTable::new();
        if config.allow_network_caching {
            for nwid in load_cached_networks(&storage) {
                networks.join(nwid, config.settings_for(nwid));
            }
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let stack = Arc::new(Stack::new(
            Arc::new(FrameQueue(frame_tx)),
            config.connect_timeout,
        ));
        let shared = Arc::new(Shared {
            networks: Arc::new(Mutex::new(networks)),
            peers: Arc::new(Mutex::new(peers)),
            stack,
            online: AtomicBool::new(false),
            wake: Notify::new(),
        });

        let (events, dispatcher) = EventBus::new();
        let observers = events.registry();
        if let Some(observer) = observer {
            observers.set(observer);
        }

        let running = Arc::new(AtomicBool::new(true));
        let sockets = SocketLayer::new(
            id,
            Arc::clone(&shared.stack),
            Arc::clone(&shared.networks),
            Arc::clone(&shared.peers),
            Arc::clone(&running),
        );
        let (stop_tx, stop_rx) = watch::channel(false);

        let service = Service::new(
            identity,
            config.clone(),
            storage,
            socket,
            Arc::clone(&shared),
            events,
            frame_rx,
            roots,
            bootstrap,
        );
        let thread = thread::Builder::new()
            .name(SERVICE_THREAD.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let dispatch = tokio::spawn(dispatcher.run());
                    service.run(stop_rx).await;
                    // The loop owned the last bus; wait for queued events.
                    let _ = dispatch.await;
                });
            })
            .map_err(|e| Error::General(format!("failed to spawn service thread: {e}")))?;
        let thread_id = thread.thread().id();

        info!(node = %id, udp = %local_udp, "node started");
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                shared,
                sockets,
                config,
                observers,
                running,
                stop_tx,
                local_udp,
                thread: Mutex::new(Some(thread)),
                thread_id,
            }),
        })
    }

    /// Stop the node. Idempotent and terminal: sockets fail with
    /// `Service(Stopped)` afterwards and blocked calls are aborted. When
    /// called from an observer the service thread is not joined.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(node = %self.inner.id, "stopping node");
        self.inner.shared.stack.abort_all();
        let _ = self.inner.stop_tx.send(true);

        if thread::current().id() == self.inner.thread_id {
            return;
        }
        if let Some(handle) = self.inner.thread.lock().take() {
            if handle.join().is_err() {
                warn!("service thread panicked");
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Service(ServiceFault::Stopped))
        }
    }

    /// Ask to join `nwid`. Repeated joins are no-ops; readiness is reported
    /// through `NetworkReadyIpv4`/`NetworkReadyIpv6` events.
    pub fn join(&self, nwid: NetworkId) -> Result<()> {
        self.ensure_running()?;
        if nwid.0 == 0 {
            return Err(Error::argument("network id 0 is not valid"));
        }
        let settings = self.inner.config.settings_for(nwid);
        let mut networks = self.inner.shared.networks.lock();
        if networks.join(nwid, settings) {
            self.inner.shared.stack.enable_network(nwid);
            drop(networks);
            info!(network = %nwid, "joining network");
            self.inner.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Leave `nwid`. Sockets bound to it fail with `NetworkLeft`.
    pub fn leave(&self, nwid: NetworkId) -> Result<()> {
        self.ensure_running()?;
        let mut networks = self.inner.shared.networks.lock();
        if networks.leave(nwid) {
            // Under the table lock so a racing connect sees either the
            // membership or the invalidation.
            self.inner.shared.stack.invalidate_network(nwid);
            drop(networks);
            info!(network = %nwid, "left network");
            self.inner.shared.wake.notify_one();
        }
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.inner.running.load(Ordering::Acquire) && self.inner.shared.online.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.id
    }

    /// Whether either family's transport is ready on `nwid`.
    pub fn transport_is_ready(&self, nwid: NetworkId) -> bool {
        let networks = self.inner.shared.networks.lock();
        networks.is_ready(nwid, Family::Ipv4) || networks.is_ready(nwid, Family::Ipv6)
    }

    pub fn network_status(&self, nwid: NetworkId) -> MembershipStatus {
        self.inner.shared.networks.lock().status(nwid)
    }

    /// This node's address of `family` on `nwid`, once that transport is
    /// ready.
    pub fn address(&self, nwid: NetworkId, family: Family) -> Option<IpAddr> {
        self.inner.shared.networks.lock().address(nwid, family)
    }

    /// Register the event observer, replacing the previous one.
    pub fn set_observer(&self, observer: Arc<dyn EventObserver>) {
        self.inner.observers.set(observer);
    }

    pub fn clear_observer(&self) {
        self.inner.observers.clear();
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.shared.peers.lock().snapshot()
    }

    pub fn joined_networks(&self) -> Vec<NetworkId> {
        self.inner.shared.networks.lock().ids()
    }

    pub fn local_udp_addr(&self) -> SocketAddr {
        self.inner.local_udp
    }

    /// Socket operations on this node's virtual addresses.
    pub fn sockets(&self) -> &SocketLayer {
        &self.inner.sockets
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("udp", &self.inner.local_udp)
            .field("running", &self.is_running())
            .finish()
    }
}

fn resolve_endpoints(entries: &[String]) -> Result<Vec<SocketAddr>> {
    let mut out = Vec::new();
    for entry in entries {
        let mut addrs = entry
            .to_socket_addrs()
            .map_err(|e| Error::argument(format!("cannot resolve endpoint {entry}: {e}")))?;
        match addrs.next() {
            Some(addr) => out.push(addr),
            None => return Err(Error::argument(format!("endpoint {entry} has no address"))),
        }
    }
    Ok(out)
}

/// Caches are best-effort: an unreadable file is dropped and rebuilt.
fn load_cached_peers(storage: &Storage, identity: &identity::Identity, peers: &mut PeerDirectory) {
    let now = std::time::Instant::now();
    let cached = match storage.load_peers() {
        Ok(cached) => cached,
        Err(e) => {
            warn!("discarding peer cache: {e}");
            if let Err(e) = storage.discard_peers() {
                warn!("{e}");
            }
            return;
        }
    };
    for peer in &cached {
        let Ok(key) = identity::decode_key(&peer.public_key) else {
            continue;
        };
        if peer.address == identity.address() {
            continue;
        }
        peers.learn_key(peer.address, key, PacketCrypto::new(&identity.agree(&key)));
        for ep in &peer.endpoints {
            peers.learn_endpoint(peer.address, *ep, now);
        }
    }
    if !cached.is_empty() {
        info!(count = cached.len(), "loaded cached peers");
    }
}

fn load_cached_networks(storage: &Storage) -> Vec<NetworkId> {
    match storage.load_networks() {
        Ok(ids) => ids,
        Err(e) => {
            warn!("discarding network cache: {e}");
            if let Err(e) = storage.discard_networks() {
                warn!("{e}");
            }
            Vec::new()
        }
    }
}
