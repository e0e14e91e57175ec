//! BSD-shaped socket interface over virtual network addresses.
//!
//! `SocketLayer` checks addresses against network membership, picks a route
//! (loopback for our own addresses, the owning peer otherwise) and hands the
//! call to the virtual stack. Every call returns its own error; the low-level
//! code is available through [`Error::code`] or [`SocketLayer::connect_ex`].

use parking_lot::Mutex;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, ErrorCode, Result, ServiceFault};
use crate::identity::NodeId;
use crate::network::{self, Family, NetworkTable};
use crate::peer::PeerDirectory;
use crate::stack::{Hop, Route, Stack};

pub use crate::stack::{Handle, MsgFlags, SocketType};

/// IANA protocol numbers accepted by `open`; 0 picks the default.
const IPPROTO_TCP: i32 = 6;
const IPPROTO_UDP: i32 = 17;

/// Socket operations for one node.
#[derive(Clone)]
pub struct SocketLayer {
    node: NodeId,
    stack: Arc<Stack>,
    networks: Arc<Mutex<NetworkTable>>,
    peers: Arc<Mutex<PeerDirectory>>,
    running: Arc<AtomicBool>,
}

impl SocketLayer {
    pub(crate) fn new(
        node: NodeId,
        stack: Arc<Stack>,
        networks: Arc<Mutex<NetworkTable>>,
        peers: Arc<Mutex<PeerDirectory>>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            node,
            stack,
            networks,
            peers,
            running,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Service(ServiceFault::Stopped))
        }
    }

    fn check_family(&self, handle: Handle, addr: &SocketAddr) -> Result<()> {
        let info = self.stack.info(handle)?;
        if info.family != Family::of(&addr.ip()) {
            return Err(Error::argument(format!(
                "address {addr} does not match the socket's family"
            )));
        }
        Ok(())
    }

    /// Work out how to reach `ip` and which local address to send from.
    fn route_to(&self, ip: IpAddr) -> Result<(Route, IpAddr)> {
        let family = Family::of(&ip);
        // Lock order: networks, then peers.
        let networks = self.networks.lock();

        if let Some(owner) = networks.owner_of(&ip) {
            if !owner.is_ready(family) {
                return Err(Error::Service(ServiceFault::NotReady));
            }
            let route = Route {
                network: owner.id,
                hop: Hop::Local,
            };
            return Ok((route, ip));
        }

        let Some(net) = networks.route_for(&ip) else {
            if networks.iter().any(|n| n.routes(&ip)) {
                return Err(Error::Service(ServiceFault::NotReady));
            }
            return Err(ErrorCode::NetworkUnreachable.into());
        };
        let local_ip = networks
            .address(net.id, family)
            .ok_or(Error::Service(ServiceFault::NotReady))?;

        let node = match ip {
            IpAddr::V6(v6) => network::embedded_node(net.id, &v6),
            IpAddr::V4(_) => self.peers.lock().resolve(net.id, &ip),
        }
        .ok_or(Error::Socket(ErrorCode::HostUnreachable))?;

        let hop = if node == self.node {
            Hop::Local
        } else {
            Hop::Remote(node)
        };
        Ok((
            Route {
                network: net.id,
                hop,
            },
            local_ip,
        ))
    }

    /// Allocate a socket. `protocol` 0 selects TCP-like streams or UDP-like
    /// datagrams according to `kind`.
    pub fn open(&self, family: Family, kind: SocketType, protocol: i32) -> Result<Handle> {
        self.ensure_running()?;
        let valid = match kind {
            SocketType::Stream => protocol == 0 || protocol == IPPROTO_TCP,
            SocketType::Datagram => protocol == 0 || protocol == IPPROTO_UDP,
        };
        if !valid {
            return Err(Error::argument(format!(
                "protocol {protocol} is not supported for {kind:?} sockets"
            )));
        }
        Ok(self.stack.open(family, kind))
    }

    /// Bind to a local virtual address. The wildcard address needs some
    /// network with a ready transport for the family; a specific address must
    /// be one of ours.
    pub fn bind(&self, handle: Handle, addr: SocketAddr) -> Result<SocketAddr> {
        self.ensure_running()?;
        self.check_family(handle, &addr)?;
        let family = Family::of(&addr.ip());

        let network = {
            let networks = self.networks.lock();
            if addr.ip().is_unspecified() {
                if !networks.any_ready(family) {
                    return Err(Error::Service(ServiceFault::NotReady));
                }
                None
            } else {
                match networks.owner_of(&addr.ip()) {
                    Some(owner) if owner.is_ready(family) => Some(owner.id),
                    Some(_) => return Err(Error::Service(ServiceFault::NotReady)),
                    None if networks.iter().any(|n| !n.is_ready(family) && n.routes(&addr.ip())) => {
                        return Err(Error::Service(ServiceFault::NotReady));
                    }
                    None => return Err(ErrorCode::AddressNotAvailable.into()),
                }
            }
        };
        self.stack.bind(handle, addr, network)
    }

    /// Start accepting connections. Negative backlogs use the default.
    pub fn listen(&self, handle: Handle, backlog: i32) -> Result<()> {
        self.ensure_running()?;
        self.stack.listen(handle, backlog)
    }

    pub fn accept(&self, handle: Handle) -> Result<(Handle, SocketAddr)> {
        self.ensure_running()?;
        self.stack.accept(handle)
    }

    pub fn connect(&self, handle: Handle, addr: SocketAddr) -> Result<()> {
        self.ensure_running()?;
        self.check_family(handle, &addr)?;
        let (route, local_ip) = self.route_to(addr.ip())?;
        self.stack.connect(handle, addr, route, local_ip)
    }

    /// `connect` returning the low-level code instead of an error; `None`
    /// means connected. Lets non-blocking callers poll for completion.
    pub fn connect_ex(&self, handle: Handle, addr: SocketAddr) -> Option<ErrorCode> {
        self.connect(handle, addr)
            .err()
            .map(|e| e.low_level_code())
    }

    /// Send on a connected stream. Returns how many bytes were accepted,
    /// which may be fewer than `data.len()`.
    pub fn send(&self, handle: Handle, data: &[u8], flags: MsgFlags) -> Result<usize> {
        self.ensure_running()?;
        self.stack.send(handle, data, flags)
    }

    /// Receive up to `max` bytes. An empty result without error means the
    /// peer closed its side.
    pub fn recv(&self, handle: Handle, max: usize, flags: MsgFlags) -> Result<Vec<u8>> {
        self.ensure_running()?;
        self.stack.recv(handle, max, flags)
    }

    pub fn send_to(&self, handle: Handle, data: &[u8], addr: SocketAddr) -> Result<usize> {
        self.ensure_running()?;
        self.check_family(handle, &addr)?;
        let (route, local_ip) = self.route_to(addr.ip())?;
        self.stack.send_to(handle, data, addr, route, local_ip)
    }

    pub fn recv_from(&self, handle: Handle, max: usize, flags: MsgFlags) -> Result<(Vec<u8>, SocketAddr)> {
        self.ensure_running()?;
        self.stack.recv_from(handle, max, flags)
    }

    pub fn shutdown(&self, handle: Handle, how: Shutdown) -> Result<()> {
        self.ensure_running()?;
        self.stack.shutdown(handle, how)
    }

    /// Close the handle. Works after the node has stopped so callers can
    /// release their handles.
    pub fn close(&self, handle: Handle) -> Result<()> {
        self.stack.close(handle)
    }

    /// Takes effect on the next call; calls already blocked keep waiting.
    pub fn set_blocking(&self, handle: Handle, blocking: bool) -> Result<()> {
        self.stack.set_blocking(handle, blocking)
    }

    pub fn blocking(&self, handle: Handle) -> Result<bool> {
        self.stack.blocking(handle)
    }

    pub fn set_recv_timeout(&self, handle: Handle, timeout: Option<Duration>) -> Result<()> {
        self.stack.set_recv_timeout(handle, timeout)
    }

    pub fn set_send_timeout(&self, handle: Handle, timeout: Option<Duration>) -> Result<()> {
        self.stack.set_send_timeout(handle, timeout)
    }

    pub fn local_addr(&self, handle: Handle) -> Result<Option<SocketAddr>> {
        self.stack.local_addr(handle)
    }

    pub fn peer_addr(&self, handle: Handle) -> Result<SocketAddr> {
        self.stack.peer_addr(handle)
    }
}
