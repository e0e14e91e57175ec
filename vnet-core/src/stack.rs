//! Embedded virtual stack.
//!
//! Streams and datagrams between virtual addresses, carried as segments
//! inside FRAME packets. The stack owns the socket table; callers block on a
//! condition variable while the service thread feeds inbound frames through
//! [`Stack::input`] and drives retransmission with [`Stack::poll_timers`].
//! Outbound frames leave through a [`FrameSink`]; frames addressed to this
//! node are looped back internally.
//!
//! Streams use a two-message handshake (SYN, SYN-ACK), numbered segments
//! acknowledged cumulatively, and timer-driven retransmission. There is no
//! congestion control; the sender is limited by a fixed window of
//! unacknowledged bytes.

mod segment;

pub use segment::{Segment, SegmentKind};

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::ops::BitOr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::{Error, ErrorCode, Result};
use crate::identity::NodeId;
use crate::network::{Family, NetworkId};
use crate::reassembly::{Reassembly, ReassemblyError};

/// Largest payload per segment.
pub const MSS: usize = 1200;

/// Backlog used when `listen` is given a negative value.
pub const DEFAULT_BACKLOG: usize = 128;

const MAX_BACKLOG: usize = 4096;

/// Bytes a stream may have in flight without acknowledgement.
pub const SEND_WINDOW: usize = 256 * 1024;

/// Received bytes buffered before the stack stops accepting new segments.
const RECV_BUFFER: usize = 1024 * 1024;

const MAX_DATAGRAM_QUEUE: usize = 512;

const RTO: Duration = Duration::from_millis(300);

/// Unacknowledged data with no word from the peer for this long kills the
/// connection.
const DEAD_AFTER: Duration = Duration::from_secs(30);

/// How long a closed stream keeps retransmitting its tail.
const LINGER: Duration = Duration::from_secs(5);

/// Upper bound on a single condition-variable wait.
const WAIT_SLICE: Duration = Duration::from_millis(200);

const EPHEMERAL_FIRST: u16 = 49152;
const EPHEMERAL_LAST: u16 = 65535;

/// Receives frames the stack wants sent to a peer.
pub trait FrameSink: Send + Sync + 'static {
    fn send_frame(&self, network: NetworkId, dest: NodeId, frame: Vec<u8>);
}

/// Where a segment goes after leaving a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    /// Back into this stack.
    Local,
    Remote(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub network: NetworkId,
    pub hop: Hop,
}

/// Opaque socket handle, an index into the engine's socket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

/// Per-call flags for send and receive operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgFlags(u8);

impl MsgFlags {
    pub const PEEK: Self = Self(0b0000_0001);
    pub const DONTWAIT: Self = Self(0b0000_0010);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MsgFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What the socket layer needs to know about a handle.
#[derive(Debug, Clone, Copy)]
pub struct SocketInfo {
    pub family: Family,
    pub kind: SocketType,
    pub local: Option<SocketAddr>,
}

#[derive(Debug)]
enum Chunk {
    Data(Vec<u8>),
    Fin,
}

#[derive(Debug)]
struct Unacked {
    kind: SegmentKind,
    payload: Vec<u8>,
    sent_at: Instant,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    SynSent { deadline: Instant, last_syn: Instant },
    Established,
}

#[derive(Debug)]
struct Conn {
    route: Route,
    local: SocketAddr,
    remote: SocketAddr,
    phase: Phase,
    initiator: bool,
    /// A non-blocking connect is waiting to report its outcome.
    report_connect: bool,
    next_send: u64,
    unacked: BTreeMap<u64, Unacked>,
    unacked_bytes: usize,
    write_shut: bool,
    read_shut: bool,
    reassembly: Reassembly<Chunk>,
    recv_buf: VecDeque<u8>,
    eof: bool,
    error: Option<ErrorCode>,
    last_progress: Instant,
    linger_until: Option<Instant>,
}

impl Conn {
    fn new(route: Route, local: SocketAddr, remote: SocketAddr, phase: Phase, now: Instant) -> Self {
        Self {
            route,
            local,
            remote,
            initiator: matches!(phase, Phase::SynSent { .. }),
            phase,
            report_connect: false,
            next_send: 0,
            unacked: BTreeMap::new(),
            unacked_bytes: 0,
            write_shut: false,
            read_shut: false,
            reassembly: Reassembly::new(0),
            recv_buf: VecDeque::new(),
            eof: false,
            error: None,
            last_progress: now,
            linger_until: None,
        }
    }

    fn matches(&self, network: NetworkId, seg: &Segment) -> bool {
        self.route.network == network && self.local == seg.dst && self.remote == seg.src
    }

    fn emit(&self, out: &mut Outbox, kind: SegmentKind, seq: u64, payload: Vec<u8>) {
        out.push(
            self.route,
            Segment {
                kind,
                src: self.local,
                dst: self.remote,
                seq,
                payload,
            },
        );
    }

    /// Queue a sequenced DATA or FIN segment.
    fn push_sequenced(&mut self, out: &mut Outbox, kind: SegmentKind, payload: Vec<u8>, now: Instant) {
        if self.unacked.is_empty() {
            self.last_progress = now;
        }
        let seq = self.next_send;
        self.next_send += 1;
        self.emit(out, kind, seq, payload.clone());
        self.unacked_bytes += payload.len();
        self.unacked.insert(
            seq,
            Unacked {
                kind,
                payload,
                sent_at: now,
            },
        );
    }

    fn send_window(&self) -> usize {
        SEND_WINDOW.saturating_sub(self.unacked_bytes)
    }

    fn abort(&mut self, code: ErrorCode) {
        self.error = Some(code);
        self.unacked.clear();
        self.unacked_bytes = 0;
    }

    fn on_segment(&mut self, seg: Segment, now: Instant, out: &mut Outbox) {
        self.last_progress = now;
        match seg.kind {
            SegmentKind::Syn => {
                // Our SYN-ACK was lost; the peer retried.
                if !self.initiator {
                    self.emit(out, SegmentKind::SynAck, 0, Vec::new());
                }
            }
            SegmentKind::SynAck => {
                if matches!(self.phase, Phase::SynSent { .. }) {
                    self.phase = Phase::Established;
                }
            }
            SegmentKind::Ack => self.on_ack(seg.seq),
            SegmentKind::Data => self.on_chunk(seg.seq, Chunk::Data(seg.payload), out),
            SegmentKind::Fin => self.on_chunk(seg.seq, Chunk::Fin, out),
            SegmentKind::Rst => {
                let code = match self.phase {
                    Phase::SynSent { .. } => ErrorCode::ConnectionRefused,
                    Phase::Established => ErrorCode::ConnectionReset,
                };
                self.abort(code);
            }
            SegmentKind::Datagram => {}
        }
    }

    fn on_ack(&mut self, next_expected: u64) {
        let rest = self.unacked.split_off(&next_expected);
        let acked = std::mem::replace(&mut self.unacked, rest);
        for segment in acked.values() {
            self.unacked_bytes -= segment.payload.len();
        }
    }

    fn on_chunk(&mut self, seq: u64, chunk: Chunk, out: &mut Outbox) {
        // The peer only sends after seeing our SYN, so data implies the
        // SYN-ACK was lost.
        if matches!(self.phase, Phase::SynSent { .. }) {
            self.phase = Phase::Established;
        }

        if self.recv_buf.len() < RECV_BUFFER {
            match self.reassembly.insert(seq, chunk) {
                Ok(()) => {}
                Err(ReassemblyError::Duplicate(_) | ReassemblyError::TooOld(..)) => {}
                Err(ReassemblyError::Full) => trace!(seq, "reassembly full; dropping segment"),
                Err(e @ ReassemblyError::OutOfWindow(..)) => debug!(remote = %self.remote, "dropping segment: {e}"),
            }
            for chunk in self.reassembly.drain_ready() {
                match chunk {
                    Chunk::Data(data) if !self.read_shut => self.recv_buf.extend(data),
                    Chunk::Data(_) => {}
                    Chunk::Fin => self.eof = true,
                }
            }
        }
        self.emit(out, SegmentKind::Ack, self.reassembly.next_expected(), Vec::new());
    }

    fn on_timer(&mut self, now: Instant, out: &mut Outbox) {
        if self.error.is_some() {
            return;
        }
        match self.phase {
            Phase::SynSent { deadline, last_syn } => {
                if now >= deadline {
                    self.abort(ErrorCode::TimedOut);
                } else if now.saturating_duration_since(last_syn) >= RTO {
                    self.emit(out, SegmentKind::Syn, 0, Vec::new());
                    self.phase = Phase::SynSent {
                        deadline,
                        last_syn: now,
                    };
                }
            }
            Phase::Established => {
                if self.unacked.is_empty() {
                    return;
                }
                if now.saturating_duration_since(self.last_progress) >= DEAD_AFTER {
                    debug!(local = %self.local, remote = %self.remote, "connection timed out");
                    self.abort(ErrorCode::TimedOut);
                    return;
                }
                let (route, local, remote) = (self.route, self.local, self.remote);
                for (seq, segment) in self.unacked.iter_mut() {
                    if now.saturating_duration_since(segment.sent_at) >= RTO {
                        segment.sent_at = now;
                        out.push(
                            route,
                            Segment {
                                kind: segment.kind,
                                src: local,
                                dst: remote,
                                seq: *seq,
                                payload: segment.payload.clone(),
                            },
                        );
                    }
                }
            }
        }
    }
}

/// Segments waiting to leave the stack.
#[derive(Debug, Default)]
struct Outbox {
    queue: VecDeque<(Route, Segment)>,
}

impl Outbox {
    fn push(&mut self, route: Route, segment: Segment) {
        self.queue.push_back((route, segment));
    }

    fn pop(&mut self) -> Option<(Route, Segment)> {
        self.queue.pop_front()
    }
}

#[derive(Debug)]
struct Listener {
    backlog: usize,
    queue: VecDeque<usize>,
}

#[derive(Debug)]
enum State {
    Idle,
    Listening(Listener),
    Stream(Conn),
    Datagram(VecDeque<(SocketAddr, Vec<u8>)>),
}

#[derive(Debug)]
struct Slot {
    family: Family,
    kind: SocketType,
    blocking: bool,
    recv_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    /// Explicit or automatic bind address.
    local: Option<SocketAddr>,
    /// Network the socket is tied to; `None` for wildcard binds.
    network: Option<NetworkId>,
    state: State,
    closing: bool,
    /// Accepted by the stack but not yet returned from `accept`.
    embryonic: bool,
    in_flight: usize,
    error: Option<ErrorCode>,
}

impl Slot {
    fn new(family: Family, kind: SocketType) -> Self {
        let state = match kind {
            SocketType::Stream => State::Idle,
            SocketType::Datagram => State::Datagram(VecDeque::new()),
        };
        Self {
            family,
            kind,
            blocking: true,
            recv_timeout: None,
            send_timeout: None,
            local: None,
            network: None,
            state,
            closing: false,
            embryonic: false,
            in_flight: 0,
            error: None,
        }
    }

    fn accepts(&self, network: NetworkId, dst: &SocketAddr) -> bool {
        if self.closing || self.network.is_some_and(|n| n != network) {
            return false;
        }
        match self.local {
            Some(local) => {
                local.port() == dst.port()
                    && Family::of(&local.ip()) == Family::of(&dst.ip())
                    && (local.ip().is_unspecified() || local.ip() == dst.ip())
            }
            None => false,
        }
    }
}

fn invalid() -> Error {
    ErrorCode::InvalidHandle.into()
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Option<Slot>>,
    lingering: Vec<Conn>,
    outbox: Outbox,
    next_ephemeral: u16,
    connect_timeout: Duration,
    /// Networks invalidated since they were last joined.
    left: HashSet<NetworkId>,
}

impl Inner {
    fn slot(&self, idx: usize) -> Result<&Slot> {
        self.slots.get(idx).and_then(Option::as_ref).ok_or_else(invalid)
    }

    fn slot_mut(&mut self, idx: usize) -> Result<&mut Slot> {
        self.slots
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or_else(invalid)
    }

    fn check_network(&self, network: NetworkId) -> Result<()> {
        if self.left.contains(&network) {
            return Err(ErrorCode::NetworkLeft.into());
        }
        Ok(())
    }

    /// Index of a handle that callers may use.
    fn live(&self, handle: Handle) -> Result<usize> {
        let slot = self.slot(handle.index())?;
        if slot.closing || slot.embryonic {
            return Err(invalid());
        }
        Ok(handle.index())
    }

    fn allocate(&mut self, slot: Slot) -> usize {
        match self.slots.iter().position(Option::is_none) {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn conn_mut(&mut self, idx: usize) -> Result<(&mut Conn, &mut Outbox)> {
        let slot = self
            .slots
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or_else(invalid)?;
        match &mut slot.state {
            State::Stream(conn) => Ok((conn, &mut self.outbox)),
            _ => Err(ErrorCode::NotConnected.into()),
        }
    }

    fn port_in_use(&self, kind: SocketType, addr: SocketAddr, except: usize) -> bool {
        self.slots.iter().enumerate().any(|(idx, slot)| {
            let Some(slot) = slot else {
                return false;
            };
            if idx == except || slot.closing || slot.kind != kind {
                return false;
            }
            slot.local.is_some_and(|l| {
                l.port() == addr.port()
                    && Family::of(&l.ip()) == Family::of(&addr.ip())
                    && (l.ip().is_unspecified() || addr.ip().is_unspecified() || l.ip() == addr.ip())
            })
        })
    }

    fn ephemeral_port(&mut self, kind: SocketType, ip: IpAddr, except: usize) -> Result<u16> {
        let span = (EPHEMERAL_LAST - EPHEMERAL_FIRST) as usize + 1;
        for _ in 0..span {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == EPHEMERAL_LAST {
                EPHEMERAL_FIRST
            } else {
                port + 1
            };
            if !self.port_in_use(kind, SocketAddr::new(ip, port), except) {
                return Ok(port);
            }
        }
        Err(ErrorCode::AddressInUse.into())
    }

    /// Bind an unbound socket to an ephemeral port on the wildcard address.
    fn auto_bind(&mut self, idx: usize) -> Result<SocketAddr> {
        let (family, kind, local) = {
            let slot = self.slot(idx)?;
            (slot.family, slot.kind, slot.local)
        };
        if let Some(local) = local {
            return Ok(local);
        }
        let ip = family.unspecified();
        let port = self.ephemeral_port(kind, ip, idx)?;
        let addr = SocketAddr::new(ip, port);
        self.slot_mut(idx)?.local = Some(addr);
        Ok(addr)
    }

    fn handle_segment(&mut self, network: NetworkId, from: Hop, seg: Segment, now: Instant) {
        let reply = Route { network, hop: from };

        if seg.kind == SegmentKind::Datagram {
            let target = self.slots.iter_mut().flatten().find(|s| {
                s.kind == SocketType::Datagram && !s.embryonic && s.accepts(network, &seg.dst)
            });
            match target.map(|s| &mut s.state) {
                Some(State::Datagram(queue)) if queue.len() < MAX_DATAGRAM_QUEUE => {
                    queue.push_back((seg.src, seg.payload));
                }
                Some(_) => trace!(dst = %seg.dst, "datagram queue full; dropping"),
                None => trace!(dst = %seg.dst, "no datagram socket; dropping"),
            }
            return;
        }

        // Established or connecting stream.
        let outbox = &mut self.outbox;
        for slot in self.slots.iter_mut().flatten() {
            if let State::Stream(conn) = &mut slot.state {
                if conn.matches(network, &seg) {
                    conn.on_segment(seg, now, outbox);
                    return;
                }
            }
        }

        if let Some(pos) = self.lingering.iter().position(|c| c.matches(network, &seg)) {
            let conn = &mut self.lingering[pos];
            match seg.kind {
                SegmentKind::Ack => conn.on_ack(seg.seq),
                // The read side is gone; the reassembly window still tracks
                // what the peer may send.
                SegmentKind::Fin => conn.on_chunk(seg.seq, Chunk::Fin, &mut self.outbox),
                SegmentKind::Data => {
                    conn.emit(&mut self.outbox, SegmentKind::Rst, 0, Vec::new());
                    self.lingering.swap_remove(pos);
                }
                SegmentKind::Rst => {
                    self.lingering.swap_remove(pos);
                }
                _ => {}
            }
            return;
        }

        match seg.kind {
            SegmentKind::Syn => self.on_syn(network, reply, seg, now),
            SegmentKind::Rst => {}
            _ => self.reset(reply, &seg),
        }
    }

    fn reset(&mut self, route: Route, seg: &Segment) {
        self.outbox.push(
            route,
            Segment {
                kind: SegmentKind::Rst,
                src: seg.dst,
                dst: seg.src,
                seq: 0,
                payload: Vec::new(),
            },
        );
    }

    fn on_syn(&mut self, network: NetworkId, reply: Route, seg: Segment, now: Instant) {
        let listener = self.slots.iter().position(|s| {
            s.as_ref().is_some_and(|s| {
                matches!(s.state, State::Listening(_)) && !s.embryonic && s.accepts(network, &seg.dst)
            })
        });
        let Some(listener) = listener else {
            debug!(dst = %seg.dst, "connection refused: nobody listening");
            self.reset(reply, &seg);
            return;
        };

        let (family, full) = match self.slots[listener].as_ref() {
            Some(Slot {
                family,
                state: State::Listening(l),
                ..
            }) => (*family, l.queue.len() >= l.backlog),
            _ => return,
        };
        if full {
            debug!(dst = %seg.dst, "connection refused: backlog full");
            self.reset(reply, &seg);
            return;
        }

        let conn = Conn::new(reply, seg.dst, seg.src, Phase::Established, now);
        conn.emit(&mut self.outbox, SegmentKind::SynAck, 0, Vec::new());
        let mut child = Slot::new(family, SocketType::Stream);
        child.network = Some(network);
        child.embryonic = true;
        child.state = State::Stream(conn);
        let child = self.allocate(child);

        if let Some(Some(Slot {
            state: State::Listening(l),
            ..
        })) = self.slots.get_mut(listener)
        {
            l.queue.push_back(child);
        }
        debug!(src = %seg.src, dst = %seg.dst, "incoming connection queued");
    }

    /// Tear down slot `idx` as part of `close`.
    fn dismantle(&mut self, idx: usize, now: Instant) {
        let Some(slot) = self.slots.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        match std::mem::replace(&mut slot.state, State::Idle) {
            State::Stream(mut conn) => {
                if conn.error.is_some() {
                    return;
                }
                if matches!(conn.phase, Phase::SynSent { .. }) {
                    conn.emit(&mut self.outbox, SegmentKind::Rst, 0, Vec::new());
                    return;
                }
                if !conn.write_shut {
                    conn.write_shut = true;
                    conn.push_sequenced(&mut self.outbox, SegmentKind::Fin, Vec::new(), now);
                }
                if !conn.unacked.is_empty() {
                    conn.linger_until = Some(now + LINGER);
                    self.lingering.push(conn);
                }
            }
            State::Listening(listener) => {
                for child in listener.queue {
                    if let Some(Some(Slot {
                        state: State::Stream(conn),
                        ..
                    })) = self.slots.get(child)
                    {
                        conn.emit(&mut self.outbox, SegmentKind::Rst, 0, Vec::new());
                    }
                    if let Some(entry) = self.slots.get_mut(child) {
                        *entry = None;
                    }
                }
            }
            State::Idle | State::Datagram(_) => {}
        }
    }

    fn free_if_done(&mut self, idx: usize) {
        if let Some(entry) = self.slots.get_mut(idx) {
            if entry.as_ref().is_some_and(|s| s.closing && s.in_flight == 0) {
                *entry = None;
            }
        }
    }
}

/// The virtual stack and its socket table.
pub struct Stack {
    inner: Mutex<Inner>,
    cond: Condvar,
    sink: Arc<dyn FrameSink>,
}

impl Stack {
    pub fn new(sink: Arc<dyn FrameSink>, connect_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                lingering: Vec::new(),
                outbox: Outbox::default(),
                next_ephemeral: EPHEMERAL_FIRST,
                connect_timeout,
                left: HashSet::new(),
            }),
            cond: Condvar::new(),
            sink,
        }
    }

    /// Deliver queued segments: loopback ones are processed in place, the
    /// rest go to the sink. Returns true if anything was looped back.
    fn flush(&self, inner: &mut Inner) -> bool {
        let mut delivered = false;
        while let Some((route, segment)) = inner.outbox.pop() {
            match route.hop {
                Hop::Local => {
                    inner.handle_segment(route.network, Hop::Local, segment, Instant::now());
                    delivered = true;
                }
                Hop::Remote(node) => {
                    self.sink.send_frame(route.network, node, segment.encode());
                }
            }
        }
        if delivered {
            self.cond.notify_all();
        }
        delivered
    }

    /// Run `op` until it completes, blocking between attempts when allowed.
    ///
    /// `op` returns `Ok(None)` when it cannot complete yet. The slot stays
    /// allocated while the call is in flight; closing it from another thread
    /// aborts the call.
    fn blocking_op<T>(
        &self,
        handle: Handle,
        dontwait: bool,
        timeout: impl Fn(&Slot) -> Option<Duration>,
        mut op: impl FnMut(&mut Inner, usize, bool) -> Result<Option<T>>,
    ) -> Result<T> {
        let mut inner = self.inner.lock();
        let idx = inner.live(handle)?;
        let (blocking, deadline) = {
            let slot = inner.slot_mut(idx)?;
            slot.in_flight += 1;
            (
                slot.blocking && !dontwait,
                timeout(&*slot).map(|t| Instant::now() + t),
            )
        };

        let result = loop {
            match inner.slot(idx) {
                Ok(slot) if slot.closing => break Err(ErrorCode::ConnectionAborted.into()),
                Ok(slot) => {
                    if let Some(code) = slot.error {
                        break Err(code.into());
                    }
                }
                Err(e) => break Err(e),
            }

            let attempt = op(&mut *inner, idx, blocking);
            let looped = self.flush(&mut *inner);
            match attempt {
                Ok(Some(value)) => break Ok(value),
                Err(e) => break Err(e),
                Ok(None) if !blocking => break Err(ErrorCode::WouldBlock.into()),
                // Loopback traffic may already have made progress.
                Ok(None) if looped => continue,
                Ok(None) => {}
            }

            let now = Instant::now();
            let slice = match deadline {
                Some(d) if d <= now => break Err(ErrorCode::TimedOut.into()),
                Some(d) => (d - now).min(WAIT_SLICE),
                None => WAIT_SLICE,
            };
            self.cond.wait_for(&mut inner, slice);
        };

        if let Ok(slot) = inner.slot_mut(idx) {
            slot.in_flight -= 1;
        }
        inner.free_if_done(idx);
        drop(inner);
        self.cond.notify_all();
        result
    }

    /// Run a non-blocking operation on a live handle.
    fn with_live<T>(&self, handle: Handle, op: impl FnOnce(&mut Inner, usize) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        let idx = inner.live(handle)?;
        if let Some(code) = inner.slot(idx)?.error {
            return Err(code.into());
        }
        let result = op(&mut *inner, idx);
        self.flush(&mut *inner);
        drop(inner);
        self.cond.notify_all();
        result
    }

    pub fn open(&self, family: Family, kind: SocketType) -> Handle {
        let mut inner = self.inner.lock();
        let idx = inner.allocate(Slot::new(family, kind));
        trace!(handle = idx, ?family, ?kind, "socket opened");
        Handle(idx as u32)
    }

    pub fn info(&self, handle: Handle) -> Result<SocketInfo> {
        let inner = self.inner.lock();
        let slot = inner.slot(inner.live(handle)?)?;
        Ok(SocketInfo {
            family: slot.family,
            kind: slot.kind,
            local: slot.local,
        })
    }

    /// Bind to `addr`; port 0 picks an ephemeral port. Returns the bound
    /// address.
    pub fn bind(&self, handle: Handle, addr: SocketAddr, network: Option<NetworkId>) -> Result<SocketAddr> {
        self.with_live(handle, |inner, idx| {
            if let Some(network) = network {
                inner.check_network(network)?;
            }
            let slot = inner.slot(idx)?;
            if slot.local.is_some() || !matches!(slot.state, State::Idle | State::Datagram(_)) {
                return Err(ErrorCode::AddressInUse.into());
            }
            let kind = slot.kind;
            let addr = if addr.port() == 0 {
                SocketAddr::new(addr.ip(), inner.ephemeral_port(kind, addr.ip(), idx)?)
            } else if inner.port_in_use(kind, addr, idx) {
                return Err(ErrorCode::AddressInUse.into());
            } else {
                addr
            };
            let slot = inner.slot_mut(idx)?;
            slot.local = Some(addr);
            slot.network = network;
            Ok(addr)
        })
    }

    pub fn listen(&self, handle: Handle, backlog: i32) -> Result<()> {
        let backlog = if backlog < 0 {
            DEFAULT_BACKLOG
        } else {
            (backlog as usize).clamp(1, MAX_BACKLOG)
        };
        self.with_live(handle, |inner, idx| {
            let slot = inner.slot_mut(idx)?;
            if slot.kind != SocketType::Stream {
                return Err(Error::argument("listen requires a stream socket"));
            }
            if slot.local.is_none() {
                return Err(Error::argument("listen requires a bound socket"));
            }
            match &mut slot.state {
                State::Listening(l) => l.backlog = backlog,
                State::Idle => {
                    slot.state = State::Listening(Listener {
                        backlog,
                        queue: VecDeque::new(),
                    })
                }
                _ => return Err(ErrorCode::IsConnected.into()),
            }
            Ok(())
        })
    }

    /// Take one completed incoming connection.
    pub fn accept(&self, handle: Handle) -> Result<(Handle, SocketAddr)> {
        self.blocking_op(
            handle,
            false,
            |s| s.recv_timeout,
            |inner, idx, _| {
                let child = match &mut inner.slot_mut(idx)?.state {
                    State::Listening(l) => l.queue.pop_front(),
                    _ => return Err(ErrorCode::NotListening.into()),
                };
                let Some(child) = child else {
                    return Ok(None);
                };
                let slot = inner.slot_mut(child)?;
                slot.embryonic = false;
                let remote = match &slot.state {
                    State::Stream(conn) => conn.remote,
                    _ => return Err(ErrorCode::ConnectionAborted.into()),
                };
                Ok(Some((Handle(child as u32), remote)))
            },
        )
    }

    /// Connect a stream socket to `remote` over `route`, using `local_ip` as
    /// the source address when the socket is not bound to a specific one.
    pub fn connect(&self, handle: Handle, remote: SocketAddr, route: Route, local_ip: IpAddr) -> Result<()> {
        let limit = self.inner.lock().connect_timeout;
        let mut started = false;
        let mut first = true;
        let result = self.blocking_op(
            handle,
            false,
            |_| Some(limit),
            |inner, idx, blocking| {
                let is_first = std::mem::replace(&mut first, false);
                let slot = inner.slot(idx)?;
                if slot.kind != SocketType::Stream {
                    return Err(Error::argument("connect requires a stream socket"));
                }
                if matches!(slot.state, State::Listening(_)) {
                    return Err(Error::argument("socket is listening"));
                }

                if matches!(slot.state, State::Idle) {
                    inner.check_network(route.network)?;
                    let bound = inner.auto_bind(idx)?;
                    let now = Instant::now();
                    let local_ip = if bound.ip().is_unspecified() {
                        local_ip
                    } else {
                        bound.ip()
                    };
                    let mut conn = Conn::new(
                        route,
                        SocketAddr::new(local_ip, bound.port()),
                        remote,
                        Phase::SynSent {
                            deadline: now + inner.connect_timeout,
                            last_syn: now,
                        },
                        now,
                    );
                    conn.emit(&mut inner.outbox, SegmentKind::Syn, 0, Vec::new());
                    conn.report_connect = !blocking;
                    let slot = inner.slot_mut(idx)?;
                    slot.network = Some(route.network);
                    slot.state = State::Stream(conn);
                    started = true;
                    debug!(%remote, "connecting");
                    return if blocking {
                        Ok(None)
                    } else {
                        Err(ErrorCode::InProgress.into())
                    };
                }

                let (conn, _) = inner.conn_mut(idx)?;
                if let Some(code) = conn.error {
                    // Failed attempt: report it once and let the caller retry.
                    inner.slot_mut(idx)?.state = State::Idle;
                    return Err(code.into());
                }
                match conn.phase {
                    Phase::Established if conn.report_connect || started => {
                        conn.report_connect = false;
                        Ok(Some(()))
                    }
                    Phase::Established => Err(ErrorCode::IsConnected.into()),
                    Phase::SynSent { .. } if is_first && !blocking => Err(ErrorCode::Already.into()),
                    Phase::SynSent { .. } => Ok(None),
                }
            },
        );
        if matches!(&result, Err(e) if e.code() == Some(ErrorCode::TimedOut)) {
            self.abandon_connect(handle);
        }
        result
    }

    /// Drop a timed-out handshake so the next `connect` starts afresh.
    fn abandon_connect(&self, handle: Handle) {
        let mut inner = self.inner.lock();
        let Ok(idx) = inner.live(handle) else {
            return;
        };
        let Ok(slot) = inner.slot_mut(idx) else {
            return;
        };
        if !matches!(&slot.state, State::Stream(c) if matches!(c.phase, Phase::SynSent { .. })) {
            return;
        }
        if let State::Stream(conn) = std::mem::replace(&mut slot.state, State::Idle) {
            conn.emit(&mut inner.outbox, SegmentKind::Rst, 0, Vec::new());
        }
        self.flush(&mut *inner);
    }

    /// Queue up to the free window of `data`. Returns the number of bytes
    /// accepted; the caller resends the rest.
    pub fn send(&self, handle: Handle, data: &[u8], flags: MsgFlags) -> Result<usize> {
        self.blocking_op(
            handle,
            flags.contains(MsgFlags::DONTWAIT),
            |s| s.send_timeout,
            |inner, idx, _| {
                if inner.slot(idx)?.kind == SocketType::Datagram {
                    return Err(ErrorCode::NotConnected.into());
                }
                let (conn, out) = inner.conn_mut(idx)?;
                if let Some(code) = conn.error {
                    return Err(code.into());
                }
                if conn.write_shut {
                    return Err(ErrorCode::Shutdown.into());
                }
                if matches!(conn.phase, Phase::SynSent { .. }) {
                    return Ok(None);
                }
                if data.is_empty() {
                    return Ok(Some(0));
                }
                let n = conn.send_window().min(data.len());
                if n == 0 {
                    return Ok(None);
                }
                let now = Instant::now();
                for chunk in data[..n].chunks(MSS) {
                    conn.push_sequenced(out, SegmentKind::Data, chunk.to_vec(), now);
                }
                Ok(Some(n))
            },
        )
    }

    /// Read up to `max` bytes. An empty result means the peer closed its side.
    pub fn recv(&self, handle: Handle, max: usize, flags: MsgFlags) -> Result<Vec<u8>> {
        let is_datagram = self.info(handle)?.kind == SocketType::Datagram;
        if is_datagram {
            return self.recv_from(handle, max, flags).map(|(data, _)| data);
        }
        self.blocking_op(
            handle,
            flags.contains(MsgFlags::DONTWAIT),
            |s| s.recv_timeout,
            |inner, idx, _| {
                let (conn, _) = inner.conn_mut(idx)?;
                if max == 0 {
                    return Ok(Some(Vec::new()));
                }
                if !conn.recv_buf.is_empty() {
                    let n = max.min(conn.recv_buf.len());
                    let data: Vec<u8> = if flags.contains(MsgFlags::PEEK) {
                        conn.recv_buf.iter().take(n).copied().collect()
                    } else {
                        conn.recv_buf.drain(..n).collect()
                    };
                    return Ok(Some(data));
                }
                if conn.eof || conn.read_shut {
                    return Ok(Some(Vec::new()));
                }
                if let Some(code) = conn.error {
                    return Err(code.into());
                }
                Ok(None)
            },
        )
    }

    /// Send one datagram to `remote`. Unbound sockets are bound to an
    /// ephemeral port first.
    pub fn send_to(
        &self,
        handle: Handle,
        data: &[u8],
        remote: SocketAddr,
        route: Route,
        local_ip: IpAddr,
    ) -> Result<usize> {
        if data.len() > MSS {
            return Err(ErrorCode::MessageTooLong.into());
        }
        self.with_live(handle, |inner, idx| {
            if inner.slot(idx)?.kind != SocketType::Datagram {
                return Err(Error::argument("send_to requires a datagram socket"));
            }
            inner.check_network(route.network)?;
            let bound = inner.auto_bind(idx)?;
            let src_ip = if bound.ip().is_unspecified() {
                local_ip
            } else {
                bound.ip()
            };
            inner.outbox.push(
                route,
                Segment {
                    kind: SegmentKind::Datagram,
                    src: SocketAddr::new(src_ip, bound.port()),
                    dst: remote,
                    seq: 0,
                    payload: data.to_vec(),
                },
            );
            Ok(data.len())
        })
    }

    /// Receive one datagram, truncated to `max` bytes.
    pub fn recv_from(&self, handle: Handle, max: usize, flags: MsgFlags) -> Result<(Vec<u8>, SocketAddr)> {
        self.blocking_op(
            handle,
            flags.contains(MsgFlags::DONTWAIT),
            |s| s.recv_timeout,
            |inner, idx, _| {
                let slot = inner.slot_mut(idx)?;
                if slot.local.is_none() {
                    return Err(Error::argument("recv_from requires a bound socket"));
                }
                let State::Datagram(queue) = &mut slot.state else {
                    return Err(Error::argument("recv_from requires a datagram socket"));
                };
                let item = if flags.contains(MsgFlags::PEEK) {
                    queue.front().cloned()
                } else {
                    queue.pop_front()
                };
                Ok(item.map(|(from, mut data)| {
                    data.truncate(max);
                    (data, from)
                }))
            },
        )
    }

    pub fn shutdown(&self, handle: Handle, how: Shutdown) -> Result<()> {
        self.with_live(handle, |inner, idx| {
            let (conn, out) = inner.conn_mut(idx)?;
            if matches!(conn.phase, Phase::SynSent { .. }) {
                return Err(ErrorCode::NotConnected.into());
            }
            if matches!(how, Shutdown::Read | Shutdown::Both) {
                conn.read_shut = true;
                conn.recv_buf.clear();
            }
            if matches!(how, Shutdown::Write | Shutdown::Both) && !conn.write_shut {
                conn.write_shut = true;
                if conn.error.is_none() {
                    conn.push_sequenced(out, SegmentKind::Fin, Vec::new(), Instant::now());
                }
            }
            Ok(())
        })
    }

    /// Close a handle. Calls blocked on it return `ConnectionAborted`; the
    /// slot is reused once they have all returned.
    pub fn close(&self, handle: Handle) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = inner.live(handle)?;
        inner.dismantle(idx, Instant::now());
        inner.slot_mut(idx)?.closing = true;
        inner.free_if_done(idx);
        self.flush(&mut *inner);
        drop(inner);
        self.cond.notify_all();
        trace!(%handle, "socket closed");
        Ok(())
    }

    pub fn set_blocking(&self, handle: Handle, blocking: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = inner.live(handle)?;
        inner.slot_mut(idx)?.blocking = blocking;
        Ok(())
    }

    pub fn blocking(&self, handle: Handle) -> Result<bool> {
        let inner = self.inner.lock();
        Ok(inner.slot(inner.live(handle)?)?.blocking)
    }

    pub fn set_recv_timeout(&self, handle: Handle, timeout: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = inner.live(handle)?;
        inner.slot_mut(idx)?.recv_timeout = timeout.filter(|t| !t.is_zero());
        Ok(())
    }

    pub fn set_send_timeout(&self, handle: Handle, timeout: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = inner.live(handle)?;
        inner.slot_mut(idx)?.send_timeout = timeout.filter(|t| !t.is_zero());
        Ok(())
    }

    /// Address the socket is bound or connected from, if any.
    pub fn local_addr(&self, handle: Handle) -> Result<Option<SocketAddr>> {
        let inner = self.inner.lock();
        let slot = inner.slot(inner.live(handle)?)?;
        Ok(match &slot.state {
            State::Stream(conn) => Some(conn.local),
            _ => slot.local,
        })
    }

    pub fn peer_addr(&self, handle: Handle) -> Result<SocketAddr> {
        let inner = self.inner.lock();
        let slot = inner.slot(inner.live(handle)?)?;
        match &slot.state {
            State::Stream(conn) if matches!(conn.phase, Phase::Established) => Ok(conn.remote),
            _ => Err(ErrorCode::NotConnected.into()),
        }
    }

    /// Feed a frame received from `from` on `network`.
    pub fn input(&self, network: NetworkId, from: NodeId, frame: &[u8]) {
        let segment = match Segment::decode(frame) {
            Ok(segment) => segment,
            Err(e) => {
                debug!(%network, %from, "dropping malformed frame: {e}");
                return;
            }
        };
        let mut inner = self.inner.lock();
        inner.handle_segment(network, Hop::Remote(from), segment, Instant::now());
        self.flush(&mut *inner);
        drop(inner);
        self.cond.notify_all();
    }

    /// Retransmit overdue segments and expire dead connections.
    pub fn poll_timers(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let Inner {
            slots,
            lingering,
            outbox,
            ..
        } = &mut *inner;
        for slot in slots.iter_mut().flatten() {
            if let State::Stream(conn) = &mut slot.state {
                conn.on_timer(now, outbox);
            }
        }
        for conn in lingering.iter_mut() {
            conn.on_timer(now, outbox);
        }
        lingering.retain(|c| {
            c.error.is_none()
                && !c.unacked.is_empty()
                && c.linger_until.is_some_and(|until| now < until)
        });
        self.flush(&mut *inner);
        drop(inner);
        self.cond.notify_all();
    }

    /// Fail every socket tied to `network` with `NetworkLeft`. New binds and
    /// connects on it fail the same way until [`Stack::enable_network`].
    pub fn invalidate_network(&self, network: NetworkId) {
        let mut inner = self.inner.lock();
        inner.left.insert(network);
        let mut count = 0;
        for slot in inner.slots.iter_mut().flatten() {
            let on_network = slot.network == Some(network)
                || matches!(&slot.state, State::Stream(c) if c.route.network == network);
            if on_network {
                slot.error = Some(ErrorCode::NetworkLeft);
                if let State::Stream(conn) = &mut slot.state {
                    conn.abort(ErrorCode::NetworkLeft);
                }
                count += 1;
            }
        }
        inner.lingering.retain(|c| c.route.network != network);
        drop(inner);
        self.cond.notify_all();
        debug!(%network, sockets = count, "invalidated sockets on left network");
    }

    /// Allow sockets on `network` again after a rejoin.
    pub fn enable_network(&self, network: NetworkId) {
        self.inner.lock().left.remove(&network);
    }

    /// Fail every socket with `ConnectionAborted`; used when the node stops.
    pub fn abort_all(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut().flatten() {
            slot.error = Some(ErrorCode::ConnectionAborted);
            if let State::Stream(conn) = &mut slot.state {
                conn.abort(ErrorCode::ConnectionAborted);
            }
        }
        inner.lingering.clear();
        inner.outbox = Outbox::default();
        drop(inner);
        self.cond.notify_all();
    }

    /// Number of allocated handle slots.
    pub fn handles_in_use(&self) -> usize {
        self.inner.lock().slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const NET: NetworkId = NetworkId(0xfeed);

    #[derive(Default)]
    struct Captured(Mutex<Vec<(NetworkId, NodeId, Vec<u8>)>>);

    impl FrameSink for Captured {
        fn send_frame(&self, network: NetworkId, dest: NodeId, frame: Vec<u8>) {
            self.0.lock().push((network, dest, frame));
        }
    }

    fn stack() -> (Arc<Stack>, Arc<Captured>) {
        let sink = Arc::new(Captured::default());
        let stack = Arc::new(Stack::new(sink.clone(), Duration::from_secs(2)));
        (stack, sink)
    }

    fn local() -> Route {
        Route {
            network: NET,
            hop: Hop::Local,
        }
    }

    fn ip() -> IpAddr {
        "10.147.0.9".parse().unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(ip(), port)
    }

    /// Listener on port 8080 plus a connected client/server pair.
    fn connected_pair(stack: &Stack) -> (Handle, Handle, Handle) {
        let listener = stack.open(Family::Ipv4, SocketType::Stream);
        stack.bind(listener, addr(8080), Some(NET)).unwrap();
        stack.listen(listener, 5).unwrap();

        let client = stack.open(Family::Ipv4, SocketType::Stream);
        stack.connect(client, addr(8080), local(), ip()).unwrap();
        let (server, from) = stack.accept(listener).unwrap();
        assert_eq!(Some(from), stack.local_addr(client).unwrap());
        (listener, client, server)
    }

    fn read_exact(stack: &Stack, handle: Handle, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            let chunk = stack.recv(handle, len - out.len(), MsgFlags::empty()).unwrap();
            assert!(!chunk.is_empty(), "unexpected EOF");
            out.extend(chunk);
        }
        out
    }

    #[test]
    fn test_loopback_preserves_bytes() {
        let (stack, _) = stack();
        let (_, client, server) = connected_pair(&stack);

        for len in [0usize, 1, MSS - 1, MSS, MSS + 1, 64 * 1024] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut sent = 0;
            while sent < len {
                sent += stack.send(client, &payload[sent..], MsgFlags::empty()).unwrap();
            }
            assert_eq!(read_exact(&stack, server, len), payload);
        }
    }

    #[test]
    fn test_orderly_close_yields_repeated_eof() {
        let (stack, _) = stack();
        let (_, client, server) = connected_pair(&stack);

        stack.send(client, b"bye", MsgFlags::empty()).unwrap();
        stack.close(client).unwrap();

        assert_eq!(stack.recv(server, 16, MsgFlags::empty()).unwrap(), b"bye");
        assert!(stack.recv(server, 16, MsgFlags::empty()).unwrap().is_empty());
        assert!(stack.recv(server, 16, MsgFlags::empty()).unwrap().is_empty());

        stack.close(server).unwrap();
        assert!(stack.recv(server, 16, MsgFlags::empty()).unwrap_err().is_invalid_handle());
    }

    #[test]
    fn test_second_close_is_invalid_handle() {
        let (stack, _) = stack();
        let h = stack.open(Family::Ipv6, SocketType::Stream);
        stack.close(h).unwrap();
        assert!(stack.close(h).unwrap_err().is_invalid_handle());
    }

    #[test]
    fn test_handles_reused_lowest_first() {
        let (stack, _) = stack();
        let a = stack.open(Family::Ipv4, SocketType::Stream);
        let b = stack.open(Family::Ipv4, SocketType::Stream);
        let c = stack.open(Family::Ipv4, SocketType::Datagram);
        stack.close(a).unwrap();
        stack.close(b).unwrap();
        assert_eq!(stack.open(Family::Ipv4, SocketType::Stream), a);
        assert_eq!(stack.open(Family::Ipv4, SocketType::Stream), b);
        assert_ne!(c, a);
    }

    #[test]
    fn test_close_aborts_blocked_accept() {
        let (stack, _) = stack();
        let listener = stack.open(Family::Ipv4, SocketType::Stream);
        stack.bind(listener, addr(9000), None).unwrap();
        stack.listen(listener, -1).unwrap();

        let blocked = {
            let stack = Arc::clone(&stack);
            thread::spawn(move || stack.accept(listener))
        };
        thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        stack.close(listener).unwrap();

        let err = blocked.join().unwrap().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConnectionAborted));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(stack.handles_in_use(), 0);
    }

    #[test]
    fn test_nonblocking_accept_and_recv() {
        let (stack, _) = stack();
        let listener = stack.open(Family::Ipv4, SocketType::Stream);
        stack.bind(listener, addr(7000), None).unwrap();
        stack.listen(listener, 1).unwrap();
        stack.set_blocking(listener, false).unwrap();
        assert!(!stack.blocking(listener).unwrap());

        let err = stack.accept(listener).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::WouldBlock));
        assert!(err.is_retryable());

        let client = stack.open(Family::Ipv4, SocketType::Stream);
        stack.connect(client, addr(7000), local(), ip()).unwrap();
        let (server, _) = stack.accept(listener).unwrap();
        let err = stack.recv(server, 10, MsgFlags::DONTWAIT).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::WouldBlock));
    }

    #[test]
    fn test_connect_refused_without_listener() {
        let (stack, _) = stack();
        let client = stack.open(Family::Ipv4, SocketType::Stream);
        let err = stack.connect(client, addr(1), local(), ip()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConnectionRefused));
    }

    #[test]
    fn test_backlog_limits_pending_connections() {
        let (stack, _) = stack();
        let listener = stack.open(Family::Ipv4, SocketType::Stream);
        stack.bind(listener, addr(8000), None).unwrap();
        stack.listen(listener, 1).unwrap();

        let first = stack.open(Family::Ipv4, SocketType::Stream);
        stack.connect(first, addr(8000), local(), ip()).unwrap();
        let second = stack.open(Family::Ipv4, SocketType::Stream);
        let err = stack.connect(second, addr(8000), local(), ip()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConnectionRefused));

        // Raising the backlog lets the retry through.
        stack.listen(listener, 4).unwrap();
        stack.connect(second, addr(8000), local(), ip()).unwrap();
    }

    #[test]
    fn test_bind_conflicts() {
        let (stack, _) = stack();
        let a = stack.open(Family::Ipv4, SocketType::Stream);
        let b = stack.open(Family::Ipv4, SocketType::Stream);
        stack.bind(a, addr(5000), None).unwrap();

        let err = stack.bind(a, addr(5001), None).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::AddressInUse));
        let err = stack
            .bind(b, SocketAddr::new(Family::Ipv4.unspecified(), 5000), None)
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::AddressInUse));

        // Same port on the other transport is fine.
        let d = stack.open(Family::Ipv4, SocketType::Datagram);
        stack.bind(d, addr(5000), None).unwrap();

        let any = stack.bind(b, addr(0), None).unwrap();
        assert!(any.port() >= EPHEMERAL_FIRST);
    }

    #[test]
    fn test_listen_requires_bind() {
        let (stack, _) = stack();
        let h = stack.open(Family::Ipv4, SocketType::Stream);
        assert!(matches!(stack.listen(h, 5), Err(Error::Argument(_))));
    }

    #[test]
    fn test_nonblocking_connect_reports_progress() {
        let (stack, sink) = stack();
        let client = stack.open(Family::Ipv4, SocketType::Stream);
        stack.set_blocking(client, false).unwrap();

        let peer = NodeId::new(0x0a0b0c0d0e);
        let route = Route {
            network: NET,
            hop: Hop::Remote(peer),
        };
        let remote = SocketAddr::new("10.147.0.20".parse().unwrap(), 80);
        let err = stack.connect(client, remote, route, ip()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InProgress));
        let err = stack.connect(client, remote, route, ip()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Already));

        // Answer the SYN the way a remote stack would.
        let (net, dest, frame) = sink.0.lock().pop().unwrap();
        assert_eq!((net, dest), (NET, peer));
        let syn = Segment::decode(&frame).unwrap();
        assert_eq!(syn.kind, SegmentKind::Syn);
        let syn_ack = Segment {
            kind: SegmentKind::SynAck,
            src: syn.dst,
            dst: syn.src,
            seq: 0,
            payload: Vec::new(),
        };
        stack.input(NET, peer, &syn_ack.encode());

        stack.connect(client, remote, route, ip()).unwrap();
        assert_eq!(stack.peer_addr(client).unwrap(), remote);
        let err = stack.connect(client, remote, route, ip()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::IsConnected));
    }

    #[test]
    fn test_unacked_data_is_retransmitted() {
        let (stack, sink) = stack();
        let peer = NodeId::new(0x77);
        let route = Route {
            network: NET,
            hop: Hop::Remote(peer),
        };
        let remote = SocketAddr::new("10.147.0.20".parse().unwrap(), 80);
        let client = stack.open(Family::Ipv4, SocketType::Stream);
        stack.set_blocking(client, false).unwrap();
        let _ = stack.connect(client, remote, route, ip());

        let syn = Segment::decode(&sink.0.lock().pop().unwrap().2).unwrap();
        let syn_ack = Segment {
            kind: SegmentKind::SynAck,
            src: syn.dst,
            dst: syn.src,
            seq: 0,
            payload: Vec::new(),
        };
        stack.input(NET, peer, &syn_ack.encode());
        stack.send(client, b"hello", MsgFlags::empty()).unwrap();
        sink.0.lock().clear();

        stack.poll_timers(Instant::now() + RTO * 2);
        let resent: Vec<_> = sink
            .0
            .lock()
            .iter()
            .map(|(_, _, f)| Segment::decode(f).unwrap())
            .collect();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].kind, SegmentKind::Data);
        assert_eq!(resent[0].payload, b"hello");

        // Once acknowledged nothing more is resent.
        let ack = Segment {
            kind: SegmentKind::Ack,
            src: syn.dst,
            dst: syn.src,
            seq: 1,
            payload: Vec::new(),
        };
        stack.input(NET, peer, &ack.encode());
        sink.0.lock().clear();
        stack.poll_timers(Instant::now() + RTO * 4);
        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn test_lingering_fin_at_sequence_limit() {
        let (stack, sink) = stack();
        let peer = NodeId::new(0x42);
        let remote = SocketAddr::new("10.147.0.20".parse().unwrap(), 40000);
        let listener = stack.open(Family::Ipv4, SocketType::Stream);
        stack.bind(listener, addr(8080), Some(NET)).unwrap();
        stack.listen(listener, 5).unwrap();

        let segment = |kind, seq| Segment {
            kind,
            src: remote,
            dst: addr(8080),
            seq,
            payload: Vec::new(),
        };
        stack.input(NET, peer, &segment(SegmentKind::Syn, 0).encode());
        let (server, _) = stack.accept(listener).unwrap();
        stack.send(server, b"unacked", MsgFlags::empty()).unwrap();
        stack.close(server).unwrap();
        sink.0.lock().clear();

        stack.input(NET, peer, &segment(SegmentKind::Fin, u64::MAX).encode());
        let replies: Vec<_> = sink
            .0
            .lock()
            .drain(..)
            .map(|(_, _, f)| Segment::decode(&f).unwrap())
            .collect();
        assert_eq!(replies.len(), 1);
        assert_eq!((replies[0].kind, replies[0].seq), (SegmentKind::Ack, 0));

        // An in-window FIN still advances the acknowledgement.
        stack.input(NET, peer, &segment(SegmentKind::Fin, 0).encode());
        let ack = Segment::decode(&sink.0.lock().pop().unwrap().2).unwrap();
        assert_eq!((ack.kind, ack.seq), (SegmentKind::Ack, 1));
    }

    #[test]
    fn test_connect_retry_after_timeout_starts_over() {
        let sink = Arc::new(Captured::default());
        let stack = Stack::new(sink.clone(), Duration::from_millis(150));
        let route = Route {
            network: NET,
            hop: Hop::Remote(NodeId::new(0x99)),
        };
        let remote = SocketAddr::new("10.147.0.20".parse().unwrap(), 80);
        let client = stack.open(Family::Ipv4, SocketType::Stream);

        let err = stack.connect(client, remote, route, ip()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::TimedOut));
        let kinds: Vec<_> = sink
            .0
            .lock()
            .drain(..)
            .map(|(_, _, f)| Segment::decode(&f).unwrap().kind)
            .collect();
        assert_eq!(kinds, vec![SegmentKind::Syn, SegmentKind::Rst]);

        stack.set_blocking(client, false).unwrap();
        let err = stack.connect(client, remote, route, ip()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InProgress));
        let syn = Segment::decode(&sink.0.lock().pop().unwrap().2).unwrap();
        assert_eq!(syn.kind, SegmentKind::Syn);
    }

    #[test]
    fn test_shutdown_write_signals_eof_but_keeps_reading() {
        let (stack, _) = stack();
        let (_, client, server) = connected_pair(&stack);

        stack.shutdown(client, Shutdown::Write).unwrap();
        assert!(stack.recv(server, 8, MsgFlags::empty()).unwrap().is_empty());
        let err = stack.send(client, b"x", MsgFlags::empty()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Shutdown));

        stack.send(server, b"reply", MsgFlags::empty()).unwrap();
        assert_eq!(read_exact(&stack, client, 5), b"reply");
    }

    #[test]
    fn test_peek_leaves_data() {
        let (stack, _) = stack();
        let (_, client, server) = connected_pair(&stack);
        stack.send(client, b"abc", MsgFlags::empty()).unwrap();

        assert_eq!(stack.recv(server, 8, MsgFlags::PEEK).unwrap(), b"abc");
        assert_eq!(stack.recv(server, 8, MsgFlags::empty()).unwrap(), b"abc");
    }

    #[test]
    fn test_invalidate_network_fails_pending_recv() {
        let (stack, _) = stack();
        let (_, _client, server) = connected_pair(&stack);

        let blocked = {
            let stack = Arc::clone(&stack);
            thread::spawn(move || stack.recv(server, 8, MsgFlags::empty()))
        };
        thread::sleep(Duration::from_millis(50));
        stack.invalidate_network(NET);

        let err = blocked.join().unwrap().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NetworkLeft));
        let err = stack.send(server, b"x", MsgFlags::empty()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NetworkLeft));
    }

    #[test]
    fn test_left_network_refuses_new_sockets() {
        let (stack, _) = stack();
        stack.invalidate_network(NET);

        let listener = stack.open(Family::Ipv4, SocketType::Stream);
        let err = stack.bind(listener, addr(8080), Some(NET)).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NetworkLeft));
        let client = stack.open(Family::Ipv4, SocketType::Stream);
        let err = stack.connect(client, addr(8080), local(), ip()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NetworkLeft));
        let dgram = stack.open(Family::Ipv4, SocketType::Datagram);
        let err = stack.send_to(dgram, b"x", addr(53), local(), ip()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NetworkLeft));

        stack.enable_network(NET);
        stack.bind(listener, addr(8080), Some(NET)).unwrap();
        stack.listen(listener, 1).unwrap();
        stack.connect(client, addr(8080), local(), ip()).unwrap();
    }

    #[test]
    fn test_abort_all_wakes_blocked_calls() {
        let (stack, _) = stack();
        let (listener, _client, _server) = connected_pair(&stack);

        let blocked = {
            let stack = Arc::clone(&stack);
            thread::spawn(move || stack.accept(listener))
        };
        thread::sleep(Duration::from_millis(50));
        stack.abort_all();

        let err = blocked.join().unwrap().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConnectionAborted));
        // Handles stay valid until closed.
        stack.close(listener).unwrap();
    }

    #[test]
    fn test_recv_timeout() {
        let (stack, _) = stack();
        let (_, _client, server) = connected_pair(&stack);
        stack
            .set_recv_timeout(server, Some(Duration::from_millis(50)))
            .unwrap();
        let err = stack.recv(server, 8, MsgFlags::empty()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::TimedOut));
    }

    #[test]
    fn test_datagrams() {
        let (stack, _) = stack();
        let rx = stack.open(Family::Ipv4, SocketType::Datagram);
        stack.bind(rx, addr(5353), Some(NET)).unwrap();
        let tx = stack.open(Family::Ipv4, SocketType::Datagram);

        stack.send_to(tx, b"one", addr(5353), local(), ip()).unwrap();
        stack.send_to(tx, b"two", addr(5353), local(), ip()).unwrap();
        let (data, from) = stack.recv_from(rx, 64, MsgFlags::empty()).unwrap();
        assert_eq!(data, b"one");
        let port = stack.local_addr(tx).unwrap().unwrap().port();
        assert_eq!(from, addr(port));
        assert_eq!(stack.recv(rx, 2, MsgFlags::empty()).unwrap(), b"tw");

        let big = vec![0u8; MSS + 1];
        let err = stack.send_to(tx, &big, addr(5353), local(), ip()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MessageTooLong));
    }
}
