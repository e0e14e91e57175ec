//! Wire format for UDP-encapsulated peer packets.
//!
//! The protocol is versioned from day one and uses network byte order
//! (big-endian) for all multi-byte fields.
//!
//! # Packet Format
//!
//! - Magic number (4 bytes): protocol identifier ("VNET")
//! - Version (1 byte)
//! - Kind (1 byte): HELLO, HELLO_ACK, KEEPALIVE, FRAME, WHOIS, WHOIS_REPLY, ANNOUNCE
//! - Destination address (5 bytes)
//! - Source address (5 bytes)
//! - Sequence number (8 bytes): per-sender counter, also the AEAD nonce
//! - Flags (1 byte)
//! - Payload length (2 bytes)
//! - Authentication tag (16 bytes): zero for unsealed HELLO / HELLO_ACK
//! - Payload (variable)
//!
//! Total header size: 43 bytes + variable payload. The header is
//! authenticated as AEAD associated data, so relays forward packets unchanged.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::identity::{NodeId, KEY_SIZE};
use crate::network::NetworkId;

/// Magic number identifying vnet packets (ASCII: "VNET")
pub const PROTOCOL_MAGIC: u32 = 0x564E_4554;

/// Current protocol version
pub const CURRENT_VERSION: u8 = 1;

/// Size of the AEAD authentication tag (ChaCha20Poly1305)
pub const AUTH_TAG_SIZE: usize = 16;

/// Minimum packet size (header + tag, no payload)
pub const MIN_PACKET_SIZE: usize = PacketHeader::SIZE + AUTH_TAG_SIZE;

/// Maximum packet size on the wire
pub const MAX_PACKET_SIZE: usize = 1500;

/// Largest payload that fits in one packet
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - MIN_PACKET_SIZE;

/// Packet kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Hello = 1,
    HelloAck = 2,
    Keepalive = 3,
    Frame = 4,
    Whois = 5,
    WhoisReply = 6,
    Announce = 7,
}

impl PacketKind {
    /// Whether the payload is encrypted under the link key. HELLO is plain,
    /// HELLO_ACK is authenticated but readable.
    pub fn is_sealed(self) -> bool {
        !matches!(self, Self::Hello | Self::HelloAck)
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Hello,
            2 => Self::HelloAck,
            3 => Self::Keepalive,
            4 => Self::Frame,
            5 => Self::Whois,
            6 => Self::WhoisReply,
            7 => Self::Announce,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

/// Packet flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub fn empty() -> Self {
        Self(0)
    }

    /// Sender routed this packet through a relay rather than directly.
    pub const VIA_RELAY: u8 = 0b0000_0001;

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn is_set(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn raw(&self) -> u8 {
        self.0
    }

    pub fn from_raw(value: u8) -> Self {
        Self(value)
    }
}

/// Packet header structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u8,
    pub kind: PacketKind,
    pub dest: NodeId,
    pub source: NodeId,
    pub sequence: u64,
    pub flags: PacketFlags,
    pub payload_len: u16,
}

impl PacketHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 27;

    pub fn new(kind: PacketKind, dest: NodeId, source: NodeId, sequence: u64) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: CURRENT_VERSION,
            kind,
            dest,
            source,
            sequence,
            flags: PacketFlags::empty(),
            payload_len: 0,
        }
    }

    /// Encode header to bytes (network byte order)
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.version;
        buf[5] = self.kind as u8;
        buf[6..11].copy_from_slice(&self.dest.to_bytes());
        buf[11..16].copy_from_slice(&self.source.to_bytes());
        buf[16..24].copy_from_slice(&self.sequence.to_be_bytes());
        buf[24] = self.flags.raw();
        buf[25..27].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Decode header from bytes (network byte order)
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::InvalidLength {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }
        if buf[4] != CURRENT_VERSION {
            return Err(ProtocolError::UnsupportedVersion(buf[4]));
        }
        let kind = PacketKind::try_from(buf[5])?;

        let mut r = Reader::new(&buf[6..Self::SIZE]);
        let dest = r.node_id()?;
        let source = r.node_id()?;
        let sequence = r.u64()?;
        let flags = PacketFlags::from_raw(r.u8()?);
        let payload_len = r.u16()?;

        Ok(Self {
            magic,
            version: buf[4],
            kind,
            dest,
            source,
            sequence,
            flags,
            payload_len,
        })
    }
}

/// Complete packet with header and payload
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub auth_tag: [u8; AUTH_TAG_SIZE],
    pub payload: Vec<u8>,
}

impl Packet {
    /// Unsealed packet (used for HELLO / HELLO_ACK).
    pub fn new(mut header: PacketHeader, payload: Vec<u8>) -> Self {
        header.payload_len = payload.len() as u16;
        Self {
            header,
            auth_tag: [0u8; AUTH_TAG_SIZE],
            payload,
        }
    }

    pub fn total_size(&self) -> usize {
        MIN_PACKET_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_size());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.auth_tag);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < MIN_PACKET_SIZE {
            return Err(ProtocolError::InvalidLength {
                expected: MIN_PACKET_SIZE,
                actual: buf.len(),
            });
        }

        let header = PacketHeader::decode(&buf[..PacketHeader::SIZE])?;
        let len = header.payload_len as usize;
        if len > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(len));
        }

        let expected_len = MIN_PACKET_SIZE + len;
        if buf.len() < expected_len {
            return Err(ProtocolError::InvalidLength {
                expected: expected_len,
                actual: buf.len(),
            });
        }

        let mut auth_tag = [0u8; AUTH_TAG_SIZE];
        auth_tag.copy_from_slice(&buf[PacketHeader::SIZE..MIN_PACKET_SIZE]);

        Ok(Self {
            header,
            auth_tag,
            payload: buf[MIN_PACKET_SIZE..expected_len].to_vec(),
        })
    }
}

/// Decoded packet payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Carries a fresh challenge the answering HELLO_ACK must echo.
    Hello {
        public_key: [u8; KEY_SIZE],
        challenge: u64,
    },
    HelloAck {
        public_key: [u8; KEY_SIZE],
        challenge: u64,
    },
    Keepalive,
    Frame {
        network: NetworkId,
        data: Vec<u8>,
    },
    Whois {
        address: NodeId,
    },
    WhoisReply {
        address: NodeId,
        public_key: [u8; KEY_SIZE],
        endpoint: Option<SocketAddr>,
    },
    Announce {
        network: NetworkId,
        addrs: Vec<IpAddr>,
    },
}

impl Message {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Hello { .. } => PacketKind::Hello,
            Self::HelloAck { .. } => PacketKind::HelloAck,
            Self::Keepalive => PacketKind::Keepalive,
            Self::Frame { .. } => PacketKind::Frame,
            Self::Whois { .. } => PacketKind::Whois,
            Self::WhoisReply { .. } => PacketKind::WhoisReply,
            Self::Announce { .. } => PacketKind::Announce,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Hello {
                public_key,
                challenge,
            }
            | Self::HelloAck {
                public_key,
                challenge,
            } => {
                buf.extend_from_slice(public_key);
                buf.extend_from_slice(&challenge.to_be_bytes());
            }
            Self::Keepalive => {}
            Self::Frame { network, data } => {
                buf.extend_from_slice(&network.0.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Self::Whois { address } => buf.extend_from_slice(&address.to_bytes()),
            Self::WhoisReply {
                address,
                public_key,
                endpoint,
            } => {
                buf.extend_from_slice(&address.to_bytes());
                buf.extend_from_slice(public_key);
                match endpoint {
                    Some(ep) => {
                        buf.push(1);
                        put_socket_addr(&mut buf, ep);
                    }
                    None => buf.push(0),
                }
            }
            Self::Announce { network, addrs } => {
                buf.extend_from_slice(&network.0.to_be_bytes());
                buf.push(addrs.len().min(u8::MAX as usize) as u8);
                for ip in addrs.iter().take(u8::MAX as usize) {
                    put_ip(&mut buf, ip);
                }
            }
        }
        buf
    }

    pub fn decode(kind: PacketKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let msg = match kind {
            PacketKind::Hello => Self::Hello {
                public_key: r.key()?,
                challenge: r.u64()?,
            },
            PacketKind::HelloAck => Self::HelloAck {
                public_key: r.key()?,
                challenge: r.u64()?,
            },
            PacketKind::Keepalive => Self::Keepalive,
            PacketKind::Frame => Self::Frame {
                network: NetworkId(r.u64()?),
                data: r.rest().to_vec(),
            },
            PacketKind::Whois => Self::Whois {
                address: r.node_id()?,
            },
            PacketKind::WhoisReply => {
                let address = r.node_id()?;
                let public_key = r.key()?;
                let endpoint = match r.u8()? {
                    0 => None,
                    _ => Some(r.socket_addr()?),
                };
                Self::WhoisReply {
                    address,
                    public_key,
                    endpoint,
                }
            }
            PacketKind::Announce => {
                let network = NetworkId(r.u64()?);
                let count = r.u8()? as usize;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    addrs.push(r.ip()?);
                }
                Self::Announce { network, addrs }
            }
        };
        Ok(msg)
    }
}

/// Protocol-related errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid magic number: 0x{0:08X} (expected 0x{:08X})", PROTOCOL_MAGIC)]
    InvalidMagic(u32),

    #[error("Unsupported protocol version: v{0}")]
    UnsupportedVersion(u8),

    #[error("Unknown packet kind: {0}")]
    UnknownKind(u8),

    #[error("Invalid packet length: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Truncated field")]
    Truncated,

    #[error("Invalid address family tag: {0}")]
    InvalidFamily(u8),
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hello => "HELLO",
            Self::HelloAck => "HELLO_ACK",
            Self::Keepalive => "KEEPALIVE",
            Self::Frame => "FRAME",
            Self::Whois => "WHOIS",
            Self::WhoisReply => "WHOIS_REPLY",
            Self::Announce => "ANNOUNCE",
        };
        f.write_str(name)
    }
}

pub(crate) fn put_ip(buf: &mut Vec<u8>, ip: &IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            buf.push(4);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.push(6);
            buf.extend_from_slice(&v6.octets());
        }
    }
}

pub(crate) fn put_socket_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    put_ip(buf, &addr.ip());
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Big-endian cursor over a byte slice.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).ok_or(ProtocolError::Truncated)?;
        let out = self.buf.get(self.pos..end).ok_or(ProtocolError::Truncated)?;
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ProtocolError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_be_bytes(b))
    }

    pub(crate) fn node_id(&mut self) -> Result<NodeId, ProtocolError> {
        let b = self.bytes(5)?;
        Ok(NodeId::from_bytes([b[0], b[1], b[2], b[3], b[4]]))
    }

    pub(crate) fn key(&mut self) -> Result<[u8; KEY_SIZE], ProtocolError> {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(self.bytes(KEY_SIZE)?);
        Ok(key)
    }

    pub(crate) fn ip(&mut self) -> Result<IpAddr, ProtocolError> {
        match self.u8()? {
            4 => {
                let b = self.bytes(4)?;
                Ok(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
            }
            6 => {
                let mut o = [0u8; 16];
                o.copy_from_slice(self.bytes(16)?);
                Ok(IpAddr::V6(Ipv6Addr::from(o)))
            }
            other => Err(ProtocolError::InvalidFamily(other)),
        }
    }

    pub(crate) fn socket_addr(&mut self) -> Result<SocketAddr, ProtocolError> {
        let ip = self.ip()?;
        let port = self.u16()?;
        Ok(SocketAddr::new(ip, port))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> PacketHeader {
        PacketHeader::new(
            PacketKind::Frame,
            NodeId::new(0x01_02_03_04_05),
            NodeId::new(0x0a_0b_0c_0d_0e),
            42,
        )
    }

    #[test]
    fn test_packet_flags() {
        let mut flags = PacketFlags::empty();
        assert!(!flags.is_set(PacketFlags::VIA_RELAY));
        flags.set(PacketFlags::VIA_RELAY);
        assert!(flags.is_set(PacketFlags::VIA_RELAY));
        assert_eq!(PacketFlags::from_raw(flags.raw()), flags);
    }

    #[test]
    fn test_header_encode_decode() {
        let mut h = header();
        h.payload_len = 100;
        h.flags.set(PacketFlags::VIA_RELAY);

        let decoded = PacketHeader::decode(&h.encode()).expect("Failed to decode header");
        assert_eq!(h, decoded);
    }

    #[test]
    fn test_header_invalid_magic() {
        let mut buf = header().encode();
        buf[0..4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(ProtocolError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_header_unsupported_version() {
        let mut buf = header().encode();
        buf[4] = 99;
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(ProtocolError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_header_unknown_kind() {
        let mut buf = header().encode();
        buf[5] = 200;
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(ProtocolError::UnknownKind(200))
        ));
    }

    #[test]
    fn test_packet_encode_decode() {
        let packet = Packet::new(header(), vec![1, 2, 3, 4, 5]);
        let decoded = Packet::decode(&packet.encode()).expect("Failed to decode packet");

        assert_eq!(decoded.header, packet.header);
        assert_eq!(decoded.payload, packet.payload);
        assert_eq!(decoded.header.payload_len, 5);
    }

    #[test]
    fn test_packet_too_short() {
        let buf = vec![0u8; 10];
        assert!(matches!(
            Packet::decode(&buf),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_packet_truncated_payload() {
        let mut wire = Packet::new(header(), vec![7; 20]).encode();
        wire.truncate(wire.len() - 5);
        assert!(matches!(
            Packet::decode(&wire),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_whois_reply_with_and_without_endpoint() {
        let with = Message::WhoisReply {
            address: NodeId::new(0x33),
            public_key: [9u8; KEY_SIZE],
            endpoint: Some("[2001:db8::1]:9993".parse().unwrap()),
        };
        assert_eq!(
            Message::decode(PacketKind::WhoisReply, &with.encode()).unwrap(),
            with
        );

        let without = Message::WhoisReply {
            address: NodeId::new(0x33),
            public_key: [9u8; KEY_SIZE],
            endpoint: None,
        };
        assert_eq!(
            Message::decode(PacketKind::WhoisReply, &without.encode()).unwrap(),
            without
        );
    }

    #[test]
    fn test_announce_mixed_families() {
        let msg = Message::Announce {
            network: NetworkId(0xfeed),
            addrs: vec![
                "10.147.1.2".parse().unwrap(),
                "fd00::1".parse().unwrap(),
            ],
        };
        assert_eq!(msg.kind(), PacketKind::Announce);
        assert_eq!(
            Message::decode(PacketKind::Announce, &msg.encode()).unwrap(),
            msg
        );
    }

    #[test]
    fn test_hello_requires_key_and_challenge() {
        assert!(matches!(
            Message::decode(PacketKind::Hello, &[1, 2, 3]),
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(
            Message::decode(PacketKind::HelloAck, &[7u8; KEY_SIZE]),
            Err(ProtocolError::Truncated)
        ));

        let ack = Message::HelloAck {
            public_key: [7u8; KEY_SIZE],
            challenge: u64::MAX,
        };
        assert_eq!(Message::decode(PacketKind::HelloAck, &ack.encode()).unwrap(), ack);
        assert!(!PacketKind::HelloAck.is_sealed());
        assert!(PacketKind::Keepalive.is_sealed());
    }

    #[test]
    fn test_bad_family_tag() {
        let mut payload = 7u64.to_be_bytes().to_vec();
        payload.push(1);
        payload.push(5);
        assert!(matches!(
            Message::decode(PacketKind::Announce, &payload),
            Err(ProtocolError::InvalidFamily(5))
        ));
    }
}
