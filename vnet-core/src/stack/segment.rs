//! Segment format carried inside FRAME packets.
//!
//! - Kind (1 byte)
//! - Source address + port
//! - Destination address + port
//! - Sequence number (8 bytes): segment number for DATA/FIN, next expected
//!   segment for ACK, zero otherwise
//! - Payload (rest of the frame)

use std::net::SocketAddr;

use crate::proto::{put_socket_addr, ProtocolError, Reader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Syn = 1,
    SynAck = 2,
    Ack = 3,
    Data = 4,
    Fin = 5,
    Rst = 6,
    Datagram = 7,
}

impl TryFrom<u8> for SegmentKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Syn,
            2 => Self::SynAck,
            3 => Self::Ack,
            4 => Self::Data,
            5 => Self::Fin,
            6 => Self::Rst,
            7 => Self::Datagram,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(48 + self.payload.len());
        buf.push(self.kind as u8);
        put_socket_addr(&mut buf, &self.src);
        put_socket_addr(&mut buf, &self.dst);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(buf);
        let kind = SegmentKind::try_from(r.u8()?)?;
        let src = r.socket_addr()?;
        let dst = r.socket_addr()?;
        let seq = r.u64()?;
        Ok(Self {
            kind,
            src,
            dst,
            seq,
            payload: r.rest().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_wire_form() {
        let seg = Segment {
            kind: SegmentKind::Data,
            src: "10.147.0.2:50000".parse().unwrap(),
            dst: "[fd00::1]:8080".parse().unwrap(),
            seq: 3,
            payload: b"abc".to_vec(),
        };
        let wire = seg.encode();
        assert_eq!(wire[0], 4);
        assert_eq!(Segment::decode(&wire).unwrap(), seg);
    }

    #[test]
    fn test_segment_rejects_garbage() {
        assert!(matches!(
            Segment::decode(&[99]),
            Err(ProtocolError::UnknownKind(99))
        ));
        assert!(matches!(
            Segment::decode(&[1, 4, 10]),
            Err(ProtocolError::Truncated)
        ));
    }
}
