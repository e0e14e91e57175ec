//! UDP transport and per-link packet encryption.
//!
//! This module handles:
//! - The single UDP socket all peer traffic shares
//! - Packet sealing/opening using ChaCha20Poly1305 with the header as AAD
//! - Authenticated cleartext packets (HELLO_ACK), where header and payload
//!   are both associated data

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::proto::{Packet, PacketHeader, AUTH_TAG_SIZE};

/// Size of ChaCha20Poly1305 key in bytes
const KEY_SIZE: usize = 32;

/// Size of nonce in bytes
const NONCE_SIZE: usize = 12;

/// Nonce domain for packets sent by the lower-addressed side of a link.
const DOMAIN_LOW_TO_HIGH: u32 = 0x4C4F_5748;

/// Nonce domain for packets sent by the higher-addressed side of a link.
const DOMAIN_HIGH_TO_LOW: u32 = 0x4849_4C4F;

/// Link encryption key
pub type EncryptionKey = [u8; KEY_SIZE];

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encryption error")]
    Encryption,

    #[error("Decryption error")]
    Decryption,
}

/// The node's UDP socket, shared between the receive loop and senders.
#[derive(Clone)]
pub struct PeerSocket {
    socket: Arc<UdpSocket>,
}

impl PeerSocket {
    /// Wrap an already-bound std socket. Must be called inside a tokio runtime.
    pub fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Arc::new(UdpSocket::from_std(socket)?),
        })
    }

    pub async fn send_to(&self, data: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, to).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Packet encryptor/decryptor for one peer link
#[derive(Clone)]
pub struct PacketCrypto {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for PacketCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCrypto").finish_non_exhaustive()
    }
}

impl PacketCrypto {
    /// Create a new packet crypto with the given key
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::from_slice(key);
        Self {
            cipher: ChaCha20Poly1305::new(key),
        }
    }

    /// Generate a new random encryption key
    pub fn generate_key() -> EncryptionKey {
        ChaCha20Poly1305::generate_key(&mut OsRng).into()
    }

    /// Encrypt returning a detached authentication tag.
    pub fn encrypt_detached(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, [u8; AUTH_TAG_SIZE]), TransportError> {
        let nonce = Nonce::from_slice(nonce);
        let mut buf = plaintext.to_vec();

        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, aad, &mut buf)
            .map_err(|_| TransportError::Encryption)?;

        let mut tag_bytes = [0u8; AUTH_TAG_SIZE];
        tag_bytes.copy_from_slice(tag.as_slice());
        Ok((buf, tag_bytes))
    }

    /// Decrypt with a detached authentication tag.
    pub fn decrypt_detached(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
        auth_tag: &[u8; AUTH_TAG_SIZE],
    ) -> Result<Vec<u8>, TransportError> {
        let nonce = Nonce::from_slice(nonce);
        let mut buf = ciphertext.to_vec();
        let tag = chacha20poly1305::Tag::from_slice(auth_tag);

        self.cipher
            .decrypt_in_place_detached(nonce, aad, &mut buf, tag)
            .map_err(|_| TransportError::Decryption)?;

        Ok(buf)
    }

    /// Create a nonce from a domain and sequence number.
    ///
    /// Both ends of a link share one key, so each direction gets its own
    /// domain to avoid nonce reuse.
    pub fn nonce_from_domain_and_sequence(domain: u32, sequence: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0..4].copy_from_slice(&domain.to_be_bytes());
        nonce[4..12].copy_from_slice(&sequence.to_be_bytes());
        nonce
    }

    fn domain_for(header: &PacketHeader) -> u32 {
        if header.source < header.dest {
            DOMAIN_LOW_TO_HIGH
        } else {
            DOMAIN_HIGH_TO_LOW
        }
    }

    /// Seal a packet: encrypt the payload and fill `auth_tag`.
    ///
    /// The header is authenticated as AEAD associated data.
    pub fn seal_packet(
        &self,
        mut header: PacketHeader,
        plaintext: &[u8],
    ) -> Result<Packet, TransportError> {
        header.payload_len = plaintext.len() as u16;
        let aad = header.encode();
        let nonce = Self::nonce_from_domain_and_sequence(Self::domain_for(&header), header.sequence);
        let (ciphertext, tag) = self.encrypt_detached(&nonce, &aad, plaintext)?;

        Ok(Packet {
            header,
            auth_tag: tag,
            payload: ciphertext,
        })
    }

    /// Authenticate a packet without encrypting it. The tag covers the header
    /// and the cleartext payload.
    pub fn sign_packet(&self, mut header: PacketHeader, payload: &[u8]) -> Result<Packet, TransportError> {
        header.payload_len = payload.len() as u16;
        let nonce = Self::nonce_from_domain_and_sequence(Self::domain_for(&header), header.sequence);
        let (_, tag) = self.encrypt_detached(&nonce, &Self::signed_aad(&header, payload), &[])?;

        Ok(Packet {
            header,
            auth_tag: tag,
            payload: payload.to_vec(),
        })
    }

    /// Check the tag of a packet built by [`PacketCrypto::sign_packet`].
    pub fn verify_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        if packet.header.payload_len as usize != packet.payload.len() {
            return Err(TransportError::Decryption);
        }
        let nonce = Self::nonce_from_domain_and_sequence(
            Self::domain_for(&packet.header),
            packet.header.sequence,
        );
        let aad = Self::signed_aad(&packet.header, &packet.payload);
        self.decrypt_detached(&nonce, &aad, &[], &packet.auth_tag)
            .map(|_| ())
    }

    fn signed_aad(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
        let mut aad = header.encode().to_vec();
        aad.extend_from_slice(payload);
        aad
    }

    /// Open a sealed packet (verify and decrypt the payload).
    pub fn open_packet(&self, packet: &Packet) -> Result<Vec<u8>, TransportError> {
        if packet.header.payload_len as usize != packet.payload.len() {
            return Err(TransportError::Decryption);
        }

        let aad = packet.header.encode();
        let nonce = Self::nonce_from_domain_and_sequence(
            Self::domain_for(&packet.header),
            packet.header.sequence,
        );
        self.decrypt_detached(&nonce, &aad, &packet.payload, &packet.auth_tag)
    }
}
