//! Node identity: an X25519 key pair and the 40-bit address derived from it.

use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::transport::EncryptionKey;

/// Size of public and secret keys in bytes
pub const KEY_SIZE: usize = 32;

/// Node addresses are 40 bits wide.
pub const ADDRESS_BITS: u32 = 40;

const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;

/// Top byte reserved for future use; never assigned to a node.
const RESERVED_PREFIX: u64 = 0xff;

const LINK_KEY_CONTEXT: &[u8] = b"vnet link key v1";

/// 40-bit node address, printed as ten hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(raw: u64) -> Self {
        Self(raw & ADDRESS_MASK)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Zero and the 0xff.. prefix are not valid node addresses.
    pub fn is_reserved(self) -> bool {
        self.0 == 0 || (self.0 >> (ADDRESS_BITS - 8)) == RESERVED_PREFIX
    }

    pub fn to_bytes(self) -> [u8; 5] {
        let b = self.0.to_be_bytes();
        [b[3], b[4], b[5], b[6], b[7]]
    }

    pub fn from_bytes(b: [u8; 5]) -> Self {
        Self(u64::from_be_bytes([0, 0, 0, b[0], b[1], b[2], b[3], b[4]]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = u64::from_str_radix(s.trim(), 16)
            .map_err(|_| IdentityError::InvalidEncoding(format!("bad node address: {s}")))?;
        if raw > ADDRESS_MASK {
            return Err(IdentityError::InvalidEncoding(format!(
                "node address wider than {ADDRESS_BITS} bits: {s}"
            )));
        }
        Ok(Self(raw))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity errors
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid identity encoding: {0}")]
    InvalidEncoding(String),

    #[error("invalid key length: expected {KEY_SIZE}, got {0}")]
    InvalidKeyLength(usize),

    #[error("key derives a reserved address: {0}")]
    ReservedAddress(NodeId),

    #[error("address {claimed} does not match public key (derives {derived})")]
    AddressMismatch { claimed: NodeId, derived: NodeId },
}

/// Derive the node address for a public key.
pub fn address_from_public_key(public: &[u8; KEY_SIZE]) -> NodeId {
    let digest = Sha256::digest(public);
    NodeId::from_bytes([digest[0], digest[1], digest[2], digest[3], digest[4]])
}

/// A node's long-lived key pair.
#[derive(Clone)]
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
    address: NodeId,
}

impl Identity {
    /// Generate a new identity, retrying until the address is not reserved.
    pub fn generate() -> Self {
        loop {
            let mut bytes = [0u8; KEY_SIZE];
            OsRng.fill_bytes(&mut bytes);
            if let Ok(identity) = Self::from_secret_bytes(bytes) {
                return identity;
            }
        }
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Result<Self, IdentityError> {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        let address = address_from_public_key(public.as_bytes());
        if address.is_reserved() {
            return Err(IdentityError::ReservedAddress(address));
        }
        Ok(Self {
            secret,
            public,
            address,
        })
    }

    pub fn address(&self) -> NodeId {
        self.address
    }

    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Symmetric key shared with the owner of `peer_public`.
    ///
    /// Both sides derive the same key; nonce domains keep the two directions
    /// apart.
    pub fn agree(&self, peer_public: &[u8; KEY_SIZE]) -> EncryptionKey {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        let mut hasher = Sha256::new();
        hasher.update(LINK_KEY_CONTEXT);
        hasher.update(shared.as_bytes());
        hasher.finalize().into()
    }

    /// Base64 of the secret key, as stored in `identity.secret`.
    pub fn encode_secret(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.secret.to_bytes())
    }

    pub fn decode_secret(s: &str) -> Result<Self, IdentityError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
        Self::from_secret_bytes(to_key(&raw)?)
    }

    /// `<address>:<base64 public key>`, as stored in `identity.public`.
    pub fn encode_public(&self) -> String {
        format!("{}:{}", self.address, encode_key(&self.public_key()))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Parse an `identity.public` line and check the address matches the key.
pub fn decode_public(s: &str) -> Result<(NodeId, [u8; KEY_SIZE]), IdentityError> {
    let (addr, key) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| IdentityError::InvalidEncoding("missing ':' separator".to_string()))?;
    let claimed: NodeId = addr.parse()?;
    let key = decode_key(key)?;
    let derived = address_from_public_key(&key);
    if derived != claimed {
        return Err(IdentityError::AddressMismatch { claimed, derived });
    }
    Ok((claimed, key))
}

pub fn encode_key(key: &[u8; KEY_SIZE]) -> String {
    base64::engine::general_purpose::STANDARD.encode(key)
}

pub fn decode_key(s: &str) -> Result<[u8; KEY_SIZE], IdentityError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
    to_key(&raw)
}

fn to_key(raw: &[u8]) -> Result<[u8; KEY_SIZE], IdentityError> {
    if raw.len() != KEY_SIZE {
        return Err(IdentityError::InvalidKeyLength(raw.len()));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(raw);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_address_is_valid() {
        let id = Identity::generate();
        assert!(!id.address().is_reserved());
        assert_eq!(id.address(), address_from_public_key(&id.public_key()));
    }

    #[test]
    fn test_secret_encoding_restores_identity() {
        let id = Identity::generate();
        let restored = Identity::decode_secret(&id.encode_secret()).unwrap();
        assert_eq!(id.address(), restored.address());
        assert_eq!(id.public_key(), restored.public_key());
    }

    #[test]
    fn test_public_encoding() {
        let id = Identity::generate();
        let (addr, key) = decode_public(&id.encode_public()).unwrap();
        assert_eq!(addr, id.address());
        assert_eq!(key, id.public_key());
    }

    #[test]
    fn test_public_encoding_rejects_mismatch() {
        let a = Identity::generate();
        let b = Identity::generate();
        let forged = format!("{}:{}", a.address(), encode_key(&b.public_key()));
        assert!(matches!(
            decode_public(&forged),
            Err(IdentityError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn test_agree_is_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_eq!(a.agree(&b.public_key()), b.agree(&a.public_key()));
    }

    #[test]
    fn test_node_id_text_form() {
        let id = NodeId::new(0x00_12_34_56_78_9a);
        assert_eq!(id.to_string(), "123456789a");
        assert_eq!("123456789a".parse::<NodeId>().unwrap(), id);
        assert!("ffffffffffff".parse::<NodeId>().is_err());
        assert_eq!(NodeId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn test_reserved_addresses() {
        assert!(NodeId::new(0).is_reserved());
        assert!(NodeId::new(0xff_00_00_00_01).is_reserved());
        assert!(!NodeId::new(0x01_00_00_00_01).is_reserved());
    }

    #[test]
    fn test_wrong_key_length() {
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 7]);
        assert!(matches!(
            Identity::decode_secret(&short),
            Err(IdentityError::InvalidKeyLength(7))
        ));
    }
}
