//! Persistent node state: identity, peer cache and network cache.
//!
//! Layout of the storage directory:
//!
//! - `identity.secret`: base64 X25519 secret key
//! - `identity.public`: `<address>:<base64 public key>`
//! - `peers.toml`: cached peers (address, key, endpoints)
//! - `networks.toml`: networks to rejoin on start

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::identity::{self, Identity, IdentityError, NodeId};
use crate::network::NetworkId;

const IDENTITY_SECRET: &str = "identity.secret";
const IDENTITY_PUBLIC: &str = "identity.public";
const PEERS_FILE: &str = "peers.toml";
const NETWORKS_FILE: &str = "networks.toml";
const WRITE_CHECK_FILE: &str = ".write-check";

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create storage directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("storage directory {path} is not writable: {source}")]
    NotWritable { path: PathBuf, source: io::Error },

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("corrupt identity in {path}: {source}")]
    CorruptIdentity { path: PathBuf, source: IdentityError },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// A peer as remembered across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPeer {
    pub address: NodeId,
    pub public_key: String,
    #[serde(default)]
    pub endpoints: Vec<SocketAddr>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PeerCacheFile {
    #[serde(default)]
    peers: Vec<CachedPeer>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NetworkCacheFile {
    #[serde(default)]
    networks: Vec<NetworkId>,
}

/// Handle to the storage directory.
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Open (creating if needed) the storage directory and check that it is
    /// writable.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let check = dir.join(WRITE_CHECK_FILE);
        fs::write(&check, b"ok").map_err(|source| StorageError::NotWritable {
            path: dir.clone(),
            source,
        })?;
        let _ = fs::remove_file(&check);

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Load the identity, generating and persisting one on first run.
    pub fn load_or_create_identity(&self) -> Result<Identity, StorageError> {
        let secret_path = self.dir.join(IDENTITY_SECRET);

        if secret_path.exists() {
            let raw = read(&secret_path)?;
            let identity = Identity::decode_secret(&raw).map_err(|source| {
                StorageError::CorruptIdentity {
                    path: secret_path.clone(),
                    source,
                }
            })?;
            info!(address = %identity.address(), "loaded identity from {}", secret_path.display());

            // The public file is derived data; rewrite it if missing or stale.
            let public_path = self.dir.join(IDENTITY_PUBLIC);
            let current = fs::read_to_string(&public_path)
                .ok()
                .and_then(|s| identity::decode_public(&s).ok())
                .is_some_and(|(addr, key)| addr == identity.address() && key == identity.public_key());
            if !current {
                write(&public_path, &identity.encode_public(), Mode::Public)?;
            }
            return Ok(identity);
        }

        let identity = Identity::generate();
        write(&secret_path, &identity.encode_secret(), Mode::Secret)?;
        write(&self.dir.join(IDENTITY_PUBLIC), &identity.encode_public(), Mode::Public)?;
        info!(address = %identity.address(), "generated new identity in {}", self.dir.display());
        Ok(identity)
    }

    /// Cached peers, skipping entries whose key does not match the address.
    pub fn load_peers(&self) -> Result<Vec<CachedPeer>, StorageError> {
        let path = self.dir.join(PEERS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file: PeerCacheFile = parse(&path)?;
        Ok(file
            .peers
            .into_iter()
            .filter(|p| {
                identity::decode_key(&p.public_key)
                    .map(|key| identity::address_from_public_key(&key) == p.address)
                    .unwrap_or(false)
            })
            .collect())
    }

    pub fn save_peers(&self, peers: &[CachedPeer]) -> Result<(), StorageError> {
        let file = PeerCacheFile {
            peers: peers.to_vec(),
        };
        self.save(PEERS_FILE, &file)
    }

    /// Remove an unreadable peer cache.
    pub fn discard_peers(&self) -> Result<(), StorageError> {
        remove(&self.dir.join(PEERS_FILE))
    }

    pub fn load_networks(&self) -> Result<Vec<NetworkId>, StorageError> {
        let path = self.dir.join(NETWORKS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file: NetworkCacheFile = parse(&path)?;
        Ok(file.networks)
    }

    pub fn save_networks(&self, networks: &[NetworkId]) -> Result<(), StorageError> {
        let file = NetworkCacheFile {
            networks: networks.to_vec(),
        };
        self.save(NETWORKS_FILE, &file)
    }

    pub fn discard_networks(&self) -> Result<(), StorageError> {
        remove(&self.dir.join(NETWORKS_FILE))
    }

    fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        let path = self.dir.join(name);
        let raw = toml::to_string_pretty(value).map_err(|e| StorageError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;
        write(&path, &raw, Mode::Public)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Public,
    /// Readable by the owner only.
    Secret,
}

fn read(path: &Path) -> Result<String, StorageError> {
    fs::read_to_string(path).map_err(|source| StorageError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace `path` atomically: write a sibling temp file, then rename it over
/// the target.
fn write(path: &Path, contents: &str, mode: Mode) -> Result<(), StorageError> {
    let err = |source: io::Error| StorageError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(err)?;
    if mode == Mode::Secret {
        restrict(tmp.as_file()).map_err(err)?;
    }
    tmp.write_all(contents.as_bytes()).map_err(err)?;
    tmp.as_file().sync_all().map_err(err)?;
    tmp.persist(path).map_err(|e| err(e.error))?;
    Ok(())
}

#[cfg(unix)]
fn restrict(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

fn remove(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StorageError::Write {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn parse<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StorageError> {
    let raw = read(path)?;
    toml::from_str(&raw).map_err(|e| StorageError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_created_then_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let first = storage.load_or_create_identity().unwrap();
        assert!(dir.path().join(IDENTITY_SECRET).exists());
        assert!(dir.path().join(IDENTITY_PUBLIC).exists());

        let again = Storage::open(dir.path()).unwrap();
        let second = again.load_or_create_identity().unwrap();
        assert_eq!(first.address(), second.address());
    }

    #[test]
    fn test_corrupt_identity_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(IDENTITY_SECRET), "not base64 at all!").unwrap();

        let storage = Storage::open(dir.path()).unwrap();
        assert!(matches!(
            storage.load_or_create_identity(),
            Err(StorageError::CorruptIdentity { .. })
        ));
    }

    #[test]
    fn test_public_file_rewritten_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let id = storage.load_or_create_identity().unwrap();

        fs::remove_file(dir.path().join(IDENTITY_PUBLIC)).unwrap();
        storage.load_or_create_identity().unwrap();
        let public = fs::read_to_string(dir.path().join(IDENTITY_PUBLIC)).unwrap();
        assert_eq!(public, id.encode_public());
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        Storage::open(dir.path()).unwrap().load_or_create_identity().unwrap();

        let mode = fs::metadata(dir.path().join(IDENTITY_SECRET))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_writes_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.load_or_create_identity().unwrap();
        storage.save_networks(&[NetworkId(9)]).unwrap();
        storage.save_networks(&[NetworkId(10)]).unwrap();

        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec![IDENTITY_PUBLIC, IDENTITY_SECRET, NETWORKS_FILE]);
        assert_eq!(storage.load_networks().unwrap(), vec![NetworkId(10)]);
    }

    #[test]
    fn test_public_file_with_other_identity_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let id = storage.load_or_create_identity().unwrap();

        fs::write(dir.path().join(IDENTITY_PUBLIC), Identity::generate().encode_public()).unwrap();
        storage.load_or_create_identity().unwrap();
        let public = fs::read_to_string(dir.path().join(IDENTITY_PUBLIC)).unwrap();
        assert_eq!(identity::decode_public(&public).unwrap().0, id.address());
    }

    #[test]
    fn test_discard_missing_cache_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.discard_peers().unwrap();
        storage.save_peers(&[]).unwrap();
        storage.discard_peers().unwrap();
        assert!(!dir.path().join(PEERS_FILE).exists());
    }

    #[test]
    fn test_peer_cache_roundtrip_filters_forged_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let good = Identity::generate();
        let other = Identity::generate();
        let peers = vec![
            CachedPeer {
                address: good.address(),
                public_key: identity::encode_key(&good.public_key()),
                endpoints: vec!["127.0.0.1:9993".parse().unwrap()],
            },
            CachedPeer {
                address: good.address(),
                public_key: identity::encode_key(&other.public_key()),
                endpoints: Vec::new(),
            },
        ];
        storage.save_peers(&peers).unwrap();

        let loaded = storage.load_peers().unwrap();
        assert_eq!(loaded, vec![peers[0].clone()]);
    }

    #[test]
    fn test_network_cache() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        assert!(storage.load_networks().unwrap().is_empty());

        let nets = vec![NetworkId(1), NetworkId(0x8056c2e21c000001)];
        storage.save_networks(&nets).unwrap();
        assert_eq!(storage.load_networks().unwrap(), nets);
    }
}
