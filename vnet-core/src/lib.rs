//! Core library for the vnet virtual network engine.
//!
//! A node has a persistent identity, talks to peers over one UDP socket,
//! joins virtual networks and exposes a BSD-style socket interface on the
//! addresses it is assigned there.
//!
//! # Architecture
//!
//! - `identity` / `storage`: key pair, node address and on-disk state
//! - `peer`: peer directory with paths, reachability and address book
//! - `network`: membership state machine and address assignment
//! - `event`: bounded event channel to a single observer
//! - `proto` / `transport`: wire format and link encryption
//! - `stack` / `reassembly`: embedded virtual stack behind a frame boundary
//! - `socket`: the socket interface callers use
//! - `service`: the control loop on the service thread
//! - `node`: the engine context tying it together
//!
//! # Example
//!
//! ```no_run
//! use vnet_core::{Family, NetworkId, Node, NodeConfig};
//!
//! # fn example() -> vnet_core::Result<()> {
//! let node = Node::start(NodeConfig::new("/var/lib/vnet"), None)?;
//! node.join(NetworkId(0x8056c2e21c000001))?;
//! if let Some(addr) = node.address(NetworkId(0x8056c2e21c000001), Family::Ipv6) {
//!     println!("assigned {addr}");
//! }
//! node.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod network;
pub mod node;
pub mod peer;
pub mod proto;
pub mod reassembly;
pub mod socket;
pub mod stack;
pub mod storage;
pub mod transport;

mod service;

pub use config::{NetworkSettings, NodeConfig};
pub use error::{Error, ErrorCode, Result, ServiceFault};
pub use event::{Event, EventObserver};
pub use identity::{Identity, NodeId};
pub use network::{rfc4193_addr, sixplane_addr, Family, MembershipStatus, NetworkId};
pub use node::Node;
pub use peer::{PeerInfo, Reachability};
pub use socket::{Handle, MsgFlags, SocketLayer, SocketType};
