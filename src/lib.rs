//! # Lattica - Overlay Node Core
//!
//! Lattica is the transport and control core of a Kademlia-style overlay
//! node:
//!
//! - **Wire codec**: a bit-exact binary format with a fixed 64-byte header,
//!   four typed payload slots, and optional DSA-SHA1 message signatures
//! - **Peer core**: master peers owning TCP+UDP transport shared by slave
//!   peers, with a command dispatcher and per-request reply futures
//! - **Relay management**: unreachable peers rent connectivity from public
//!   peers and advertise the relay endpoints in their own address
//!
//! Routing tables, storage policy, and NAT probing are collaborators behind
//! traits; the core ships a fixed-list routing and an in-memory tracker
//! store for embedding and tests.
//!
//! ## Architecture
//!
//! Components with mutable shared state use the actor pattern: a public
//! handle that is cheap to clone, and a private task owning the control
//! flow. Request futures cancel on drop, and shutdown is a straight-line
//! ordered sequence with a completion future that fires exactly once.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | 160-bit ids, peer addresses, NAT flags, relay endpoints |
//! | `messages` | the message envelope, commands, types, payload slots |
//! | `codec` | wire encoding and decoding, signing and verification |
//! | `crypto` | DSA-SHA1 primitives and key pairs |
//! | `dispatcher` | per-peer, per-command routing of inbound requests |
//! | `transport` | channel server, sender, reservations, peer connections |
//! | `peer` | master and slave lifecycle, the shared connection bundle |
//! | `relay` | relay setup RPC and the distributed relay control loop |
//! | `rpc` | the ping probe |
//! | `tracker` | tracker announce and query RPC plus the storage seam |
//! | `nat` | assembly of a NAT-capable peer |
//! | `protocols` | collaborator traits (routing, port mapping) |

pub mod codec;
pub mod crypto;
pub mod dispatcher;
pub mod identity;
pub mod messages;
pub mod nat;
pub mod peer;
pub mod protocols;
pub mod relay;
pub mod rpc;
pub mod tracker;
pub mod transport;

pub use crypto::KeyPair;
pub use identity::{Id160, PeerAddress, PeerSocketAddress, MAX_RELAYS};
pub use messages::{Command, Content, Data, DataKey, Message, MessageType};
pub use nat::{NatPeerBuilder, PeerNat};
pub use peer::{ConnectionBundle, Peer, PeerBuilder};
pub use protocols::{NatPortMapper, NoopPortMapper, Routing, StaticRouting};
pub use relay::{
    DistributedRelay, RelayCallback, RelayClientConfig, RelayRpc, RelaySetup, RelayType,
};
pub use rpc::PingRpc;
pub use tracker::{MemoryTrackerStorage, TrackerRpc, TrackerStorage};
pub use transport::{ChannelServerConfig, PeerConnection, RequestError};
