//! Collaborator trait definitions for the peer core.
//!
//! The core deliberately does not implement routing, storage policy, or NAT
//! probing; it consumes them through the traits defined here. Keeping the
//! traits separate from both the core and any implementation lets the relay
//! manager be tested against scripted collaborators and lets embedders plug
//! in their own.
//!
//! | Concern | Trait | Consumed by |
//! |---------|-------|-------------|
//! | Neighbor candidates | [`Routing`] | relay candidate selection |
//! | Port mapping | [`NatPortMapper`] | peer construction and shutdown |

use std::sync::Mutex;

use crate::identity::PeerAddress;

/// Read access to the routing layer's current peer map.
pub trait Routing: Send + Sync {
    /// The peers currently known to the routing table, best first.
    fn neighbors(&self) -> Vec<PeerAddress>;
}

/// A fixed, externally maintained peer list.
///
/// This is what a binary wires in when the real routing table lives outside
/// the core, and what tests use to script candidate pools.
pub struct StaticRouting {
    peers: Mutex<Vec<PeerAddress>>,
}

impl StaticRouting {
    pub fn new(peers: Vec<PeerAddress>) -> Self {
        StaticRouting { peers: Mutex::new(peers) }
    }

    pub fn add(&self, peer: PeerAddress) {
        self.peers.lock().expect("routing lock poisoned").push(peer);
    }
}

impl Routing for StaticRouting {
    fn neighbors(&self) -> Vec<PeerAddress> {
        self.peers.lock().expect("routing lock poisoned").clone()
    }
}

/// NAT gateway port-mapping helper.
///
/// `shutdown` is allowed to block (it typically releases mappings over the
/// network); the master peer calls it from a blocking context as the final
/// shutdown step.
pub trait NatPortMapper: Send + Sync {
    /// Try to map the bound ports to the externally visible ones. Returns
    /// true when a mapping was established.
    fn map_ports(
        &self,
        internal_tcp: u16,
        internal_udp: u16,
        external_tcp: u16,
        external_udp: u16,
    ) -> bool;

    /// Release any mappings. May block.
    fn shutdown(&self);
}

/// Port mapper for peers that do not probe their gateway.
pub struct NoopPortMapper;

impl NatPortMapper for NoopPortMapper {
    fn map_ports(&self, _: u16, _: u16, _: u16, _: u16) -> bool {
        false
    }

    fn shutdown(&self) {}
}
