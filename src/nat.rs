//! # NAT-Capable Peer Assembly
//!
//! [`NatPeerBuilder`] wires the relay subsystem onto an existing peer: it
//! registers the relay handler, starts the [`DistributedRelay`] control
//! loop, optionally asks the NAT helper for a port mapping, and installs the
//! maintenance tick that refills lost relay capacity. The result is a
//! [`PeerNat`] handle over the running subsystem.
//!
//! Fire [`PeerNat::setup_relays`] after bootstrapping, once the routing
//! layer holds real candidates.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::peer::Peer;
use crate::protocols::Routing;
use crate::relay::{
    DefaultRelayCallback, DistributedRelay, RelayCallback, RelayClientConfig, RelayRpc,
};

/// How often lost relay capacity is re-checked by default.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

pub struct NatPeerBuilder {
    peer: Peer,
    routing: Arc<dyn Routing>,
    relay_config: RelayClientConfig,
    callback: Arc<dyn RelayCallback>,
    manual_ports: bool,
    maintenance_interval: Duration,
}

impl NatPeerBuilder {
    pub fn new(peer: &Peer, routing: Arc<dyn Routing>) -> Self {
        NatPeerBuilder {
            peer: peer.clone(),
            routing,
            relay_config: RelayClientConfig::default(),
            callback: Arc::new(DefaultRelayCallback),
            manual_ports: false,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }

    pub fn relay_config(mut self, config: RelayClientConfig) -> Self {
        self.relay_config = config;
        self
    }

    pub fn relay_callback(mut self, callback: Arc<dyn RelayCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Skip gateway port mapping; the user has forwarded ports themselves.
    pub fn manual_ports(mut self) -> Self {
        self.manual_ports = true;
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Assemble and start the NAT subsystem.
    pub fn start(self) -> PeerNat {
        let relay_rpc = RelayRpc::new(&self.peer);

        if !self.manual_ports {
            let address = self.peer.address();
            let server = self.peer.bundle().server();
            let mapped = self.peer.bundle().nat().map_ports(
                server.local_tcp_addr().port(),
                server.local_udp_addr().port(),
                address.tcp_port(),
                address.udp_port(),
            );
            if mapped {
                info!("gateway port mapping established");
            } else {
                debug!("no gateway port mapping");
            }
        }

        let relay = DistributedRelay::new(
            &self.peer,
            relay_rpc.clone(),
            self.routing,
            self.callback,
            self.relay_config,
        );

        // periodic refill so lost capacity recovers even without close events
        let tick = {
            let relay = relay.clone();
            let period = self.maintenance_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // the immediate first tick
                loop {
                    interval.tick().await;
                    relay.setup_relays();
                }
            })
        };
        self.peer.register_maintenance(tick);

        PeerNat { relay, relay_rpc }
    }
}

/// The running NAT subsystem of one peer.
pub struct PeerNat {
    relay: DistributedRelay,
    relay_rpc: Arc<RelayRpc>,
}

impl PeerNat {
    pub fn distributed_relay(&self) -> &DistributedRelay {
        &self.relay
    }

    pub fn relay_rpc(&self) -> &Arc<RelayRpc> {
        &self.relay_rpc
    }

    /// Start filling relay slots.
    pub fn setup_relays(&self) {
        self.relay.setup_relays();
    }

    /// Close all relay connections and wait for the manager to go idle.
    pub async fn shutdown(&self) {
        self.relay.shutdown().await;
    }
}
