use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use lattica::{
    Id160, KeyPair, MemoryTrackerStorage, NatPeerBuilder, PeerAddress, PeerBuilder, PingRpc,
    RelayClientConfig, StaticRouting, TrackerRpc,
};

/// A known peer given as ID@IP:PORT (one port serving both TCP and UDP).
#[derive(Clone, Debug)]
struct KnownPeer {
    id: Id160,
    addr: SocketAddr,
}

impl KnownPeer {
    fn peer_address(&self) -> PeerAddress {
        PeerAddress::new(self.id, self.addr.ip(), self.addr.port(), self.addr.port())
    }
}

impl FromStr for KnownPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id_part, addr_part) = s
            .split_once('@')
            .context("known peer must be given as ID@IP:PORT")?;
        let id = Id160::from_hex(id_part).context("peer id must be 40 hex characters")?;
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        Ok(KnownPeer { id, addr })
    }
}

#[derive(Parser, Debug)]
#[command(name = "lattica")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short = 't', long, default_value = "7700")]
    tcp_port: u16,

    #[arg(short = 'u', long, default_value = "7700")]
    udp_port: u16,

    /// Overlay network identifier; peers only talk within one overlay.
    #[arg(short = 'n', long, default_value = "1")]
    p2p_id: u32,

    /// Mark this peer as unable to accept inbound connections and rent
    /// relay connectivity from known peers.
    #[arg(long)]
    behind_nat: bool,

    /// Known peers, used as relay candidates when behind NAT.
    #[arg(short = 'p', long = "peer", value_name = "PEER")]
    peers: Vec<KnownPeer>,

    #[arg(long, default_value = "5")]
    max_relays: usize,

    #[arg(long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("generating DSA key pair");
    let key_pair = KeyPair::generate().context("key generation failed")?;

    let peer = PeerBuilder::new(args.p2p_id)
        .key_pair(key_pair)
        .bind_ip(args.bind)
        .ports(args.tcp_port, args.udp_port)
        .behind_firewall(args.behind_nat)
        .start()
        .await?;
    info!("peer id: {}", peer.id());

    let _ping = PingRpc::new(&peer);
    let _tracker = TrackerRpc::new(&peer, Arc::new(MemoryTrackerStorage::default()));

    let routing = Arc::new(StaticRouting::new(
        args.peers.iter().map(KnownPeer::peer_address).collect(),
    ));

    let nat = if args.behind_nat {
        if args.peers.is_empty() {
            warn!("behind NAT but no known peers given, relays cannot be set up");
        }
        let nat = NatPeerBuilder::new(&peer, routing)
            .relay_config(RelayClientConfig::open_tcp().max_relays(args.max_relays))
            .start();
        nat.setup_relays();
        Some(nat)
    } else {
        None
    };

    let mut interval = time::interval(Duration::from_secs(args.status_interval));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let address = peer.address();
                info!(
                    %address,
                    relays = nat.as_ref().map(|n| n.distributed_relay().active_relays().len()).unwrap_or(0),
                    "status"
                );
            }
        }
    }

    if let Some(nat) = &nat {
        nat.shutdown().await;
    }
    peer.shutdown().await;
    Ok(())
}
