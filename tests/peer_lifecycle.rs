//! Integration tests for master/slave peer lifecycle.
//!
//! These cover construction, request/reply over both transports, slave
//! independence, and the ordered master shutdown.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test peer_lifecycle -- --nocapture

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Once;
use std::time::Duration;

use lattica::{
    Id160, MessageType, Peer, PeerBuilder, PingRpc, RequestError,
};

static INIT: Once = Once::new();

/// Initialize tracing for tests. Use RUST_LOG=debug for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const OVERLAY: u32 = 42;

/// A loopback master on ephemeral ports.
async fn master() -> Peer {
    init_tracing();
    PeerBuilder::new(OVERLAY)
        .bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .ports(0, 0)
        .start()
        .await
        .expect("master start")
}

#[tokio::test]
async fn master_publishes_concrete_address() {
    let peer = master().await;

    let address = peer.address();
    assert!(peer.is_master());
    assert_eq!(address.id(), peer.id());
    assert_eq!(address.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_ne!(address.tcp_port(), 0);
    assert_ne!(address.udp_port(), 0);
    assert!(!address.flags().firewalled_tcp);
    assert!(!address.flags().relayed);

    peer.shutdown().await;
}

#[tokio::test]
async fn ping_round_trips_over_both_transports() {
    let alice = master().await;
    let bob = master().await;
    let alice_ping = PingRpc::new(&alice);
    let _bob_ping = PingRpc::new(&bob);

    let reply = alice_ping.ping_udp(&bob.address()).await.expect("udp ping");
    assert_eq!(reply.message_type(), MessageType::Ok);
    assert_eq!(reply.sender().id(), bob.id());

    let reply = alice_ping.ping_tcp(&bob.address()).await.expect("tcp ping");
    assert_eq!(reply.message_type(), MessageType::Ok);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn slave_derives_address_and_answers() {
    let parent = master().await;
    let slave_id = Id160::random();
    let slave = Peer::new_slave(&parent, slave_id, None);
    let _slave_ping = PingRpc::new(&slave);

    assert!(!slave.is_master());
    assert_eq!(slave.address(), parent.address().with_id(slave_id));

    // reach the slave through the shared transport
    let other = master().await;
    let other_ping = PingRpc::new(&other);
    let reply = other_ping.ping_udp(&slave.address()).await.expect("ping slave");
    assert_eq!(reply.message_type(), MessageType::Ok);
    assert_eq!(reply.sender().id(), slave_id);

    other.shutdown().await;
    parent.shutdown().await;
}

#[tokio::test]
async fn slave_shutdown_leaves_master_and_sibling_running() {
    let parent = master().await;
    let first = Peer::new_slave(&parent, Id160::random(), None);
    let second = Peer::new_slave(&parent, Id160::random(), None);
    let _parent_ping = PingRpc::new(&parent);
    let _first_ping = PingRpc::new(&first);
    let _second_ping = PingRpc::new(&second);

    first.shutdown().await;

    let other = master().await;
    let ping = PingRpc::new(&other);

    // the stopped slave is deregistered, the transport answers unknown-peer
    let reply = ping.ping_udp(&first.address()).await.expect("reply");
    assert_eq!(reply.message_type(), MessageType::UnknownPeer);

    // sibling and master keep dispatching
    let reply = ping.ping_udp(&second.address()).await.expect("sibling reply");
    assert_eq!(reply.message_type(), MessageType::Ok);
    let reply = ping.ping_udp(&parent.address()).await.expect("master reply");
    assert_eq!(reply.message_type(), MessageType::Ok);

    other.shutdown().await;
    parent.shutdown().await;
}

#[tokio::test]
async fn nested_slaves_shut_down_recursively() {
    let parent = master().await;
    let child = Peer::new_slave(&parent, Id160::random(), None);
    let grandchild = Peer::new_slave(&child, Id160::random(), None);
    let _child_ping = PingRpc::new(&child);
    let _grandchild_ping = PingRpc::new(&grandchild);

    assert!(parent.dispatcher().has_handlers(child.id()));
    assert!(parent.dispatcher().has_handlers(grandchild.id()));

    child.shutdown().await;
    grandchild.shutdown_complete().await;
    assert!(!parent.dispatcher().has_handlers(child.id()));
    assert!(!parent.dispatcher().has_handlers(grandchild.id()));

    parent.shutdown().await;
}

#[tokio::test]
async fn master_shutdown_detaches_attached_slaves() {
    let parent = master().await;
    let slave = Peer::new_slave(&parent, Id160::random(), None);
    let grandchild = Peer::new_slave(&slave, Id160::random(), None);
    let _slave_ping = PingRpc::new(&slave);
    let _grandchild_ping = PingRpc::new(&grandchild);

    parent.shutdown().await;

    // still-attached slaves are deregistered and their futures resolve
    assert!(!parent.dispatcher().has_handlers(slave.id()));
    assert!(!parent.dispatcher().has_handlers(grandchild.id()));
    tokio::time::timeout(Duration::from_secs(1), slave.shutdown_complete())
        .await
        .expect("slave completion");
    tokio::time::timeout(Duration::from_secs(1), grandchild.shutdown_complete())
        .await
        .expect("grandchild completion");
}

#[tokio::test]
async fn master_shutdown_cancels_inflight_and_releases_ports() {
    let peer = PeerBuilder::new(OVERLAY)
        .bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .ports(0, 0)
        .request_timeout(Duration::from_secs(30))
        .start()
        .await
        .expect("master start");
    init_tracing();
    let ping = PingRpc::new(&peer);

    // a request nobody will ever answer
    let blackhole =
        lattica::PeerAddress::new(Id160::random(), IpAddr::V4(Ipv4Addr::LOCALHOST), 9, 9);
    let inflight = {
        let ping = ping.clone();
        tokio::spawn(async move { ping.ping_udp(&blackhole).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let tcp_port = peer.address().tcp_port();
    let udp_port = peer.address().udp_port();

    peer.shutdown().await;

    // outstanding request futures fail with the cancelled reason
    let result = inflight.await.expect("task");
    assert!(
        matches!(result, Err(RequestError::Cancelled)),
        "expected cancellation, got {result:?}"
    );

    // dispatcher entries are gone
    assert!(!peer.dispatcher().has_handlers(peer.id()));

    // the bound ports are free again
    let addr = std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), tcp_port);
    tokio::net::TcpListener::bind(addr).await.expect("tcp port released");
    let addr = std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), udp_port);
    tokio::net::UdpSocket::bind(addr).await.expect("udp port released");
}

#[tokio::test]
async fn shutdown_is_idempotent_and_completes_once() {
    let peer = master().await;

    // concurrent callers all observe the single completion
    let clone = peer.clone();
    let concurrent = tokio::spawn(async move { clone.shutdown().await });
    peer.shutdown().await;
    concurrent.await.expect("concurrent shutdown");

    // repeated calls return immediately
    tokio::time::timeout(Duration::from_secs(1), peer.shutdown())
        .await
        .expect("repeat shutdown must not hang");
    peer.shutdown_complete().await;
}

#[tokio::test]
async fn new_requests_after_shutdown_fail_cancelled() {
    let alice = master().await;
    let bob = master().await;
    let ping = PingRpc::new(&alice);
    let _bob_ping = PingRpc::new(&bob);

    alice.shutdown().await;

    let result = ping.ping_udp(&bob.address()).await;
    assert!(matches!(result, Err(RequestError::Cancelled)));
    let result = ping.ping_tcp(&bob.address()).await;
    assert!(matches!(result, Err(RequestError::Cancelled)));

    bob.shutdown().await;
}
