//! Integration tests for the tracker RPC over live peers.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test tracker_api -- --nocapture

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Once};

use lattica::{
    Data, DataKey, Id160, KeyPair, MemoryTrackerStorage, MessageType, Peer, PeerAddress,
    PeerBuilder, TrackerRpc,
};

static INIT: Once = Once::new();

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

const OVERLAY: u32 = 44;

async fn master() -> Peer {
    init_tracing();
    PeerBuilder::new(OVERLAY)
        .bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .ports(0, 0)
        .start()
        .await
        .expect("master start")
}

/// A tracker-serving master with a bounded store.
async fn tracker_master(max_size: usize) -> (Peer, Arc<TrackerRpc>) {
    let peer = master().await;
    let rpc = TrackerRpc::new(&peer, Arc::new(MemoryTrackerStorage::new(max_size)));
    (peer, rpc)
}

#[tokio::test]
async fn signed_announce_and_query() {
    let (server, _server_rpc) = tracker_master(8).await;

    let key_pair = KeyPair::generate().expect("key generation");
    let client = PeerBuilder::new(OVERLAY)
        .bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .ports(0, 0)
        .key_pair(key_pair.clone())
        .start()
        .await
        .expect("client start");
    let client_rpc = TrackerRpc::new(&client, Arc::new(MemoryTrackerStorage::default()));

    let location = Id160::random();
    let domain = Id160::random();

    // signed announcement with an attachment travels over TCP
    let reply = client_rpc
        .add_to_tracker(
            &server.address(),
            location,
            domain,
            Some(Data::new(b"swarm metadata".to_vec()).with_ttl(600)),
            true,
        )
        .await
        .expect("announce");
    assert_eq!(reply.message_type(), MessageType::Ok);
    // the reply carries the state before our announcement
    assert!(reply.peer_data_map().expect("map slot").is_empty());

    let reply = client_rpc
        .get_from_tracker(&server.address(), location, domain, true, false)
        .await
        .expect("query");
    assert_eq!(reply.message_type(), MessageType::Ok);
    let map = reply.peer_data_map().expect("map slot");
    let (entry_peer, data) = map
        .iter()
        .find(|(peer, _)| peer.id() == client.id())
        .expect("our announcement");
    assert_eq!(entry_peer.udp_port(), client.address().udp_port());
    assert_eq!(data.value(), b"swarm metadata");
    assert_eq!(data.ttl_seconds(), 600);
    // the verified message key was stored with the entry
    assert_eq!(
        data.public_key(),
        Some(&DataKey::Supplied(key_pair.public_key_der().to_vec()))
    );

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn query_miss_is_not_found() {
    let (server, _server_rpc) = tracker_master(8).await;
    let (client, client_rpc) = tracker_master(8).await;

    let reply = client_rpc
        .get_from_tracker(&server.address(), Id160::random(), Id160::random(), false, false)
        .await
        .expect("query");
    assert_eq!(reply.message_type(), MessageType::NotFound);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn full_tracker_denies_new_peers() {
    let (server, _server_rpc) = tracker_master(1).await;
    let (first, first_rpc) = tracker_master(1).await;
    let (second, second_rpc) = tracker_master(1).await;

    let location = Id160::random();
    let domain = Id160::random();

    let reply = first_rpc
        .add_to_tracker(&server.address(), location, domain, None, false)
        .await
        .expect("first announce");
    assert_eq!(reply.message_type(), MessageType::Ok);

    let reply = second_rpc
        .add_to_tracker(&server.address(), location, domain, None, false)
        .await
        .expect("second announce");
    assert_eq!(reply.message_type(), MessageType::Denied);

    // re-announcing an already tracked peer is still accepted
    let reply = first_rpc
        .add_to_tracker(&server.address(), location, domain, None, false)
        .await
        .expect("re-announce");
    assert_eq!(reply.message_type(), MessageType::Ok);

    first.shutdown().await;
    second.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn replication_inserts_foreign_entry() {
    let (server, server_rpc) = tracker_master(8).await;
    let (client, client_rpc) = tracker_master(8).await;

    let location = Id160::random();
    let domain = Id160::random();
    let tracked = PeerAddress::new(Id160::random(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)), 70, 71);

    let reply = client_rpc
        .add_to_tracker_replication(
            &server.address(),
            location,
            domain,
            tracked.clone(),
            Data::new(b"replicated".to_vec()),
            false,
        )
        .await
        .expect("replication");
    assert_eq!(reply.message_type(), MessageType::Ok);

    // the entry is visible on the server under the replicated peer, not the sender
    let stored = server_rpc.storage().get(location, domain).expect("stored map");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored.get(&tracked).expect("entry").value(), b"replicated");

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn malformed_tracker_request_gets_exception() {
    let (server, _server_rpc) = tracker_master(8).await;
    let client = master().await;

    // a tracker request without its key pair fails the handler's check
    let message = client.create_request(
        lattica::Command::TrackerGet,
        MessageType::Request1,
        server.address(),
    );
    let reply = client.sender().send_udp(&message).await.expect("reply");
    assert_eq!(reply.message_type(), MessageType::Exception);

    client.shutdown().await;
    server.shutdown().await;
}
