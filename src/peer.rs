//! # Peer Lifecycle
//!
//! Construction and teardown of peers. Two modes exist:
//!
//! - A **master** owns the transport: the channel server bound to the
//!   configured TCP and UDP ports, the client-side sender, the dispatcher,
//!   the outbound reservation pool, and the NAT helper. These live in one
//!   ref-counted [`ConnectionBundle`].
//! - A **slave** is a logical peer with its own id (and optionally its own
//!   key pair) that attaches to a master and shares its bundle. Its address
//!   is the master's with the id swapped.
//!
//! ## Shutdown
//!
//! `shutdown` is idempotent and strictly ordered. Every peer first leaves
//! the dispatcher and stops its own maintenance tasks, then detaches the
//! slaves attached below it and completes their futures. A slave is done at
//! that point. A master additionally stops
//! the shared maintenance timer, cancels every outstanding request while
//! draining the reservation pool, closes the channel server (which drains
//! workers and then the accept tasks, releasing the bound ports), and
//! finally releases NAT port mappings from a blocking context. Slaves never
//! touch the shared bundle; the master is its sole releaser.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::crypto::KeyPair;
use crate::dispatcher::Dispatcher;
use crate::identity::{Id160, LocalAddress, PeerAddress};
use crate::messages::{Command, Message, MessageType};
use crate::protocols::{NatPortMapper, NoopPortMapper};
use crate::transport::{ChannelServer, ChannelServerConfig, PendingRequests, Reservation, Sender};

// ============================================================================
// ConnectionBundle
// ============================================================================

/// The shared I/O resources of a master peer.
///
/// Slaves hold the same `Arc` but never shut any of it down; the bundle's
/// lifetime is tied to the master.
pub struct ConnectionBundle {
    p2p_id: u32,
    dispatcher: Arc<Dispatcher>,
    sender: Arc<Sender>,
    server: ChannelServer,
    reservation: Reservation,
    pending: Arc<PendingRequests>,
    nat: Arc<dyn NatPortMapper>,
    /// Shared maintenance tasks (the "timer"); aborted on master shutdown.
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionBundle {
    pub fn p2p_id(&self) -> u32 {
        self.p2p_id
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    pub fn server(&self) -> &ChannelServer {
        &self.server
    }

    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    pub fn nat(&self) -> &Arc<dyn NatPortMapper> {
        &self.nat
    }

    pub(crate) fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Track a shared maintenance task for abortion at master shutdown.
    pub fn register_maintenance(&self, task: JoinHandle<()>) {
        self.maintenance
            .lock()
            .expect("bundle lock poisoned")
            .push(task);
    }
}

// ============================================================================
// PeerBuilder
// ============================================================================

/// Builder for a master peer.
pub struct PeerBuilder {
    p2p_id: u32,
    peer_id: Option<Id160>,
    key_pair: Option<KeyPair>,
    config: ChannelServerConfig,
    nat: Option<Arc<dyn NatPortMapper>>,
}

impl PeerBuilder {
    pub fn new(p2p_id: u32) -> Self {
        PeerBuilder {
            p2p_id,
            peer_id: None,
            key_pair: None,
            config: ChannelServerConfig::default(),
            nat: None,
        }
    }

    pub fn peer_id(mut self, id: Id160) -> Self {
        self.peer_id = Some(id);
        self
    }

    /// Attach a key pair. Unless an explicit id was set, the peer id becomes
    /// the key digest.
    pub fn key_pair(mut self, key_pair: KeyPair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    pub fn ports(mut self, tcp_port: u16, udp_port: u16) -> Self {
        self.config.tcp_port = tcp_port;
        self.config.udp_port = udp_port;
        self
    }

    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.config.bind_ip = ip;
        self
    }

    pub fn external_address(mut self, ip: IpAddr) -> Self {
        self.config.external_address = Some(ip);
        self
    }

    pub fn external_ports(mut self, tcp_port: u16, udp_port: u16) -> Self {
        self.config.external_tcp_port = Some(tcp_port);
        self.config.external_udp_port = Some(udp_port);
        self
    }

    pub fn behind_firewall(mut self, behind_firewall: bool) -> Self {
        self.config.behind_firewall = behind_firewall;
        self
    }

    pub fn heartbeat(mut self, heartbeat: Duration) -> Self {
        self.config.heartbeat = heartbeat;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_outbound(mut self, max_outbound: usize) -> Self {
        self.config.max_outbound = max_outbound;
        self
    }

    pub fn nat_port_mapper(mut self, nat: Arc<dyn NatPortMapper>) -> Self {
        self.nat = Some(nat);
        self
    }

    /// Replace the whole transport configuration.
    pub fn config(mut self, config: ChannelServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the master: bind the transport, discover the externally visible
    /// address, and assemble the shared bundle. Fails when the ports cannot
    /// be bound or no usable address can be found.
    pub async fn start(self) -> Result<Peer> {
        let peer_id = self
            .peer_id
            .or_else(|| self.key_pair.as_ref().map(KeyPair::peer_id))
            .unwrap_or_else(Id160::random);

        let local = LocalAddress::new(PeerAddress::with_id_only(peer_id));
        let dispatcher = Arc::new(Dispatcher::new(
            self.p2p_id,
            self.config.heartbeat,
            local.clone(),
        ));
        let reservation = Reservation::new(self.config.max_outbound);
        let pending = Arc::new(PendingRequests::new());

        let server = ChannelServer::bind(&self.config, dispatcher.clone(), pending.clone())
            .await
            .context("failed to start channel server")?;

        let external_ip = discover_external_address(&self.config)
            .context("not listening to anything, maybe the binding information is wrong")?;
        let external_tcp = self
            .config
            .external_tcp_port
            .unwrap_or_else(|| server.local_tcp_addr().port());
        let external_udp = self
            .config
            .external_udp_port
            .unwrap_or_else(|| server.local_udp_addr().port());

        let address = PeerAddress::new(peer_id, external_ip, external_tcp, external_udp)
            .with_firewalled_tcp(self.config.behind_firewall)
            .with_firewalled_udp(self.config.behind_firewall);
        local.set(address.clone());
        info!(%address, "visible address to other peers");

        let sender = Arc::new(
            Sender::bind(
                self.config.bind_ip,
                pending.clone(),
                reservation.clone(),
                self.config.request_timeout,
                self.config.connect_timeout,
            )
            .await
            .context("failed to bind client socket")?,
        );

        let nat: Arc<dyn NatPortMapper> = self.nat.unwrap_or_else(|| Arc::new(NoopPortMapper));
        let bundle = Arc::new(ConnectionBundle {
            p2p_id: self.p2p_id,
            dispatcher,
            sender,
            server,
            reservation,
            pending,
            nat,
            maintenance: Mutex::new(Vec::new()),
        });

        Ok(Peer {
            inner: Arc::new(PeerInner {
                id: peer_id,
                key_pair: self.key_pair,
                address: local,
                bundle,
                master: true,
                children: Mutex::new(Vec::new()),
                peer_maintenance: Mutex::new(Vec::new()),
                shutdown_started: AtomicBool::new(false),
                done: watch::channel(false).0,
            }),
        })
    }
}

/// Find the address other peers should reach us at.
///
/// Explicit configuration wins; a concrete bind address is trusted next;
/// otherwise a probe socket toward public resolvers reveals the preferred
/// outbound interface without sending a packet. Loopback is the configurable
/// last resort for offline machines.
fn discover_external_address(config: &ChannelServerConfig) -> Option<IpAddr> {
    if let Some(ip) = config.external_address {
        return Some(ip);
    }
    if !config.bind_ip.is_unspecified() {
        return Some(config.bind_ip);
    }

    const PROBE_TARGETS: [&str; 3] = ["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"];
    for target in PROBE_TARGETS {
        if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
            if socket.connect(target).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    let ip = local.ip();
                    if !ip.is_loopback() && !ip.is_unspecified() {
                        return Some(ip);
                    }
                }
            }
        }
    }

    if config.allow_loopback {
        return Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    None
}

// ============================================================================
// Peer
// ============================================================================

struct PeerInner {
    id: Id160,
    key_pair: Option<KeyPair>,
    address: LocalAddress,
    bundle: Arc<ConnectionBundle>,
    master: bool,
    children: Mutex<Vec<Peer>>,
    peer_maintenance: Mutex<Vec<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
    done: watch::Sender<bool>,
}

/// A running peer, master or slave. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    pub fn builder(p2p_id: u32) -> PeerBuilder {
        PeerBuilder::new(p2p_id)
    }

    /// Attach a slave peer to `parent`, sharing its transport. The slave
    /// publishes the parent's address with its own id and registers itself
    /// in the parent's child list.
    pub fn new_slave(parent: &Peer, id: Id160, key_pair: Option<KeyPair>) -> Peer {
        let address = LocalAddress::new(parent.address().with_id(id));
        let peer = Peer {
            inner: Arc::new(PeerInner {
                id,
                key_pair,
                address,
                bundle: parent.inner.bundle.clone(),
                master: false,
                children: Mutex::new(Vec::new()),
                peer_maintenance: Mutex::new(Vec::new()),
                shutdown_started: AtomicBool::new(false),
                done: watch::channel(false).0,
            }),
        };
        parent
            .inner
            .children
            .lock()
            .expect("peer lock poisoned")
            .push(peer.clone());
        debug!(slave = ?id, master = ?parent.id(), "slave peer attached");
        peer
    }

    pub fn id(&self) -> Id160 {
        self.inner.id
    }

    pub fn is_master(&self) -> bool {
        self.inner.master
    }

    pub fn p2p_id(&self) -> u32 {
        self.inner.bundle.p2p_id
    }

    /// The currently published address.
    pub fn address(&self) -> PeerAddress {
        self.inner.address.get()
    }

    /// The swappable address cell, shared with the relay manager.
    pub fn local_address(&self) -> LocalAddress {
        self.inner.address.clone()
    }

    pub fn key_pair(&self) -> Option<&KeyPair> {
        self.inner.key_pair.as_ref()
    }

    pub fn bundle(&self) -> &Arc<ConnectionBundle> {
        &self.inner.bundle
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.inner.bundle.dispatcher()
    }

    pub fn sender(&self) -> &Arc<Sender> {
        self.inner.bundle.sender()
    }

    pub fn reservation(&self) -> &Reservation {
        self.inner.bundle.reservation()
    }

    /// A request message from this peer on its overlay.
    pub fn create_request(
        &self,
        command: Command,
        message_type: MessageType,
        recipient: PeerAddress,
    ) -> Message {
        Message::request(self.p2p_id(), command, message_type, self.address(), recipient)
    }

    /// Track a task belonging to this peer alone; aborted when the peer
    /// shuts down.
    pub fn register_maintenance(&self, task: JoinHandle<()>) {
        self.inner
            .peer_maintenance
            .lock()
            .expect("peer lock poisoned")
            .push(task);
    }

    /// Resolves once [`shutdown`](Self::shutdown) has completed.
    pub async fn shutdown_complete(&self) {
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Deregister this peer's handlers and stop its own tasks. The sync part
    /// of shutdown, shared by the slave-subtree walk.
    fn detach(&self) -> bool {
        if self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.bundle.dispatcher.remove(self.inner.id);
        for task in self
            .inner
            .peer_maintenance
            .lock()
            .expect("peer lock poisoned")
            .drain(..)
        {
            task.abort();
        }
        true
    }

    /// Detach every slave attached below this peer and fire their
    /// completion futures. Already stopped slaves drained their own child
    /// lists, so the walk skips them.
    fn detach_subtree(&self) {
        let mut queue: Vec<Peer> = {
            let mut children = self.inner.children.lock().expect("peer lock poisoned");
            children.drain(..).collect()
        };
        while let Some(child) = queue.pop() {
            if child.detach() {
                queue.extend(
                    child
                        .inner
                        .children
                        .lock()
                        .expect("peer lock poisoned")
                        .drain(..),
                );
                child.inner.done.send_replace(true);
            }
        }
    }

    /// Shut the peer down. Idempotent; concurrent callers await the first
    /// invocation's completion.
    pub async fn shutdown(&self) {
        if !self.detach() {
            self.shutdown_complete().await;
            return;
        }

        if !self.inner.master {
            self.detach_subtree();
            self.inner.done.send_replace(true);
            return;
        }

        debug!("master shutdown in progress");
        // slaves go first so their handlers leave the dispatcher before the
        // transport is torn down, and their completion futures resolve
        self.detach_subtree();
        let bundle = &self.inner.bundle;

        // stop the shared maintenance timer
        for task in bundle
            .maintenance
            .lock()
            .expect("bundle lock poisoned")
            .drain(..)
        {
            task.abort();
        }

        // drain the reservation pool and cancel every outstanding request
        bundle.pending.fail_all();
        bundle.reservation.close();
        bundle.sender.close();

        // server first, then workers, then the accept tasks
        bundle.server.shutdown().await;

        // the port-mapping release blocks, keep it off the runtime
        let nat = bundle.nat.clone();
        let _ = tokio::task::spawn_blocking(move || nat.shutdown()).await;

        debug!("master shutdown complete");
        self.inner.done.send_replace(true);
    }
}
