//! # Distributed Relay Management
//!
//! NAT traversal by renting connectivity: a peer that cannot accept inbound
//! connections keeps up to `max_relays` outbound TCP connections open to
//! public peers and advertises those peers' endpoints inside its own
//! published address.
//!
//! # Architecture
//!
//! ## Wire level
//! - [`RelayRpc`]: both sides of the setup handshake. As a client it opens a
//!   persistent connection to a candidate and asks it to relay; as a
//!   dispatcher handler it answers those requests on public peers.
//!
//! ## Control level
//! - [`DistributedRelay`]: the public handle (cheap to clone, feeds events)
//! - a private actor task owning the control flow: it drains a bounded event
//!   channel of `{try fill, lost(peer)}` and is the only place relay slots
//!   are filled, so candidate setup never races with itself
//!
//! State lives beside the actor under mutexes shared with the handle, so
//! `shutdown` can observe and close connections without a channel round
//! trip. Failed candidates are remembered in a bounded, time-expiring set
//! and retried only after the configured wait.
//!
//! ## Address rewriting
//!
//! Every gain or loss of a relay republishes the local peer address: relay
//! endpoints capped at `max_relays`, firewalled flags cleared while any
//! relay is live, the relayed flag set, and the slow flag following the
//! relay type. Installing that address is the signal to the rest of the
//! peer to announce itself with relays.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::dispatcher::DispatchHandler;
use crate::identity::{LocalAddress, PeerAddress, PeerSocketAddress, MAX_RELAYS};
use crate::messages::{Command, Message, MessageType};
use crate::peer::Peer;
use crate::protocols::Routing;
use crate::transport::{read_message, PeerConnection, RequestError};

/// Bound on the failed-relay memory.
const FAILED_CACHE_SIZE: usize = 128;

/// Event channel depth; the actor drains fast, this only absorbs bursts.
const EVENT_QUEUE_SIZE: usize = 32;

pub const DEFAULT_FAILED_RELAY_WAIT: Duration = Duration::from_secs(60);
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(8);

// ============================================================================
// Configuration
// ============================================================================

/// The kind of relay connection a client rents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayType {
    /// A permanently open TCP connection; messages flow immediately.
    OpenTcp,
    /// A buffering relay for devices that sleep; senders must expect delays.
    Buffered,
}

impl RelayType {
    /// Default relay count for this type.
    pub fn max_relays(self) -> usize {
        match self {
            RelayType::OpenTcp => MAX_RELAYS,
            RelayType::Buffered => 2,
        }
    }

    /// Whether addresses relayed this way carry the slow flag.
    pub fn is_slow(self) -> bool {
        matches!(self, RelayType::Buffered)
    }

    pub(crate) fn code(self) -> i32 {
        match self {
            RelayType::OpenTcp => 0,
            RelayType::Buffered => 1,
        }
    }
}

/// Client-side relay settings.
#[derive(Clone, Debug)]
pub struct RelayClientConfig {
    pub relay_type: RelayType,
    /// Target number of live relay connections, capped at [`MAX_RELAYS`].
    pub max_relays: usize,
    /// How long a failed candidate is banned before a retry.
    pub failed_relay_wait: Duration,
    /// Window for the whole setup handshake with one candidate.
    pub setup_timeout: Duration,
    /// When non-empty these candidates are used verbatim; the caller owns
    /// the failure filter.
    pub manual_relays: Vec<PeerAddress>,
}

impl RelayClientConfig {
    pub fn open_tcp() -> Self {
        RelayClientConfig {
            relay_type: RelayType::OpenTcp,
            max_relays: RelayType::OpenTcp.max_relays(),
            failed_relay_wait: DEFAULT_FAILED_RELAY_WAIT,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            manual_relays: Vec::new(),
        }
    }

    pub fn max_relays(mut self, max_relays: usize) -> Self {
        self.max_relays = max_relays.min(MAX_RELAYS);
        self
    }

    pub fn failed_relay_wait(mut self, wait: Duration) -> Self {
        self.failed_relay_wait = wait;
        self
    }

    pub fn setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn manual_relays(mut self, relays: Vec<PeerAddress>) -> Self {
        self.manual_relays = relays;
        self
    }
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        RelayClientConfig::open_tcp()
    }
}

// ============================================================================
// Errors and Callbacks
// ============================================================================

/// Why a relay setup attempt failed. Setup failures are ordinary events; the
/// manager records the candidate and moves on.
#[derive(Debug)]
pub enum RelayError {
    /// The candidate refused to act as a relay.
    Denied,
    /// The candidate answered with something other than OK or DENIED.
    Unexpected(MessageType),
    /// The handshake never completed.
    Request(RequestError),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Denied => write!(f, "candidate denied relaying"),
            RelayError::Unexpected(t) => write!(f, "unexpected setup reply {t:?}"),
            RelayError::Request(e) => write!(f, "setup request failed: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

/// Wire-level relay setup, abstracted so the control loop can be driven by
/// scripted implementations in tests.
#[async_trait]
pub trait RelaySetup: Send + Sync {
    /// Perform the setup handshake with one candidate. Success yields the
    /// persistent connection whose close future feeds the control loop.
    async fn send_setup_message(
        &self,
        candidate: &PeerAddress,
        config: &RelayClientConfig,
    ) -> Result<PeerConnection, RelayError>;
}

/// Observer of relay slot changes.
pub trait RelayCallback: Send + Sync {
    fn on_relay_added(&self, _relay: &PeerAddress) {}
    fn on_relay_removed(&self, _relay: &PeerAddress) {}
}

/// Callback that ignores everything.
pub struct DefaultRelayCallback;

impl RelayCallback for DefaultRelayCallback {}

// ============================================================================
// RelayRpc
// ============================================================================

/// Both sides of the relay setup handshake.
pub struct RelayRpc {
    peer: Peer,
}

impl RelayRpc {
    /// Create the RPC and register its handler for this peer.
    pub fn new(peer: &Peer) -> Arc<RelayRpc> {
        let rpc = Arc::new(RelayRpc { peer: peer.clone() });
        peer.dispatcher()
            .register(peer.id(), &[Command::Relay], rpc.clone());
        rpc
    }

    fn io_error(e: std::io::Error) -> RelayError {
        RelayError::Request(RequestError::Io(e))
    }
}

#[async_trait]
impl RelaySetup for RelayRpc {
    async fn send_setup_message(
        &self,
        candidate: &PeerAddress,
        config: &RelayClientConfig,
    ) -> Result<PeerConnection, RelayError> {
        let permit = self
            .peer
            .reservation()
            .reserve()
            .await
            .map_err(RelayError::Request)?;

        let mut message =
            self.peer
                .create_request(Command::Relay, MessageType::Request1, candidate.clone());
        message.set_integer(config.relay_type.code());
        let bytes = codec::encode(&message)
            .map_err(|e| RelayError::Request(RequestError::Encode(e)))?;

        let target = candidate.tcp_socket();
        let mut stream = timeout(config.setup_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| RelayError::Request(RequestError::Timeout))?
            .map_err(Self::io_error)?;
        stream.write_all(&bytes).await.map_err(Self::io_error)?;

        let reply = timeout(config.setup_timeout, read_message(&mut stream, target))
            .await
            .map_err(|_| RelayError::Request(RequestError::Timeout))?
            .map_err(Self::io_error)?;

        match reply.message_type() {
            MessageType::Ok => {
                trace!(relay = %candidate, "relay setup accepted");
                let connection = PeerConnection::new(candidate.clone());
                spawn_relay_connection(stream, connection.clone(), permit, self.peer.clone());
                Ok(connection)
            }
            MessageType::Denied => Err(RelayError::Denied),
            other => Err(RelayError::Unexpected(other)),
        }
    }
}

#[async_trait]
impl DispatchHandler for RelayRpc {
    fn check_message(&self, message: &Message) -> bool {
        message.command() == Command::Relay && message.message_type() == MessageType::Request1
    }

    async fn handle(&self, message: Message) -> anyhow::Result<Message> {
        let me = self.peer.address();
        // a peer that is itself relayed or firewalled cannot serve others
        let reply = if me.flags().relayed || me.flags().firewalled_tcp {
            MessageType::Denied
        } else {
            MessageType::Ok
        };
        debug!(from = ?message.sender().id(), accepted = (reply == MessageType::Ok),
            "relay setup request");
        Ok(Message::response_to(&message, reply, me))
    }
}

/// Drive a persistent relay connection: answer requests arriving over it,
/// resolve replies, and fire the close future when either side ends it. The
/// reservation slot is held for the connection's lifetime.
fn spawn_relay_connection(
    mut stream: TcpStream,
    connection: PeerConnection,
    permit: tokio::sync::OwnedSemaphorePermit,
    peer: Peer,
) {
    let remote = connection.remote().tcp_socket();
    tokio::spawn(async move {
        let _permit = permit;
        loop {
            tokio::select! {
                _ = connection.closed() => break,
                read = read_message(&mut stream, remote) => {
                    let message = match read {
                        Ok(message) => message,
                        Err(e) => {
                            trace!("relay connection ended: {e}");
                            break;
                        }
                    };
                    if message.message_type().is_request() {
                        let Some(response) = peer.dispatcher().dispatch(message).await else {
                            continue;
                        };
                        match codec::encode(&response) {
                            Ok(bytes) => {
                                if stream.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("encoding relay reply failed: {e}"),
                        }
                    } else {
                        peer.bundle().pending().complete(message.id(), message);
                    }
                }
            }
        }
        connection.close();
    });
}

// ============================================================================
// Failure Memory
// ============================================================================

/// Bounded set whose entries expire after a fixed wait.
pub(crate) struct ExpiringSet {
    entries: LruCache<PeerAddress, Instant>,
    ttl: Duration,
}

impl ExpiringSet {
    pub(crate) fn new(ttl: Duration) -> Self {
        ExpiringSet {
            entries: LruCache::new(NonZeroUsize::new(FAILED_CACHE_SIZE).expect("nonzero")),
            ttl,
        }
    }

    pub(crate) fn insert(&mut self, peer: PeerAddress) {
        self.entries.put(peer, Instant::now());
    }

    pub(crate) fn contains(&mut self, peer: &PeerAddress) -> bool {
        match self.entries.get(peer) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                self.entries.pop(peer);
                false
            }
            None => false,
        }
    }
}

// ============================================================================
// DistributedRelay
// ============================================================================

enum RelayEvent {
    /// Attempt to fill open relay slots.
    TryFill,
    /// A live relay connection closed.
    Lost(PeerAddress),
}

struct RelayShared {
    active: Mutex<HashMap<PeerAddress, PeerConnection>>,
    failed: Mutex<ExpiringSet>,
    /// Fill passes currently in flight; guards shutdown completion.
    activity: AtomicUsize,
    shutdown: AtomicBool,
    done: watch::Sender<bool>,
    done_fired: AtomicBool,
}

impl RelayShared {
    /// Complete the shutdown future when nothing is live or in flight.
    /// Fires at most once.
    fn maybe_complete(&self) {
        if self.shutdown.load(Ordering::SeqCst)
            && self.activity.load(Ordering::SeqCst) == 0
            && self.active.lock().expect("relay lock poisoned").is_empty()
            && !self.done_fired.swap(true, Ordering::SeqCst)
        {
            debug!("relay manager shut down");
            self.done.send_replace(true);
        }
    }
}

struct RelayContext {
    local: LocalAddress,
    setup: Arc<dyn RelaySetup>,
    routing: Arc<dyn Routing>,
    callback: Arc<dyn RelayCallback>,
    config: RelayClientConfig,
    shared: Arc<RelayShared>,
    events: mpsc::Sender<RelayEvent>,
}

/// Handle to the relay control loop. Cheap to clone.
#[derive(Clone)]
pub struct DistributedRelay {
    events: mpsc::Sender<RelayEvent>,
    shared: Arc<RelayShared>,
    config: RelayClientConfig,
}

impl DistributedRelay {
    /// Start the control loop for `peer`. Nothing happens until
    /// [`setup_relays`](Self::setup_relays) fires the first fill pass; call
    /// it after bootstrapping, when the routing layer has real candidates.
    pub fn new(
        peer: &Peer,
        setup: Arc<dyn RelaySetup>,
        routing: Arc<dyn Routing>,
        callback: Arc<dyn RelayCallback>,
        config: RelayClientConfig,
    ) -> Self {
        let (events, receiver) = mpsc::channel(EVENT_QUEUE_SIZE);
        let shared = Arc::new(RelayShared {
            active: Mutex::new(HashMap::new()),
            failed: Mutex::new(ExpiringSet::new(config.failed_relay_wait)),
            activity: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            done: watch::channel(false).0,
            done_fired: AtomicBool::new(false),
        });
        let context = RelayContext {
            local: peer.local_address(),
            setup,
            routing,
            callback,
            config: config.clone(),
            shared: shared.clone(),
            events: events.clone(),
        };
        tokio::spawn(run_relay_actor(receiver, context));
        DistributedRelay { events, shared, config }
    }

    pub fn config(&self) -> &RelayClientConfig {
        &self.config
    }

    /// Ask the control loop to fill open relay slots.
    pub fn setup_relays(&self) {
        // a full queue already guarantees a pending fill pass
        let _ = self.events.try_send(RelayEvent::TryFill);
    }

    /// Snapshot of the currently active relay peers.
    pub fn active_relays(&self) -> Vec<PeerAddress> {
        self.shared
            .active
            .lock()
            .expect("relay lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Whether `peer` is currently banned by the failure memory.
    pub fn is_failed(&self, peer: &PeerAddress) -> bool {
        self.shared
            .failed
            .lock()
            .expect("relay lock poisoned")
            .contains(peer)
    }

    /// Close every relay connection and resolve once the manager is idle:
    /// `active` empty, no setup in flight. The completion fires exactly
    /// once; concurrent callers all observe it.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let connections: Vec<PeerConnection> = {
            let active = self.shared.active.lock().expect("relay lock poisoned");
            active.values().cloned().collect()
        };
        for connection in &connections {
            connection.close();
        }
        self.shared.maybe_complete();

        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }
}

async fn run_relay_actor(mut events: mpsc::Receiver<RelayEvent>, context: RelayContext) {
    while let Some(event) = events.recv().await {
        match event {
            RelayEvent::TryFill => fill_slots(&context).await,
            RelayEvent::Lost(peer) => {
                let removed = context
                    .shared
                    .active
                    .lock()
                    .expect("relay lock poisoned")
                    .remove(&peer)
                    .is_some();
                context
                    .shared
                    .failed
                    .lock()
                    .expect("relay lock poisoned")
                    .insert(peer.clone());
                if removed {
                    republish_address(&context);
                    debug!(relay = ?peer.id(), "lost relay");
                }
                context.callback.on_relay_removed(&peer);
                context.shared.maybe_complete();
                fill_slots(&context).await;
            }
        }
    }
}

/// One fill pass: keep taking the best candidate until the target count is
/// reached, candidates run out, or shutdown begins. Runs only on the actor
/// task, so slots are filled strictly one at a time.
async fn fill_slots(context: &RelayContext) {
    let shared = &context.shared;
    shared.activity.fetch_add(1, Ordering::SeqCst);

    // one attempt per candidate per pass; later passes may retry
    let mut attempted: std::collections::HashSet<PeerAddress> = std::collections::HashSet::new();
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            debug!("shutting down, not restarting relays");
            break;
        }
        {
            let active = shared.active.lock().expect("relay lock poisoned");
            if active.len() >= context.config.max_relays {
                trace!("enough relays");
                break;
            }
        }
        let Some(candidate) = next_candidate(context, &attempted) else {
            debug!("no more relay candidates");
            break;
        };
        attempted.insert(candidate.clone());

        match context
            .setup
            .send_setup_message(&candidate, &context.config)
            .await
        {
            Ok(connection) => {
                {
                    let mut active = shared.active.lock().expect("relay lock poisoned");
                    if shared.shutdown.load(Ordering::SeqCst) {
                        drop(active);
                        connection.close();
                        break;
                    }
                    active.insert(candidate.clone(), connection.clone());
                }
                republish_address(context);
                context.callback.on_relay_added(&candidate);
                debug!(relay = ?candidate.id(), "found relay");

                // feed the loss back into the event loop when it closes
                let events = context.events.clone();
                let lost = candidate.clone();
                tokio::spawn(async move {
                    connection.closed().await;
                    let _ = events.send(RelayEvent::Lost(lost)).await;
                });
            }
            Err(error) => {
                shared
                    .failed
                    .lock()
                    .expect("relay lock poisoned")
                    .insert(candidate.clone());
                context.callback.on_relay_removed(&candidate);
                debug!(relay = ?candidate.id(), "bad relay: {error}");
            }
        }
    }

    shared.activity.fetch_sub(1, Ordering::SeqCst);
    shared.maybe_complete();
}

/// Pick the next candidate. Manual relays are used verbatim (the caller owns
/// the failure filter); otherwise the routing layer's neighbors are filtered
/// against peers that are relayed themselves, already active, or recently
/// failed. Active and failed are read under their locks so a candidate is
/// never selected twice.
fn next_candidate(
    context: &RelayContext,
    attempted: &std::collections::HashSet<PeerAddress>,
) -> Option<PeerAddress> {
    let manual = !context.config.manual_relays.is_empty();
    let candidates = if manual {
        context.config.manual_relays.clone()
    } else {
        context.routing.neighbors()
    };

    let active = context.shared.active.lock().expect("relay lock poisoned");
    let mut failed = context.shared.failed.lock().expect("relay lock poisoned");
    let found = candidates.into_iter().find(|candidate| {
        !candidate.flags().relayed
            && !attempted.contains(candidate)
            && !active.contains_key(candidate)
            && (manual || !failed.contains(candidate))
    });
    trace!(candidate = ?found.as_ref().map(|c| c.id()), "relay candidate selection");
    found
}

/// Rewrite and install the local peer address from the current relay set:
/// relay endpoints capped at the configured maximum, firewalled flags
/// cleared while any relay is live, the slow flag following the relay type.
fn republish_address(context: &RelayContext) {
    let new_address = {
        let active = context.shared.active.lock().expect("relay lock poisoned");
        let has_relays = !active.is_empty();
        let sockets: Vec<PeerSocketAddress> = active
            .keys()
            .take(context.config.max_relays)
            .map(PeerAddress::socket_address)
            .collect();
        context
            .local
            .get()
            .with_firewalled_tcp(!has_relays)
            .with_firewalled_udp(!has_relays)
            .with_relayed(has_relays)
            .with_relays(sockets)
            .with_slow(has_relays && context.config.relay_type.is_slow())
    };
    debug!(address = %new_address, "updated local peer address");
    context.local.set(new_address);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Id160;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer_address(seed: u8) -> PeerAddress {
        let mut bytes = [0u8; 20];
        bytes[0] = seed;
        PeerAddress::new(
            Id160::from_bytes(bytes),
            IpAddr::V4(Ipv4Addr::new(10, 1, 1, seed)),
            6000,
            6001,
        )
    }

    #[test]
    fn expiring_set_forgets_after_ttl() {
        let mut set = ExpiringSet::new(Duration::from_millis(30));
        let peer = peer_address(1);
        assert!(!set.contains(&peer));

        set.insert(peer.clone());
        assert!(set.contains(&peer));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!set.contains(&peer));
        // expired entries are evicted, a re-insert starts a fresh window
        set.insert(peer.clone());
        assert!(set.contains(&peer));
    }

    #[test]
    fn relay_type_shapes_config() {
        assert!(!RelayType::OpenTcp.is_slow());
        assert!(RelayType::Buffered.is_slow());
        assert_eq!(RelayClientConfig::open_tcp().max_relays, MAX_RELAYS);
        assert_eq!(RelayClientConfig::open_tcp().max_relays(9).max_relays, MAX_RELAYS);
        assert_eq!(RelayClientConfig::open_tcp().max_relays(2).max_relays, 2);
    }
}
