//! # Channel Server and Sender
//!
//! The transport layer of a master peer: one TCP listener and one UDP socket
//! accepting inbound traffic, plus a client-side [`Sender`] issuing outbound
//! requests with per-request reply futures.
//!
//! ## Task Model
//!
//! - A pair of accept tasks (TCP accept loop, UDP receive loop) own the bound
//!   sockets. Dropping the listener on shutdown is what releases the ports.
//! - Per-connection and per-datagram work runs on tracked worker tasks so
//!   shutdown can drain them before the accept tasks are joined.
//! - The [`Sender`] owns a separate ephemeral UDP socket and its own receive
//!   task; replies to outbound requests come back there and resolve entries
//!   in the shared [`PendingRequests`] table.
//!
//! ## Request Lifecycle
//!
//! Sending registers the message id in the pending table and returns once a
//! matching reply arrives, the request window elapses (timeout), or the
//! sender shuts down (cancelled). Dropping the in-flight future removes the
//! pending entry and releases its reservation slot, so callers can cancel by
//! simply dropping. TCP requests open a short-lived connection and read the
//! reply inline; long-lived connections are represented by
//! [`PeerConnection`] handles whose close future fires exactly once.
//!
//! ## Framing
//!
//! TCP frames are self-describing: a fixed header whose declared content
//! length says how many payload bytes follow. A datagram carries exactly one
//! message. Malformed input is discarded; the listener survives.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, EncodeError, HEADER_SIZE};
use crate::dispatcher::Dispatcher;
use crate::identity::PeerAddress;
use crate::messages::Message;

/// Upper bound on a declared TCP frame payload.
/// Prevents a hostile header from making us allocate gigabytes.
pub const MAX_CONTENT_LENGTH: usize = 4 * 1024 * 1024;

/// Receive buffer size for datagrams.
const MAX_UDP_MESSAGE: usize = 65536;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_OUTBOUND: usize = 50;

// ============================================================================
// Configuration
// ============================================================================

/// Listener and client-side settings for a master peer.
#[derive(Clone, Debug)]
pub struct ChannelServerConfig {
    pub bind_ip: IpAddr,
    /// TCP listener port; 0 picks an ephemeral one.
    pub tcp_port: u16,
    /// UDP listener port; 0 picks an ephemeral one.
    pub udp_port: u16,
    /// Externally visible address, when known (manual port forwarding).
    pub external_address: Option<IpAddr>,
    /// Externally mapped ports when they differ from the bound ones.
    pub external_tcp_port: Option<u16>,
    pub external_udp_port: Option<u16>,
    /// Advertise this peer as unable to accept inbound connections.
    pub behind_firewall: bool,
    /// Accept the loopback address as a last-resort external address.
    pub allow_loopback: bool,
    pub heartbeat: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Size of the outbound reservation pool.
    pub max_outbound: usize,
}

impl Default for ChannelServerConfig {
    fn default() -> Self {
        ChannelServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 0,
            udp_port: 0,
            external_address: None,
            external_tcp_port: None,
            external_udp_port: None,
            behind_firewall: false,
            allow_loopback: true,
            heartbeat: DEFAULT_HEARTBEAT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_outbound: DEFAULT_MAX_OUTBOUND,
        }
    }
}

// ============================================================================
// Request Errors
// ============================================================================

/// Why an outbound request future failed.
#[derive(Debug)]
pub enum RequestError {
    /// No reply within the request window.
    Timeout,
    /// The request was cancelled, usually by peer shutdown.
    Cancelled,
    /// The message could not be put on the wire.
    Encode(EncodeError),
    Io(io::Error),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Timeout => write!(f, "no response within the request window"),
            RequestError::Cancelled => write!(f, "request cancelled"),
            RequestError::Encode(e) => write!(f, "encoding failed: {e}"),
            RequestError::Io(e) => write!(f, "transport failed: {e}"),
        }
    }
}

impl std::error::Error for RequestError {}

// ============================================================================
// Reservation
// ============================================================================

/// Bounded pool of outbound connection slots.
///
/// A slot is held for the lifetime of a request (or of a persistent peer
/// connection) and returns to the pool on drop. Closing the pool makes every
/// further reservation fail with [`RequestError::Cancelled`].
#[derive(Clone)]
pub struct Reservation {
    permits: Arc<Semaphore>,
}

impl Reservation {
    pub fn new(max_outbound: usize) -> Self {
        Reservation { permits: Arc::new(Semaphore::new(max_outbound)) }
    }

    pub async fn reserve(&self) -> Result<OwnedSemaphorePermit, RequestError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RequestError::Cancelled)
    }

    /// Stop handing out slots. Outstanding holders keep theirs until drop.
    pub fn close(&self) {
        self.permits.close();
    }
}

// ============================================================================
// Pending Requests
// ============================================================================

/// The reply futures of all in-flight requests, keyed by message id.
///
/// Shared between the sender (which registers) and every receive path (which
/// completes). After [`fail_all`](Self::fail_all) the table refuses new
/// registrations, so requests racing with shutdown fail immediately.
pub struct PendingRequests {
    table: Mutex<Option<HashMap<u32, oneshot::Sender<Message>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        PendingRequests { table: Mutex::new(Some(HashMap::new())) }
    }

    fn register(&self, id: u32) -> Result<oneshot::Receiver<Message>, RequestError> {
        let mut table = self.table.lock().expect("pending lock poisoned");
        let Some(table) = table.as_mut() else {
            return Err(RequestError::Cancelled);
        };
        let (tx, rx) = oneshot::channel();
        table.insert(id, tx);
        Ok(rx)
    }

    fn remove(&self, id: u32) {
        if let Some(table) = self.table.lock().expect("pending lock poisoned").as_mut() {
            table.remove(&id);
        }
    }

    /// Resolve the request `id` with `message`. Returns false when no such
    /// request is pending (stray or duplicate reply).
    pub fn complete(&self, id: u32, message: Message) -> bool {
        let sender = self
            .table
            .lock()
            .expect("pending lock poisoned")
            .as_mut()
            .and_then(|table| table.remove(&id));
        match sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding request with a cancelled reason and refuse any
    /// new ones. Idempotent.
    pub fn fail_all(&self) {
        let dropped = self.table.lock().expect("pending lock poisoned").take();
        if let Some(dropped) = dropped {
            if !dropped.is_empty() {
                debug!(count = dropped.len(), "cancelling outstanding requests");
            }
        }
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the pending entry when a request future is dropped mid-flight.
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

// ============================================================================
// Sender
// ============================================================================

/// Client side of the transport: encodes requests, ships them over UDP or a
/// short-lived TCP connection, and resolves the reply future.
pub struct Sender {
    udp: Arc<UdpSocket>,
    pending: Arc<PendingRequests>,
    reservation: Reservation,
    request_timeout: Duration,
    connect_timeout: Duration,
    shutdown: watch::Sender<bool>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl Sender {
    /// Bind the client socket on an ephemeral port and start its receive
    /// task.
    pub async fn bind(
        bind_ip: IpAddr,
        pending: Arc<PendingRequests>,
        reservation: Reservation,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> io::Result<Sender> {
        let udp = Arc::new(UdpSocket::bind((bind_ip, 0)).await?);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let receive_task =
            tokio::spawn(Self::receive_loop(udp.clone(), pending.clone(), shutdown_rx));
        Ok(Sender {
            udp,
            pending,
            reservation,
            request_timeout,
            connect_timeout,
            shutdown,
            receive_task: Mutex::new(Some(receive_task)),
        })
    }

    async fn receive_loop(
        udp: Arc<UdpSocket>,
        pending: Arc<PendingRequests>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = udp.recv_from(&mut buf) => {
                    let (len, remote) = match received {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("client socket receive failed: {e}");
                            continue;
                        }
                    };
                    match codec::decode(&buf[..len], remote) {
                        Ok(message) if !message.message_type().is_request() => {
                            if !pending.complete(message.id(), message) {
                                trace!("reply without a pending request");
                            }
                        }
                        Ok(_) => trace!(%remote, "ignoring request on client socket"),
                        Err(e) => debug!("discarding malformed datagram: {e}"),
                    }
                }
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Send a request as a single datagram and await its reply.
    pub async fn send_udp(&self, message: &Message) -> Result<Message, RequestError> {
        let _permit = self.reservation.reserve().await?;
        let bytes = codec::encode(message).map_err(RequestError::Encode)?;
        let receiver = self.pending.register(message.id())?;
        let _guard = PendingGuard { pending: &self.pending, id: message.id() };

        self.udp
            .send_to(&bytes, message.recipient().udp_socket())
            .await
            .map_err(RequestError::Io)?;

        match tokio::time::timeout(self.request_timeout, receiver).await {
            Err(_) => Err(RequestError::Timeout),
            Ok(Err(_)) => Err(RequestError::Cancelled),
            Ok(Ok(reply)) => Ok(reply),
        }
    }

    /// Send a request over a short-lived TCP connection and read the reply
    /// inline.
    pub async fn send_tcp(&self, message: &Message) -> Result<Message, RequestError> {
        let _permit = self.reservation.reserve().await?;
        let bytes = codec::encode(message).map_err(RequestError::Encode)?;
        let target = message.recipient().tcp_socket();
        let wanted = message.id();
        let mut shutdown = self.shutdown.subscribe();

        let exchange = async {
            let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
                .await
                .map_err(|_| RequestError::Timeout)?
                .map_err(RequestError::Io)?;
            stream.write_all(&bytes).await.map_err(RequestError::Io)?;

            let reply = tokio::time::timeout(self.request_timeout, async {
                loop {
                    let message = read_message(&mut stream, target).await?;
                    if message.id() == wanted && !message.message_type().is_request() {
                        return Ok::<Message, io::Error>(message);
                    }
                    trace!("skipping unrelated message on request connection");
                }
            })
            .await
            .map_err(|_| RequestError::Timeout)?
            .map_err(RequestError::Io)?;
            Ok::<Message, RequestError>(reply)
        };

        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => Err(RequestError::Cancelled),
            result = exchange => result,
        }
    }

    /// Fail all outstanding requests and stop the client socket. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        self.pending.fail_all();
        if let Some(task) = self.receive_task.lock().expect("sender lock poisoned").take() {
            task.abort();
        }
    }
}

// ============================================================================
// PeerConnection
// ============================================================================

/// Handle to a long-lived connection to one peer.
///
/// Cheap to clone; all clones observe the same close state. The close future
/// resolves exactly once, whether the local side called [`close`](Self::close)
/// or the backing transport task saw the stream end.
#[derive(Clone)]
pub struct PeerConnection {
    remote: PeerAddress,
    closed: Arc<watch::Sender<bool>>,
}

impl PeerConnection {
    /// A fresh handle in the open state. Pair it with a transport task that
    /// closes it when the stream ends; without one it is a plain bookkeeping
    /// handle.
    pub fn new(remote: PeerAddress) -> Self {
        let (closed, _) = watch::channel(false);
        PeerConnection { remote, closed: Arc::new(closed) }
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Close the connection. The backing transport task, if any, drops the
    /// stream when it observes this.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Resolves when the connection is closed, from either side.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("remote", &self.remote.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Worker Tracking
// ============================================================================

/// Counts live worker tasks so shutdown can drain them.
#[derive(Clone, Default)]
pub(crate) struct TaskGroup {
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl TaskGroup {
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let active = self.active.clone();
        let idle = self.idle.clone();
        active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            future.await;
            if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
    }

    pub(crate) async fn wait_idle(&self) {
        let notified = self.idle.notified();
        tokio::pin!(notified);
        loop {
            // register as a waiter before reading the counter, so a worker
            // draining it to zero in between cannot lose the wakeup
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.as_mut().await;
            notified.set(self.idle.notified());
        }
    }
}

// ============================================================================
// ChannelServer
// ============================================================================

/// The inbound half of a master peer: TCP listener plus UDP socket, feeding
/// the dispatcher.
pub struct ChannelServer {
    local_tcp: SocketAddr,
    local_udp: SocketAddr,
    shutdown: watch::Sender<bool>,
    boss: Mutex<Vec<JoinHandle<()>>>,
    workers: TaskGroup,
    udp: Mutex<Option<Arc<UdpSocket>>>,
}

impl ChannelServer {
    /// Bind both listeners. Failure here is fatal for master construction.
    pub async fn bind(
        config: &ChannelServerConfig,
        dispatcher: Arc<Dispatcher>,
        pending: Arc<PendingRequests>,
    ) -> io::Result<ChannelServer> {
        let tcp = TcpListener::bind((config.bind_ip, config.tcp_port)).await?;
        let udp = Arc::new(UdpSocket::bind((config.bind_ip, config.udp_port)).await?);
        let local_tcp = tcp.local_addr()?;
        let local_udp = udp.local_addr()?;
        info!(%local_tcp, %local_udp, "channel server listening");

        let (shutdown, _) = watch::channel(false);
        let workers = TaskGroup::default();
        let boss = vec![
            tokio::spawn(accept_loop(
                tcp,
                dispatcher.clone(),
                pending.clone(),
                workers.clone(),
                shutdown.subscribe(),
            )),
            tokio::spawn(udp_loop(
                udp.clone(),
                dispatcher,
                pending,
                workers.clone(),
                shutdown.subscribe(),
            )),
        ];

        Ok(ChannelServer {
            local_tcp,
            local_udp,
            shutdown,
            boss: Mutex::new(boss),
            workers,
            udp: Mutex::new(Some(udp)),
        })
    }

    pub fn local_tcp_addr(&self) -> SocketAddr {
        self.local_tcp
    }

    pub fn local_udp_addr(&self) -> SocketAddr {
        self.local_udp
    }

    /// Stop accepting, drain in-flight workers, then join the accept tasks.
    /// The bound ports are released once this returns. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.workers.wait_idle().await;
        let handles: Vec<JoinHandle<()>> = {
            let mut boss = self.boss.lock().expect("server lock poisoned");
            boss.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        // last server-held reference to the UDP socket
        self.udp.lock().expect("server lock poisoned").take();
        debug!("channel server shut down");
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    pending: Arc<PendingRequests>,
    workers: TaskGroup,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("accept failed: {e}");
                        continue;
                    }
                };
                trace!(%remote, "inbound connection");
                workers.spawn(serve_connection(
                    stream,
                    remote,
                    dispatcher.clone(),
                    pending.clone(),
                    shutdown.clone(),
                ));
            }
        }
    }
    // listener drops here, releasing the port
}

async fn serve_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    pending: Arc<PendingRequests>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            read = read_message(&mut stream, remote) => {
                let message = match read {
                    Ok(message) => message,
                    Err(e) => {
                        if e.kind() != io::ErrorKind::UnexpectedEof {
                            debug!(%remote, "connection read failed: {e}");
                        }
                        break;
                    }
                };
                if message.message_type().is_request() {
                    let Some(response) = dispatcher.dispatch(message).await else {
                        continue;
                    };
                    match codec::encode(&response) {
                        Ok(bytes) => {
                            if let Err(e) = stream.write_all(&bytes).await {
                                debug!(%remote, "reply write failed: {e}");
                                break;
                            }
                        }
                        Err(e) => warn!("encoding reply failed: {e}"),
                    }
                } else {
                    pending.complete(message.id(), message);
                }
            }
        }
    }
}

async fn udp_loop(
    udp: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    pending: Arc<PendingRequests>,
    workers: TaskGroup,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_UDP_MESSAGE];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = udp.recv_from(&mut buf) => {
                let (len, remote) = match received {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("udp receive failed: {e}");
                        continue;
                    }
                };
                let message = match codec::decode(&buf[..len], remote) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(%remote, "discarding malformed datagram: {e}");
                        continue;
                    }
                };
                if message.message_type().is_request() {
                    let udp = udp.clone();
                    let dispatcher = dispatcher.clone();
                    workers.spawn(async move {
                        let Some(response) = dispatcher.dispatch(message).await else {
                            return;
                        };
                        match codec::encode(&response) {
                            Ok(bytes) => {
                                if let Err(e) = udp.send_to(&bytes, remote).await {
                                    debug!(%remote, "reply send failed: {e}");
                                }
                            }
                            Err(e) => warn!("encoding reply failed: {e}"),
                        }
                    });
                } else {
                    pending.complete(message.id(), message);
                }
            }
        }
    }
}

/// Read one length-framed message from a TCP stream.
pub(crate) async fn read_message(
    stream: &mut TcpStream,
    remote: SocketAddr,
) -> io::Result<Message> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let content_length =
        u32::from_be_bytes([header[53], header[54], header[55], header[56]]) as usize;
    if content_length > MAX_CONTENT_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "declared content length exceeds limit",
        ));
    }
    let mut frame = vec![0u8; HEADER_SIZE + content_length];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    stream.read_exact(&mut frame[HEADER_SIZE..]).await?;
    codec::decode(&frame, remote).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
