//! # Inbound Message Dispatch
//!
//! Routes decoded inbound requests to the handler registered for their
//! recipient id and command. The table is two-level (`peer id -> command ->
//! handler`) because several logical peers can share one transport: a master
//! and its slaves all dispatch through the same instance.
//!
//! Requests for an unknown recipient get a typed unknown-peer reply, requests
//! a handler refuses via [`DispatchHandler::check_message`] get an exception
//! reply, and messages carrying a foreign overlay version are dropped
//! outright. Reply-typed messages are never dispatched here; the transport
//! feeds them to the pending-request table instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::identity::{Id160, LocalAddress};
use crate::messages::{Command, Message, MessageType};

/// A registered request handler.
///
/// Handlers run concurrently on the transport's worker tasks; per-peer
/// ordering is not guaranteed and implementations must tolerate interleaving.
#[async_trait]
pub trait DispatchHandler: Send + Sync {
    /// Cheap structural validation before [`handle`](Self::handle) runs. A
    /// rejected message is answered with an exception-typed reply.
    fn check_message(&self, _message: &Message) -> bool {
        true
    }

    /// Process a request and produce the reply to send back on the same
    /// transport. An error is mapped to an exception-typed reply.
    async fn handle(&self, message: Message) -> anyhow::Result<Message>;
}

pub struct Dispatcher {
    version: u32,
    heartbeat: Duration,
    /// Fallback responder address for requests no handler claims.
    local: LocalAddress,
    handlers: RwLock<HashMap<Id160, HashMap<Command, Arc<dyn DispatchHandler>>>>,
}

impl Dispatcher {
    pub fn new(version: u32, heartbeat: Duration, local: LocalAddress) -> Self {
        Dispatcher { version, heartbeat, local, handlers: RwLock::new(HashMap::new()) }
    }

    /// The overlay network identifier this dispatcher accepts.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Liveness interval for handlers that track peer health.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Install `handler` for every command in `commands` under `peer`.
    pub fn register(&self, peer: Id160, commands: &[Command], handler: Arc<dyn DispatchHandler>) {
        let mut table = self.handlers.write().expect("dispatcher lock poisoned");
        let entry = table.entry(peer).or_default();
        for command in commands {
            entry.insert(*command, handler.clone());
        }
    }

    /// Drop every handler registered under `peer`; used on peer shutdown.
    pub fn remove(&self, peer: Id160) {
        self.handlers
            .write()
            .expect("dispatcher lock poisoned")
            .remove(&peer);
    }

    /// True if any handler is registered under `peer`.
    pub fn has_handlers(&self, peer: Id160) -> bool {
        self.handlers
            .read()
            .expect("dispatcher lock poisoned")
            .contains_key(&peer)
    }

    fn lookup(&self, peer: Id160, command: Command) -> Option<Arc<dyn DispatchHandler>> {
        self.handlers
            .read()
            .expect("dispatcher lock poisoned")
            .get(&peer)
            .and_then(|commands| commands.get(&command))
            .cloned()
    }

    /// Route one inbound request. Returns the reply to transmit, or `None`
    /// when the message must be discarded silently.
    pub async fn dispatch(&self, message: Message) -> Option<Message> {
        if message.version() != self.version {
            debug!(
                got = message.version(),
                expected = self.version,
                "dropping message from foreign overlay"
            );
            return None;
        }
        if !message.message_type().is_request() {
            debug!("dispatcher received a reply-typed message, dropping");
            return None;
        }

        let requester = message.sender().clone();
        let handler = self.lookup(message.recipient().id(), message.command());
        let Some(handler) = handler else {
            debug!(recipient = ?message.recipient().id(), command = ?message.command(),
                "no handler registered");
            return Some(Message::response_to(&message, MessageType::UnknownPeer, self.local.get()));
        };

        if !handler.check_message(&message) {
            debug!(command = ?message.command(), "handler rejected message");
            return Some(Message::response_to(&message, MessageType::Exception, self.local.get()));
        }

        let correlator = message.id();
        let command = message.command();
        let version = message.version();
        match handler.handle(message).await {
            Ok(response) => Some(response),
            Err(error) => {
                warn!(?command, "handler failed: {error:#}");
                Some(Message::new(
                    version,
                    correlator,
                    command,
                    MessageType::Exception,
                    self.local.get(),
                    requester,
                ))
            }
        }
    }
}
