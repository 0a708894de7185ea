//! # Ping RPC
//!
//! The smallest request/reply pair on the overlay: a liveness probe that
//! exercises the whole correlation path (encode, send, pending table, reply
//! future) over either transport. Handlers that track peer health key their
//! probing off the dispatcher's heartbeat interval.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::dispatcher::DispatchHandler;
use crate::identity::PeerAddress;
use crate::messages::{Command, Message, MessageType};
use crate::peer::Peer;
use crate::transport::RequestError;

pub struct PingRpc {
    peer: Peer,
}

impl PingRpc {
    /// Create the RPC and register its handler for this peer.
    pub fn new(peer: &Peer) -> Arc<PingRpc> {
        let rpc = Arc::new(PingRpc { peer: peer.clone() });
        peer.dispatcher()
            .register(peer.id(), &[Command::Ping], rpc.clone());
        rpc
    }

    /// Probe `remote` with a single datagram.
    pub async fn ping_udp(&self, remote: &PeerAddress) -> Result<Message, RequestError> {
        let message = self
            .peer
            .create_request(Command::Ping, MessageType::Request1, remote.clone());
        self.peer.sender().send_udp(&message).await
    }

    /// Probe `remote` over a short-lived TCP connection.
    pub async fn ping_tcp(&self, remote: &PeerAddress) -> Result<Message, RequestError> {
        let message = self
            .peer
            .create_request(Command::Ping, MessageType::Request1, remote.clone());
        self.peer.sender().send_tcp(&message).await
    }
}

#[async_trait]
impl DispatchHandler for PingRpc {
    fn check_message(&self, message: &Message) -> bool {
        message.command() == Command::Ping && message.message_type().is_request()
    }

    async fn handle(&self, message: Message) -> anyhow::Result<Message> {
        trace!(from = ?message.sender().id(), "ping");
        Ok(Message::response_to(&message, MessageType::Ok, self.peer.address()))
    }
}
