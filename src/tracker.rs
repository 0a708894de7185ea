//! # Tracker RPC
//!
//! Peers announce themselves under a `(location, domain)` key pair and query
//! who else announced there. The wire work lives here; what gets kept, for
//! how long, and eviction policy belong to the [`TrackerStorage`]
//! collaborator.
//!
//! Requests carry the key pair as a KEY_KEY slot. An announcement may attach
//! a data atom (serialized as a data map keyed by the content hash) and may
//! be signed, in which case the verified message key is stored with the
//! entry so protected domains can check ownership later. Replies carry the
//! tracker's current entries as a peer-to-data map.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use tracing::debug;

use crate::codec::EncodeError;
use crate::dispatcher::DispatchHandler;
use crate::identity::{Id160, PeerAddress};
use crate::messages::{Command, Data, DataKey, Message, MessageType};
use crate::peer::Peer;
use crate::transport::RequestError;

/// Bound on distinct `(location, domain)` keys held in memory.
const MAX_TRACKED_KEYS: usize = 256;

/// Default cap on entries per tracked key.
pub const DEFAULT_TRACKER_SIZE: usize = 35;

// ============================================================================
// Storage Interface
// ============================================================================

/// Tracker storage collaborator. Insertion policy and TTL expiry live behind
/// this interface, not in the RPC.
pub trait TrackerStorage: Send + Sync {
    /// Record `peer` under the key pair. `public_key` is the verified
    /// message-level key of a signed announcement. Returns false when the
    /// entry is refused.
    fn put(
        &self,
        location: Id160,
        domain: Id160,
        peer: PeerAddress,
        public_key: Option<Vec<u8>>,
        data: Data,
    ) -> bool;

    /// All entries under the key pair.
    fn get(&self, location: Id160, domain: Id160) -> Option<BTreeMap<PeerAddress, Data>>;

    fn size(&self, location: Id160, domain: Id160) -> usize;

    /// Cap on entries per key pair.
    fn max_size(&self) -> usize;
}

/// Bounded in-memory tracker storage.
pub struct MemoryTrackerStorage {
    maps: Mutex<LruCache<(Id160, Id160), BTreeMap<PeerAddress, Data>>>,
    max_size: usize,
}

impl MemoryTrackerStorage {
    pub fn new(max_size: usize) -> Self {
        MemoryTrackerStorage {
            maps: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_KEYS).expect("nonzero"),
            )),
            max_size,
        }
    }
}

impl Default for MemoryTrackerStorage {
    fn default() -> Self {
        MemoryTrackerStorage::new(DEFAULT_TRACKER_SIZE)
    }
}

impl TrackerStorage for MemoryTrackerStorage {
    fn put(
        &self,
        location: Id160,
        domain: Id160,
        peer: PeerAddress,
        public_key: Option<Vec<u8>>,
        data: Data,
    ) -> bool {
        let mut maps = self.maps.lock().expect("tracker lock poisoned");
        let map = maps.get_or_insert_mut((location, domain), BTreeMap::new);
        if map.len() >= self.max_size && !map.contains_key(&peer) {
            return false;
        }
        let stored = match public_key {
            Some(der) => data.with_public_key(DataKey::Supplied(der)),
            None => data,
        };
        map.insert(peer, stored);
        true
    }

    fn get(&self, location: Id160, domain: Id160) -> Option<BTreeMap<PeerAddress, Data>> {
        self.maps
            .lock()
            .expect("tracker lock poisoned")
            .get(&(location, domain))
            .cloned()
    }

    fn size(&self, location: Id160, domain: Id160) -> usize {
        self.maps
            .lock()
            .expect("tracker lock poisoned")
            .get(&(location, domain))
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn max_size(&self) -> usize {
        self.max_size
    }
}

// ============================================================================
// TrackerRpc
// ============================================================================

pub struct TrackerRpc {
    peer: Peer,
    storage: Arc<dyn TrackerStorage>,
}

impl TrackerRpc {
    /// Create the RPC and register its handler for this peer.
    pub fn new(peer: &Peer, storage: Arc<dyn TrackerStorage>) -> Arc<TrackerRpc> {
        let rpc = Arc::new(TrackerRpc { peer: peer.clone(), storage });
        peer.dispatcher().register(
            peer.id(),
            &[Command::TrackerAdd, Command::TrackerGet],
            rpc.clone(),
        );
        rpc
    }

    pub fn storage(&self) -> &Arc<dyn TrackerStorage> {
        &self.storage
    }

    fn keyed_request(
        &self,
        command: Command,
        message_type: MessageType,
        remote: &PeerAddress,
        location: Id160,
        domain: Id160,
        sign: bool,
    ) -> Result<Message, RequestError> {
        let mut message = self.peer.create_request(command, message_type, remote.clone());
        message.set_key_key(location, domain);
        if sign {
            let key_pair = self
                .peer
                .key_pair()
                .ok_or(RequestError::Encode(EncodeError::MissingSignKey))?;
            message.set_public_key_and_sign(key_pair);
        }
        Ok(message)
    }

    /// Announce this peer on `remote`'s tracker, optionally with an attached
    /// data atom. With an attachment the request travels over TCP, without
    /// one a datagram suffices.
    pub async fn add_to_tracker(
        &self,
        remote: &PeerAddress,
        location: Id160,
        domain: Id160,
        attachment: Option<Data>,
        sign: bool,
    ) -> Result<Message, RequestError> {
        let mut message = self.keyed_request(
            Command::TrackerAdd,
            MessageType::Request1,
            remote,
            location,
            domain,
            sign,
        )?;
        match attachment {
            Some(data) => {
                let mut map = BTreeMap::new();
                map.insert(data.hash(), data);
                message.set_data_map(map);
                self.peer.sender().send_tcp(&message).await
            }
            None => self.peer.sender().send_udp(&message).await,
        }
    }

    /// Push a known `(peer, data)` entry to the tracker that should also be
    /// responsible for the key pair.
    pub async fn add_to_tracker_replication(
        &self,
        remote: &PeerAddress,
        location: Id160,
        domain: Id160,
        entry_peer: PeerAddress,
        data: Data,
        sign: bool,
    ) -> Result<Message, RequestError> {
        let mut message = self.keyed_request(
            Command::TrackerAdd,
            MessageType::Request2,
            remote,
            location,
            domain,
            sign,
        )?;
        let mut map = BTreeMap::new();
        map.insert(entry_peer, data);
        message.set_peer_data_map(map);
        self.peer.sender().send_tcp(&message).await
    }

    /// Ask `remote` who announced under the key pair. Expecting attachments
    /// means a potentially large reply, so that variant uses TCP.
    pub async fn get_from_tracker(
        &self,
        remote: &PeerAddress,
        location: Id160,
        domain: Id160,
        expect_attachment: bool,
        sign: bool,
    ) -> Result<Message, RequestError> {
        let message = self.keyed_request(
            Command::TrackerGet,
            MessageType::Request1,
            remote,
            location,
            domain,
            sign,
        )?;
        if expect_attachment {
            self.peer.sender().send_tcp(&message).await
        } else {
            self.peer.sender().send_udp(&message).await
        }
    }
}

#[async_trait]
impl DispatchHandler for TrackerRpc {
    fn check_message(&self, message: &Message) -> bool {
        matches!(message.command(), Command::TrackerAdd | Command::TrackerGet)
            && matches!(
                message.message_type(),
                MessageType::Request1 | MessageType::Request2
            )
            && message.key_key().is_some()
    }

    async fn handle(&self, message: Message) -> anyhow::Result<Message> {
        let (location, domain) = message
            .key_key()
            .ok_or_else(|| anyhow::anyhow!("tracker request without a key pair"))?;
        let mut response = Message::response_to(&message, MessageType::Ok, self.peer.address());

        if message.message_type() == MessageType::Request1 {
            let existing = self.storage.get(location, domain);
            match message.command() {
                Command::TrackerAdd => {
                    debug!(%location, %domain, from = ?message.sender().id(), "tracker put");
                    // reply with the state before this announcement
                    response.set_peer_data_map(existing.unwrap_or_default());
                    if self.storage.size(location, domain) < self.storage.max_size() {
                        let attachment = message
                            .data_map()
                            .and_then(|map| map.values().next().cloned())
                            .unwrap_or_else(Data::empty);
                        // the key arrives on the message, not inside the data
                        let public_key = message.public_key().map(<[u8]>::to_vec);
                        if !self.storage.put(
                            location,
                            domain,
                            message.sender().clone(),
                            public_key,
                            attachment,
                        ) {
                            response.set_message_type(MessageType::Denied);
                        }
                    } else {
                        response.set_message_type(MessageType::Denied);
                    }
                }
                _ => {
                    debug!(%location, %domain, from = ?message.sender().id(), "tracker get");
                    match existing {
                        Some(map) => {
                            response.set_peer_data_map(map);
                        }
                        None => response.set_message_type(MessageType::NotFound),
                    }
                }
            }
        } else {
            // replication: the entries arrive as an explicit peer map
            let entries = message.peer_data_map().cloned().unwrap_or_default();
            for (entry_peer, data) in entries {
                if !self.storage.put(location, domain, entry_peer, None, data) {
                    response.set_message_type(MessageType::Denied);
                }
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(seed: u8) -> PeerAddress {
        let mut bytes = [0u8; 20];
        bytes[0] = seed;
        PeerAddress::new(
            Id160::from_bytes(bytes),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, seed)),
            1000,
            1001,
        )
    }

    #[test]
    fn storage_caps_entries_per_key() {
        let storage = MemoryTrackerStorage::new(2);
        let location = Id160::random();
        let domain = Id160::random();

        assert!(storage.put(location, domain, peer(1), None, Data::empty()));
        assert!(storage.put(location, domain, peer(2), None, Data::empty()));
        assert_eq!(storage.size(location, domain), 2);

        // full for new peers, but re-announcement of a known one still works
        assert!(!storage.put(location, domain, peer(3), None, Data::empty()));
        assert!(storage.put(location, domain, peer(1), None, Data::new(b"x".to_vec())));
        assert_eq!(storage.size(location, domain), 2);
    }

    #[test]
    fn storage_attaches_message_key() {
        let storage = MemoryTrackerStorage::default();
        let location = Id160::random();
        let domain = Id160::random();

        storage.put(location, domain, peer(1), Some(vec![1, 2, 3]), Data::empty());
        let map = storage.get(location, domain).unwrap();
        assert_eq!(
            map.get(&peer(1)).unwrap().public_key(),
            Some(&DataKey::Supplied(vec![1, 2, 3]))
        );
        assert!(storage.get(location, Id160::random()).is_none());
    }
}
