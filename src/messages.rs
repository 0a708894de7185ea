//! # Wire Protocol Messages
//!
//! This module defines the in-memory envelope for every request and reply on
//! the overlay, plus the enumerations the codec maps to and from wire nibbles.
//!
//! ## Envelope Layout
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `version` | network identifier shared by all peers on the same overlay |
//! | `id` | request correlator, echoed by replies |
//! | `command` | one of 16 operations ([`Command`]) |
//! | `message_type` | request variant or reply status ([`MessageType`]) |
//! | `sender` / `recipient` | peer addresses; the recipient travels id-only |
//! | slots | up to [`MAX_CONTENT_SLOTS`] typed payload values ([`Payload`]) |
//!
//! ## Payload Slots
//!
//! Slots are ordered; slot 1 is encoded and decoded first. A message that is
//! to be signed carries a [`Content::PublicKeySignature`] slot, which the
//! setters keep in the final position because the signature covers every byte
//! that precedes it on the wire.
//!
//! ## Data Atoms
//!
//! [`Data`] is the value type stored in tracker and storage maps: a ttl, a
//! protection bit folded into the ttl's sign bit on the wire, opaque bytes,
//! and an optional public key and signature. A data atom can reference the
//! message-level key instead of carrying its own ([`DataKey::FromMessage`]);
//! the codec translates that flag to a length sentinel on the wire.

use std::collections::BTreeMap;
use std::fmt;

use crate::crypto::KeyPair;
use crate::identity::{Id160, PeerAddress};

/// Number of payload slots in a message.
pub const MAX_CONTENT_SLOTS: usize = 4;

/// Hard cap on neighbors in one SET_NEIGHBORS payload (count travels as u8).
pub const MAX_NEIGHBORS: usize = 255;

/// Largest ttl a data atom can carry; the high bit encodes protection.
pub const MAX_TTL_SECONDS: u32 = 0x7fff_ffff;

// ============================================================================
// Wire Enumerations
// ============================================================================

/// The 16 overlay operations, one per command nibble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Command {
    Ping = 0,
    Put = 1,
    Get = 2,
    Add = 3,
    Remove = 4,
    Neighbors = 5,
    Quit = 6,
    DirectData = 7,
    TrackerAdd = 8,
    TrackerGet = 9,
    Pex = 10,
    Digest = 11,
    Broadcast = 12,
    Relay = 13,
    Rcon = 14,
    Sync = 15,
}

impl Command {
    /// Every nibble value maps to a command; unknown operations arrive as
    /// whatever the sender chose and handlers decide what to do.
    pub fn from_nibble(nibble: u8) -> Command {
        match nibble & 0x0f {
            0 => Command::Ping,
            1 => Command::Put,
            2 => Command::Get,
            3 => Command::Add,
            4 => Command::Remove,
            5 => Command::Neighbors,
            6 => Command::Quit,
            7 => Command::DirectData,
            8 => Command::TrackerAdd,
            9 => Command::TrackerGet,
            10 => Command::Pex,
            11 => Command::Digest,
            12 => Command::Broadcast,
            13 => Command::Relay,
            14 => Command::Rcon,
            _ => Command::Sync,
        }
    }

    pub fn as_nibble(self) -> u8 {
        self as u8
    }
}

/// Message type nibble: four request variants plus reply statuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request1 = 0,
    Request2 = 1,
    Request3 = 2,
    Request4 = 3,
    Ok = 4,
    PartiallyOk = 5,
    NotFound = 6,
    Denied = 7,
    /// Reply for a recipient id no handler is registered for.
    UnknownPeer = 8,
    /// Reply when a handler rejected or failed on the request.
    Exception = 9,
    Cancel = 10,
    User1 = 11,
    User2 = 12,
    Reserved1 = 13,
    Reserved2 = 14,
    Reserved3 = 15,
}

impl MessageType {
    pub fn from_nibble(nibble: u8) -> MessageType {
        match nibble & 0x0f {
            0 => MessageType::Request1,
            1 => MessageType::Request2,
            2 => MessageType::Request3,
            3 => MessageType::Request4,
            4 => MessageType::Ok,
            5 => MessageType::PartiallyOk,
            6 => MessageType::NotFound,
            7 => MessageType::Denied,
            8 => MessageType::UnknownPeer,
            9 => MessageType::Exception,
            10 => MessageType::Cancel,
            11 => MessageType::User1,
            12 => MessageType::User2,
            13 => MessageType::Reserved1,
            14 => MessageType::Reserved2,
            _ => MessageType::Reserved3,
        }
    }

    pub fn as_nibble(self) -> u8 {
        self as u8
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::Request1
                | MessageType::Request2
                | MessageType::Request3
                | MessageType::Request4
        )
    }
}

/// Payload slot type nibble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Content {
    Empty = 0,
    Key = 1,
    KeyKey = 2,
    MapKeyData = 3,
    MapKeyKey = 4,
    SetKeys = 5,
    SetNeighbors = 6,
    ChannelBuffer = 7,
    Long = 8,
    Integer = 9,
    MapPeerData = 10,
    PublicKey = 11,
    PublicKeySignature = 12,
    Reserved1 = 13,
    Reserved2 = 14,
    Reserved3 = 15,
}

impl Content {
    pub fn from_nibble(nibble: u8) -> Content {
        match nibble & 0x0f {
            0 => Content::Empty,
            1 => Content::Key,
            2 => Content::KeyKey,
            3 => Content::MapKeyData,
            4 => Content::MapKeyKey,
            5 => Content::SetKeys,
            6 => Content::SetNeighbors,
            7 => Content::ChannelBuffer,
            8 => Content::Long,
            9 => Content::Integer,
            10 => Content::MapPeerData,
            11 => Content::PublicKey,
            12 => Content::PublicKeySignature,
            13 => Content::Reserved1,
            14 => Content::Reserved2,
            _ => Content::Reserved3,
        }
    }

    pub fn as_nibble(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Data
// ============================================================================

/// Origin of the public key attached to a data atom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataKey {
    /// The atom carries its own DER-encoded key.
    Supplied(Vec<u8>),
    /// The atom reuses the message-level key; the codec emits the length
    /// sentinel for this.
    FromMessage,
}

/// The value stored under a key in tracker and storage maps.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Data {
    ttl_seconds: u32,
    protected_entry: bool,
    value: Vec<u8>,
    public_key: Option<DataKey>,
    signature: Option<Vec<u8>>,
}

impl Data {
    pub fn new(value: Vec<u8>) -> Self {
        Data { value, ..Data::default() }
    }

    /// An empty atom, used when only expiry matters.
    pub fn empty() -> Self {
        Data::default()
    }

    pub fn with_ttl(mut self, ttl_seconds: u32) -> Self {
        self.ttl_seconds = ttl_seconds & MAX_TTL_SECONDS;
        self
    }

    pub fn with_protected(mut self, protected_entry: bool) -> Self {
        self.protected_entry = protected_entry;
        self
    }

    pub fn with_public_key(mut self, key: DataKey) -> Self {
        self.public_key = Some(key);
        self
    }

    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn ttl_seconds(&self) -> u32 {
        self.ttl_seconds
    }

    pub fn is_protected(&self) -> bool {
        self.protected_entry
    }

    pub fn public_key(&self) -> Option<&DataKey> {
        self.public_key.as_ref()
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Content hash of the value, used as the map key for attachments.
    pub fn hash(&self) -> Id160 {
        Id160::sha1_of(&self.value)
    }

    /// The key bytes this atom is protected by, resolving the
    /// [`DataKey::FromMessage`] reference against the carrying message.
    pub fn resolved_public_key<'a>(&'a self, message: &'a Message) -> Option<&'a [u8]> {
        match self.public_key.as_ref()? {
            DataKey::Supplied(der) => Some(der),
            DataKey::FromMessage => message.public_key(),
        }
    }
}

// ============================================================================
// Payload
// ============================================================================

/// One typed payload slot value.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Key(Id160),
    KeyKey(Id160, Id160),
    DataMap(BTreeMap<Id160, Data>),
    KeyMap(BTreeMap<Id160, Id160>),
    Keys(Vec<Id160>),
    Neighbors(Vec<PeerAddress>),
    Buffer(Vec<u8>),
    Long(i64),
    Integer(i32),
    PeerDataMap(BTreeMap<PeerAddress, Data>),
    PublicKey(Vec<u8>),
    PublicKeySignature(Vec<u8>),
}

impl Payload {
    pub fn content(&self) -> Content {
        match self {
            Payload::Key(_) => Content::Key,
            Payload::KeyKey(..) => Content::KeyKey,
            Payload::DataMap(_) => Content::MapKeyData,
            Payload::KeyMap(_) => Content::MapKeyKey,
            Payload::Keys(_) => Content::SetKeys,
            Payload::Neighbors(_) => Content::SetNeighbors,
            Payload::Buffer(_) => Content::ChannelBuffer,
            Payload::Long(_) => Content::Long,
            Payload::Integer(_) => Content::Integer,
            Payload::PeerDataMap(_) => Content::MapPeerData,
            Payload::PublicKey(_) => Content::PublicKey,
            Payload::PublicKeySignature(_) => Content::PublicKeySignature,
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// The in-memory envelope every overlay component produces and consumes.
#[derive(Clone, Debug)]
pub struct Message {
    version: u32,
    id: u32,
    command: Command,
    message_type: MessageType,
    sender: PeerAddress,
    recipient: PeerAddress,
    slots: Vec<Payload>,
    /// Declared payload size; filled in by the decoder.
    content_length: u32,
    /// Cap applied when a neighbor set is encoded.
    neighbor_limit: usize,
    /// Message-level public key: installed by the signing setters on the way
    /// out, and by the decoder after successful verification on the way in.
    public_key: Option<Vec<u8>>,
    /// Key the encoder signs with when a signature slot is present.
    sign_key: Option<KeyPair>,
    /// The address the transport actually observed, for NAT detection.
    real_sender: Option<PeerAddress>,
}

impl Message {
    pub fn new(
        version: u32,
        id: u32,
        command: Command,
        message_type: MessageType,
        sender: PeerAddress,
        recipient: PeerAddress,
    ) -> Self {
        Message {
            version,
            id,
            command,
            message_type,
            sender,
            recipient,
            slots: Vec::new(),
            content_length: 0,
            neighbor_limit: MAX_NEIGHBORS,
            public_key: None,
            sign_key: None,
            real_sender: None,
        }
    }

    /// A new request with a random correlator.
    pub fn request(
        version: u32,
        command: Command,
        message_type: MessageType,
        sender: PeerAddress,
        recipient: PeerAddress,
    ) -> Self {
        Message::new(version, rand::random(), command, message_type, sender, recipient)
    }

    /// A reply to `request`: same correlator and command, swapped direction.
    pub fn response_to(request: &Message, message_type: MessageType, sender: PeerAddress) -> Self {
        Message::new(
            request.version,
            request.id,
            request.command,
            message_type,
            sender,
            request.sender.clone(),
        )
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn set_message_type(&mut self, message_type: MessageType) {
        self.message_type = message_type;
    }

    pub fn sender(&self) -> &PeerAddress {
        &self.sender
    }

    pub fn recipient(&self) -> &PeerAddress {
        &self.recipient
    }

    pub fn slots(&self) -> &[Payload] {
        &self.slots
    }

    /// The four content type nibbles in slot order, padded with EMPTY.
    pub fn content_types(&self) -> [Content; MAX_CONTENT_SLOTS] {
        let mut types = [Content::Empty; MAX_CONTENT_SLOTS];
        for (slot, payload) in self.slots.iter().enumerate() {
            types[slot] = payload.content();
        }
        types
    }

    pub fn content_length(&self) -> u32 {
        self.content_length
    }

    pub(crate) fn set_content_length(&mut self, content_length: u32) {
        self.content_length = content_length;
    }

    pub fn neighbor_limit(&self) -> usize {
        self.neighbor_limit
    }

    /// Cap how many neighbors are encoded from a SET_NEIGHBORS slot.
    pub fn set_neighbor_limit(&mut self, limit: usize) {
        self.neighbor_limit = limit;
    }

    /// The message-level public key, present on decoded messages only after
    /// the signature verified.
    pub fn public_key(&self) -> Option<&[u8]> {
        self.public_key.as_deref()
    }

    pub(crate) fn set_verified_public_key(&mut self, der: Vec<u8>) {
        self.public_key = Some(der);
    }

    pub(crate) fn sign_key(&self) -> Option<&KeyPair> {
        self.sign_key.as_ref()
    }

    /// True when a signature slot is present and the encoder will sign.
    pub fn sign_pending(&self) -> bool {
        self.slots
            .iter()
            .any(|p| matches!(p, Payload::PublicKeySignature(_)))
    }

    /// The address the socket observed, set by the decoder. Differs from
    /// `sender` when the peer is behind a NAT.
    pub fn real_sender(&self) -> Option<&PeerAddress> {
        self.real_sender.as_ref()
    }

    pub(crate) fn set_real_sender(&mut self, address: PeerAddress) {
        self.real_sender = Some(address);
    }

    /// Append a payload slot. A signature slot is kept in the final position
    /// because the signature must cover all preceding payload bytes.
    ///
    /// # Panics
    ///
    /// Panics when all slots are occupied; callers own the slot budget.
    pub fn add_payload(&mut self, payload: Payload) -> &mut Self {
        assert!(self.slots.len() < MAX_CONTENT_SLOTS, "all {MAX_CONTENT_SLOTS} content slots in use");
        match self.slots.last() {
            Some(Payload::PublicKeySignature(_))
                if !matches!(payload, Payload::PublicKeySignature(_)) =>
            {
                let last = self.slots.len() - 1;
                self.slots.insert(last, payload);
            }
            _ => self.slots.push(payload),
        }
        self
    }

    pub fn set_key(&mut self, key: Id160) -> &mut Self {
        self.add_payload(Payload::Key(key))
    }

    pub fn set_key_key(&mut self, key1: Id160, key2: Id160) -> &mut Self {
        self.add_payload(Payload::KeyKey(key1, key2))
    }

    pub fn set_data_map(&mut self, map: BTreeMap<Id160, Data>) -> &mut Self {
        self.add_payload(Payload::DataMap(map))
    }

    pub fn set_key_map(&mut self, map: BTreeMap<Id160, Id160>) -> &mut Self {
        self.add_payload(Payload::KeyMap(map))
    }

    pub fn set_keys(&mut self, keys: Vec<Id160>) -> &mut Self {
        self.add_payload(Payload::Keys(keys))
    }

    pub fn set_neighbors(&mut self, neighbors: Vec<PeerAddress>) -> &mut Self {
        self.add_payload(Payload::Neighbors(neighbors))
    }

    pub fn set_buffer(&mut self, buffer: Vec<u8>) -> &mut Self {
        self.add_payload(Payload::Buffer(buffer))
    }

    pub fn set_long(&mut self, value: i64) -> &mut Self {
        self.add_payload(Payload::Long(value))
    }

    pub fn set_integer(&mut self, value: i32) -> &mut Self {
        self.add_payload(Payload::Integer(value))
    }

    pub fn set_peer_data_map(&mut self, map: BTreeMap<PeerAddress, Data>) -> &mut Self {
        self.add_payload(Payload::PeerDataMap(map))
    }

    /// Attach the public key as an unsigned payload.
    pub fn set_public_key(&mut self, der: Vec<u8>) -> &mut Self {
        self.public_key = Some(der.clone());
        self.add_payload(Payload::PublicKey(der))
    }

    /// Attach the key pair's public half and request signing on encode. The
    /// signature slot stays last regardless of later setter calls.
    pub fn set_public_key_and_sign(&mut self, key_pair: &KeyPair) -> &mut Self {
        let der = key_pair.public_key_der().to_vec();
        self.public_key = Some(der.clone());
        self.sign_key = Some(key_pair.clone());
        self.add_payload(Payload::PublicKeySignature(der))
    }

    fn first_slot<'a, T, F: Fn(&'a Payload) -> Option<T>>(&'a self, pick: F) -> Option<T> {
        self.slots.iter().find_map(pick)
    }

    pub fn key(&self) -> Option<Id160> {
        self.first_slot(|p| match p {
            Payload::Key(k) => Some(*k),
            _ => None,
        })
    }

    pub fn key_key(&self) -> Option<(Id160, Id160)> {
        self.first_slot(|p| match p {
            Payload::KeyKey(a, b) => Some((*a, *b)),
            _ => None,
        })
    }

    pub fn data_map(&self) -> Option<&BTreeMap<Id160, Data>> {
        self.first_slot(|p| match p {
            Payload::DataMap(m) => Some(m),
            _ => None,
        })
    }

    pub fn key_map(&self) -> Option<&BTreeMap<Id160, Id160>> {
        self.first_slot(|p| match p {
            Payload::KeyMap(m) => Some(m),
            _ => None,
        })
    }

    pub fn keys(&self) -> Option<&[Id160]> {
        self.first_slot(|p| match p {
            Payload::Keys(k) => Some(k.as_slice()),
            _ => None,
        })
    }

    pub fn neighbors(&self) -> Option<&[PeerAddress]> {
        self.first_slot(|p| match p {
            Payload::Neighbors(n) => Some(n.as_slice()),
            _ => None,
        })
    }

    pub fn buffer(&self) -> Option<&[u8]> {
        self.first_slot(|p| match p {
            Payload::Buffer(b) => Some(b.as_slice()),
            _ => None,
        })
    }

    pub fn long_value(&self) -> Option<i64> {
        self.first_slot(|p| match p {
            Payload::Long(v) => Some(*v),
            _ => None,
        })
    }

    pub fn int_value(&self) -> Option<i32> {
        self.first_slot(|p| match p {
            Payload::Integer(v) => Some(*v),
            _ => None,
        })
    }

    pub fn peer_data_map(&self) -> Option<&BTreeMap<PeerAddress, Data>> {
        self.first_slot(|p| match p {
            Payload::PeerDataMap(m) => Some(m),
            _ => None,
        })
    }
}

/// Equality covers the wire-visible identity of a message: envelope fields,
/// payload slots, and the message-level public key. Bookkeeping fields
/// (declared length, neighbor cap, signing key, observed sender) are not part
/// of a message's identity.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.id == other.id
            && self.command == other.command
            && self.message_type == other.message_type
            && self.sender == other.sender
            && self.recipient == other.recipient
            && self.slots == other.slots
            && self.public_key == other.public_key
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} id={:08x} {:?} -> {:?}",
            self.command,
            self.message_type,
            self.id,
            self.sender.id(),
            self.recipient.id()
        )
    }
}
