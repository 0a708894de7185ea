//! # Peer Identifiers and Addresses
//!
//! This module defines the core identity types used throughout Lattica:
//!
//! - [`Id160`]: 160-bit opaque identifier for peers, content keys, and domain keys
//! - [`PeerAddress`]: a peer id plus every transport coordinate needed to reach it
//! - [`PeerSocketAddress`]: a bare (ip, tcp, udp) endpoint, used for relay sockets
//! - [`LocalAddress`]: the shared, swappable cell holding a peer's published address
//!
//! ## Identity Model
//!
//! An identity is an opaque 160-bit value. Peers that own a DSA key pair derive
//! their id as `SHA1(SubjectPublicKeyInfo)`; peers without keys use a random id.
//! Equality and hashing are bytewise, and the serialized form is exactly 20
//! bytes in transmission (big-endian) order.
//!
//! ## Address Model
//!
//! A [`PeerAddress`] is immutable. All `with_*` methods return a new value;
//! installing a changed address into the peer's [`LocalAddress`] cell is the
//! signal to the rest of the stack that the peer should announce itself with
//! the new coordinates (for example after gaining or losing a relay).
//!
//! ## Invariants
//!
//! - `Id160::from_bytes(b).as_bytes() == b` (round-trip preservation)
//! - A peer address carries at most [`MAX_RELAYS`] relay sockets
//! - Flags and ip family fully determine the serialized size of an address

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};

use rand::RngCore;
use sha1::{Digest, Sha1};

/// Maximum number of relay sockets a peer address may advertise.
pub const MAX_RELAYS: usize = 5;

// ============================================================================
// Id160
// ============================================================================

/// A 160-bit opaque identifier.
///
/// Used for peer ids, content location keys, and domain keys. Immutable,
/// bytewise ordered, serialized as exactly 20 big-endian bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id160([u8; Id160::SIZE]);

impl Id160 {
    /// Serialized size in bytes.
    pub const SIZE: usize = 20;

    /// The all-zero identifier.
    pub const ZERO: Id160 = Id160([0u8; Id160::SIZE]);

    /// The all-ones identifier.
    pub const MAX: Id160 = Id160([0xffu8; Id160::SIZE]);

    pub fn from_bytes(bytes: [u8; Id160::SIZE]) -> Self {
        Id160(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Id160::SIZE] {
        &self.0
    }

    /// A uniformly random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; Id160::SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Id160(bytes)
    }

    /// The SHA-1 digest of `data` as an identifier.
    ///
    /// This is how peer ids are derived from DER-encoded public keys and how
    /// content hashes are computed for tracker attachments.
    pub fn sha1_of(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; Id160::SIZE];
        bytes.copy_from_slice(&digest);
        Id160(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 40-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; Id160::SIZE] = bytes.try_into().ok()?;
        Some(Id160(bytes))
    }
}

impl fmt::Display for Id160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Id160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form for logs
        write!(f, "Id160({}..)", &self.to_hex()[..8])
    }
}

// ============================================================================
// Address Flags
// ============================================================================

/// NAT and reachability flags carried in a peer address.
///
/// The ipv6 bit of the wire representation is derived from the ip field and
/// is not stored here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AddressFlags {
    /// The peer cannot accept inbound TCP connections.
    pub firewalled_tcp: bool,
    /// The peer cannot accept inbound UDP datagrams.
    pub firewalled_udp: bool,
    /// The peer is reachable through the relay sockets it advertises.
    pub relayed: bool,
    /// The relay path is a slow (buffered) one; senders should expect delays.
    pub slow: bool,
    /// The address was manually forwarded; the ip travels inside the header.
    pub forwarded: bool,
}

const FLAG_IPV6: u8 = 1;
const FLAG_FIREWALLED_UDP: u8 = 1 << 1;
const FLAG_FIREWALLED_TCP: u8 = 1 << 2;
const FLAG_RELAYED: u8 = 1 << 3;
const FLAG_SLOW: u8 = 1 << 4;
const FLAG_FORWARDED: u8 = 1 << 5;

impl AddressFlags {
    /// Decode from a wire flags byte. Reserved high bits are ignored.
    pub fn from_byte(byte: u8) -> Self {
        AddressFlags {
            firewalled_tcp: byte & FLAG_FIREWALLED_TCP != 0,
            firewalled_udp: byte & FLAG_FIREWALLED_UDP != 0,
            relayed: byte & FLAG_RELAYED != 0,
            slow: byte & FLAG_SLOW != 0,
            forwarded: byte & FLAG_FORWARDED != 0,
        }
    }

    fn to_byte(self, ipv6: bool) -> u8 {
        let mut byte = 0u8;
        if ipv6 {
            byte |= FLAG_IPV6;
        }
        if self.firewalled_udp {
            byte |= FLAG_FIREWALLED_UDP;
        }
        if self.firewalled_tcp {
            byte |= FLAG_FIREWALLED_TCP;
        }
        if self.relayed {
            byte |= FLAG_RELAYED;
        }
        if self.slow {
            byte |= FLAG_SLOW;
        }
        if self.forwarded {
            byte |= FLAG_FORWARDED;
        }
        byte
    }
}

/// True if the wire flags byte marks an IPv6 address.
pub fn flags_byte_is_ipv6(byte: u8) -> bool {
    byte & FLAG_IPV6 != 0
}

// ============================================================================
// PeerSocketAddress
// ============================================================================

/// A bare transport endpoint: ip plus both listener ports.
///
/// Peer addresses advertise their relay peers as a list of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerSocketAddress {
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl PeerSocketAddress {
    pub fn new(ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        PeerSocketAddress { ip, tcp_port, udp_port }
    }

    /// Serialized size: family byte, ip bytes, two ports.
    pub fn wire_len(&self) -> usize {
        let ip_len = if self.ip.is_ipv6() { 16 } else { 4 };
        1 + ip_len + 2 + 2
    }
}

impl fmt::Display for PeerSocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.tcp_port, self.udp_port)
    }
}

// ============================================================================
// PeerAddress
// ============================================================================

/// A peer id plus all transport coordinates needed to reach it.
///
/// Immutable; the `with_*` methods return changed copies. Equality, ordering
/// and hashing cover every field, so two addresses for the same id with
/// different flags compare unequal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddress {
    id: Id160,
    ip: IpAddr,
    tcp_port: u16,
    udp_port: u16,
    flags: AddressFlags,
    relays: Vec<PeerSocketAddress>,
}

impl PeerAddress {
    pub fn new(id: Id160, ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        PeerAddress {
            id,
            ip,
            tcp_port,
            udp_port,
            flags: AddressFlags::default(),
            relays: Vec::new(),
        }
    }

    /// An address that carries only the id, as a message recipient does on
    /// the wire.
    pub fn with_id_only(id: Id160) -> Self {
        PeerAddress::new(id, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0)
    }

    /// Reassemble an address from decoded header or neighbor fields. The
    /// relay list starts empty; the codec appends decoded relay sockets.
    pub fn from_wire_parts(
        id: Id160,
        ip: IpAddr,
        tcp_port: u16,
        udp_port: u16,
        flags: AddressFlags,
    ) -> Self {
        PeerAddress { id, ip, tcp_port, udp_port, flags, relays: Vec::new() }
    }

    pub fn id(&self) -> Id160 {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn flags(&self) -> AddressFlags {
        self.flags
    }

    pub fn relays(&self) -> &[PeerSocketAddress] {
        &self.relays
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    pub fn tcp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    /// The wire flags byte, with the ipv6 bit derived from the ip field.
    pub fn flags_byte(&self) -> u8 {
        self.flags.to_byte(self.is_ipv6())
    }

    /// This address as a bare endpoint, as relay peers are advertised.
    pub fn socket_address(&self) -> PeerSocketAddress {
        PeerSocketAddress::new(self.ip, self.tcp_port, self.udp_port)
    }

    /// Serialized size of the full wire form, deterministic from flags.
    pub fn wire_len(&self) -> usize {
        let ip_len = if self.is_ipv6() { 16 } else { 4 };
        let base = Id160::SIZE + 2 + 2 + 1 + ip_len;
        if self.flags.relayed {
            base + 1 + self.relays.iter().map(|r| r.wire_len()).sum::<usize>()
        } else {
            base
        }
    }

    pub fn with_id(&self, id: Id160) -> Self {
        let mut next = self.clone();
        next.id = id;
        next
    }

    pub fn with_firewalled_tcp(&self, firewalled: bool) -> Self {
        let mut next = self.clone();
        next.flags.firewalled_tcp = firewalled;
        next
    }

    pub fn with_firewalled_udp(&self, firewalled: bool) -> Self {
        let mut next = self.clone();
        next.flags.firewalled_udp = firewalled;
        next
    }

    /// Set the relayed flag. An address without the flag never serializes
    /// relay sockets.
    pub fn with_relayed(&self, relayed: bool) -> Self {
        let mut next = self.clone();
        next.flags.relayed = relayed;
        if !relayed {
            next.relays.clear();
        }
        next
    }

    pub fn with_slow(&self, slow: bool) -> Self {
        let mut next = self.clone();
        next.flags.slow = slow;
        next
    }

    pub fn with_forwarded(&self, forwarded: bool) -> Self {
        let mut next = self.clone();
        next.flags.forwarded = forwarded;
        next
    }

    /// Replace the relay socket list, truncated to [`MAX_RELAYS`].
    pub fn with_relays(&self, mut relays: Vec<PeerSocketAddress>) -> Self {
        relays.truncate(MAX_RELAYS);
        let mut next = self.clone();
        next.relays = relays;
        next
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}:{}/{}", self.id, self.ip, self.tcp_port, self.udp_port)?;
        if self.flags.relayed {
            write!(f, " relayed({})", self.relays.len())?;
        }
        if self.flags.firewalled_tcp || self.flags.firewalled_udp {
            write!(f, " firewalled")?;
        }
        Ok(())
    }
}

// ============================================================================
// LocalAddress
// ============================================================================

/// The shared cell holding a peer's currently published address.
///
/// Cheap to clone. The relay manager swaps in rewritten addresses as relays
/// come and go; everything that announces the peer reads the current value.
#[derive(Clone)]
pub struct LocalAddress(Arc<RwLock<PeerAddress>>);

impl LocalAddress {
    pub fn new(address: PeerAddress) -> Self {
        LocalAddress(Arc::new(RwLock::new(address)))
    }

    pub fn get(&self) -> PeerAddress {
        self.0.read().expect("address lock poisoned").clone()
    }

    pub fn set(&self, address: PeerAddress) {
        *self.0.write().expect("address lock poisoned") = address;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr(seed: u8) -> PeerAddress {
        let mut bytes = [0u8; 20];
        bytes[0] = seed;
        PeerAddress::new(
            Id160::from_bytes(bytes),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, seed)),
            7700,
            7701,
        )
    }

    #[test]
    fn id_round_trip_hex() {
        let id = Id160::random();
        let parsed = Id160::from_hex(&id.to_hex()).expect("hex parse");
        assert_eq!(id, parsed);

        assert!(Id160::from_hex("abcd").is_none());
        assert!(Id160::from_hex("zz").is_none());
    }

    #[test]
    fn id_ordering_is_bytewise() {
        assert!(Id160::ZERO < Id160::MAX);
        let mut low = [0u8; 20];
        low[19] = 1;
        let mut high = [0u8; 20];
        high[0] = 1;
        assert!(Id160::from_bytes(low) < Id160::from_bytes(high));
    }

    #[test]
    fn sha1_of_is_deterministic() {
        let a = Id160::sha1_of(b"payload");
        let b = Id160::sha1_of(b"payload");
        assert_eq!(a, b);
        assert_ne!(a, Id160::sha1_of(b"other"));
    }

    #[test]
    fn flags_byte_round_trip() {
        let flags = AddressFlags {
            firewalled_tcp: true,
            firewalled_udp: false,
            relayed: true,
            slow: false,
            forwarded: true,
        };
        let byte = flags.to_byte(false);
        assert_eq!(AddressFlags::from_byte(byte), flags);
        assert!(!flags_byte_is_ipv6(byte));
        assert!(flags_byte_is_ipv6(flags.to_byte(true)));
    }

    #[test]
    fn reserved_flag_bits_are_ignored() {
        let byte = 0b1100_0000;
        assert_eq!(AddressFlags::from_byte(byte), AddressFlags::default());
    }

    #[test]
    fn with_relays_caps_at_max() {
        let sockets: Vec<PeerSocketAddress> = (0..8)
            .map(|i| {
                PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)), 100 + i as u16, 200)
            })
            .collect();
        let addr = test_addr(1).with_relayed(true).with_relays(sockets);
        assert_eq!(addr.relays().len(), MAX_RELAYS);
    }

    #[test]
    fn with_methods_return_changed_copies() {
        let addr = test_addr(2);
        let changed = addr.with_firewalled_tcp(true).with_relayed(true);
        assert!(!addr.flags().firewalled_tcp);
        assert!(changed.flags().firewalled_tcp);
        assert!(changed.flags().relayed);
        assert_eq!(addr.id(), changed.id());
        assert_ne!(addr, changed);
    }

    #[test]
    fn clearing_relayed_drops_sockets() {
        let addr = test_addr(3)
            .with_relayed(true)
            .with_relays(vec![PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1, 2)]);
        assert_eq!(addr.relays().len(), 1);
        let cleared = addr.with_relayed(false);
        assert!(cleared.relays().is_empty());
    }

    #[test]
    fn wire_len_tracks_flags() {
        let v4 = test_addr(4);
        assert_eq!(v4.wire_len(), 20 + 2 + 2 + 1 + 4);

        let relayed = v4
            .with_relayed(true)
            .with_relays(vec![PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1, 2)]);
        assert_eq!(relayed.wire_len(), 29 + 1 + 9);
    }

    #[test]
    fn local_address_swaps() {
        let cell = LocalAddress::new(test_addr(5));
        let other = cell.clone();
        cell.set(test_addr(6));
        assert_eq!(other.get(), test_addr(6));
    }
}
