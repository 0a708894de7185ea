//! # Binary Wire Codec
//!
//! Serializes [`Message`] values to the overlay wire format and back. The
//! format is a fixed 64-byte header followed by up to four typed payload
//! slots and, for signed messages, a trailing 40-byte DSA signature.
//!
//! ## Header Layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | version |
//! | 4 | 4 | message id |
//! | 8 | 1 | `(type << 4) \| command` |
//! | 9 | 20 | sender id |
//! | 29 | 2 | sender TCP port |
//! | 31 | 2 | sender UDP port |
//! | 33 | 20 | recipient id |
//! | 53 | 4 | content length |
//! | 57 | 2 | packed content type nibbles, slot 1 lowest |
//! | 59 | 1 | sender flags byte |
//! | 60 | 4 | forwarded IPv4 sender address, or zero |
//!
//! All integers are big-endian. The recipient travels id-only; the sender's
//! ip is normally taken from the socket, except for manually forwarded IPv4
//! peers whose address rides in the last header word.
//!
//! ## Signing
//!
//! A message with a [`Content::PublicKeySignature`] slot is signed: after all
//! payload slots are written, SHA1-DSA runs over every byte emitted so far
//! (header included) and the two 160-bit signature components are appended
//! raw. The declared content length already accounts for those 40 bytes, so
//! the header never needs patching after the fact. On decode the verifier
//! runs over the buffer prefix up to the signature itself; a bad signature
//! leaves the message's public key unset but does not abort decoding.
//!
//! ## Errors
//!
//! Decoding is total over untrusted input: every length is checked before
//! use and failures name the offending field. A failed message is discarded
//! by the transport; the connection survives where it can.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tracing::debug;

use crate::crypto::{self, SIGNATURE_SIZE};
use crate::identity::{
    flags_byte_is_ipv6, AddressFlags, Id160, PeerAddress, PeerSocketAddress,
};
use crate::messages::{
    Command, Content, Data, DataKey, Message, MessageType, Payload, MAX_NEIGHBORS,
};

/// Exact size of the fixed message header.
pub const HEADER_SIZE: usize = 64;

/// Cap on `peer -> data` map entries; the count travels as a single byte.
const MAX_BYTE: usize = 255;

/// Length sentinel meaning "this data atom reuses the message-level key".
const INHERIT_KEY_SENTINEL: u16 = 0xffff;

// ============================================================================
// Errors
// ============================================================================

/// Failure while producing wire bytes.
#[derive(Debug)]
pub enum EncodeError {
    /// The message carries a signature slot but no signing key.
    MissingSignKey,
    /// The signer itself failed.
    Signing(crypto::CryptoError),
    /// A value does not fit its wire length field.
    Oversize { field: &'static str },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::MissingSignKey => {
                write!(f, "message requests signing but carries no private key")
            }
            EncodeError::Signing(e) => write!(f, "signing failed: {e}"),
            EncodeError::Oversize { field } => {
                write!(f, "{field} does not fit its length field")
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Failure while reading wire bytes; names the field that broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended inside the named field.
    Truncated { field: &'static str },
    /// A relay socket carried an address family byte that is neither v4 nor v6.
    UnknownAddressFamily { value: u8 },
    /// A public key field did not parse as X.509 SubjectPublicKeyInfo.
    InvalidPublicKey { field: &'static str },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { field } => write!(f, "buffer ended inside {field}"),
            DecodeError::UnknownAddressFamily { value } => {
                write!(f, "unknown address family {value:#04x}")
            }
            DecodeError::InvalidPublicKey { field } => {
                write!(f, "unparseable public key in {field}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Encoding
// ============================================================================

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Encode a message to its complete wire form, signing when requested.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut payload = Vec::new();
    let mut content_length: u32 = 0;
    for slot in message.slots() {
        content_length += encode_payload(slot, &mut payload, message)?;
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() + SIGNATURE_SIZE);
    encode_header(&mut out, message, content_length);
    out.extend_from_slice(&payload);

    if message.sign_pending() {
        let key = message.sign_key().ok_or(EncodeError::MissingSignKey)?;
        let signature = key.sign(&[out.as_slice()]).map_err(EncodeError::Signing)?;
        out.extend_from_slice(&signature);
    }
    Ok(out)
}

fn encode_header(out: &mut Vec<u8>, message: &Message, content_length: u32) {
    put_u32(out, message.version());
    put_u32(out, message.id());
    out.push((message.message_type().as_nibble() << 4) | message.command().as_nibble());
    out.extend_from_slice(message.sender().id().as_bytes());
    put_u16(out, message.sender().tcp_port());
    put_u16(out, message.sender().udp_port());
    out.extend_from_slice(message.recipient().id().as_bytes());
    put_u32(out, content_length);
    let types = message.content_types();
    let packed = ((types[3].as_nibble() as u16) << 12)
        | ((types[2].as_nibble() as u16) << 8)
        | ((types[1].as_nibble() as u16) << 4)
        | (types[0].as_nibble() as u16);
    put_u16(out, packed);
    out.push(message.sender().flags_byte());
    match message.sender().ip() {
        IpAddr::V4(v4) if message.sender().flags().forwarded => {
            out.extend_from_slice(&v4.octets());
        }
        _ => put_u32(out, 0),
    }
    debug_assert_eq!(out.len(), HEADER_SIZE);
}

/// Write one payload slot and return the byte count it contributes to the
/// declared content length. A signature slot reserves the 40 trailing
/// signature bytes here, before the header is ever written.
fn encode_payload(
    payload: &Payload,
    out: &mut Vec<u8>,
    message: &Message,
) -> Result<u32, EncodeError> {
    match payload {
        Payload::Key(key) => {
            out.extend_from_slice(key.as_bytes());
            Ok(20)
        }
        Payload::KeyKey(key1, key2) => {
            out.extend_from_slice(key1.as_bytes());
            out.extend_from_slice(key2.as_bytes());
            Ok(40)
        }
        Payload::DataMap(map) => {
            put_u32(out, map.len() as u32);
            let mut count = 4u32;
            for (key, data) in map {
                out.extend_from_slice(key.as_bytes());
                count += 20;
                count += encode_data(data, out)?;
            }
            Ok(count)
        }
        Payload::KeyMap(map) => {
            put_u32(out, map.len() as u32);
            for (key, value) in map {
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(value.as_bytes());
            }
            Ok(4 + map.len() as u32 * 40)
        }
        Payload::Keys(keys) => {
            put_u32(out, keys.len() as u32);
            for key in keys {
                out.extend_from_slice(key.as_bytes());
            }
            Ok(4 + keys.len() as u32 * 20)
        }
        Payload::Neighbors(neighbors) => {
            let size = neighbors
                .len()
                .min(message.neighbor_limit())
                .min(MAX_NEIGHBORS);
            out.push(size as u8);
            let mut count = 1u32;
            for address in neighbors.iter().take(size) {
                count += encode_peer_address(address, out);
            }
            Ok(count)
        }
        Payload::Buffer(bytes) => {
            if bytes.len() > u32::MAX as usize {
                return Err(EncodeError::Oversize { field: "channel buffer" });
            }
            put_u32(out, bytes.len() as u32);
            out.extend_from_slice(bytes);
            Ok(4 + bytes.len() as u32)
        }
        Payload::Long(value) => {
            out.extend_from_slice(&value.to_be_bytes());
            Ok(8)
        }
        Payload::Integer(value) => {
            out.extend_from_slice(&value.to_be_bytes());
            Ok(4)
        }
        Payload::PeerDataMap(map) => {
            let size = map.len().min(MAX_BYTE);
            out.push(size as u8);
            let mut count = 1u32;
            for (address, data) in map.iter().take(size) {
                count += encode_peer_address(address, out);
                count += encode_data(data, out)?;
            }
            Ok(count)
        }
        Payload::PublicKey(der) => {
            let len = public_key_len(der)?;
            put_u16(out, len);
            out.extend_from_slice(der);
            Ok(2 + len as u32)
        }
        Payload::PublicKeySignature(der) => {
            let len = public_key_len(der)?;
            put_u16(out, len);
            out.extend_from_slice(der);
            // 40 bytes for the signature, which comes after all payload
            Ok(SIGNATURE_SIZE as u32 + 2 + len as u32)
        }
    }
}

fn public_key_len(der: &[u8]) -> Result<u16, EncodeError> {
    if der.len() >= INHERIT_KEY_SENTINEL as usize {
        return Err(EncodeError::Oversize { field: "public key" });
    }
    Ok(der.len() as u16)
}

/// Data atom wire form: an 11-byte prefix (ttl with the protection bit, value
/// length, public key length, signature length) followed by the value, key,
/// and signature bytes.
fn encode_data(data: &Data, out: &mut Vec<u8>) -> Result<u32, EncodeError> {
    if data.value().len() > u32::MAX as usize {
        return Err(EncodeError::Oversize { field: "data value" });
    }
    let mut count = 11u32 + data.value().len() as u32;

    let ttl = if data.is_protected() {
        data.ttl_seconds() | 0x8000_0000
    } else {
        data.ttl_seconds()
    };
    put_u32(out, ttl);
    put_u32(out, data.value().len() as u32);

    let supplied_key = match data.public_key() {
        None => {
            put_u16(out, 0);
            None
        }
        Some(DataKey::FromMessage) => {
            put_u16(out, INHERIT_KEY_SENTINEL);
            None
        }
        Some(DataKey::Supplied(der)) => {
            let len = public_key_len(der)?;
            put_u16(out, len);
            count += len as u32;
            Some(der.as_slice())
        }
    };

    let signature = data.signature().filter(|s| !s.is_empty());
    match signature {
        None => out.push(0),
        Some(sig) => {
            if sig.len() > MAX_BYTE {
                return Err(EncodeError::Oversize { field: "data signature" });
            }
            out.push(sig.len() as u8);
            count += sig.len() as u32;
        }
    }

    out.extend_from_slice(data.value());
    if let Some(der) = supplied_key {
        out.extend_from_slice(der);
    }
    if let Some(sig) = signature {
        out.extend_from_slice(sig);
    }
    Ok(count)
}

fn encode_peer_address(address: &PeerAddress, out: &mut Vec<u8>) -> u32 {
    out.extend_from_slice(address.id().as_bytes());
    put_u16(out, address.tcp_port());
    put_u16(out, address.udp_port());
    out.push(address.flags_byte());
    match address.ip() {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
    if address.flags().relayed {
        out.push(address.relays().len() as u8);
        for relay in address.relays() {
            encode_peer_socket(relay, out);
        }
    }
    address.wire_len() as u32
}

fn encode_peer_socket(socket: &PeerSocketAddress, out: &mut Vec<u8>) {
    match socket.ip {
        IpAddr::V4(v4) => {
            out.push(0);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(1);
            out.extend_from_slice(&v6.octets());
        }
    }
    put_u16(out, socket.tcp_port);
    put_u16(out, socket.udp_port);
}

// ============================================================================
// Decoding
// ============================================================================

/// Bounds-checked big-endian reader over an untrusted buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        if len > self.buf.len() - self.pos {
            return Err(DecodeError::Truncated { field });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, DecodeError> {
        Ok(self.u32(field)? as i32)
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, DecodeError> {
        let bytes = self.take(8, field)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    fn id(&mut self, field: &'static str) -> Result<Id160, DecodeError> {
        let bytes = self.take(Id160::SIZE, field)?;
        let mut raw = [0u8; Id160::SIZE];
        raw.copy_from_slice(bytes);
        Ok(Id160::from_bytes(raw))
    }

    fn ipv4(&mut self, field: &'static str) -> Result<Ipv4Addr, DecodeError> {
        let bytes = self.take(4, field)?;
        Ok(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
    }

    fn ipv6(&mut self, field: &'static str) -> Result<Ipv6Addr, DecodeError> {
        let bytes = self.take(16, field)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(Ipv6Addr::from(raw))
    }

    fn position(&self) -> usize {
        self.pos
    }

    /// The already-consumed prefix, what a message signature covers.
    fn consumed(&self, end: usize) -> &'a [u8] {
        &self.buf[..end]
    }
}

/// Decode one complete message. `remote` is the address the socket observed,
/// which becomes the sender's ip unless the header carries a forwarded one,
/// and is recorded separately for NAT detection either way.
pub fn decode(buffer: &[u8], remote: SocketAddr) -> Result<Message, DecodeError> {
    let mut reader = Reader::new(buffer);

    let version = reader.u32("version")?;
    let id = reader.u32("message id")?;
    let type_command = reader.u8("type and command")?;
    let message_type = MessageType::from_nibble(type_command >> 4);
    let command = Command::from_nibble(type_command & 0x0f);
    let sender_id = reader.id("sender id")?;
    let tcp_port = reader.u16("sender tcp port")?;
    let udp_port = reader.u16("sender udp port")?;
    let recipient_id = reader.id("recipient id")?;
    let content_length = reader.u32("content length")?;
    let packed = reader.u16("content types")?;
    let flags_byte = reader.u8("sender flags")?;
    let forwarded = reader.ipv4("forwarded sender address")?;

    let sender_ip = if forwarded.octets() != [0u8; 4] {
        IpAddr::V4(forwarded)
    } else {
        remote.ip()
    };
    let sender = PeerAddress::from_wire_parts(
        sender_id,
        sender_ip,
        tcp_port,
        udp_port,
        AddressFlags::from_byte(flags_byte),
    );

    let mut message = Message::new(
        version,
        id,
        command,
        message_type,
        sender,
        PeerAddress::with_id_only(recipient_id),
    );
    message.set_real_sender(PeerAddress::new(sender_id, remote.ip(), tcp_port, udp_port));
    message.set_content_length(content_length);

    let types = [
        Content::from_nibble((packed & 0x0f) as u8),
        Content::from_nibble(((packed >> 4) & 0x0f) as u8),
        Content::from_nibble(((packed >> 8) & 0x0f) as u8),
        Content::from_nibble((packed >> 12) as u8),
    ];
    for content in types {
        decode_payload(content, &mut reader, &mut message)?;
    }
    Ok(message)
}

fn decode_payload(
    content: Content,
    reader: &mut Reader<'_>,
    message: &mut Message,
) -> Result<(), DecodeError> {
    match content {
        Content::Empty | Content::Reserved1 | Content::Reserved2 | Content::Reserved3 => {}
        Content::Key => {
            let key = reader.id("key")?;
            message.add_payload(Payload::Key(key));
        }
        Content::KeyKey => {
            let key1 = reader.id("first key")?;
            let key2 = reader.id("second key")?;
            message.add_payload(Payload::KeyKey(key1, key2));
        }
        Content::MapKeyData => {
            let size = reader.u32("data map size")?;
            let mut map = BTreeMap::new();
            for _ in 0..size {
                let key = reader.id("data map key")?;
                let data = decode_data(reader)?;
                map.insert(key, data);
            }
            message.add_payload(Payload::DataMap(map));
        }
        Content::MapKeyKey => {
            let size = reader.u32("key map size")?;
            let mut map = BTreeMap::new();
            for _ in 0..size {
                let key = reader.id("key map key")?;
                let value = reader.id("key map value")?;
                map.insert(key, value);
            }
            message.add_payload(Payload::KeyMap(map));
        }
        Content::SetKeys => {
            let size = reader.u32("key set size")?;
            let mut keys = Vec::new();
            for _ in 0..size {
                keys.push(reader.id("key set entry")?);
            }
            message.add_payload(Payload::Keys(keys));
        }
        Content::SetNeighbors => {
            let size = reader.u8("neighbor count")? as usize;
            let mut neighbors = Vec::with_capacity(size.min(MAX_NEIGHBORS));
            for _ in 0..size {
                neighbors.push(decode_peer_address(reader)?);
            }
            message.add_payload(Payload::Neighbors(neighbors));
        }
        Content::ChannelBuffer => {
            let len = reader.u32("channel buffer length")? as usize;
            let bytes = reader.take(len, "channel buffer")?.to_vec();
            message.add_payload(Payload::Buffer(bytes));
        }
        Content::Long => {
            let value = reader.i64("long value")?;
            message.add_payload(Payload::Long(value));
        }
        Content::Integer => {
            let value = reader.i32("integer value")?;
            message.add_payload(Payload::Integer(value));
        }
        Content::MapPeerData => {
            let size = reader.u8("peer data map size")? as usize;
            let mut map = BTreeMap::new();
            for _ in 0..size {
                let address = decode_peer_address(reader)?;
                let data = decode_data(reader)?;
                map.insert(address, data);
            }
            message.add_payload(Payload::PeerDataMap(map));
        }
        Content::PublicKey => {
            let len = reader.u16("message public key length")? as usize;
            let der = reader.take(len, "message public key")?.to_vec();
            crypto::validate_public_key(&der)
                .map_err(|_| DecodeError::InvalidPublicKey { field: "message public key" })?;
            message.set_public_key(der);
        }
        Content::PublicKeySignature => {
            let len = reader.u16("message public key length")? as usize;
            let der = reader.take(len, "message public key")?.to_vec();
            crypto::validate_public_key(&der)
                .map_err(|_| DecodeError::InvalidPublicKey { field: "message public key" })?;

            let signed_end = reader.position();
            let raw = reader.take(SIGNATURE_SIZE, "signature")?;
            let mut signature = [0u8; SIGNATURE_SIZE];
            signature.copy_from_slice(raw);

            if crypto::verify(&der, reader.consumed(signed_end), &signature) {
                message.set_verified_public_key(der.clone());
            } else {
                // key stays unset; handlers decide whether to reject
                debug!("message signature failed verification");
            }
            message.add_payload(Payload::PublicKeySignature(der));
        }
    }
    Ok(())
}

fn decode_data(reader: &mut Reader<'_>) -> Result<Data, DecodeError> {
    let ttl_raw = reader.u32("data ttl")?;
    let value_len = reader.u32("data value length")? as usize;
    let key_len = reader.u16("data public key length")?;
    let signature_len = reader.u8("data signature length")? as usize;

    let value = reader.take(value_len, "data value")?.to_vec();
    let mut data = Data::new(value)
        .with_ttl(ttl_raw & 0x7fff_ffff)
        .with_protected(ttl_raw & 0x8000_0000 != 0);

    if key_len == INHERIT_KEY_SENTINEL {
        data = data.with_public_key(DataKey::FromMessage);
    } else if key_len > 0 {
        let der = reader.take(key_len as usize, "data public key")?.to_vec();
        crypto::validate_public_key(&der)
            .map_err(|_| DecodeError::InvalidPublicKey { field: "data public key" })?;
        data = data.with_public_key(DataKey::Supplied(der));
    }
    if signature_len > 0 {
        let signature = reader.take(signature_len, "data signature")?.to_vec();
        data = data.with_signature(signature);
    }
    Ok(data)
}

fn decode_peer_address(reader: &mut Reader<'_>) -> Result<PeerAddress, DecodeError> {
    let id = reader.id("peer id")?;
    let tcp_port = reader.u16("peer tcp port")?;
    let udp_port = reader.u16("peer udp port")?;
    let flags_byte = reader.u8("peer flags")?;
    let ip = if flags_byte_is_ipv6(flags_byte) {
        IpAddr::V6(reader.ipv6("peer ip")?)
    } else {
        IpAddr::V4(reader.ipv4("peer ip")?)
    };
    let flags = AddressFlags::from_byte(flags_byte);
    let mut address = PeerAddress::from_wire_parts(id, ip, tcp_port, udp_port, flags);
    if flags.relayed {
        let count = reader.u8("relay count")? as usize;
        let mut relays = Vec::with_capacity(count.min(crate::identity::MAX_RELAYS));
        for _ in 0..count {
            relays.push(decode_peer_socket(reader)?);
        }
        address = address.with_relays(relays);
    }
    Ok(address)
}

fn decode_peer_socket(reader: &mut Reader<'_>) -> Result<PeerSocketAddress, DecodeError> {
    let family = reader.u8("relay address family")?;
    let ip = match family {
        0 => IpAddr::V4(reader.ipv4("relay ip")?),
        1 => IpAddr::V6(reader.ipv6("relay ip")?),
        value => return Err(DecodeError::UnknownAddressFamily { value }),
    };
    let tcp_port = reader.u16("relay tcp port")?;
    let udp_port = reader.u16("relay udp port")?;
    Ok(PeerSocketAddress::new(ip, tcp_port, udp_port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keypair;
    use crate::identity::MAX_RELAYS;

    const VERSION: u32 = 0x0102_0304;

    fn remote_for(sender: &PeerAddress) -> SocketAddr {
        SocketAddr::new(sender.ip(), sender.udp_port())
    }

    fn addr(seed: u8) -> PeerAddress {
        let mut bytes = [0u8; 20];
        bytes[0] = seed;
        PeerAddress::new(
            Id160::from_bytes(bytes),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            7070,
            7070,
        )
    }

    fn round_trip(message: &Message) -> Message {
        let bytes = encode(message).expect("encode");
        assert_eq!(
            bytes.len() - HEADER_SIZE,
            u32::from_be_bytes(bytes[53..57].try_into().unwrap()) as usize,
            "declared content length must match emitted payload bytes"
        );
        decode(&bytes, remote_for(message.sender())).expect("decode")
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let sender = addr(0);
        let message = Message::new(
            VERSION,
            0x0506_0708,
            Command::Ping,
            MessageType::Request1,
            PeerAddress::new(Id160::ZERO, sender.ip(), 7070, 7070),
            PeerAddress::with_id_only(Id160::MAX),
        );
        let bytes = encode(&message).expect("encode");

        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..8], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(bytes[8], 0x00);
        assert_eq!(&bytes[9..29], &[0u8; 20]);
        assert_eq!(&bytes[29..31], &[0x1b, 0x9e]); // 7070
        assert_eq!(&bytes[33..53], &[0xffu8; 20]);
        assert_eq!(&bytes[53..57], &[0, 0, 0, 0]);
        assert_eq!(&bytes[60..64], &[0, 0, 0, 0]);

        let decoded = decode(&bytes, "127.0.0.1:7070".parse().unwrap()).expect("decode");
        assert_eq!(decoded, message);
        assert_eq!(decoded.real_sender().unwrap().udp_port(), 7070);
    }

    #[test]
    fn forwarded_sender_rides_in_header() {
        let forwarded_ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        let sender = PeerAddress::new(Id160::random(), forwarded_ip, 1000, 1001)
            .with_forwarded(true);
        let message = Message::new(
            VERSION,
            1,
            Command::Ping,
            MessageType::Request1,
            sender,
            PeerAddress::with_id_only(Id160::random()),
        );
        let bytes = encode(&message).expect("encode");
        assert_eq!(&bytes[60..64], &[203, 0, 113, 9]);

        // decoded from a different observed socket, the forwarded ip wins
        let decoded = decode(&bytes, "10.0.0.1:9".parse().unwrap()).expect("decode");
        assert_eq!(decoded.sender().ip(), forwarded_ip);
        assert_eq!(decoded.real_sender().unwrap().ip(), "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn key_payloads_round_trip() {
        let mut message = Message::new(
            VERSION,
            2,
            Command::Get,
            MessageType::Request2,
            addr(1),
            PeerAddress::with_id_only(Id160::random()),
        );
        let mut key_map = BTreeMap::new();
        key_map.insert(Id160::random(), Id160::random());
        key_map.insert(Id160::random(), Id160::random());
        message
            .set_key(Id160::random())
            .set_key_key(Id160::ZERO, Id160::MAX)
            .set_keys(vec![Id160::random(), Id160::random(), Id160::random()])
            .set_key_map(key_map);

        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn scalar_payloads_round_trip() {
        let mut message = Message::new(
            VERSION,
            3,
            Command::DirectData,
            MessageType::Request1,
            addr(2),
            PeerAddress::with_id_only(Id160::random()),
        );
        message
            .set_buffer(vec![0xde, 0xad, 0xbe, 0xef])
            .set_long(-77)
            .set_integer(i32::MIN);

        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn neighbors_round_trip_with_relays_and_ipv6() {
        let relayed = PeerAddress::new(
            Id160::random(),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            100,
            101,
        )
        .with_relayed(true)
        .with_firewalled_tcp(true)
        .with_firewalled_udp(true)
        .with_relays(vec![
            PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), 10, 11),
            PeerSocketAddress::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 12, 13),
        ]);
        let v6_peer = PeerAddress::new(Id160::random(), IpAddr::V6(Ipv6Addr::LOCALHOST), 1, 2);

        let mut message = Message::new(
            VERSION,
            4,
            Command::Neighbors,
            MessageType::Ok,
            addr(3),
            PeerAddress::with_id_only(Id160::random()),
        );
        message.set_neighbors(vec![relayed, v6_peer, addr(4)]);

        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn neighbor_overflow_caps_at_255() {
        let mut message = Message::new(
            VERSION,
            5,
            Command::Neighbors,
            MessageType::Ok,
            addr(5),
            PeerAddress::with_id_only(Id160::random()),
        );
        message.set_neighbors((0..300).map(|i| addr((i % 200) as u8)).collect());

        let bytes = encode(&message).expect("encode");
        assert_eq!(bytes[HEADER_SIZE], 255, "first payload byte is the capped count");

        let decoded = decode(&bytes, remote_for(message.sender())).expect("decode");
        assert_eq!(decoded.neighbors().unwrap().len(), 255);
    }

    #[test]
    fn neighbor_limit_caps_below_255() {
        let mut message = Message::new(
            VERSION,
            6,
            Command::Neighbors,
            MessageType::Ok,
            addr(6),
            PeerAddress::with_id_only(Id160::random()),
        );
        message.set_neighbors((0..20).map(|i| addr(i as u8)).collect());
        message.set_neighbor_limit(3);

        let bytes = encode(&message).expect("encode");
        assert_eq!(bytes[HEADER_SIZE], 3);
    }

    #[test]
    fn data_maps_round_trip() {
        let key = test_keypair();
        let protected = Data::new(b"guarded".to_vec())
            .with_ttl(3600)
            .with_protected(true)
            .with_public_key(DataKey::Supplied(key.public_key_der().to_vec()))
            .with_signature(vec![7; 46]);
        let plain = Data::new(Vec::new()).with_ttl(5);

        let mut data_map = BTreeMap::new();
        data_map.insert(Id160::random(), protected.clone());
        data_map.insert(Id160::random(), plain);

        let mut peer_map = BTreeMap::new();
        peer_map.insert(addr(7), protected);
        peer_map.insert(addr(8), Data::new(b"x".to_vec()));

        let mut message = Message::new(
            VERSION,
            7,
            Command::TrackerGet,
            MessageType::Ok,
            addr(9),
            PeerAddress::with_id_only(Id160::random()),
        );
        message.set_data_map(data_map).set_peer_data_map(peer_map);

        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn unsigned_public_key_round_trips() {
        let key = test_keypair();
        let mut message = Message::new(
            VERSION,
            8,
            Command::Put,
            MessageType::Request1,
            addr(10),
            PeerAddress::with_id_only(Id160::random()),
        );
        message.set_public_key(key.public_key_der().to_vec());

        let decoded = round_trip(&message);
        assert_eq!(decoded, message);
        assert_eq!(decoded.public_key(), Some(key.public_key_der()));
    }

    #[test]
    fn signed_message_verifies_and_survives_round_trip() {
        let key = test_keypair();
        let mut message = Message::new(
            VERSION,
            9,
            Command::TrackerAdd,
            MessageType::Request1,
            addr(11),
            PeerAddress::with_id_only(Id160::random()),
        );
        message.set_integer(42);
        message.set_public_key_and_sign(key);

        let bytes = encode(&message).expect("encode");
        let payload_len = bytes.len() - HEADER_SIZE;
        let declared = u32::from_be_bytes(bytes[53..57].try_into().unwrap()) as usize;
        assert_eq!(declared, payload_len, "content length includes the 40 signature bytes");
        assert_eq!(declared, 4 + 2 + key.public_key_der().len() + SIGNATURE_SIZE);

        let decoded = decode(&bytes, remote_for(message.sender())).expect("decode");
        assert_eq!(decoded.public_key(), Some(key.public_key_der()));
        assert_eq!(decoded.int_value(), Some(42));
        assert_eq!(decoded, message);
    }

    #[test]
    fn any_single_byte_flip_breaks_verification() {
        let key = test_keypair();
        let mut message = Message::new(
            VERSION,
            10,
            Command::TrackerAdd,
            MessageType::Request1,
            addr(12),
            PeerAddress::with_id_only(Id160::random()),
        );
        message.set_integer(42);
        message.set_public_key_and_sign(key);
        let bytes = encode(&message).expect("encode");

        let remote = remote_for(message.sender());
        for position in 0..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[position] ^= 0x01;
            match decode(&tampered, remote) {
                // structural damage is an acceptable outcome of tampering
                Err(_) => {}
                Ok(decoded) => assert!(
                    decoded.public_key().is_none(),
                    "flip at byte {position} still verified"
                ),
            }
        }
    }

    #[test]
    fn inherited_data_key_resolves_after_verification() {
        let key = test_keypair();
        let mut data_map = BTreeMap::new();
        data_map.insert(
            Id160::random(),
            Data::new(b"entry".to_vec()).with_public_key(DataKey::FromMessage),
        );

        let mut message = Message::new(
            VERSION,
            11,
            Command::TrackerAdd,
            MessageType::Request1,
            addr(13),
            PeerAddress::with_id_only(Id160::random()),
        );
        message.set_data_map(data_map);
        message.set_public_key_and_sign(key);

        let decoded = round_trip(&message);
        assert_eq!(decoded, message);
        let data = decoded.data_map().unwrap().values().next().unwrap();
        assert_eq!(data.public_key(), Some(&DataKey::FromMessage));
        assert_eq!(data.resolved_public_key(&decoded), Some(key.public_key_der()));
    }

    #[test]
    fn signing_without_key_is_an_error() {
        let key = test_keypair();
        let mut message = Message::new(
            VERSION,
            12,
            Command::Put,
            MessageType::Request1,
            addr(14),
            PeerAddress::with_id_only(Id160::random()),
        );
        // a bare signature slot, as a decoder would produce it
        message.add_payload(Payload::PublicKeySignature(key.public_key_der().to_vec()));
        assert!(matches!(encode(&message), Err(EncodeError::MissingSignKey)));
    }

    #[test]
    fn truncation_names_the_field() {
        let mut message = Message::new(
            VERSION,
            13,
            Command::Get,
            MessageType::Request1,
            addr(15),
            PeerAddress::with_id_only(Id160::random()),
        );
        message.set_buffer(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let bytes = encode(&message).expect("encode");
        let remote = remote_for(message.sender());

        assert_eq!(
            decode(&bytes[..40], remote),
            Err(DecodeError::Truncated { field: "recipient id" })
        );
        assert_eq!(
            decode(&bytes[..bytes.len() - 2], remote),
            Err(DecodeError::Truncated { field: "channel buffer" })
        );
    }

    #[test]
    fn reserved_content_types_decode_without_payload() {
        let message = Message::new(
            VERSION,
            14,
            Command::Sync,
            MessageType::User1,
            addr(16),
            PeerAddress::with_id_only(Id160::random()),
        );
        let mut bytes = encode(&message).expect("encode");
        // claim a reserved content type in slot 1
        bytes[57..59].copy_from_slice(&(Content::Reserved2.as_nibble() as u16).to_be_bytes());

        let decoded = decode(&bytes, remote_for(message.sender())).expect("decode");
        assert!(decoded.slots().is_empty());
        assert_eq!(decoded.command(), Command::Sync);
    }

    #[test]
    fn bad_relay_family_is_an_error() {
        let relayed = PeerAddress::new(Id160::random(), IpAddr::V4(Ipv4Addr::LOCALHOST), 1, 2)
            .with_relayed(true)
            .with_relays(vec![PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3, 4)]);
        let mut message = Message::new(
            VERSION,
            15,
            Command::Neighbors,
            MessageType::Ok,
            addr(17),
            PeerAddress::with_id_only(Id160::random()),
        );
        message.set_neighbors(vec![relayed]);
        let mut bytes = encode(&message).expect("encode");

        // the family byte of the first relay socket follows the neighbor base
        let family_at = HEADER_SIZE + 1 + 29 + 1;
        assert_eq!(bytes[family_at], 0);
        bytes[family_at] = 9;
        assert_eq!(
            decode(&bytes, remote_for(message.sender())),
            Err(DecodeError::UnknownAddressFamily { value: 9 })
        );
    }

    #[test]
    fn relay_list_round_trips_at_max() {
        let mut message = Message::new(
            VERSION,
            16,
            Command::Neighbors,
            MessageType::Ok,
            addr(18),
            PeerAddress::with_id_only(Id160::random()),
        );
        let relays: Vec<PeerSocketAddress> = (0..MAX_RELAYS)
            .map(|i| PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i as u8)), 1, 2))
            .collect();
        let neighbor = PeerAddress::new(Id160::random(), IpAddr::V4(Ipv4Addr::LOCALHOST), 1, 2)
            .with_relayed(true)
            .with_relays(relays);
        message.set_neighbors(vec![neighbor.clone()]);

        let decoded = round_trip(&message);
        assert_eq!(decoded.neighbors().unwrap()[0].relays().len(), MAX_RELAYS);
        assert_eq!(decoded.neighbors().unwrap()[0], neighbor);
    }
}
