//! # Message Signing Primitives
//!
//! This module wraps the DSA-with-SHA1 operations the wire codec depends on:
//!
//! - [`KeyPair`]: a DSA signing key plus its cached X.509 `SubjectPublicKeyInfo`
//! - [`verify`]: signature verification against a DER-encoded public key
//! - [`validate_public_key`]: structural check used while decoding
//!
//! ## Signature Format
//!
//! A wire signature is the two raw 160-bit DSA components `(r, s)`, each
//! left-padded to 20 bytes and concatenated, 40 bytes in total. The ASN.1
//! framing produced by the signer is stripped before the components go on the
//! wire, and rebuilt before verification.
//!
//! Key generation uses the 1024/160 parameter size because the wire format
//! fixes the component width at 160 bits.

use std::fmt;

use dsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use dsa::{Components, KeySize, Signature, SigningKey, VerifyingKey};
use num_bigint_dig::BigUint;
use rand::rngs::OsRng;
use sha1::{Digest, Sha1};
use signature::{DigestSigner, DigestVerifier};

use crate::identity::Id160;

/// Size of a wire signature: two 160-bit components.
pub const SIGNATURE_SIZE: usize = 40;

/// Failure in key handling or signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoError {
    reason: String,
}

impl CryptoError {
    fn new(reason: impl Into<String>) -> Self {
        CryptoError { reason: reason.into() }
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "crypto failure: {}", self.reason)
    }
}

impl std::error::Error for CryptoError {}

/// A DSA key pair with its DER-encoded public half cached.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    public_der: Vec<u8>,
}

impl KeyPair {
    /// Generate a fresh 1024/160 key pair.
    ///
    /// Parameter generation is expensive (hundreds of milliseconds); peers
    /// normally do this once at startup.
    #[allow(deprecated)]
    pub fn generate() -> Result<Self, CryptoError> {
        let components = Components::generate(&mut OsRng, KeySize::DSA_1024_160);
        let signing_key = SigningKey::generate(&mut OsRng, components);
        Self::from_signing_key(signing_key)
    }

    fn from_signing_key(signing_key: SigningKey) -> Result<Self, CryptoError> {
        let public_der = signing_key
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| CryptoError::new(format!("public key encoding: {e}")))?
            .into_vec();
        Ok(KeyPair { signing_key, public_der })
    }

    /// The X.509 `SubjectPublicKeyInfo` encoding of the public key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// The peer id derived from this key: `SHA1(SubjectPublicKeyInfo)`.
    pub fn peer_id(&self) -> Id160 {
        Id160::sha1_of(&self.public_der)
    }

    /// Sign the concatenation of `parts` with SHA1-DSA and return the raw
    /// 40-byte component pair.
    pub fn sign(&self, parts: &[&[u8]]) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
        let mut digest = Sha1::new();
        for part in parts {
            digest.update(part);
        }
        let sig: Signature = self
            .signing_key
            .try_sign_digest(digest)
            .map_err(|e| CryptoError::new(format!("signing: {e}")))?;
        raw_components(&sig)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({:?})", self.peer_id())
    }
}

fn raw_components(sig: &Signature) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
    let mut raw = [0u8; SIGNATURE_SIZE];
    let r = sig.r().to_bytes_be();
    let s = sig.s().to_bytes_be();
    if r.len() > 20 || s.len() > 20 {
        // cannot happen with a 160-bit q
        return Err(CryptoError::new("signature component exceeds 160 bits"));
    }
    raw[20 - r.len()..20].copy_from_slice(&r);
    raw[40 - s.len()..].copy_from_slice(&s);
    Ok(raw)
}

/// Verify a raw 40-byte signature over `data` against a DER-encoded public
/// key. Any parse failure counts as verification failure.
pub fn verify(public_der: &[u8], data: &[u8], raw: &[u8; SIGNATURE_SIZE]) -> bool {
    let Ok(key) = VerifyingKey::from_public_key_der(public_der) else {
        return false;
    };
    let r = BigUint::from_bytes_be(&raw[..20]);
    let s = BigUint::from_bytes_be(&raw[20..]);
    let Ok(sig) = Signature::from_components(r, s) else {
        return false;
    };
    let mut digest = Sha1::new();
    digest.update(data);
    key.verify_digest(digest, &sig).is_ok()
}

/// Check that `der` parses as an X.509 DSA `SubjectPublicKeyInfo`.
pub fn validate_public_key(der: &[u8]) -> Result<(), CryptoError> {
    VerifyingKey::from_public_key_der(der)
        .map(|_| ())
        .map_err(|e| CryptoError::new(format!("public key parse: {e}")))
}

/// Shared key pair for unit tests; parameter generation is slow enough that
/// every test regenerating one would dominate the suite.
#[cfg(test)]
pub(crate) fn test_keypair() -> &'static KeyPair {
    static KEY: std::sync::OnceLock<KeyPair> = std::sync::OnceLock::new();
    KEY.get_or_init(|| KeyPair::generate().expect("key generation"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_keypair() -> &'static KeyPair {
        test_keypair()
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let key = shared_keypair();
        let sig = key.sign(&[b"hello ".as_slice(), b"world"]).expect("sign");
        assert!(verify(key.public_key_der(), b"hello world", &sig));
    }

    #[test]
    fn tampered_data_fails_verification() {
        let key = shared_keypair();
        let sig = key.sign(&[b"payload".as_slice()]).expect("sign");
        assert!(!verify(key.public_key_der(), b"payloaX", &sig));
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let key = shared_keypair();
        let mut sig = key.sign(&[b"payload".as_slice()]).expect("sign");
        sig[0] ^= 0x01;
        assert!(!verify(key.public_key_der(), b"payload", &sig));
    }

    #[test]
    fn garbage_public_key_rejected() {
        assert!(validate_public_key(&[0x30, 0x01, 0x00]).is_err());
        let sig = [0u8; SIGNATURE_SIZE];
        assert!(!verify(&[1, 2, 3], b"data", &sig));
    }

    #[test]
    fn peer_id_is_key_digest() {
        let key = shared_keypair();
        assert_eq!(key.peer_id(), Id160::sha1_of(key.public_key_der()));
    }
}
