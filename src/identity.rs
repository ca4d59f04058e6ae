//! # Identity and Peer Records
//!
//! Core identity types for the transport:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PeerIdentity`]: the 32-byte public key identifying a peer
//! - [`Address`]: 20-byte routing key derived from the public key
//! - [`Peer`] / [`BoundPeer`]: unbound and network-addressable peer records
//!
//! ## Identity Model
//!
//! A peer IS its Ed25519 public key. The routing [`Address`] is the first
//! 20 bytes of `blake3(public_key)` and is the key the Kademlia table
//! organizes peers by. Equality and hashing of identities use the raw
//! public key bytes.
//!
//! Only a [`BoundPeer`] (peer + endpoint) is addressable by the transport;
//! an unbound [`Peer`] is what travels in the envelope's sender frame.

use std::net::{IpAddr, SocketAddr};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::version::AppProtocolVersion;

/// Length of a routing address in bytes (160-bit keyspace).
pub const ADDRESS_LEN: usize = 20;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().to_hex())
            .finish_non_exhaustive()
    }
}

/// A peer's public key. Equality and hashing use the raw key bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerIdentity([u8; 32]);

impl PeerIdentity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The 20-byte routing address derived from this key.
    pub fn address(&self) -> Address {
        Address::from_public_key(&self.0)
    }

    /// Interpret the raw bytes as an Ed25519 verifying key.
    /// Returns `None` if the bytes are not a valid curve point.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::try_from(self.0.as_slice()).ok()
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerIdentity({})", hex::encode(&self.0[..8]))
    }
}

/// 20-byte Kademlia routing key: the leading bytes of `blake3(public_key)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    #[inline]
    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let digest = blake3::hash(public_key);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest.as_bytes()[..ADDRESS_LEN]);
        Self(out)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Address) -> [u8; ADDRESS_LEN] {
        let mut out = [0u8; ADDRESS_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", hex::encode(&self.0[..6]))
    }
}

/// Compare two XOR distances as 160-bit big-endian integers.
pub(crate) fn distance_cmp(a: &[u8; ADDRESS_LEN], b: &[u8; ADDRESS_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// An unbound peer: identity, declared protocol version, and the public IP
/// it believes it is reachable at (if any).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub identity: PeerIdentity,
    pub app_version: AppProtocolVersion,
    pub public_ip: Option<IpAddr>,
}

impl Peer {
    pub fn new(identity: PeerIdentity, app_version: AppProtocolVersion) -> Self {
        Self {
            identity,
            app_version,
            public_ip: None,
        }
    }

    pub fn with_public_ip(mut self, ip: IpAddr) -> Self {
        self.public_ip = Some(ip);
        self
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }
}

/// A peer with a network endpoint; the only form the transport can
/// address directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundPeer {
    pub peer: Peer,
    pub endpoint: SocketAddr,
}

impl BoundPeer {
    pub fn new(peer: Peer, endpoint: SocketAddr) -> Self {
        Self { peer, endpoint }
    }

    pub fn identity(&self) -> PeerIdentity {
        self.peer.identity
    }

    pub fn address(&self) -> Address {
        self.peer.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::AppProtocolVersion;

    fn test_version(keypair: &Keypair) -> AppProtocolVersion {
        AppProtocolVersion::signed(1, Vec::new(), keypair)
    }

    #[test]
    fn identity_round_trip() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();
        let restored = PeerIdentity::from_bytes(*identity.as_bytes());
        assert_eq!(identity, restored);
    }

    #[test]
    fn address_is_deterministic() {
        let keypair = Keypair::generate();
        let a = keypair.identity().address();
        let b = keypair.identity().address();
        assert_eq!(a, b);

        let other = Keypair::generate();
        assert_ne!(a, other.identity().address());
    }

    #[test]
    fn xor_distance_symmetric_and_zero_to_self() {
        let a = Keypair::generate().identity().address();
        let b = Keypair::generate().identity().address();
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; ADDRESS_LEN]);
    }

    #[test]
    fn sign_and_verify() {
        let keypair = Keypair::generate();
        let message = b"transport handshake";
        let signature = keypair.sign(message);
        assert!(keypair.verify(message, &signature));
        assert!(!keypair.verify(b"tampered", &signature));
    }

    #[test]
    fn keypair_secret_round_trip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(keypair.identity(), restored.identity());
    }

    #[test]
    fn bound_peer_accessors() {
        let keypair = Keypair::generate();
        let peer = Peer::new(keypair.identity(), test_version(&keypair));
        let bound = BoundPeer::new(peer.clone(), "127.0.0.1:4000".parse().unwrap());
        assert_eq!(bound.identity(), keypair.identity());
        assert_eq!(bound.address(), peer.address());
    }
}
