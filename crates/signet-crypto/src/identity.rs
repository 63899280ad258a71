//! This device's long-term identity and identity key helpers.
//!
//! The identity key pair is Curve25519 (via libsignal). It is persisted as
//! an [`OwnIdentityRow`] and rebuilt into an [`OwnIdentity`] when the store
//! hydrates.

use libsignal_protocol::{IdentityKey, IdentityKeyPair, KeyPair};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::StoreError;

/// Persisted form of this device's identity.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct OwnIdentityRow {
    /// Serialized identity public key (33 bytes, type-prefixed).
    pub identity_public: Vec<u8>,
    /// 32-byte Curve25519 private key.
    pub identity_private: Vec<u8>,
    pub registration_id: u32,
    /// Stable peer id of this account, once known.
    pub peer_id: Option<String>,
}

impl OwnIdentityRow {
    pub fn new(key_pair: &IdentityKeyPair, registration_id: u32, peer_id: Option<String>) -> Self {
        Self {
            identity_public: key_pair.public_key().serialize().to_vec(),
            identity_private: key_pair.private_key().serialize().to_vec(),
            registration_id,
            peer_id,
        }
    }

    /// Reconstruct libsignal's IdentityKeyPair from the stored bytes.
    pub fn to_identity_key_pair(&self) -> Result<IdentityKeyPair, StoreError> {
        let key_pair =
            KeyPair::from_public_and_private(&self.identity_public, &self.identity_private)?;
        Ok(IdentityKeyPair::new(
            IdentityKey::new(key_pair.public_key),
            key_pair.private_key,
        ))
    }
}

/// Hydrated own identity, as used by migration and trust checks.
#[derive(Clone)]
pub struct OwnIdentity {
    pub key_pair: IdentityKeyPair,
    pub registration_id: u32,
    pub peer_id: Option<String>,
}

impl OwnIdentity {
    pub fn from_row(row: &OwnIdentityRow) -> Result<Self, StoreError> {
        Ok(Self {
            key_pair: row.to_identity_key_pair()?,
            registration_id: row.registration_id,
            peer_id: row.peer_id.clone(),
        })
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        identity_key_to_bytes(self.key_pair.identity_key())
    }

    pub fn is_peer(&self, peer_id: &str) -> bool {
        self.peer_id.as_deref() == Some(peer_id)
    }
}

/// Generate a fresh identity key pair.
pub fn generate_identity_key_pair() -> IdentityKeyPair {
    IdentityKeyPair::generate(&mut OsRng)
}

/// Generate a registration id in Signal's 14-bit range.
pub fn generate_registration_id() -> u32 {
    OsRng.gen_range(1..=16380)
}

pub fn identity_key_to_bytes(key: &IdentityKey) -> Vec<u8> {
    key.serialize().to_vec()
}

pub fn identity_key_from_bytes(bytes: &[u8]) -> Result<IdentityKey, StoreError> {
    Ok(IdentityKey::decode(bytes)?)
}

/// Constant-time comparison of two serialized public keys.
pub fn keys_match(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
