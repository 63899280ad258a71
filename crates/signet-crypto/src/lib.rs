//! Signet protocol state core.
//!
//! This crate provides:
//! - A cached credential & session store over a pluggable persistence layer
//! - Trust-on-first-use identity verification
//! - One-time and signed pre-key lifecycle and generation
//! - Per-device serialized session mutation, with legacy session migration
//! - libsignal store trait bridges
//! - The device-linking (provisioning) envelope cipher

pub mod address;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod memory;
pub mod prekey;
pub mod provisioning;
mod queue;
pub mod session;
pub mod store;
pub mod stores;
pub mod trust;

// Re-export key types for convenience
pub use address::{Address, NormalizedAddress, PeerDirectory};
pub use config::StoreConfig;
pub use error::{ProvisioningError, StoreError};
pub use events::{StoreEvent, StoreListener};
pub use gateway::{PersistenceGateway, UnprocessedEnvelope, UnprocessedUpdate};
pub use identity::{generate_identity_key_pair, generate_registration_id, OwnIdentity};
pub use prekey::PreKeySet;
pub use provisioning::{ProvisionDecryptResult, ProvisionEnvelope, ProvisionMessage, ProvisioningCipher};
pub use libsignal_protocol::SessionRecord;
pub use session::{RecordStructure, SessionStructure};
pub use store::{PreKey, ProtocolStore, SignedPreKey};
pub use trust::{Direction, IdentityAttributes, IdentityRecord, VerifiedStatus};
