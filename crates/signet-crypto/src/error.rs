use std::time::Duration;

use libsignal_protocol::SignalProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} cache used before hydrate_caches() completed")]
    NotInitialized(&'static str),

    #[error("{kind} {id} already exists")]
    DuplicateKey { kind: &'static str, id: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no peer known for identifier {0:?}")]
    UnknownPeer(String),

    #[error("no identity record for peer {0}")]
    IdentityNotFound(String),

    #[error("session {id} has unknown version {version}")]
    UnknownSessionVersion { id: String, version: u32 },

    #[error("session {id} is corrupt: {reason}")]
    CorruptSession { id: String, reason: String },

    #[error("own identity has not been provisioned")]
    MissingOwnIdentity,

    #[error("session job for {address} timed out after {timeout:?}")]
    SessionJobTimeout { address: String, timeout: Duration },

    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),

    #[error(transparent)]
    Signal(#[from] SignalProtocolError),

    #[error("record encoding error: {0}")]
    Encoding(#[from] prost::DecodeError),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("bad provisioning envelope version: {0}")]
    BadVersion(u8),

    #[error("provisioning envelope too short: {0} bytes")]
    Truncated(usize),

    #[error("no ephemeral key pair; call public_key() before decrypting")]
    MissingKeyPair,

    #[error("provisioning envelope MAC mismatch")]
    MacMismatch,

    #[error("provisioning ciphertext could not be decrypted")]
    Decrypt,

    #[error("invalid provisioning key material: {0}")]
    InvalidKey(#[from] SignalProtocolError),

    #[error("provisioning message carries no identity key")]
    MissingIdentity,

    #[error("malformed provisioning message: {0}")]
    Encoding(#[from] prost::DecodeError),

    #[error("provisioning key derivation failed")]
    KeyDerivation,

    #[error("RNG failed")]
    Rng,
}
