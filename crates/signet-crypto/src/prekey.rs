//! Pre-key and signed pre-key generation.
//!
//! Pre-keys are one-time-use Curve25519 key pairs used in the X3DH
//! key agreement protocol. Signed pre-keys are medium-term keys
//! signed by the identity key. Generated keys go straight into the
//! [`ProtocolStore`]; the returned sets hold only what gets uploaded.

use libsignal_protocol::KeyPair;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StoreError;
use crate::store::ProtocolStore;

/// Number of one-time pre-keys to generate initially.
pub const INITIAL_PREKEY_COUNT: u32 = 100;

/// Threshold below which we should replenish pre-keys.
pub const PREKEY_REPLENISH_THRESHOLD: u32 = 10;

/// A set of pre-keys ready to be uploaded to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeySet {
    pub registration_id: u32,
    pub device_id: u32,
    pub signed_prekey_id: u32,
    pub signed_prekey_public: Vec<u8>,
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekeys: Vec<PublicPreKey>,
}

/// A one-time pre-key's public portion for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicPreKey {
    pub id: u32,
    pub public_key: Vec<u8>,
}

/// Generate a signed pre-key and `count` one-time pre-keys starting at
/// `start_id`, store them, and return the upload set. Needs the device's
/// own identity for the signature.
pub async fn generate_prekeys(
    store: &ProtocolStore,
    device_id: u32,
    signed_prekey_id: u32,
    start_id: u32,
    count: u32,
) -> Result<PreKeySet, StoreError> {
    let identity_key_pair = store.identity_key_pair()?;
    let registration_id = store.local_registration_id()?;

    let one_time_prekeys = generate_replenish_prekeys(store, start_id, count).await?;

    let signed_key_pair = KeyPair::generate(&mut OsRng);
    let signature = identity_key_pair
        .private_key()
        .calculate_signature(&signed_key_pair.public_key.serialize(), &mut OsRng)?;
    store
        .store_signed_pre_key(signed_prekey_id, &signed_key_pair, &signature, false)
        .await?;

    info!(
        signed_prekey_id,
        one_time = one_time_prekeys.len(),
        "generated prekey set"
    );
    Ok(PreKeySet {
        registration_id,
        device_id,
        signed_prekey_id,
        signed_prekey_public: signed_key_pair.public_key.serialize().to_vec(),
        signed_prekey_signature: signature.to_vec(),
        one_time_prekeys,
    })
}

/// Generate additional one-time pre-keys to replenish supply.
pub async fn generate_replenish_prekeys(
    store: &ProtocolStore,
    start_id: u32,
    count: u32,
) -> Result<Vec<PublicPreKey>, StoreError> {
    let ids = (0..count)
        .map(|i| start_id.checked_add(i))
        .collect::<Option<Vec<u32>>>()
        .ok_or_else(|| {
            StoreError::InvalidArgument(format!(
                "{count} prekeys starting at {start_id} run past the id space"
            ))
        })?;

    let mut prekeys = Vec::with_capacity(ids.len());
    for id in ids {
        let key_pair = KeyPair::generate(&mut OsRng);
        store.store_pre_key(id, &key_pair).await?;
        prekeys.push(PublicPreKey {
            id,
            public_key: key_pair.public_key.serialize().to_vec(),
        });
    }

    Ok(prekeys)
}

/// First id after every stored one-time pre-key.
pub fn next_prekey_id(store: &ProtocolStore) -> Result<u32, StoreError> {
    Ok(store
        .pre_key_ids()?
        .last()
        .map_or(1, |last| last.saturating_add(1)))
}

pub fn needs_replenish(store: &ProtocolStore) -> Result<bool, StoreError> {
    Ok(store.pre_key_ids()?.len() < PREKEY_REPLENISH_THRESHOLD as usize)
}

/// Mark a signed pre-key as accepted by the server.
pub async fn confirm_signed_prekey(store: &ProtocolStore, id: u32) -> Result<(), StoreError> {
    let signed = store.load_signed_pre_key(id)?.ok_or_else(|| {
        StoreError::InvalidArgument(format!("no signed prekey {id} to confirm"))
    })?;
    store
        .store_signed_pre_key(id, &signed.key_pair, &signed.signature, true)
        .await
}
