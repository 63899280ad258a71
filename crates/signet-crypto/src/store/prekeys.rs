//! One-time and signed prekey lifecycle.

use std::sync::Arc;

use dashmap::DashSet;
use libsignal_protocol::{
    KeyPair, PreKeyId, PreKeyRecord, SignedPreKeyId, SignedPreKeyRecord, Timestamp,
};
use tracing::{debug, info};

use super::{tolerate_removal, ProtocolStore};
use crate::cache::CacheEntry;
use crate::error::StoreError;
use crate::events::StoreEvent;
use crate::gateway::{PreKeyRow, SignedPreKeyRow};
use crate::trust::now_ms;

/// A hydrated one-time prekey.
pub struct PreKey {
    pub id: u32,
    pub key_pair: KeyPair,
}

impl PreKey {
    fn from_row(row: &PreKeyRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: row.id,
            key_pair: KeyPair::from_public_and_private(&row.public_key, &row.private_key)?,
        })
    }

    pub fn to_record(&self) -> PreKeyRecord {
        PreKeyRecord::new(PreKeyId::from(self.id), &self.key_pair)
    }
}

/// A hydrated signed prekey.
pub struct SignedPreKey {
    pub id: u32,
    pub key_pair: KeyPair,
    pub signature: Vec<u8>,
    /// Milliseconds since the epoch.
    pub created_at: u64,
    pub confirmed: bool,
}

impl SignedPreKey {
    fn from_row(row: &SignedPreKeyRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: row.id,
            key_pair: KeyPair::from_public_and_private(&row.public_key, &row.private_key)?,
            signature: row.signature.clone(),
            created_at: row.created_at,
            confirmed: row.confirmed,
        })
    }

    pub fn to_record(&self) -> SignedPreKeyRecord {
        SignedPreKeyRecord::new(
            SignedPreKeyId::from(self.id),
            Timestamp::from_epoch_millis(self.created_at),
            &self.key_pair,
            &self.signature,
        )
    }
}

/// Claim on a prekey id, released on drop.
struct Reservation<'a> {
    ids: &'a DashSet<u32>,
    id: u32,
}

impl<'a> Reservation<'a> {
    fn take(ids: &'a DashSet<u32>, id: u32) -> Option<Self> {
        ids.insert(id).then_some(Self { ids, id })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.ids.remove(&self.id);
    }
}

impl ProtocolStore {
    // ── One-time prekeys ───────────────────────────────────────────────

    /// Store a new prekey. Ids are never reused: storing an id that is
    /// still cached, or being stored right now, is
    /// [`StoreError::DuplicateKey`].
    pub async fn store_pre_key(&self, id: u32, key_pair: &KeyPair) -> Result<(), StoreError> {
        let duplicate = || StoreError::DuplicateKey { kind: "prekey", id };
        self.pre_keys.with(|_| ())?;
        let Some(_reservation) = Reservation::take(&self.pre_key_reservations, id) else {
            return Err(duplicate());
        };
        // A finished writer caches the key before releasing its reservation.
        if self.pre_keys.with(|keys| keys.contains_key(&id))? {
            return Err(duplicate());
        }

        let row = PreKeyRow {
            id,
            public_key: key_pair.public_key.serialize().to_vec(),
            private_key: key_pair.private_key.serialize().to_vec(),
        };
        self.gateway
            .create_or_update_pre_key(&row)
            .await
            .map_err(StoreError::Persistence)?;
        debug!(pre_key_id = id, "prekey stored");
        self.pre_keys.with(|keys| {
            keys.insert(id, CacheEntry::cold(row));
        })
    }

    /// `None` when the prekey was never stored or has been consumed.
    pub fn load_pre_key(&self, id: u32) -> Result<Option<Arc<PreKey>>, StoreError> {
        self.pre_keys.with(|keys| {
            keys.get_mut(&id)
                .map(|entry| entry.hydrate(PreKey::from_row))
                .transpose()
        })?
    }

    /// Evict a prekey. Removing a missing key is fine; observers are told
    /// either way so replenishment can run.
    pub async fn remove_pre_key(&self, id: u32) -> Result<(), StoreError> {
        let was_cached = self.pre_keys.with(|keys| keys.remove(&id).is_some())?;
        tolerate_removal(self.gateway.remove_pre_key_by_id(id).await, "prekey", id);
        info!(pre_key_id = id, was_cached, "prekey removed");
        self.emit(StoreEvent::PreKeyRemoved { id });
        Ok(())
    }

    pub async fn clear_pre_key_store(&self) -> Result<(), StoreError> {
        self.pre_keys.with(|keys| keys.clear())?;
        tolerate_removal(self.gateway.remove_all_pre_keys().await, "prekeys", "all");
        Ok(())
    }

    /// Ids of every cached prekey, ascending.
    pub fn pre_key_ids(&self) -> Result<Vec<u32>, StoreError> {
        self.pre_keys.with(|keys| keys.keys().copied().collect())
    }

    // ── Signed prekeys ─────────────────────────────────────────────────

    /// Create a signed prekey, or update an existing one in place. This is
    /// also how a key is confirmed once the server has accepted it. An
    /// update keeps the original creation time.
    pub async fn store_signed_pre_key(
        &self,
        id: u32,
        key_pair: &KeyPair,
        signature: &[u8],
        confirmed: bool,
    ) -> Result<(), StoreError> {
        let existing_created_at = self
            .signed_pre_keys
            .with(|keys| keys.get(&id).map(|entry| entry.raw().created_at))?;

        let row = SignedPreKeyRow {
            id,
            public_key: key_pair.public_key.serialize().to_vec(),
            private_key: key_pair.private_key.serialize().to_vec(),
            signature: signature.to_vec(),
            created_at: existing_created_at.unwrap_or_else(now_ms),
            confirmed,
        };
        self.gateway
            .create_or_update_signed_pre_key(&row)
            .await
            .map_err(StoreError::Persistence)?;
        info!(
            signed_pre_key_id = id,
            confirmed,
            update = existing_created_at.is_some(),
            "signed prekey stored"
        );
        self.signed_pre_keys.with(|keys| {
            keys.insert(id, CacheEntry::cold(row));
        })
    }

    pub fn load_signed_pre_key(&self, id: u32) -> Result<Option<Arc<SignedPreKey>>, StoreError> {
        self.signed_pre_keys.with(|keys| {
            keys.get_mut(&id)
                .map(|entry| entry.hydrate(SignedPreKey::from_row))
                .transpose()
        })?
    }

    /// Every signed prekey, hydrated, by ascending id.
    pub fn load_signed_pre_keys(&self) -> Result<Vec<Arc<SignedPreKey>>, StoreError> {
        self.signed_pre_keys.with(|keys| {
            keys.values_mut()
                .map(|entry| entry.hydrate(SignedPreKey::from_row))
                .collect::<Result<Vec<_>, StoreError>>()
        })?
    }

    pub async fn remove_signed_pre_key(&self, id: u32) -> Result<(), StoreError> {
        self.signed_pre_keys.with(|keys| {
            keys.remove(&id);
        })?;
        tolerate_removal(
            self.gateway.remove_signed_pre_key_by_id(id).await,
            "signed prekey",
            id,
        );
        info!(signed_pre_key_id = id, "signed prekey removed");
        Ok(())
    }

    pub async fn clear_signed_pre_keys_store(&self) -> Result<(), StoreError> {
        self.signed_pre_keys.with(|keys| keys.clear())?;
        tolerate_removal(
            self.gateway.remove_all_signed_pre_keys().await,
            "signed prekeys",
            "all",
        );
        Ok(())
    }
}
