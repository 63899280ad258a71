//! libsignal store traits over [`ProtocolStore`].
//!
//! libsignal addresses a device as `ProtocolAddress(name, device)`; the
//! store sees that as `"name:device"` and resolves `name` through its
//! peer directory like any other caller.
//!
//! The traits are implemented for `&ProtocolStore`, so one store can be
//! handed to libsignal as its session and identity stores at once.

use std::sync::Arc;

use libsignal_protocol::{
    Direction, GenericSignedPreKey, IdentityKey, IdentityKeyPair, IdentityKeyStore, PreKeyId,
    PreKeyRecord, PreKeyStore, ProtocolAddress, SessionRecord, SessionStore, SignalProtocolError,
    SignedPreKeyId, SignedPreKeyRecord, SignedPreKeyStore,
};

use crate::error::StoreError;
use crate::store::ProtocolStore;

fn store_address(address: &ProtocolAddress) -> String {
    format!("{}:{}", address.name(), address.device_id())
}

fn to_signal(error: StoreError) -> SignalProtocolError {
    match error {
        StoreError::Signal(inner) => inner,
        other => SignalProtocolError::InvalidArgument(other.to_string()),
    }
}

// ── Identity Key Store ──────────────────────────────────────────────────

#[async_trait::async_trait(?Send)]
impl<'s> IdentityKeyStore for &'s ProtocolStore {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, SignalProtocolError> {
        self.identity_key_pair().map_err(to_signal)
    }

    async fn get_local_registration_id(&self) -> Result<u32, SignalProtocolError> {
        self.local_registration_id().map_err(to_signal)
    }

    async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, SignalProtocolError> {
        ProtocolStore::save_identity(*self, &store_address(address), identity, false)
            .await
            .map_err(to_signal)
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        direction: Direction,
    ) -> Result<bool, SignalProtocolError> {
        ProtocolStore::is_trusted_identity(*self, &store_address(address), identity, direction.into())
            .map_err(to_signal)
    }

    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, SignalProtocolError> {
        self.load_identity_key(address.name()).map_err(to_signal)
    }
}

// ── Session Store ───────────────────────────────────────────────────────

#[async_trait::async_trait(?Send)]
impl<'s> SessionStore for &'s ProtocolStore {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, SignalProtocolError> {
        Ok(ProtocolStore::load_session(*self, &store_address(address))
            .map_err(to_signal)?
            .map(Arc::unwrap_or_clone))
    }

    async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SignalProtocolError> {
        ProtocolStore::store_session(*self, &store_address(address), record.clone())
            .await
            .map_err(to_signal)
    }
}

// ── Pre-Key Store ───────────────────────────────────────────────────────

#[async_trait::async_trait(?Send)]
impl<'s> PreKeyStore for &'s ProtocolStore {
    async fn get_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord, SignalProtocolError> {
        self.load_pre_key(id.into())
            .map_err(to_signal)?
            .map(|pre_key| pre_key.to_record())
            .ok_or(SignalProtocolError::InvalidPreKeyId)
    }

    async fn save_pre_key(
        &mut self,
        id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.store_pre_key(id.into(), &record.key_pair()?)
            .await
            .map_err(to_signal)
    }

    async fn remove_pre_key(&mut self, id: PreKeyId) -> Result<(), SignalProtocolError> {
        ProtocolStore::remove_pre_key(*self, id.into())
            .await
            .map_err(to_signal)
    }
}

// ── Signed Pre-Key Store ────────────────────────────────────────────────

#[async_trait::async_trait(?Send)]
impl<'s> SignedPreKeyStore for &'s ProtocolStore {
    async fn get_signed_pre_key(
        &self,
        id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, SignalProtocolError> {
        self.load_signed_pre_key(id.into())
            .map_err(to_signal)?
            .map(|signed| signed.to_record())
            .ok_or(SignalProtocolError::InvalidSignedPreKeyId)
    }

    /// Saving through libsignal never changes the confirmation flag.
    async fn save_signed_pre_key(
        &mut self,
        id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        let id = u32::from(id);
        let confirmed = self
            .load_signed_pre_key(id)
            .map_err(to_signal)?
            .is_some_and(|existing| existing.confirmed);
        self.store_signed_pre_key(id, &record.key_pair()?, &record.signature()?, confirmed)
            .await
            .map_err(to_signal)
    }
}
