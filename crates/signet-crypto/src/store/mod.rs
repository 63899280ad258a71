//! The credential & session store.
//!
//! [`ProtocolStore`] is the single cached view over everything the
//! [`PersistenceGateway`] holds: this device's identity, remote identity
//! keys with their trust flags, one-time and signed prekeys, and per-device
//! sessions. Writes go to the gateway first and then to the cache.
//!
//! Call [`ProtocolStore::hydrate_caches`] before anything else. Until it has
//! completed, cache-backed operations fail with
//! [`StoreError::NotInitialized`].

mod identities;
mod prekeys;
mod sessions;
mod unprocessed;

pub use prekeys::{PreKey, SignedPreKey};

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Arc;

use dashmap::DashSet;
use libsignal_protocol::{IdentityKeyPair, SessionRecord};
use tracing::{info, warn};

use crate::address::{self, NormalizedAddress, PeerDirectory};
use crate::cache::{Cache, CacheEntry};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::events::{Listeners, StoreEvent, StoreListener};
use crate::gateway::{PersistenceGateway, PreKeyRow, SessionRow, SignedPreKeyRow};
use crate::identity::{OwnIdentity, OwnIdentityRow};
use crate::queue::SessionQueues;
use crate::trust::IdentityRecord;

type SessionEntry = CacheEntry<SessionRow, SessionRecord>;
type PreKeyEntry = CacheEntry<PreKeyRow, PreKey>;
type SignedPreKeyEntry = CacheEntry<SignedPreKeyRow, SignedPreKey>;

pub struct ProtocolStore {
    gateway: Arc<dyn PersistenceGateway>,
    directory: Arc<dyn PeerDirectory>,
    config: StoreConfig,

    own_identity: Cache<Option<OwnIdentity>>,
    identity_keys: Cache<HashMap<String, IdentityRecord>>,
    sessions: Cache<HashMap<String, SessionEntry>>,
    pre_keys: Cache<BTreeMap<u32, PreKeyEntry>>,
    signed_pre_keys: Cache<BTreeMap<u32, SignedPreKeyEntry>>,
    /// Prekey ids whose write is in flight.
    pre_key_reservations: DashSet<u32>,

    queues: SessionQueues,
    listeners: Listeners,
}

impl ProtocolStore {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        directory: Arc<dyn PeerDirectory>,
        config: StoreConfig,
    ) -> Self {
        let queues = SessionQueues::new(config.session_job_timeout());
        Self {
            gateway,
            directory,
            config,
            own_identity: Cache::new("own identity"),
            identity_keys: Cache::new("identity keys"),
            sessions: Cache::new("sessions"),
            pre_keys: Cache::new("prekeys"),
            signed_pre_keys: Cache::new("signed prekeys"),
            pre_key_reservations: DashSet::new(),
            queues,
            listeners: Listeners::default(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Load every persisted table and fill the caches with cold entries.
    /// Calling it again discards the caches and reloads them.
    pub async fn hydrate_caches(&self) -> Result<(), StoreError> {
        let gateway = &self.gateway;
        let (own, identity_keys, sessions, pre_keys, signed_pre_keys) = tokio::try_join!(
            gateway.load_own_identity(),
            gateway.get_all_identity_keys(),
            gateway.get_all_sessions(),
            gateway.get_all_pre_keys(),
            gateway.get_all_signed_pre_keys(),
        )
        .map_err(StoreError::Persistence)?;

        let own = own.as_ref().map(OwnIdentity::from_row).transpose()?;
        if own.is_none() {
            warn!("no own identity persisted yet; device is not linked");
        }

        info!(
            identity_keys = identity_keys.len(),
            sessions = sessions.len(),
            pre_keys = pre_keys.len(),
            signed_pre_keys = signed_pre_keys.len(),
            "caches hydrated"
        );

        self.own_identity.fill(own);
        self.identity_keys.fill(
            identity_keys
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
        );
        self.sessions.fill(
            sessions
                .into_iter()
                .map(|row| (row.id.clone(), CacheEntry::cold(row)))
                .collect(),
        );
        self.pre_keys.fill(
            pre_keys
                .into_iter()
                .map(|row| (row.id, CacheEntry::cold(row)))
                .collect(),
        );
        self.signed_pre_keys.fill(
            signed_pre_keys
                .into_iter()
                .map(|row| (row.id, CacheEntry::cold(row)))
                .collect(),
        );
        Ok(())
    }

    /// Register an observer for [`StoreEvent`]s.
    pub fn add_listener(&self, listener: impl StoreListener + 'static) {
        self.listeners.add(Arc::new(listener));
    }

    // ── Own identity ───────────────────────────────────────────────────

    fn own(&self) -> Result<Option<OwnIdentity>, StoreError> {
        self.own_identity.with(|own| own.clone())
    }

    fn require_own(&self) -> Result<OwnIdentity, StoreError> {
        self.own()?.ok_or(StoreError::MissingOwnIdentity)
    }

    pub fn identity_key_pair(&self) -> Result<IdentityKeyPair, StoreError> {
        Ok(self.require_own()?.key_pair)
    }

    pub fn local_registration_id(&self) -> Result<u32, StoreError> {
        Ok(self.require_own()?.registration_id)
    }

    /// Persist and cache this device's identity, as received when linking.
    pub async fn set_own_identity(
        &self,
        key_pair: &IdentityKeyPair,
        registration_id: u32,
        peer_id: Option<String>,
    ) -> Result<(), StoreError> {
        // Fail before writing if the store was never hydrated.
        self.own_identity.with(|_| ())?;

        let row = OwnIdentityRow::new(key_pair, registration_id, peer_id);
        self.gateway
            .save_own_identity(&row)
            .await
            .map_err(StoreError::Persistence)?;
        let own = OwnIdentity::from_row(&row)?;
        info!(registration_id, peer_id = ?own.peer_id, "own identity stored");
        self.own_identity.with(|slot| *slot = Some(own))
    }

    // ── Reset ──────────────────────────────────────────────────────────

    /// Wipe every table and reload the (now empty) caches.
    pub async fn remove_all_data(&self) -> Result<(), StoreError> {
        warn!("removing all protocol data");
        self.gateway
            .remove_all()
            .await
            .map_err(StoreError::Persistence)?;
        self.hydrate_caches().await
    }

    // ── Shared helpers ─────────────────────────────────────────────────

    fn normalize(&self, address: &str) -> Result<NormalizedAddress, StoreError> {
        address::normalize(self.directory.as_ref(), address)
    }

    fn resolve_peer(&self, identifier: &str) -> Result<String, StoreError> {
        address::resolve_peer(self.directory.as_ref(), identifier)
    }

    fn emit(&self, event: StoreEvent) {
        self.listeners.emit(&event);
    }
}

/// Delete-style persistence failures are logged and otherwise ignored:
/// the row is treated as already gone.
fn tolerate_removal(result: anyhow::Result<()>, what: &str, id: impl Display) {
    if let Err(e) = result {
        warn!(%id, "failed to remove {what}, treating it as gone: {e:#}");
    }
}
