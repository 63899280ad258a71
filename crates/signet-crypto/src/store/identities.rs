//! Remote identity keys and trust-on-first-use.

use libsignal_protocol::IdentityKey;
use tracing::{error, info, warn};

use super::{tolerate_removal, ProtocolStore};
use crate::error::StoreError;
use crate::events::StoreEvent;
use crate::identity::{identity_key_from_bytes, identity_key_to_bytes, keys_match};
use crate::trust::{
    demoted_status, is_non_blocking_approval_required, is_trusted_for_sending, now_ms, Direction,
    IdentityAttributes, IdentityRecord, VerifiedStatus,
};

impl ProtocolStore {
    fn identity_record(&self, peer_id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        self.identity_keys.with(|keys| keys.get(peer_id).cloned())
    }

    fn require_identity_record(&self, peer_id: &str) -> Result<IdentityRecord, StoreError> {
        self.identity_record(peer_id)?
            .ok_or_else(|| StoreError::IdentityNotFound(peer_id.to_owned()))
    }

    async fn put_identity_record(&self, record: IdentityRecord) -> Result<(), StoreError> {
        self.identity_keys.with(|_| ())?;
        self.gateway
            .create_or_update_identity_key(&record)
            .await
            .map_err(StoreError::Persistence)?;
        self.identity_keys.with(|keys| {
            keys.insert(record.id.clone(), record);
        })
    }

    /// Whether `key` may be used for `address` in `direction`.
    ///
    /// Receiving is always allowed so history stays decryptable. For our
    /// own account the key must equal the stored one.
    pub fn is_trusted_identity(
        &self,
        address: &str,
        key: &IdentityKey,
        direction: Direction,
    ) -> Result<bool, StoreError> {
        let address = self.normalize(address)?;
        let candidate = identity_key_to_bytes(key);
        let record = self.identity_record(&address.peer_id)?;

        let is_own_peer = self
            .own()?
            .is_some_and(|own| own.is_peer(&address.peer_id));
        if is_own_peer {
            return Ok(match record {
                Some(record) => keys_match(&record.public_key, &candidate),
                None => {
                    warn!(peer_id = %address.peer_id, "no stored key for our own account, trusting");
                    true
                }
            });
        }

        Ok(match direction {
            Direction::Sending => is_trusted_for_sending(
                &candidate,
                record.as_ref(),
                now_ms(),
                self.config.approval_window_ms,
            ),
            Direction::Receiving => true,
        })
    }

    /// Record `key` for the peer behind `address`. Returns whether an
    /// existing, different key was replaced.
    ///
    /// A replaced key never gains trust: a verified or unverified record
    /// becomes unverified. Observers get [`StoreEvent::KeyChanged`] and
    /// every session of the peer is archived. Inside a session job, devices
    /// other than the job's own are archived once the job finishes.
    pub async fn save_identity(
        &self,
        address: &str,
        key: &IdentityKey,
        nonblocking_approval: bool,
    ) -> Result<bool, StoreError> {
        let address = self.normalize(address)?;
        let peer_id = address.peer_id;
        let candidate = identity_key_to_bytes(key);
        let now = now_ms();

        let Some(existing) = self.identity_record(&peer_id)? else {
            info!(%peer_id, "saving identity key for the first time");
            self.put_identity_record(IdentityRecord {
                id: peer_id,
                public_key: candidate,
                first_use: true,
                timestamp_ms: now,
                verified: VerifiedStatus::Default,
                nonblocking_approval,
            })
            .await?;
            return Ok(false);
        };

        if !keys_match(&existing.public_key, &candidate) {
            info!(%peer_id, "replacing existing identity key");
            self.put_identity_record(IdentityRecord {
                id: peer_id.clone(),
                public_key: candidate,
                first_use: false,
                timestamp_ms: now,
                verified: demoted_status(existing.verified),
                nonblocking_approval,
            })
            .await?;
            self.emit(StoreEvent::KeyChanged {
                peer_id: peer_id.clone(),
            });
            self.archive_peer_sessions(&peer_id).await?;
            return Ok(true);
        }

        if is_non_blocking_approval_required(&existing, now, self.config.approval_window_ms) {
            info!(%peer_id, nonblocking_approval, "updating approval status");
            self.put_identity_record(IdentityRecord {
                nonblocking_approval,
                ..existing
            })
            .await?;
        }
        Ok(false)
    }

    /// Overwrite the peer's record with `attributes`. The key must decode as
    /// an identity key.
    pub async fn save_identity_with_attributes(
        &self,
        identifier: &str,
        attributes: IdentityAttributes,
    ) -> Result<(), StoreError> {
        identity_key_from_bytes(&attributes.public_key)
            .map_err(|e| StoreError::InvalidArgument(format!("identity public key: {e}")))?;
        let peer_id = self.resolve_peer(identifier)?;
        self.put_identity_record(attributes.into_record(peer_id)).await
    }

    pub async fn set_approval(
        &self,
        identifier: &str,
        nonblocking_approval: bool,
    ) -> Result<(), StoreError> {
        let peer_id = self.resolve_peer(identifier)?;
        let record = self.require_identity_record(&peer_id)?;
        self.put_identity_record(IdentityRecord {
            nonblocking_approval,
            ..record
        })
        .await
    }

    /// Set the peer's verified status. With `key`, only applied when it
    /// matches the stored key.
    pub async fn set_verified(
        &self,
        identifier: &str,
        status: VerifiedStatus,
        key: Option<&IdentityKey>,
    ) -> Result<(), StoreError> {
        let peer_id = self.resolve_peer(identifier)?;
        let record = self.require_identity_record(&peer_id)?;
        if let Some(key) = key {
            if !keys_match(&record.public_key, &identity_key_to_bytes(key)) {
                warn!(%peer_id, "not setting verified status, key mismatch");
                return Ok(());
            }
        }
        info!(%peer_id, ?status, "setting verified status");
        self.put_identity_record(IdentityRecord {
            verified: status,
            ..record
        })
        .await
    }

    pub fn get_verified(&self, identifier: &str) -> Result<VerifiedStatus, StoreError> {
        let peer_id = self.resolve_peer(identifier)?;
        Ok(self.require_identity_record(&peer_id)?.verified)
    }

    pub fn get_identity_record(&self, identifier: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let peer_id = self.resolve_peer(identifier)?;
        self.identity_record(&peer_id)
    }

    pub fn load_identity_key(&self, identifier: &str) -> Result<Option<IdentityKey>, StoreError> {
        self.get_identity_record(identifier)?
            .map(|record| identity_key_from_bytes(&record.public_key))
            .transpose()
    }

    /// A recently changed, unapproved key that is not a first use.
    pub fn is_untrusted(&self, identifier: &str) -> Result<bool, StoreError> {
        let peer_id = self.resolve_peer(identifier)?;
        let record = self.require_identity_record(&peer_id)?;
        Ok(is_non_blocking_approval_required(
            &record,
            now_ms(),
            self.config.approval_window_ms,
        ))
    }

    /// Forget the peer's identity key and drop its sessions.
    pub async fn remove_identity_key(&self, identifier: &str) -> Result<(), StoreError> {
        let peer_id = self.resolve_peer(identifier)?;
        self.identity_keys.with(|keys| {
            keys.remove(&peer_id);
        })?;
        tolerate_removal(
            self.gateway.remove_identity_key_by_id(&peer_id).await,
            "identity key",
            &peer_id,
        );
        info!(%peer_id, "identity key removed");
        self.remove_peer_sessions(&peer_id).await
    }

    // ── Externally asserted verification ───────────────────────────────

    /// Apply a verification state learned elsewhere, e.g. a synced contact.
    pub async fn process_contact_sync_verification_state(
        &self,
        identifier: &str,
        status: VerifiedStatus,
        key: Option<&IdentityKey>,
    ) -> Result<bool, StoreError> {
        match status {
            VerifiedStatus::Unverified => {
                self.process_unverified_message(identifier, status, key).await
            }
            _ => self.process_verified_message(identifier, status, key).await,
        }
    }

    /// Reconcile a `Default` or `Verified` assertion. Returns whether a new
    /// key was adopted.
    pub async fn process_verified_message(
        &self,
        identifier: &str,
        status: VerifiedStatus,
        key: Option<&IdentityKey>,
    ) -> Result<bool, StoreError> {
        let peer_id = self.resolve_peer(identifier)?;
        let existing = self.identity_record(&peer_id)?;
        let key_matches = key_matches(existing.as_ref(), key);

        if existing.is_none() && status == VerifiedStatus::Default {
            info!(%peer_id, "no existing record for default status");
            return Ok(false);
        }

        if let Some(existing) = &existing {
            if key_matches && existing.verified != status {
                self.set_verified(identifier, status, key).await?;
                return Ok(false);
            }
        }

        if existing.is_none() || !key_matches {
            return self
                .adopt_asserted_key(identifier, &peer_id, existing.as_ref(), status, key)
                .await;
        }
        Ok(false)
    }

    /// Reconcile an `Unverified` assertion. Returns whether a new key was
    /// adopted.
    pub async fn process_unverified_message(
        &self,
        identifier: &str,
        status: VerifiedStatus,
        key: Option<&IdentityKey>,
    ) -> Result<bool, StoreError> {
        let peer_id = self.resolve_peer(identifier)?;
        let existing = self.identity_record(&peer_id)?;
        let key_matches = key_matches(existing.as_ref(), key);

        if let Some(existing) = &existing {
            if key_matches && existing.verified != VerifiedStatus::Unverified {
                self.set_verified(identifier, status, key).await?;
                return Ok(false);
            }
        }

        if existing.is_none() || !key_matches {
            return self
                .adopt_asserted_key(identifier, &peer_id, existing.as_ref(), status, key)
                .await;
        }
        // Same key, already unverified.
        Ok(false)
    }

    async fn adopt_asserted_key(
        &self,
        identifier: &str,
        peer_id: &str,
        existing: Option<&IdentityRecord>,
        status: VerifiedStatus,
        key: Option<&IdentityKey>,
    ) -> Result<bool, StoreError> {
        let Some(key) = key else {
            error!(%peer_id, "verification state asserted without a key");
            return Err(StoreError::InvalidArgument(format!(
                "verification of {peer_id} needs a public key"
            )));
        };
        self.save_identity_with_attributes(
            identifier,
            IdentityAttributes {
                public_key: identity_key_to_bytes(key),
                first_use: false,
                timestamp_ms: now_ms(),
                verified: status,
                nonblocking_approval: true,
            },
        )
        .await?;

        if existing.is_none() {
            return Ok(false);
        }
        info!(%peer_id, ?status, "adopted asserted identity key");
        self.emit(StoreEvent::KeyChanged {
            peer_id: peer_id.to_owned(),
        });
        self.archive_peer_sessions(peer_id).await?;
        Ok(true)
    }
}

fn key_matches(record: Option<&IdentityRecord>, key: Option<&IdentityKey>) -> bool {
    match (record, key) {
        (Some(record), Some(key)) => keys_match(&record.public_key, &identity_key_to_bytes(key)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::super::tests::new_store;
    use super::*;
    use crate::identity::generate_identity_key_pair;
    use crate::session::record::tests::open_record;

    fn fresh_key() -> IdentityKey {
        *generate_identity_key_pair().identity_key()
    }

    #[tokio::test]
    async fn first_save_is_not_a_key_change() {
        let (store, _, directory) = new_store();
        directory.insert("alice", "peer-a");
        store.hydrate_caches().await.unwrap();

        let changed = store.save_identity("alice:1", &fresh_key(), false).await.unwrap();
        assert!(!changed);
        let record = store.get_identity_record("alice").unwrap().unwrap();
        assert!(record.first_use);
        assert_eq!(record.verified, VerifiedStatus::Default);
    }

    #[tokio::test]
    async fn key_change_demotes_and_archives() {
        let (store, gateway, directory) = new_store();
        directory.insert("alice", "peer-a");
        store.hydrate_caches().await.unwrap();

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        store.add_listener(move |event: &StoreEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });

        let old = fresh_key();
        store.save_identity("alice:1", &old, false).await.unwrap();
        store
            .set_verified("alice", VerifiedStatus::Verified, Some(&old))
            .await
            .unwrap();
        for address in ["alice:1", "alice:2"] {
            store
                .store_session(address, open_record(1))
                .await
                .unwrap();
        }

        let changed = store.save_identity("alice:1", &fresh_key(), false).await.unwrap();
        assert!(changed);
        assert_eq!(store.get_verified("alice").unwrap(), VerifiedStatus::Unverified);
        assert!(!gateway.identity_key("peer-a").unwrap().first_use);
        assert!(store.get_device_ids("alice").unwrap().is_empty());
        assert_eq!(
            *changes.lock().unwrap(),
            vec![StoreEvent::KeyChanged {
                peer_id: "peer-a".into()
            }]
        );
    }

    #[tokio::test]
    async fn sending_trust_follows_stored_state() {
        let (store, _, directory) = new_store();
        directory.insert("alice", "peer-a");
        store.hydrate_caches().await.unwrap();

        let key = fresh_key();
        let other = fresh_key();
        assert!(store.is_trusted_identity("alice:1", &key, Direction::Sending).unwrap());

        store.save_identity("alice:1", &key, false).await.unwrap();
        assert!(store.is_trusted_identity("alice:1", &key, Direction::Sending).unwrap());
        assert!(!store.is_trusted_identity("alice:1", &other, Direction::Sending).unwrap());
        assert!(store.is_trusted_identity("alice:1", &other, Direction::Receiving).unwrap());

        store
            .set_verified("alice", VerifiedStatus::Unverified, None)
            .await
            .unwrap();
        assert!(!store.is_trusted_identity("alice:1", &key, Direction::Sending).unwrap());
        assert!(store.is_trusted_identity("alice:1", &key, Direction::Receiving).unwrap());
    }

    #[tokio::test]
    async fn changed_key_needs_approval_before_sending() {
        let (store, _, directory) = new_store();
        directory.insert("alice", "peer-a");
        store.hydrate_caches().await.unwrap();

        store.save_identity("alice:1", &fresh_key(), false).await.unwrap();
        let replacement = fresh_key();
        store.save_identity("alice:1", &replacement, false).await.unwrap();
        assert!(store.is_untrusted("alice").unwrap());
        assert!(!store
            .is_trusted_identity("alice:1", &replacement, Direction::Sending)
            .unwrap());

        // Saving the same key again while approval is pending records it.
        assert!(!store.save_identity("alice:1", &replacement, true).await.unwrap());
        assert!(!store.is_untrusted("alice").unwrap());
        assert!(store
            .is_trusted_identity("alice:1", &replacement, Direction::Sending)
            .unwrap());
    }

    #[tokio::test]
    async fn own_account_trusts_only_its_stored_key() {
        let (store, _, directory) = new_store();
        directory.insert("me", "peer-me");
        store.hydrate_caches().await.unwrap();
        store
            .set_own_identity(&generate_identity_key_pair(), 1, Some("peer-me".into()))
            .await
            .unwrap();

        let key = fresh_key();
        // Nothing stored yet for ourselves.
        assert!(store.is_trusted_identity("me:2", &key, Direction::Receiving).unwrap());

        store.save_identity("me:2", &key, false).await.unwrap();
        assert!(!store
            .is_trusted_identity("me:2", &fresh_key(), Direction::Receiving)
            .unwrap());
        assert!(store.is_trusted_identity("me:2", &key, Direction::Sending).unwrap());
    }

    #[tokio::test]
    async fn unknown_peer_record_is_an_error_where_required() {
        let (store, _, directory) = new_store();
        directory.insert("alice", "peer-a");
        store.hydrate_caches().await.unwrap();

        assert!(matches!(
            store.get_verified("alice"),
            Err(StoreError::IdentityNotFound(_))
        ));
        let err = store
            .set_verified("alice", VerifiedStatus::Verified, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IdentityNotFound(_)));
        assert!(store.load_identity_key("alice").unwrap().is_none());
    }

    #[tokio::test]
    async fn set_verified_ignores_mismatched_key() {
        let (store, _, directory) = new_store();
        directory.insert("alice", "peer-a");
        store.hydrate_caches().await.unwrap();
        store.save_identity("alice:1", &fresh_key(), false).await.unwrap();

        store
            .set_verified("alice", VerifiedStatus::Verified, Some(&fresh_key()))
            .await
            .unwrap();
        assert_eq!(store.get_verified("alice").unwrap(), VerifiedStatus::Default);
    }

    #[tokio::test]
    async fn attributes_must_carry_a_valid_key() {
        let (store, _, directory) = new_store();
        directory.insert("alice", "peer-a");
        store.hydrate_caches().await.unwrap();

        let err = store
            .save_identity_with_attributes(
                "alice",
                IdentityAttributes {
                    public_key: vec![1, 2, 3],
                    first_use: true,
                    timestamp_ms: 0,
                    verified: VerifiedStatus::Default,
                    nonblocking_approval: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn verified_message_adopts_new_key() {
        let (store, _, directory) = new_store();
        directory.insert("alice", "peer-a");
        store.hydrate_caches().await.unwrap();

        // No record and default status: nothing to do.
        let key = fresh_key();
        assert!(!store
            .process_verified_message("alice", VerifiedStatus::Default, Some(&key))
            .await
            .unwrap());
        assert!(store.get_identity_record("alice").unwrap().is_none());

        // No record and verified: saved, but not a change.
        assert!(!store
            .process_verified_message("alice", VerifiedStatus::Verified, Some(&key))
            .await
            .unwrap());
        assert_eq!(store.get_verified("alice").unwrap(), VerifiedStatus::Verified);

        // Same key, different status: status only.
        assert!(!store
            .process_verified_message("alice", VerifiedStatus::Default, Some(&key))
            .await
            .unwrap());
        assert_eq!(store.get_verified("alice").unwrap(), VerifiedStatus::Default);

        // Different key: adopted.
        store
            .store_session("alice:1", open_record(1))
            .await
            .unwrap();
        let replacement = fresh_key();
        assert!(store
            .process_verified_message("alice", VerifiedStatus::Verified, Some(&replacement))
            .await
            .unwrap());
        let record = store.get_identity_record("alice").unwrap().unwrap();
        assert!(keys_match(&record.public_key, &identity_key_to_bytes(&replacement)));
        assert_eq!(record.verified, VerifiedStatus::Verified);
        assert!(record.nonblocking_approval);
        assert!(store.get_device_ids("alice").unwrap().is_empty());
    }

    #[tokio::test]
    async fn unverified_message_paths() {
        let (store, _, directory) = new_store();
        directory.insert("alice", "peer-a");
        store.hydrate_caches().await.unwrap();

        let key = fresh_key();
        store.save_identity("alice:1", &key, false).await.unwrap();

        // Same key, not yet unverified: status update only.
        assert!(!store
            .process_contact_sync_verification_state("alice", VerifiedStatus::Unverified, Some(&key))
            .await
            .unwrap());
        assert_eq!(store.get_verified("alice").unwrap(), VerifiedStatus::Unverified);

        // Same key, already unverified: nothing.
        assert!(!store
            .process_unverified_message("alice", VerifiedStatus::Unverified, Some(&key))
            .await
            .unwrap());

        // New key: adopted.
        assert!(store
            .process_unverified_message("alice", VerifiedStatus::Unverified, Some(&fresh_key()))
            .await
            .unwrap());

        // No key to adopt is a bad argument.
        directory.insert("bob", "peer-b");
        let err = store
            .process_unverified_message("bob", VerifiedStatus::Unverified, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn removing_identity_drops_sessions() {
        let (store, gateway, directory) = new_store();
        directory.insert("alice", "peer-a");
        store.hydrate_caches().await.unwrap();
        store.save_identity("alice:1", &fresh_key(), false).await.unwrap();
        store
            .store_session("alice:1", open_record(1))
            .await
            .unwrap();

        store.remove_identity_key("alice").await.unwrap();
        assert!(store.get_identity_record("alice").unwrap().is_none());
        assert!(gateway.identity_key("peer-a").is_none());
        assert!(store.load_session("alice:1").unwrap().is_none());
    }

    #[tokio::test]
    async fn key_changes_in_jobs_on_two_devices_do_not_block_each_other() {
        use std::time::{Duration, Instant};

        use tokio::sync::Barrier;

        use crate::address::PeerDirectory;
        use crate::config::StoreConfig;
        use crate::gateway::PersistenceGateway;
        use crate::memory::{MemoryDirectory, MemoryGateway};

        let directory = Arc::new(MemoryDirectory::new());
        directory.insert("alice", "peer-a");
        let store = ProtocolStore::new(
            Arc::new(MemoryGateway::new()) as Arc<dyn PersistenceGateway>,
            directory as Arc<dyn PeerDirectory>,
            StoreConfig {
                session_job_timeout_ms: 1_000,
                ..StoreConfig::default()
            },
        );
        store.hydrate_caches().await.unwrap();
        store.save_identity("alice:1", &fresh_key(), false).await.unwrap();
        for address in ["alice:1", "alice:2"] {
            store.store_session(address, open_record(1)).await.unwrap();
        }

        // Both jobs hold their own device when the key change lands.
        let barrier = Barrier::new(2);
        let job = |device: u32| {
            let (store, barrier) = (&store, &barrier);
            async move {
                let address = format!("alice:{device}");
                store
                    .enqueue_session_job(&address, async {
                        barrier.wait().await;
                        store.save_identity(&address, &fresh_key(), false).await
                    })
                    .await
            }
        };
        let started = Instant::now();
        let (first, second) = tokio::join!(job(1), job(2));
        assert!(first.unwrap());
        assert!(second.unwrap());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(store.get_device_ids("alice").unwrap().is_empty());
    }
}
