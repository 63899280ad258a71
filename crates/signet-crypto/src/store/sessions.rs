//! Session lifecycle. Every write to a device's session runs in that
//! device's queue, and no job waits on another device's queue while it
//! holds its own.

use std::future::Future;
use std::sync::Arc;

use libsignal_protocol::SessionRecord;
use tracing::{debug, info, warn};

use super::{tolerate_removal, ProtocolStore};
use crate::address::NormalizedAddress;
use crate::cache::CacheEntry;
use crate::error::StoreError;
use crate::gateway::SessionRow;
use crate::queue::{Deferred, SessionQueues};
use crate::session::{encode_record, maybe_migrate_session, SESSION_VERSION};

impl ProtocolStore {
    /// The session for `"<identifier>:<deviceId>"`, migrating a legacy row
    /// on first access. The migrated form is cached, not written back.
    pub fn load_session(&self, address: &str) -> Result<Option<Arc<SessionRecord>>, StoreError> {
        let address = self.normalize(address)?;
        self.load_session_by_key(&address.key())
    }

    pub(crate) fn load_session_by_key(
        &self,
        key: &str,
    ) -> Result<Option<Arc<SessionRecord>>, StoreError> {
        let own = self.own()?;
        let max_archived = self.config.max_archived_states;
        self.sessions.with(|sessions| {
            sessions
                .get_mut(key)
                .map(|entry| {
                    entry.hydrate(|row| maybe_migrate_session(row, own.as_ref(), max_archived))
                })
                .transpose()
        })?
    }

    /// Persist `record` in the current format and cache it.
    pub async fn store_session(&self, address: &str, record: SessionRecord) -> Result<(), StoreError> {
        let address = self.normalize(address)?;
        self.in_queue(&address.key(), self.write_session(&address, record))
            .await
    }

    pub(crate) async fn write_session(
        &self,
        address: &NormalizedAddress,
        record: SessionRecord,
    ) -> Result<(), StoreError> {
        self.sessions.with(|_| ())?;

        let row = SessionRow {
            id: address.key(),
            version: Some(SESSION_VERSION),
            conversation_id: address.peer_id.clone(),
            device_id: address.device_id,
            record: encode_record(&record)?,
        };
        self.gateway
            .create_or_update_session(&row)
            .await
            .map_err(StoreError::Persistence)?;
        debug!(session_id = %row.id, "session stored");
        self.sessions.with(|sessions| {
            sessions.insert(row.id.clone(), CacheEntry::hydrated(row, record));
        })
    }

    /// Run `job` in the address's session queue. This is how an encryption
    /// engine performs its load, mutate and store cycle without racing
    /// other work on the same device.
    pub async fn enqueue_session_job<T, F>(&self, address: &str, job: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let address = self.normalize(address)?;
        self.in_queue(&address.key(), job).await
    }

    /// Run `job` in `key`'s queue, then carry out the work it deferred to
    /// other devices. The job's result is returned even when deferred work
    /// fails; those failures are logged.
    pub(crate) async fn in_queue<T, F>(&self, key: &str, job: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let completed = self.queues.run(key, job).await;
        for (other, work) in completed.deferred {
            let done = match work {
                Deferred::Archive => self.queues.run(&other, self.archive_in_queue(&other)).await,
                Deferred::Remove => self.queues.run(&other, self.remove_in_queue(&other)).await,
            };
            if let Err(e) = done.result {
                warn!(session_id = %other, ?work, "deferred session work failed: {e}");
            }
        }
        completed.result
    }

    /// Cached device ids under `peer_id`, ascending.
    fn session_devices(&self, peer_id: &str) -> Result<Vec<u32>, StoreError> {
        let mut devices: Vec<u32> = self.sessions.with(|sessions| {
            sessions
                .values()
                .map(CacheEntry::raw)
                .filter(|row| row.conversation_id == peer_id)
                .map(|row| row.device_id)
                .collect()
        })?;
        devices.sort_unstable();
        Ok(devices)
    }

    /// Devices of a peer that have a live (not merely archived) session.
    pub fn get_device_ids(&self, identifier: &str) -> Result<Vec<u32>, StoreError> {
        let peer_id = self.resolve_peer(identifier)?;
        let mut open = Vec::new();
        for device_id in self.session_devices(&peer_id)? {
            let key = NormalizedAddress::new(peer_id.as_str(), device_id).key();
            if let Some(record) = self.load_session_by_key(&key)? {
                if record.has_current_session_state() {
                    open.push(device_id);
                }
            }
        }
        Ok(open)
    }

    // ── Archiving ──────────────────────────────────────────────────────

    pub async fn archive_session(&self, address: &str) -> Result<(), StoreError> {
        let address = self.normalize(address)?;
        self.archive_device(&address).await
    }

    /// Archive every other device of the same peer.
    pub async fn archive_sibling_sessions(&self, address: &str) -> Result<(), StoreError> {
        let address = self.normalize(address)?;
        info!(peer_id = %address.peer_id, device_id = address.device_id, "archiving sibling sessions");
        for device_id in self.session_devices(&address.peer_id)? {
            if device_id != address.device_id {
                self.archive_device(&NormalizedAddress::new(address.peer_id.as_str(), device_id))
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn archive_all_sessions(&self, identifier: &str) -> Result<(), StoreError> {
        let peer_id = self.resolve_peer(identifier)?;
        self.archive_peer_sessions(&peer_id).await
    }

    pub(super) async fn archive_peer_sessions(&self, peer_id: &str) -> Result<(), StoreError> {
        info!(peer_id, "archiving all sessions");
        for device_id in self.session_devices(peer_id)? {
            self.archive_device(&NormalizedAddress::new(peer_id, device_id))
                .await?;
        }
        Ok(())
    }

    /// From inside another device's job this only records the archive; it
    /// runs once that job has released its queue.
    async fn archive_device(&self, address: &NormalizedAddress) -> Result<(), StoreError> {
        let key = address.key();
        if SessionQueues::defer(&key, Deferred::Archive) {
            debug!(session_id = %key, "archive deferred");
            return Ok(());
        }
        self.in_queue(&key, self.archive_in_queue(&key)).await
    }

    /// Caller holds `key`'s queue.
    async fn archive_in_queue(&self, key: &str) -> Result<(), StoreError> {
        let Some(record) = self.load_session_by_key(key)? else {
            return Ok(());
        };
        if !record.has_current_session_state() {
            return Ok(());
        }
        let Some(address) = self.cached_address(key)? else {
            return Ok(());
        };
        let mut archived = SessionRecord::clone(&record);
        archived.archive_current_state()?;
        debug!(session_id = %key, "session archived");
        self.write_session(&address, archived).await
    }

    fn cached_address(&self, key: &str) -> Result<Option<NormalizedAddress>, StoreError> {
        self.sessions.with(|sessions| {
            sessions.get(key).map(|entry| {
                let row = entry.raw();
                NormalizedAddress::new(row.conversation_id.as_str(), row.device_id)
            })
        })
    }

    // ── Removal ────────────────────────────────────────────────────────

    pub async fn remove_session(&self, address: &str) -> Result<(), StoreError> {
        let address = self.normalize(address)?;
        self.remove_device(&address.key()).await
    }

    pub async fn remove_all_sessions(&self, identifier: &str) -> Result<(), StoreError> {
        let peer_id = self.resolve_peer(identifier)?;
        self.remove_peer_sessions(&peer_id).await
    }

    pub(super) async fn remove_peer_sessions(&self, peer_id: &str) -> Result<(), StoreError> {
        for device_id in self.session_devices(peer_id)? {
            self.remove_device(&NormalizedAddress::new(peer_id, device_id).key())
                .await?;
        }
        info!(peer_id, "all sessions of peer removed");
        Ok(())
    }

    pub async fn clear_session_store(&self) -> Result<(), StoreError> {
        let keys: Vec<String> =
            self.sessions.with(|sessions| sessions.keys().cloned().collect())?;
        for key in &keys {
            self.remove_device(key).await?;
        }
        info!(sessions = keys.len(), "session store cleared");
        Ok(())
    }

    async fn remove_device(&self, key: &str) -> Result<(), StoreError> {
        if SessionQueues::defer(key, Deferred::Remove) {
            debug!(session_id = %key, "removal deferred");
            return Ok(());
        }
        self.in_queue(key, self.remove_in_queue(key)).await
    }

    /// Caller holds `key`'s queue.
    async fn remove_in_queue(&self, key: &str) -> Result<(), StoreError> {
        self.sessions.with(|sessions| {
            sessions.remove(key);
        })?;
        tolerate_removal(
            self.gateway.remove_session_by_id(key).await,
            "session",
            key,
        );
        info!(session_id = %key, "session removed");
        Ok(())
    }
}
