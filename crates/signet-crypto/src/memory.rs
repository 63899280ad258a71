//! In-process collaborators: a table-per-kind gateway and a map-backed
//! peer directory. Used by the tests and by embedders that keep state in
//! memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;

use crate::address::PeerDirectory;
use crate::gateway::{
    PersistenceGateway, PreKeyRow, SessionRow, SignedPreKeyRow, UnprocessedEnvelope,
    UnprocessedUpdate,
};
use crate::identity::OwnIdentityRow;
use crate::trust::IdentityRecord;

#[derive(Default)]
struct Tables {
    own: Option<OwnIdentityRow>,
    identity_keys: BTreeMap<String, IdentityRecord>,
    sessions: BTreeMap<String, SessionRow>,
    pre_keys: BTreeMap<u32, PreKeyRow>,
    signed_pre_keys: BTreeMap<u32, SignedPreKeyRow>,
    unprocessed: BTreeMap<String, UnprocessedEnvelope>,
}

/// [`PersistenceGateway`] over in-memory tables.
#[derive(Default)]
pub struct MemoryGateway {
    tables: Mutex<Tables>,
    fail_removals: AtomicBool,
    write_latency_ms: AtomicU64,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every `remove_*_by_id` call fail, as a flaky disk would.
    pub fn fail_removals(&self, fail: bool) {
        self.fail_removals.store(fail, Ordering::SeqCst);
    }

    /// Delay every `create_or_update_*` call, as a real backend would.
    pub fn set_write_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.write_latency_ms.store(ms, Ordering::SeqCst);
    }

    async fn settle(&self) {
        let ms = self.write_latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check_removal(&self, what: &str) -> anyhow::Result<()> {
        if self.fail_removals.load(Ordering::SeqCst) {
            bail!("removal of {what} failed");
        }
        Ok(())
    }

    /// Insert a session row directly, bypassing the store.
    pub fn put_session(&self, row: SessionRow) {
        self.tables().sessions.insert(row.id.clone(), row);
    }

    pub fn session(&self, id: &str) -> Option<SessionRow> {
        self.tables().sessions.get(id).cloned()
    }

    pub fn identity_key(&self, peer_id: &str) -> Option<IdentityRecord> {
        self.tables().identity_keys.get(peer_id).cloned()
    }

    pub fn put_identity_key(&self, record: IdentityRecord) {
        self.tables().identity_keys.insert(record.id.clone(), record);
    }

    pub fn pre_key(&self, id: u32) -> Option<PreKeyRow> {
        self.tables().pre_keys.get(&id).cloned()
    }

    pub fn has_pre_key(&self, id: u32) -> bool {
        self.tables().pre_keys.contains_key(&id)
    }

    pub fn signed_pre_key(&self, id: u32) -> Option<SignedPreKeyRow> {
        self.tables().signed_pre_keys.get(&id).cloned()
    }

    pub fn own_identity(&self) -> Option<OwnIdentityRow> {
        self.tables().own.clone()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn load_own_identity(&self) -> anyhow::Result<Option<OwnIdentityRow>> {
        Ok(self.tables().own.clone())
    }

    async fn save_own_identity(&self, row: &OwnIdentityRow) -> anyhow::Result<()> {
        self.tables().own = Some(row.clone());
        Ok(())
    }

    async fn get_all_identity_keys(&self) -> anyhow::Result<Vec<IdentityRecord>> {
        Ok(self.tables().identity_keys.values().cloned().collect())
    }

    async fn create_or_update_identity_key(&self, record: &IdentityRecord) -> anyhow::Result<()> {
        self.settle().await;
        self.tables()
            .identity_keys
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn remove_identity_key_by_id(&self, id: &str) -> anyhow::Result<()> {
        self.check_removal("identity key")?;
        self.tables().identity_keys.remove(id);
        Ok(())
    }

    async fn get_all_sessions(&self) -> anyhow::Result<Vec<SessionRow>> {
        Ok(self.tables().sessions.values().cloned().collect())
    }

    async fn create_or_update_session(&self, row: &SessionRow) -> anyhow::Result<()> {
        self.settle().await;
        self.tables().sessions.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn remove_session_by_id(&self, id: &str) -> anyhow::Result<()> {
        self.check_removal("session")?;
        self.tables().sessions.remove(id);
        Ok(())
    }

    async fn remove_sessions_by_conversation(&self, conversation_id: &str) -> anyhow::Result<()> {
        self.check_removal("sessions")?;
        self.tables()
            .sessions
            .retain(|_, row| row.conversation_id != conversation_id);
        Ok(())
    }

    async fn remove_all_sessions(&self) -> anyhow::Result<()> {
        self.tables().sessions.clear();
        Ok(())
    }

    async fn get_all_pre_keys(&self) -> anyhow::Result<Vec<PreKeyRow>> {
        Ok(self.tables().pre_keys.values().cloned().collect())
    }

    async fn create_or_update_pre_key(&self, row: &PreKeyRow) -> anyhow::Result<()> {
        self.settle().await;
        self.tables().pre_keys.insert(row.id, row.clone());
        Ok(())
    }

    async fn remove_pre_key_by_id(&self, id: u32) -> anyhow::Result<()> {
        self.check_removal("prekey")?;
        self.tables().pre_keys.remove(&id);
        Ok(())
    }

    async fn remove_all_pre_keys(&self) -> anyhow::Result<()> {
        self.tables().pre_keys.clear();
        Ok(())
    }

    async fn get_all_signed_pre_keys(&self) -> anyhow::Result<Vec<SignedPreKeyRow>> {
        Ok(self.tables().signed_pre_keys.values().cloned().collect())
    }

    async fn create_or_update_signed_pre_key(&self, row: &SignedPreKeyRow) -> anyhow::Result<()> {
        self.settle().await;
        self.tables().signed_pre_keys.insert(row.id, row.clone());
        Ok(())
    }

    async fn remove_signed_pre_key_by_id(&self, id: u32) -> anyhow::Result<()> {
        self.check_removal("signed prekey")?;
        self.tables().signed_pre_keys.remove(&id);
        Ok(())
    }

    async fn remove_all_signed_pre_keys(&self) -> anyhow::Result<()> {
        self.tables().signed_pre_keys.clear();
        Ok(())
    }

    async fn get_unprocessed_count(&self) -> anyhow::Result<usize> {
        Ok(self.tables().unprocessed.len())
    }

    async fn get_all_unprocessed(&self) -> anyhow::Result<Vec<UnprocessedEnvelope>> {
        Ok(self.tables().unprocessed.values().cloned().collect())
    }

    async fn get_unprocessed_by_id(&self, id: &str) -> anyhow::Result<Option<UnprocessedEnvelope>> {
        Ok(self.tables().unprocessed.get(id).cloned())
    }

    async fn save_unprocessed(&self, envelope: &UnprocessedEnvelope) -> anyhow::Result<()> {
        self.tables()
            .unprocessed
            .insert(envelope.id.clone(), envelope.clone());
        Ok(())
    }

    async fn save_unprocesseds(&self, envelopes: &[UnprocessedEnvelope]) -> anyhow::Result<()> {
        let mut tables = self.tables();
        for envelope in envelopes {
            tables
                .unprocessed
                .insert(envelope.id.clone(), envelope.clone());
        }
        Ok(())
    }

    async fn update_unprocessed_attempts(&self, id: &str, attempts: u32) -> anyhow::Result<()> {
        let mut tables = self.tables();
        let envelope = tables
            .unprocessed
            .get_mut(id)
            .ok_or_else(|| anyhow!("no unprocessed envelope {id}"))?;
        envelope.attempts = attempts;
        Ok(())
    }

    async fn update_unprocessed_with_data(
        &self,
        id: &str,
        update: &UnprocessedUpdate,
    ) -> anyhow::Result<()> {
        let mut tables = self.tables();
        let envelope = tables
            .unprocessed
            .get_mut(id)
            .ok_or_else(|| anyhow!("no unprocessed envelope {id}"))?;
        if update.source.is_some() {
            envelope.source = update.source.clone();
        }
        if update.source_device.is_some() {
            envelope.source_device = update.source_device;
        }
        if update.server_timestamp.is_some() {
            envelope.server_timestamp = update.server_timestamp;
        }
        if update.decrypted.is_some() {
            envelope.decrypted = update.decrypted.clone();
        }
        Ok(())
    }

    async fn remove_unprocessed(&self, id: &str) -> anyhow::Result<()> {
        self.check_removal("unprocessed envelope")?;
        self.tables().unprocessed.remove(id);
        Ok(())
    }

    async fn remove_all_unprocessed(&self) -> anyhow::Result<()> {
        self.tables().unprocessed.clear();
        Ok(())
    }

    async fn remove_all(&self) -> anyhow::Result<()> {
        *self.tables() = Tables::default();
        Ok(())
    }
}

/// [`PeerDirectory`] over a map. A registered peer id also resolves to
/// itself.
#[derive(Default)]
pub struct MemoryDirectory {
    peers: RwLock<HashMap<String, String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identifier: impl Into<String>, peer_id: impl Into<String>) {
        let peer_id = peer_id.into();
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.insert(peer_id.clone(), peer_id.clone());
        peers.insert(identifier.into(), peer_id);
    }
}

impl PeerDirectory for MemoryDirectory {
    fn resolve(&self, identifier: &str) -> Option<String> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .cloned()
    }
}
