//! Durable storage seam.
//!
//! The store never touches disk itself. Everything it persists goes through
//! a [`PersistenceGateway`], keyed by the ids on the row types below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::OwnIdentityRow;
use crate::trust::IdentityRecord;

/// Persisted one-time prekey.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PreKeyRow {
    pub id: u32,
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

/// Persisted signed prekey.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SignedPreKeyRow {
    pub id: u32,
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
    #[serde(default)]
    pub signature: Vec<u8>,
    pub created_at: u64,
    pub confirmed: bool,
}

/// Persisted session for one peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    /// `"<peerId>.<deviceId>"`.
    pub id: String,
    /// `None` for the legacy JSON layout, `Some(2)` for the current one.
    pub version: Option<u32>,
    /// Peer id owning the session.
    pub conversation_id: String,
    pub device_id: u32,
    /// Base64 record (version 2) or legacy JSON text.
    pub record: String,
}

/// An incoming envelope that has not been fully processed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnprocessedEnvelope {
    pub id: String,
    pub version: u32,
    /// Base64 of the raw envelope as received.
    pub envelope: Option<String>,
    pub timestamp: u64,
    pub attempts: u32,
    pub source: Option<String>,
    pub source_device: Option<u32>,
    pub server_timestamp: Option<u64>,
    /// Base64 of the decrypted content, once decryption succeeded.
    pub decrypted: Option<String>,
}

/// Fields filled in after an unprocessed envelope is decrypted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnprocessedUpdate {
    pub source: Option<String>,
    pub source_device: Option<u32>,
    pub server_timestamp: Option<u64>,
    pub decrypted: Option<String>,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    // ── Own identity ───────────────────────────────────────────────────
    async fn load_own_identity(&self) -> anyhow::Result<Option<OwnIdentityRow>>;
    async fn save_own_identity(&self, row: &OwnIdentityRow) -> anyhow::Result<()>;

    // ── Identity keys ──────────────────────────────────────────────────
    async fn get_all_identity_keys(&self) -> anyhow::Result<Vec<IdentityRecord>>;
    async fn create_or_update_identity_key(&self, record: &IdentityRecord) -> anyhow::Result<()>;
    async fn remove_identity_key_by_id(&self, id: &str) -> anyhow::Result<()>;

    // ── Sessions ───────────────────────────────────────────────────────
    async fn get_all_sessions(&self) -> anyhow::Result<Vec<SessionRow>>;
    async fn create_or_update_session(&self, row: &SessionRow) -> anyhow::Result<()>;
    async fn remove_session_by_id(&self, id: &str) -> anyhow::Result<()>;
    async fn remove_sessions_by_conversation(&self, conversation_id: &str) -> anyhow::Result<()>;
    async fn remove_all_sessions(&self) -> anyhow::Result<()>;

    // ── Prekeys ────────────────────────────────────────────────────────
    async fn get_all_pre_keys(&self) -> anyhow::Result<Vec<PreKeyRow>>;
    async fn create_or_update_pre_key(&self, row: &PreKeyRow) -> anyhow::Result<()>;
    async fn remove_pre_key_by_id(&self, id: u32) -> anyhow::Result<()>;
    async fn remove_all_pre_keys(&self) -> anyhow::Result<()>;

    // ── Signed prekeys ─────────────────────────────────────────────────
    async fn get_all_signed_pre_keys(&self) -> anyhow::Result<Vec<SignedPreKeyRow>>;
    async fn create_or_update_signed_pre_key(&self, row: &SignedPreKeyRow) -> anyhow::Result<()>;
    async fn remove_signed_pre_key_by_id(&self, id: u32) -> anyhow::Result<()>;
    async fn remove_all_signed_pre_keys(&self) -> anyhow::Result<()>;

    // ── Unprocessed envelopes ──────────────────────────────────────────
    async fn get_unprocessed_count(&self) -> anyhow::Result<usize>;
    async fn get_all_unprocessed(&self) -> anyhow::Result<Vec<UnprocessedEnvelope>>;
    async fn get_unprocessed_by_id(&self, id: &str) -> anyhow::Result<Option<UnprocessedEnvelope>>;
    async fn save_unprocessed(&self, envelope: &UnprocessedEnvelope) -> anyhow::Result<()>;
    async fn save_unprocesseds(&self, envelopes: &[UnprocessedEnvelope]) -> anyhow::Result<()>;
    async fn update_unprocessed_attempts(&self, id: &str, attempts: u32) -> anyhow::Result<()>;
    async fn update_unprocessed_with_data(
        &self,
        id: &str,
        update: &UnprocessedUpdate,
    ) -> anyhow::Result<()>;
    async fn remove_unprocessed(&self, id: &str) -> anyhow::Result<()>;
    async fn remove_all_unprocessed(&self) -> anyhow::Result<()>;

    // ── Everything ─────────────────────────────────────────────────────
    /// Wipe every table, own identity included.
    async fn remove_all(&self) -> anyhow::Result<()>;
}
