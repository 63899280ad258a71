//! Current (version 2) session record layout.
//!
//! Records are libsignal [`SessionRecord`]s, persisted as base64 of their
//! protobuf serialization. The message types below mirror libsignal's
//! storage layout so that migrated state can be built field by field and
//! read back for inspection.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use libsignal_protocol::SessionRecord;
use prost::Message;

use crate::error::StoreError;

/// Ratchet protocol version written into every migrated state (pre-Kyber).
pub const MIGRATED_SESSION_VERSION: u32 = 3;

/// Archived states kept when migrating a legacy row, unless configured
/// otherwise. libsignal applies the same cap when it archives.
pub const ARCHIVED_STATES_MAX_LENGTH: usize = 40;

/// Receiver chains kept per state.
pub const MAX_RECEIVER_CHAINS: usize = 5;

#[derive(Clone, PartialEq, Message)]
pub struct ChainKey {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MessageKey {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub cipher_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub mac_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub iv: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Chain {
    #[prost(bytes = "vec", tag = "1")]
    pub sender_ratchet_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub sender_ratchet_key_private: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub chain_key: Option<ChainKey>,
    #[prost(message, repeated, tag = "4")]
    pub message_keys: Vec<MessageKey>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PendingPreKey {
    #[prost(uint32, optional, tag = "1")]
    pub pre_key_id: Option<u32>,
    #[prost(bytes = "vec", tag = "2")]
    pub base_key: Vec<u8>,
    #[prost(int32, tag = "3")]
    pub signed_pre_key_id: i32,
    /// Seconds since the epoch; zero when unknown.
    #[prost(uint64, tag = "4")]
    pub timestamp: u64,
}

/// Ratchet state for one session with one peer device.
#[derive(Clone, PartialEq, Message)]
pub struct SessionStructure {
    #[prost(uint32, tag = "1")]
    pub session_version: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub local_identity_public: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub remote_identity_public: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub root_key: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub previous_counter: u32,
    #[prost(message, optional, tag = "6")]
    pub sender_chain: Option<Chain>,
    #[prost(message, repeated, tag = "7")]
    pub receiver_chains: Vec<Chain>,
    #[prost(message, optional, tag = "9")]
    pub pending_pre_key: Option<PendingPreKey>,
    #[prost(uint32, tag = "10")]
    pub remote_registration_id: u32,
    #[prost(uint32, tag = "11")]
    pub local_registration_id: u32,
    #[prost(bool, tag = "12")]
    pub needs_refresh: bool,
    #[prost(bytes = "vec", tag = "13")]
    pub alice_base_key: Vec<u8>,
}

/// The live state plus archived states, newest first. Archived states are
/// nested serialized [`SessionStructure`]s.
#[derive(Clone, PartialEq, Message)]
pub struct RecordStructure {
    #[prost(message, optional, tag = "1")]
    pub current_session: Option<SessionStructure>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub previous_sessions: Vec<Vec<u8>>,
}

impl RecordStructure {
    pub fn previous_states(&self) -> Result<Vec<SessionStructure>, StoreError> {
        self.previous_sessions
            .iter()
            .map(|bytes| SessionStructure::decode(bytes.as_slice()).map_err(StoreError::from))
            .collect()
    }
}

/// Build a libsignal record from a live state and archived states.
pub fn record_from_states(
    current: Option<SessionStructure>,
    previous: &[SessionStructure],
) -> Result<SessionRecord, StoreError> {
    let structure = RecordStructure {
        current_session: current,
        previous_sessions: previous.iter().map(Message::encode_to_vec).collect(),
    };
    Ok(SessionRecord::deserialize(&structure.encode_to_vec())?)
}

/// Read a record back into its storage layout.
pub fn record_structure(record: &SessionRecord) -> Result<RecordStructure, StoreError> {
    Ok(RecordStructure::decode(record.serialize()?.as_slice())?)
}

/// Text-safe persisted form.
pub fn encode_record(record: &SessionRecord) -> Result<String, StoreError> {
    Ok(STANDARD.encode(record.serialize()?))
}

pub fn decode_record(id: &str, text: &str) -> Result<SessionRecord, StoreError> {
    let corrupt = |reason: String| StoreError::CorruptSession {
        id: id.to_owned(),
        reason,
    };
    let bytes = STANDARD.decode(text).map_err(|e| corrupt(e.to_string()))?;
    SessionRecord::deserialize(&bytes).map_err(|e| corrupt(e.to_string()))
}
