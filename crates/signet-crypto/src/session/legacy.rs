//! Migration of unversioned (legacy) session rows.
//!
//! Legacy rows hold a JSON document: a map of sessions keyed by base key,
//! each carrying its ratchet, index info and chains keyed by ratchet public
//! key. Binary values are base64 strings. Migration rebuilds the same state
//! as a libsignal [`SessionRecord`]. It depends only on its inputs.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use libsignal_protocol::SessionRecord;
use serde::Deserialize;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::record::{
    record_from_states, Chain, ChainKey, MessageKey, PendingPreKey, SessionStructure,
    MAX_RECEIVER_CHAINS, MIGRATED_SESSION_VERSION,
};
use crate::error::StoreError;

const CHAIN_TYPE_SENDING: u8 = 1;
const CHAIN_TYPE_RECEIVING: u8 = 2;
const OPEN: i64 = -1;

#[derive(Deserialize)]
struct LegacyRecord {
    #[serde(default)]
    sessions: BTreeMap<String, LegacySession>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySession {
    registration_id: u32,
    current_ratchet: LegacyRatchet,
    index_info: LegacyIndexInfo,
    #[serde(default)]
    pending_pre_key: Option<LegacyPendingPreKey>,
    /// Chains live alongside the fixed fields, keyed by ratchet key.
    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRatchet {
    root_key: String,
    previous_counter: u32,
    ephemeral_key_pair: LegacyKeyPair,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyKeyPair {
    pub_key: String,
    priv_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyIndexInfo {
    remote_identity_key: String,
    closed: i64,
    base_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPendingPreKey {
    base_key: String,
    signed_key_id: u32,
    #[serde(default)]
    pre_key_id: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyChain {
    chain_key: LegacyChainKey,
    chain_type: u8,
    #[serde(default)]
    message_keys: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct LegacyChainKey {
    /// Starts at -1 before the first message.
    counter: i64,
    #[serde(default)]
    key: Option<String>,
}

/// Context shared by every state built from one legacy row.
struct Migration<'a> {
    id: &'a str,
    local_identity_public: &'a [u8],
    local_registration_id: u32,
}

impl Migration<'_> {
    fn corrupt(&self, reason: impl Into<String>) -> StoreError {
        StoreError::CorruptSession {
            id: self.id.to_owned(),
            reason: reason.into(),
        }
    }

    fn bytes(&self, field: &str, value: &str) -> Result<Vec<u8>, StoreError> {
        STANDARD
            .decode(value)
            .map_err(|e| self.corrupt(format!("{field}: {e}")))
    }

    /// Legacy rows keep the 32-byte seed; libsignal keeps the expanded keys.
    fn message_key(&self, index: u32, seed: &[u8]) -> Result<MessageKey, StoreError> {
        let mut okm = Zeroizing::new([0u8; 80]);
        Hkdf::<Sha256>::new(None, seed)
            .expand(b"WhisperMessageKeys", okm.as_mut())
            .map_err(|_| self.corrupt(format!("message key {index}")))?;
        Ok(MessageKey {
            index,
            cipher_key: okm[..32].to_vec(),
            mac_key: okm[32..64].to_vec(),
            iv: okm[64..].to_vec(),
        })
    }

    fn chain(&self, ratchet_key: &str, legacy: &LegacyChain) -> Result<Chain, StoreError> {
        let index = u32::try_from(legacy.chain_key.counter + 1)
            .map_err(|_| self.corrupt(format!("chain counter {}", legacy.chain_key.counter)))?;
        let key = match legacy.chain_key.key.as_deref() {
            Some(k) => self.bytes("chainKey.key", k)?,
            None => Vec::new(),
        };

        let mut message_keys = legacy
            .message_keys
            .iter()
            .map(|(counter, seed)| {
                let index = counter
                    .parse::<u32>()
                    .map_err(|_| self.corrupt(format!("message key index {counter:?}")))?;
                let seed = Zeroizing::new(self.bytes("messageKeys", seed)?);
                self.message_key(index, &seed)
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        message_keys.sort_by_key(|k| k.index);

        Ok(Chain {
            sender_ratchet_key: self.bytes("ratchet key", ratchet_key)?,
            sender_ratchet_key_private: Vec::new(),
            chain_key: Some(ChainKey { index, key }),
            message_keys,
        })
    }

    fn state(&self, session: &LegacySession) -> Result<SessionStructure, StoreError> {
        let ratchet = &session.current_ratchet;
        let sender_key = ratchet.ephemeral_key_pair.pub_key.as_str();

        let mut sender_chain = None;
        let mut receiver_chains = Vec::new();
        for (key, value) in &session.rest {
            // Not every extra field is a chain (e.g. oldRatchetList).
            let Ok(chain) = LegacyChain::deserialize(value) else {
                continue;
            };
            if key == sender_key {
                if chain.chain_type != CHAIN_TYPE_SENDING {
                    return Err(self.corrupt("sender ratchet key maps to a receiving chain"));
                }
                let mut built = self.chain(key, &chain)?;
                built.sender_ratchet_key_private =
                    self.bytes("ephemeralKeyPair.privKey", &ratchet.ephemeral_key_pair.priv_key)?;
                sender_chain = Some(built);
            } else if chain.chain_type == CHAIN_TYPE_RECEIVING
                && receiver_chains.len() < MAX_RECEIVER_CHAINS
            {
                receiver_chains.push(self.chain(key, &chain)?);
            }
        }

        let pending_pre_key = session
            .pending_pre_key
            .as_ref()
            .map(|pending| {
                let signed_pre_key_id = i32::try_from(pending.signed_key_id).map_err(|_| {
                    self.corrupt(format!("signed prekey id {}", pending.signed_key_id))
                })?;
                Ok::<_, StoreError>(PendingPreKey {
                    pre_key_id: pending.pre_key_id,
                    base_key: self.bytes("pendingPreKey.baseKey", &pending.base_key)?,
                    signed_pre_key_id,
                    timestamp: 0,
                })
            })
            .transpose()?;

        Ok(SessionStructure {
            session_version: MIGRATED_SESSION_VERSION,
            local_identity_public: self.local_identity_public.to_vec(),
            remote_identity_public: self
                .bytes("remoteIdentityKey", &session.index_info.remote_identity_key)?,
            root_key: self.bytes("rootKey", &ratchet.root_key)?,
            previous_counter: ratchet.previous_counter,
            sender_chain,
            receiver_chains,
            pending_pre_key,
            remote_registration_id: session.registration_id,
            local_registration_id: self.local_registration_id,
            needs_refresh: false,
            alice_base_key: self.bytes("baseKey", &session.index_info.base_key)?,
        })
    }
}

/// Rebuild a legacy JSON session row as a libsignal [`SessionRecord`].
///
/// The open session (`closed == -1`) becomes the current state; closed
/// sessions become archived states, most recently closed first. More than
/// one open session, or none at all, is a corrupt record.
pub fn migrate_legacy_session(
    id: &str,
    legacy_json: &str,
    local_identity_public: &[u8],
    local_registration_id: u32,
    max_archived: usize,
) -> Result<SessionRecord, StoreError> {
    let migration = Migration {
        id,
        local_identity_public,
        local_registration_id,
    };
    let legacy: LegacyRecord = serde_json::from_str(legacy_json)
        .map_err(|e| migration.corrupt(format!("legacy JSON: {e}")))?;

    let mut open = Vec::new();
    let mut closed = Vec::new();
    for session in legacy.sessions.values() {
        if session.index_info.closed == OPEN {
            open.push(session);
        } else {
            closed.push(session);
        }
    }
    if open.len() > 1 {
        return Err(migration.corrupt("more than one open session"));
    }
    if open.is_empty() && closed.is_empty() {
        return Err(migration.corrupt("record has no sessions"));
    }

    // Stable sort keeps base-key order among equal timestamps.
    closed.sort_by(|a, b| b.index_info.closed.cmp(&a.index_info.closed));
    closed.truncate(max_archived);

    let current = open.first().map(|s| migration.state(s)).transpose()?;
    let previous = closed
        .into_iter()
        .map(|s| migration.state(s))
        .collect::<Result<Vec<_>, _>>()?;
    record_from_states(current, &previous)
}
