//! Trust-on-first-use state for remote identity keys.
//!
//! The functions here are pure: they decide, the store persists.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::StoreError;
use crate::identity::keys_match;

/// Verification state of a remote identity key.
///
/// Persisted as its integer constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum VerifiedStatus {
    /// Trusted, never explicitly checked.
    #[default]
    Default,
    /// Confirmed out-of-band.
    Verified,
    /// Explicitly flagged, or demoted after a key change.
    Unverified,
}

impl From<VerifiedStatus> for i32 {
    fn from(status: VerifiedStatus) -> Self {
        match status {
            VerifiedStatus::Default => 0,
            VerifiedStatus::Verified => 1,
            VerifiedStatus::Unverified => 2,
        }
    }
}

impl TryFrom<i32> for VerifiedStatus {
    type Error = StoreError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::Verified),
            2 => Ok(Self::Unverified),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown verified status {other}"
            ))),
        }
    }
}

/// Which way a message is going when trust is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

impl From<libsignal_protocol::Direction> for Direction {
    fn from(direction: libsignal_protocol::Direction) -> Self {
        if matches!(direction, libsignal_protocol::Direction::Sending) {
            Self::Sending
        } else {
            Self::Receiving
        }
    }
}

/// One remote peer's identity key and trust flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Peer id.
    pub id: String,
    pub public_key: Vec<u8>,
    pub first_use: bool,
    pub timestamp_ms: u64,
    pub verified: VerifiedStatus,
    pub nonblocking_approval: bool,
}

/// Fields written by `save_identity_with_attributes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAttributes {
    pub public_key: Vec<u8>,
    pub first_use: bool,
    pub timestamp_ms: u64,
    pub verified: VerifiedStatus,
    pub nonblocking_approval: bool,
}

impl IdentityAttributes {
    pub fn into_record(self, id: String) -> IdentityRecord {
        IdentityRecord {
            id,
            public_key: self.public_key,
            first_use: self.first_use,
            timestamp_ms: self.timestamp_ms,
            verified: self.verified,
            nonblocking_approval: self.nonblocking_approval,
        }
    }
}

/// A key learned within the approval window, that is not a first use and
/// has not been approved yet, is held back from sending.
pub fn is_non_blocking_approval_required(
    record: &IdentityRecord,
    now_ms: u64,
    window_ms: u64,
) -> bool {
    !record.first_use
        && now_ms.saturating_sub(record.timestamp_ms) < window_ms
        && !record.nonblocking_approval
}

/// Sending-side trust. Order of checks matters: record presence, key
/// match, verified status, approval recency.
pub fn is_trusted_for_sending(
    candidate: &[u8],
    record: Option<&IdentityRecord>,
    now_ms: u64,
    window_ms: u64,
) -> bool {
    let Some(record) = record else {
        info!("is_trusted_for_sending: no previous record, trusting");
        return true;
    };
    if !keys_match(&record.public_key, candidate) {
        info!(peer_id = %record.id, "is_trusted_for_sending: identity keys don't match");
        return false;
    }
    if record.verified == VerifiedStatus::Unverified {
        error!(peer_id = %record.id, "is_trusted_for_sending: needs unverified approval");
        return false;
    }
    if is_non_blocking_approval_required(record, now_ms, window_ms) {
        error!(peer_id = %record.id, "is_trusted_for_sending: needs non-blocking approval");
        return false;
    }
    true
}

/// Status a record takes when its key is replaced. Never promotes.
pub fn demoted_status(previous: VerifiedStatus) -> VerifiedStatus {
    match previous {
        VerifiedStatus::Verified | VerifiedStatus::Unverified => VerifiedStatus::Unverified,
        VerifiedStatus::Default => VerifiedStatus::Default,
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
