//! Peer-device addressing.
//!
//! Callers hand the store `"<identifier>:<deviceId>"`. Internally every
//! session is keyed by `"<peerId>.<deviceId>"`, where the peer id comes
//! from the [`PeerDirectory`]. Two identifiers that resolve to the same
//! peer therefore share one session and one task queue.

use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Resolves a human-facing identifier (phone number, uuid) to a stable
/// peer id.
pub trait PeerDirectory: Send + Sync {
    fn resolve(&self, identifier: &str) -> Option<String>;
}

/// A caller-supplied `"<identifier>:<deviceId>"` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub identifier: String,
    pub device_id: u32,
}

impl Address {
    pub fn new(identifier: impl Into<String>, device_id: u32) -> Self {
        Self {
            identifier: identifier.into(),
            device_id,
        }
    }
}

impl FromStr for Address {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (identifier, device) = s
            .rsplit_once(':')
            .ok_or_else(|| StoreError::InvalidArgument(format!("malformed address {s:?}")))?;
        if identifier.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "address {s:?} has an empty identifier"
            )));
        }
        let device_id = device.parse::<u32>().map_err(|_| {
            StoreError::InvalidArgument(format!("address {s:?} has a bad device id"))
        })?;
        Ok(Self::new(identifier, device_id))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identifier, self.device_id)
    }
}

/// `"<peerId>.<deviceId>"`: the session cache and queue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedAddress {
    pub peer_id: String,
    pub device_id: u32,
}

impl NormalizedAddress {
    pub fn new(peer_id: impl Into<String>, device_id: u32) -> Self {
        Self {
            peer_id: peer_id.into(),
            device_id,
        }
    }

    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NormalizedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.peer_id, self.device_id)
    }
}

pub(crate) fn resolve_peer(
    directory: &dyn PeerDirectory,
    identifier: &str,
) -> Result<String, StoreError> {
    if identifier.is_empty() {
        return Err(StoreError::InvalidArgument("empty peer identifier".into()));
    }
    directory
        .resolve(identifier)
        .ok_or_else(|| StoreError::UnknownPeer(identifier.to_owned()))
}

pub(crate) fn normalize(
    directory: &dyn PeerDirectory,
    address: &str,
) -> Result<NormalizedAddress, StoreError> {
    let parsed: Address = address.parse()?;
    let peer_id = resolve_peer(directory, &parsed.identifier)?;
    Ok(NormalizedAddress::new(peer_id, parsed.device_id))
}
