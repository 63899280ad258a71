//! Session records and format migration.

pub mod legacy;
pub mod record;

pub use legacy::migrate_legacy_session;
pub use record::{
    decode_record, encode_record, record_from_states, record_structure, Chain, ChainKey,
    MessageKey, PendingPreKey, RecordStructure, SessionStructure, ARCHIVED_STATES_MAX_LENGTH,
};

use libsignal_protocol::SessionRecord;
use tracing::info;

use crate::error::StoreError;
use crate::gateway::SessionRow;
use crate::identity::OwnIdentity;

/// Version tag of rows written in the current layout.
pub const SESSION_VERSION: u32 = 2;

/// Turn a persisted session row into a record.
///
/// Version 2 rows decode directly. Unversioned rows are migrated from the
/// legacy layout using this device's identity; that needs `own`. Any other
/// version is refused.
pub fn maybe_migrate_session(
    row: &SessionRow,
    own: Option<&OwnIdentity>,
    max_archived: usize,
) -> Result<SessionRecord, StoreError> {
    match row.version {
        Some(SESSION_VERSION) => decode_record(&row.id, &row.record),
        Some(version) => Err(StoreError::UnknownSessionVersion {
            id: row.id.clone(),
            version,
        }),
        None => {
            let own = own.ok_or(StoreError::MissingOwnIdentity)?;
            info!(session_id = %row.id, "migrating legacy session");
            migrate_legacy_session(
                &row.id,
                &row.record,
                &own.public_key_bytes(),
                own.registration_id,
                max_archived,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{generate_identity_key_pair, OwnIdentityRow};

    fn own() -> OwnIdentity {
        OwnIdentity::from_row(&OwnIdentityRow::new(&generate_identity_key_pair(), 77, None)).unwrap()
    }

    fn row(version: Option<u32>, record: String) -> SessionRow {
        SessionRow {
            id: "peer.1".into(),
            version,
            conversation_id: "peer".into(),
            device_id: 1,
            record,
        }
    }

    #[test]
    fn legacy_then_current_is_stable() {
        let own = own();
        let legacy = row(None, legacy::tests::legacy_record(&[(1, -1), (2, 50)]));
        let migrated = maybe_migrate_session(&legacy, Some(&own), 40).unwrap();
        let current_state = record_structure(&migrated).unwrap().current_session.unwrap();
        assert_eq!(current_state.local_identity_public, own.public_key_bytes());

        let current = row(Some(SESSION_VERSION), encode_record(&migrated).unwrap());
        let again = maybe_migrate_session(&current, Some(&own), 40).unwrap();
        assert_eq!(again.serialize().unwrap(), migrated.serialize().unwrap());
    }

    #[test]
    fn unknown_version_is_refused() {
        let err = maybe_migrate_session(&row(Some(3), String::new()), Some(&own()), 40).unwrap_err();
        assert!(matches!(err, StoreError::UnknownSessionVersion { version: 3, .. }));
    }

    #[test]
    fn legacy_needs_own_identity() {
        let legacy = row(None, legacy::tests::legacy_record(&[(1, -1)]));
        let err = maybe_migrate_session(&legacy, None, 40).unwrap_err();
        assert!(matches!(err, StoreError::MissingOwnIdentity));
    }
}
