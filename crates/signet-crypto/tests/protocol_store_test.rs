//! Store-level integration tests.
//!
//! These exercise the store through its public surface only, against the
//! in-memory gateway and directory:
//! - hydration and cache identity
//! - legacy session migration
//! - trust-on-first-use and key-change handling
//! - prekey single use
//! - per-address serialization
//! - device linking into a fresh store

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use libsignal_protocol::IdentityKey;
use serde_json::json;
use signet_crypto::gateway::SessionRow;
use signet_crypto::memory::{MemoryDirectory, MemoryGateway};
use signet_crypto::prekey::generate_prekeys;
use signet_crypto::session::record::MIGRATED_SESSION_VERSION;
use signet_crypto::session::{encode_record, record_from_states, record_structure, SESSION_VERSION};
use signet_crypto::{
    generate_identity_key_pair, Direction, PersistenceGateway, PeerDirectory, ProtocolStore,
    ProvisionMessage, ProvisioningCipher, SessionRecord, SessionStructure, StoreConfig,
    StoreError, StoreEvent, VerifiedStatus,
};

struct Fixture {
    store: Arc<ProtocolStore>,
    gateway: Arc<MemoryGateway>,
    directory: Arc<MemoryDirectory>,
}

// Logs show up with RUST_LOG=signet_crypto=debug and --nocapture.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signet_crypto=warn".into()),
        )
        .with_test_writer()
        .try_init();
}

fn fixture_with(config: StoreConfig) -> Fixture {
    init_tracing();
    let gateway = Arc::new(MemoryGateway::new());
    let directory = Arc::new(MemoryDirectory::new());
    directory.insert("alice", "peer-a");
    directory.insert("+15550002222", "peer-a");
    directory.insert("bob", "peer-b");
    let store = Arc::new(ProtocolStore::new(
        Arc::clone(&gateway) as Arc<dyn PersistenceGateway>,
        Arc::clone(&directory) as Arc<dyn PeerDirectory>,
        config,
    ));
    Fixture {
        store,
        gateway,
        directory,
    }
}

async fn hydrated() -> Fixture {
    let fixture = fixture_with(StoreConfig::default());
    fixture.store.hydrate_caches().await.expect("hydrate failed");
    fixture
}

fn state(tag: u8) -> SessionStructure {
    SessionStructure {
        session_version: MIGRATED_SESSION_VERSION,
        local_identity_public: vec![5; 33],
        remote_identity_public: vec![tag; 33],
        root_key: vec![tag; 32],
        remote_registration_id: 1,
        local_registration_id: 2,
        alice_base_key: vec![tag; 33],
        ..Default::default()
    }
}

fn open_record(tag: u8) -> SessionRecord {
    record_from_states(Some(state(tag)), &[]).expect("record from state")
}

fn current_state(record: &SessionRecord) -> Option<SessionStructure> {
    record_structure(record).unwrap().current_session
}

fn previous_states(record: &SessionRecord) -> Vec<SessionStructure> {
    record_structure(record).unwrap().previous_states().unwrap()
}

fn fresh_key() -> IdentityKey {
    *generate_identity_key_pair().identity_key()
}

fn b64(fill: u8, len: usize) -> String {
    STANDARD.encode(vec![fill; len])
}

fn legacy_json(sessions: &[(u8, i64)]) -> String {
    let mut map = serde_json::Map::new();
    for &(tag, closed) in sessions {
        map.insert(
            b64(tag, 33),
            json!({
                "registrationId": 1000 + tag as u32,
                "currentRatchet": {
                    "rootKey": b64(tag, 32),
                    "previousCounter": 0,
                    "ephemeralKeyPair": { "pubKey": b64(tag, 33), "privKey": b64(tag, 32) }
                },
                "indexInfo": {
                    "remoteIdentityKey": b64(9, 33),
                    "closed": closed,
                    "baseKey": b64(tag, 33)
                }
            }),
        );
    }
    json!({ "sessions": map }).to_string()
}

// ── Hydration ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pre_hydration_use_names_the_cache() {
    let fixture = fixture_with(StoreConfig::default());
    let err = fixture.store.load_session("alice:1").unwrap_err();
    assert!(matches!(err, StoreError::NotInitialized(_)), "{err}");
    assert!(fixture.store.get_verified("alice").is_err());
}

#[tokio::test]
async fn test_loading_a_current_session_twice_returns_the_same_object() {
    let fixture = fixture_with(StoreConfig::default());
    fixture.gateway.put_session(SessionRow {
        id: "peer-a.1".into(),
        version: Some(SESSION_VERSION),
        conversation_id: "peer-a".into(),
        device_id: 1,
        record: encode_record(&open_record(1)).unwrap(),
    });
    fixture.store.hydrate_caches().await.unwrap();

    let first = fixture.store.load_session("alice:1").unwrap().unwrap();
    let second = fixture.store.load_session("alice:1").unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // Another identifier for the same peer reaches the same cache entry.
    let third = fixture.store.load_session("+15550002222:1").unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &third));
}

// ── Migration ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_legacy_migration_is_pure_and_stable() {
    let identity = generate_identity_key_pair();
    let legacy = legacy_json(&[(1, 100), (2, -1)]);
    let legacy_row = SessionRow {
        id: "peer-a.1".into(),
        version: None,
        conversation_id: "peer-a".into(),
        device_id: 1,
        record: legacy.clone(),
    };

    let mut migrated = Vec::new();
    for _ in 0..2 {
        let fixture = fixture_with(StoreConfig::default());
        fixture.gateway.put_session(legacy_row.clone());
        fixture.store.hydrate_caches().await.unwrap();
        fixture
            .store
            .set_own_identity(&identity, 4242, None)
            .await
            .unwrap();
        let record = fixture.store.load_session("alice:1").unwrap().unwrap();
        assert_eq!(fixture.gateway.session("peer-a.1").unwrap().record, legacy);
        migrated.push(SessionRecord::clone(&record));
    }
    assert_eq!(
        migrated[0].serialize().unwrap(),
        migrated[1].serialize().unwrap()
    );

    let record = &migrated[0];
    let current = current_state(record).unwrap();
    assert_eq!(current.root_key, vec![2; 32]);
    assert_eq!(current.local_registration_id, 4242);
    assert_eq!(
        current.local_identity_public,
        identity.public_key().serialize().to_vec()
    );
    assert_eq!(previous_states(record).len(), 1);

    // The migrated form, stored as version 2, comes back unchanged.
    let fixture = fixture_with(StoreConfig::default());
    fixture.gateway.put_session(SessionRow {
        version: Some(SESSION_VERSION),
        record: encode_record(record).unwrap(),
        ..legacy_row
    });
    fixture.store.hydrate_caches().await.unwrap();
    let reloaded = fixture.store.load_session("alice:1").unwrap().unwrap();
    assert_eq!(reloaded.serialize().unwrap(), record.serialize().unwrap());
}

#[tokio::test]
async fn test_unknown_session_version_is_fatal() {
    let fixture = fixture_with(StoreConfig::default());
    fixture.gateway.put_session(SessionRow {
        id: "peer-a.1".into(),
        version: Some(1),
        conversation_id: "peer-a".into(),
        device_id: 1,
        record: String::new(),
    });
    fixture.store.hydrate_caches().await.unwrap();
    assert!(matches!(
        fixture.store.load_session("alice:1"),
        Err(StoreError::UnknownSessionVersion { version: 1, .. })
    ));
    assert!(fixture.store.get_device_ids("alice").is_err());
}

// ── Trust ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_save_is_always_first_use() {
    let fixture = hydrated().await;
    for peer in ["alice", "bob"] {
        let changed = fixture
            .store
            .save_identity(&format!("{peer}:1"), &fresh_key(), false)
            .await
            .unwrap();
        assert!(!changed);
        let record = fixture.store.get_identity_record(peer).unwrap().unwrap();
        assert!(record.first_use);
        assert_eq!(record.verified, VerifiedStatus::Default);
    }
}

#[tokio::test]
async fn test_key_change_on_verified_peer_downgrades_and_archives_everything() {
    let fixture = hydrated().await;
    let store = &fixture.store;

    let old = fresh_key();
    store.save_identity("alice:1", &old, false).await.unwrap();
    store
        .set_verified("alice", VerifiedStatus::Verified, Some(&old))
        .await
        .unwrap();
    for device in 1..=3 {
        store
            .store_session(&format!("alice:{device}"), open_record(device))
            .await
            .unwrap();
    }
    store.store_session("bob:1", open_record(9)).await.unwrap();

    let changed = store.save_identity("alice:2", &fresh_key(), false).await.unwrap();

    assert!(changed);
    assert_eq!(store.get_verified("alice").unwrap(), VerifiedStatus::Unverified);
    assert!(store.get_device_ids("alice").unwrap().is_empty());
    for device in 1..=3u8 {
        let record = store
            .load_session(&format!("alice:{device}"))
            .unwrap()
            .unwrap();
        assert!(!record.has_current_session_state());
        assert_eq!(previous_states(&record), vec![state(device)]);
    }
    assert_eq!(store.get_device_ids("bob").unwrap(), vec![1]);
}

#[tokio::test]
async fn test_receiving_is_always_trusted_sending_is_not() {
    let fixture = hydrated().await;
    let store = &fixture.store;
    let stored = fresh_key();
    let other = fresh_key();
    store.save_identity("alice:1", &stored, false).await.unwrap();

    for status in [
        VerifiedStatus::Default,
        VerifiedStatus::Verified,
        VerifiedStatus::Unverified,
    ] {
        store.set_verified("alice", status, None).await.unwrap();
        for key in [&stored, &other] {
            assert!(store
                .is_trusted_identity("alice:1", key, Direction::Receiving)
                .unwrap());
        }
        assert!(!store
            .is_trusted_identity("alice:1", &other, Direction::Sending)
            .unwrap());
    }
}

#[tokio::test]
async fn test_listener_failures_do_not_unwind_the_mutation() {
    let fixture = hydrated().await;
    let store = &fixture.store;
    let seen = Arc::new(Mutex::new(Vec::new()));

    store.add_listener(|_: &StoreEvent| -> anyhow::Result<()> {
        anyhow::bail!("listener offline")
    });
    store.add_listener(|_: &StoreEvent| -> anyhow::Result<()> { panic!("listener bug") });
    let sink = Arc::clone(&seen);
    store.add_listener(move |event: &StoreEvent| -> anyhow::Result<()> {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });

    store.save_identity("bob:1", &fresh_key(), false).await.unwrap();
    let changed = store.save_identity("bob:1", &fresh_key(), false).await.unwrap();
    assert!(changed);
    assert!(!fixture.gateway.identity_key("peer-b").unwrap().first_use);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![StoreEvent::KeyChanged {
            peer_id: "peer-b".into()
        }]
    );
}

// ── Prekeys ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_prekey_five_lifecycle() {
    let fixture = hydrated().await;
    let store = &fixture.store;
    let pair = libsignal_protocol::KeyPair::generate(&mut rand::rngs::OsRng);

    store.store_pre_key(5, &pair).await.unwrap();
    let loaded = store.load_pre_key(5).unwrap().expect("prekey 5 missing");
    assert_eq!(loaded.id, 5);

    store.remove_pre_key(5).await.unwrap();
    assert!(store.load_pre_key(5).unwrap().is_none());
    store.remove_pre_key(5).await.unwrap();

    // Persistence refusing the delete is tolerated too.
    store.store_pre_key(6, &pair).await.unwrap();
    fixture.gateway.fail_removals(true);
    store.remove_pre_key(6).await.unwrap();
    assert!(store.load_pre_key(6).unwrap().is_none());
}

// ── Queues ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_same_address_mutations_do_not_interleave() {
    let fixture = hydrated().await;
    let store = &fixture.store;
    store.store_session("alice:1", open_record(0)).await.unwrap();

    // Each job reads, yields, then writes back a record with a new live
    // state and the old one archived. If the two overlapped, one archived
    // state would be lost.
    let job = move |tag: u8| {
        store.enqueue_session_job("alice:1", async move {
            let current = store.load_session("alice:1")?.expect("session missing");
            tokio::time::sleep(Duration::from_millis(20)).await;
            let structure = record_structure(&current)?;
            let mut previous: Vec<SessionStructure> =
                structure.current_session.clone().into_iter().collect();
            previous.extend(structure.previous_states()?);
            store
                .store_session("alice:1", record_from_states(Some(state(tag)), &previous)?)
                .await
        })
    };
    let (a, b) = tokio::join!(job(1), job(2));
    a.unwrap();
    b.unwrap();

    let record = store.load_session("alice:1").unwrap().unwrap();
    assert_eq!(previous_states(&record), vec![state(1), state(0)]);
    assert_eq!(current_state(&record), Some(state(2)));
}

#[tokio::test]
async fn test_timed_out_job_frees_the_address() {
    let config = StoreConfig::from_toml_str("session_job_timeout_ms = 50").unwrap();
    let fixture = fixture_with(config);
    fixture.store.hydrate_caches().await.unwrap();

    let err = fixture
        .store
        .enqueue_session_job("alice:1", async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SessionJobTimeout { .. }));

    fixture
        .store
        .store_session("alice:1", open_record(1))
        .await
        .unwrap();
    assert_eq!(fixture.store.get_device_ids("alice").unwrap(), vec![1]);
}

// ── Linking ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_linked_identity_becomes_the_store_identity() {
    let fixture = hydrated().await;
    fixture.directory.insert("+15550009999", "peer-me");

    // Primary device seals its identity to the new device's ephemeral key.
    let mut new_device = ProvisioningCipher::new();
    let mut primary = ProvisioningCipher::new();
    let account = generate_identity_key_pair();
    let mut message = ProvisionMessage::for_identity(&account);
    message.number = Some("+15550009999".into());
    message.uuid = Some("peer-me".into());
    let envelope = primary.encrypt(&message, &new_device.public_key()).unwrap();

    let linked = new_device.decrypt(&envelope).unwrap();
    fixture
        .store
        .set_own_identity(&linked.identity_key_pair, 77, linked.uuid.clone())
        .await
        .unwrap();

    let set = generate_prekeys(&fixture.store, 2, 1, 100, 10).await.unwrap();
    assert_eq!(set.registration_id, 77);
    assert!(account
        .public_key()
        .verify_signature(&set.signed_prekey_public, &set.signed_prekey_signature));

    // Our own account: only the stored key is trusted.
    fixture
        .store
        .save_identity("+15550009999:1", account.identity_key(), false)
        .await
        .unwrap();
    assert!(!fixture
        .store
        .is_trusted_identity("+15550009999:1", &fresh_key(), Direction::Receiving)
        .unwrap());

    // A second store over the same persistence sees the same identity.
    let reopened = ProtocolStore::new(
        Arc::clone(&fixture.gateway) as Arc<dyn PersistenceGateway>,
        Arc::clone(&fixture.directory) as Arc<dyn PeerDirectory>,
        StoreConfig::default(),
    );
    reopened.hydrate_caches().await.unwrap();
    assert_eq!(
        reopened.identity_key_pair().unwrap().public_key().serialize(),
        account.public_key().serialize()
    );
    assert_eq!(reopened.load_pre_key(105).unwrap().unwrap().id, 105);
}
