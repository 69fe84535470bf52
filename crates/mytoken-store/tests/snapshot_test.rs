//! Snapshot persistence of the reference store: commits survive a reopen,
//! rolled back work never reaches disk.

use mytoken_core::{Purpose, TokenHash, UnixTime};
use mytoken_store::{
    transact, transact_keeping, MemoryStore, NodeFilter, NodeRecord, SecretId, Store, StoreError, Transaction,
    UsageKey, WrappedKeyRecord,
};

fn root(id: &str, secret_id: SecretId) -> NodeRecord {
    NodeRecord {
        id: TokenHash::from_stored(id),
        seq_no: 1,
        parent_id: None,
        root_id: TokenHash::from_stored(id),
        secret_id,
        oidc_subject: "alice".into(),
        oidc_issuer: "https://op.example.org".into(),
        name: Some("laptop".into()),
        created: UnixTime(1_700_000_000),
        last_rotated: UnixTime(1_700_000_000),
        expires_at: UnixTime(1_800_000_000),
        ip_created: Some("192.0.2.10".into()),
        restrictions: Some(serde_json::json!([{"usages_AT": 3}])),
        capabilities: vec!["AT".into(), "create_mytoken".into()],
        rotation: None,
    }
}

#[test]
fn committed_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("store.json");

    {
        let store = MemoryStore::open(&path).unwrap();
        transact(&store, |tx| -> Result<(), StoreError> {
            let secret = tx.insert_secret("nonce-ciphertext".into())?;
            tx.insert_node(root("r1", secret))?;
            tx.put_wrapped_key(WrappedKeyRecord {
                token_id: TokenHash::from_stored("r1"),
                wrapped_key: "salt-nonce-ct".into(),
                secret_id: secret,
            })?;
            tx.increment_usage(
                &UsageKey {
                    token_id: TokenHash::from_stored("r1"),
                    restriction_hash: "h".into(),
                    restriction: r#"{"usages_AT":3}"#.into(),
                },
                Purpose::AccessToken,
            )?;
            Ok(())
        })
        .unwrap();
    }

    assert!(path.exists());
    assert!(!path.with_extension("tmp").exists());

    let store = MemoryStore::open(&path).unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats.nodes, 1);
    assert_eq!(stats.secrets, 1);
    assert_eq!(stats.wrapped_keys, 1);
    assert_eq!(stats.usage_counters, 1);

    let mut tx = store.begin().unwrap();
    let node = tx.get_node(&TokenHash::from_stored("r1")).unwrap().unwrap();
    assert_eq!(node, root("r1", node.secret_id));
    assert_eq!(
        tx.usage_count(&TokenHash::from_stored("r1"), "h", Purpose::AccessToken)
            .unwrap(),
        Some(1)
    );
}

#[test]
fn secret_ids_keep_increasing_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    let first = {
        let store = MemoryStore::open(&path).unwrap();
        transact(&store, |tx| tx.insert_secret("a".into())).unwrap()
    };
    let store = MemoryStore::open(&path).unwrap();
    let second = transact(&store, |tx| tx.insert_secret("b".into())).unwrap();
    assert!(second > first);
}

#[test]
fn rolled_back_work_is_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let store = MemoryStore::open(&path).unwrap();

    let mut tx = store.begin().unwrap();
    tx.insert_node(root("r1", SecretId(1))).unwrap();
    tx.rollback().unwrap();

    assert!(!path.exists());
    let mut tx = store.begin().unwrap();
    assert!(tx.list_nodes(&NodeFilter::All).unwrap().is_empty());
}

#[test]
fn kept_errors_commit_their_writes() {
    let store = MemoryStore::new();

    let err = transact_keeping(
        &store,
        |e| matches!(e, StoreError::Conflict(_)),
        |tx| -> Result<(), StoreError> {
            tx.insert_node(root("kept", SecretId(1)))?;
            Err(StoreError::Conflict("lineage revoked".into()))
        },
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let err = transact_keeping(
        &store,
        |e| matches!(e, StoreError::Conflict(_)),
        |tx| -> Result<(), StoreError> {
            tx.insert_node(root("dropped", SecretId(2)))?;
            Err(StoreError::Backend("timeout".into()))
        },
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::Backend(_)));

    let mut tx = store.begin().unwrap();
    assert!(tx.get_node(&TokenHash::from_stored("kept")).unwrap().is_some());
    assert!(tx.get_node(&TokenHash::from_stored("dropped")).unwrap().is_none());
}

#[test]
fn corrupt_snapshot_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(MemoryStore::open(&path), Err(StoreError::Serde(_))));
}
