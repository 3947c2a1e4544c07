//! Integration tests for SqliteMetaDataStorage
//!
//! Each test creates a fresh in-memory database so tests stay isolated.

use std::path::{Path, PathBuf};

use chrono::{Duration, TimeZone, Utc};

use docsync_cache::{DatabasePool, SqliteMetaDataStorage};
use docsync_core::domain::{
    newtypes::{ChangeToken, Checksum, LocalGuid, RemoteId, RemotePath, SyncPath},
    MappedObject, ObjectType, PathMatcher,
};
use docsync_core::ports::{IMetaDataStorage, ITransmissionStorage, TransmissionRecord};

// ============================================================================
// Test helpers
// ============================================================================

fn matcher() -> PathMatcher {
    PathMatcher::new(
        SyncPath::new(PathBuf::from("/home/user/Docs")).unwrap(),
        RemotePath::new("/Sites/team".to_string()).unwrap(),
    )
}

async fn setup() -> SqliteMetaDataStorage {
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    SqliteMetaDataStorage::new(pool.pool().clone(), matcher())
}

fn id(s: &str) -> RemoteId {
    RemoteId::new(s.to_string()).unwrap()
}

fn token(s: &str) -> Option<ChangeToken> {
    Some(ChangeToken::new(s.to_string()).unwrap())
}

/// Stores root -> reports/ -> q1.odt and returns the document
async fn seed_tree(storage: &SqliteMetaDataStorage) -> MappedObject {
    let root = MappedObject::new_root("team", id("root"), token("r1")).unwrap();
    storage.save_mapped_object(&root).await.unwrap();

    let folder = MappedObject::new(
        "reports",
        id("f1"),
        ObjectType::Folder,
        Some(id("root")),
        token("f1"),
    )
    .unwrap();
    storage.save_mapped_object(&folder).await.unwrap();

    let mut doc = MappedObject::new(
        "q1.odt",
        id("d1"),
        ObjectType::File,
        Some(id("f1")),
        token("d1"),
    )
    .unwrap();
    doc.set_checksum(Some(Checksum::sha256(vec![7u8; 32]).unwrap()))
        .unwrap();
    doc.set_content_size(42);
    doc.set_remote_write_time(Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()));
    doc.set_local_write_time(Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 6).unwrap()));
    doc.set_description(Some("quarterly".to_string()));
    doc.set_read_only(true);
    storage.save_mapped_object(&doc).await.unwrap();

    doc
}

// ============================================================================
// Mapped object tests
// ============================================================================

#[tokio::test]
async fn test_save_and_get_round_trips_all_fields() {
    let storage = setup().await;
    let doc = seed_tree(&storage).await;

    let by_id = storage.get_object_by_remote_id(&id("d1")).await.unwrap();
    assert_eq!(by_id.as_ref(), Some(&doc));

    let by_guid = storage.get_object_by_guid(&doc.guid()).await.unwrap();
    assert_eq!(by_guid, Some(doc));
}

#[tokio::test]
async fn test_get_missing_object_returns_none() {
    let storage = setup().await;
    assert!(storage
        .get_object_by_remote_id(&id("nope"))
        .await
        .unwrap()
        .is_none());
    assert!(storage
        .get_object_by_guid(&LocalGuid::new())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_local_and_remote_paths_are_derived_from_parent_chain() {
    let storage = setup().await;
    let doc = seed_tree(&storage).await;

    let local = storage.get_local_path(&doc).await.unwrap();
    assert_eq!(local, Some(PathBuf::from("/home/user/Docs/reports/q1.odt")));

    let remote = storage.get_remote_path(&doc).await.unwrap();
    assert_eq!(remote.unwrap().as_str(), "/Sites/team/reports/q1.odt");

    let root = storage.root_object().await.unwrap().unwrap();
    assert_eq!(
        storage.get_local_path(&root).await.unwrap(),
        Some(PathBuf::from("/home/user/Docs"))
    );
}

#[tokio::test]
async fn test_get_object_by_local_path() {
    let storage = setup().await;
    seed_tree(&storage).await;

    let found = storage
        .get_object_by_local_path(Path::new("/home/user/Docs/reports/q1.odt"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.remote_id(), &id("d1"));

    let root = storage
        .get_object_by_local_path(Path::new("/home/user/Docs"))
        .await
        .unwrap()
        .unwrap();
    assert!(root.is_root());

    assert!(storage
        .get_object_by_local_path(Path::new("/home/user/Docs/reports/missing.odt"))
        .await
        .unwrap()
        .is_none());
    assert!(storage
        .get_object_by_local_path(Path::new("/elsewhere/q1.odt"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_broken_parent_chain_yields_no_path() {
    let storage = setup().await;
    let orphan = MappedObject::new(
        "lost.txt",
        id("o1"),
        ObjectType::File,
        Some(id("gone")),
        None,
    )
    .unwrap();
    storage.save_mapped_object(&orphan).await.unwrap();

    assert!(storage.get_local_path(&orphan).await.unwrap().is_none());
    assert!(storage.get_remote_path(&orphan).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rename_changes_derived_path_of_descendants() {
    let storage = setup().await;
    let doc = seed_tree(&storage).await;

    let mut folder = storage
        .get_object_by_remote_id(&id("f1"))
        .await
        .unwrap()
        .unwrap();
    folder.set_name("archive").unwrap();
    storage.save_mapped_object(&folder).await.unwrap();

    assert_eq!(
        storage.get_local_path(&doc).await.unwrap(),
        Some(PathBuf::from("/home/user/Docs/archive/q1.odt"))
    );
}

#[tokio::test]
async fn test_get_children_is_ordered_by_name() {
    let storage = setup().await;
    seed_tree(&storage).await;
    for (rid, name) in [("d3", "b.txt"), ("d2", "a.txt")] {
        let doc = MappedObject::new(name, id(rid), ObjectType::File, Some(id("root")), None)
            .unwrap();
        storage.save_mapped_object(&doc).await.unwrap();
    }

    let names: Vec<String> = storage
        .get_children(&id("root"))
        .await
        .unwrap()
        .iter()
        .map(|o| o.name().to_string())
        .collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "reports"]);
}

#[tokio::test]
async fn test_remove_object_removes_subtree() {
    let storage = setup().await;
    seed_tree(&storage).await;

    storage.remove_object(&id("f1")).await.unwrap();

    assert!(storage
        .get_object_by_remote_id(&id("f1"))
        .await
        .unwrap()
        .is_none());
    assert!(storage
        .get_object_by_remote_id(&id("d1"))
        .await
        .unwrap()
        .is_none());
    assert!(storage
        .get_object_by_remote_id(&id("root"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_rekey_object_moves_children_along() {
    let storage = setup().await;
    let doc = seed_tree(&storage).await;

    storage.rekey_object(&id("f1"), &id("f1-v2")).await.unwrap();

    assert!(storage
        .get_object_by_remote_id(&id("f1"))
        .await
        .unwrap()
        .is_none());
    let children = storage.get_children(&id("f1-v2")).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].guid(), doc.guid());
}

#[tokio::test]
async fn test_rekey_unknown_object_fails() {
    let storage = setup().await;
    assert!(storage.rekey_object(&id("a"), &id("b")).await.is_err());
}

// ============================================================================
// Change log token tests
// ============================================================================

#[tokio::test]
async fn test_change_log_token_round_trip() {
    let storage = setup().await;
    assert!(storage.change_log_token().await.unwrap().is_none());

    let t = ChangeToken::new("42".to_string()).unwrap();
    storage.set_change_log_token(Some(&t)).await.unwrap();
    assert_eq!(storage.change_log_token().await.unwrap(), Some(t));

    storage.set_change_log_token(None).await.unwrap();
    assert!(storage.change_log_token().await.unwrap().is_none());
}

// ============================================================================
// Structure validation tests
// ============================================================================

#[tokio::test]
async fn test_validate_structure_of_consistent_tree() {
    let storage = setup().await;
    seed_tree(&storage).await;
    assert!(storage.validate_object_structure().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_validate_structure_reports_orphans_and_duplicates() {
    let storage = setup().await;
    seed_tree(&storage).await;

    let orphan =
        MappedObject::new("x", id("o1"), ObjectType::File, Some(id("gone")), None).unwrap();
    storage.save_mapped_object(&orphan).await.unwrap();
    let twin = MappedObject::new(
        "q1.odt",
        id("d9"),
        ObjectType::File,
        Some(id("f1")),
        None,
    )
    .unwrap();
    storage.save_mapped_object(&twin).await.unwrap();

    let problems = storage.validate_object_structure().await.unwrap();
    assert!(problems.iter().any(|p| p.contains("missing parent")));
    assert!(problems.iter().any(|p| p.contains("Duplicate name")));
}

// ============================================================================
// Transmission tests
// ============================================================================

#[tokio::test]
async fn test_transmission_round_trip() {
    let storage = setup().await;
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let record = TransmissionRecord {
        remote_id: id("d1"),
        local_path: PathBuf::from("/home/user/Docs/big.bin"),
        position: 1024,
        length: 4096,
        local_modified: Some(now - Duration::minutes(5)),
        updated_at: now,
    };

    storage.save_transmission(&record).await.unwrap();
    assert_eq!(
        storage.get_transmission(&id("d1")).await.unwrap(),
        Some(record)
    );

    storage.remove_transmission(&id("d1")).await.unwrap();
    assert!(storage.get_transmission(&id("d1")).await.unwrap().is_none());
}

// ============================================================================
// Persistence tests
// ============================================================================

#[tokio::test]
async fn test_file_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("docs.db");

    let guid = {
        let pool = DatabasePool::new(&db_path).await.unwrap();
        let storage = SqliteMetaDataStorage::new(pool.pool().clone(), matcher());
        let doc = seed_tree(&storage).await;
        storage
            .set_change_log_token(token("7").as_ref())
            .await
            .unwrap();
        pool.close().await;
        doc.guid()
    };

    let pool = DatabasePool::new(&db_path).await.unwrap();
    let storage = SqliteMetaDataStorage::new(pool.pool().clone(), matcher());
    let doc = storage.get_object_by_guid(&guid).await.unwrap().unwrap();
    assert_eq!(doc.content_size(), Some(42));
    assert_eq!(storage.change_log_token().await.unwrap(), token("7"));
}
