//! End-to-end synchronization scenarios over a temp dir and an in-memory repository

mod common;

use common::*;
use docsync_core::ports::IMetaDataStorage;

#[tokio::test]
async fn test_initial_crawl_downloads_remote_tree() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.repo.put_folder("/docs/sub");
    h.repo.put_document("/docs/sub/b.txt", b"world");

    h.crawl().await;

    assert_eq!(h.read("a.txt").unwrap(), b"hello");
    assert_eq!(h.read("sub/b.txt").unwrap(), b"world");
    assert!(h.local("sub").is_dir());
    assert_eq!(h.repo.downloads(), 2);
    assert_eq!(h.repo.uploads(), 0);

    let a = h.mapping("a.txt").await.unwrap();
    assert_eq!(a.remote_id(), &h.repo.id_of("/docs/a.txt").unwrap());
    assert_eq!(a.last_checksum(), Some(&sha256(b"hello")));
    assert_eq!(
        a.last_change_token(),
        h.repo.object("/docs/a.txt").unwrap().change_token.as_ref()
    );
    assert!(h.mapping("sub").await.unwrap().is_folder());
    assert!(h.storage.change_log_token().await.unwrap().is_some());
}

#[tokio::test]
async fn test_second_crawl_transfers_nothing() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.write("local.txt", b"from disk");
    h.crawl().await;
    let (uploads, downloads) = (h.repo.uploads(), h.repo.downloads());

    h.crawl().await;

    assert_eq!(h.repo.uploads(), uploads);
    assert_eq!(h.repo.downloads(), downloads);
    assert_eq!(h.read("a.txt").unwrap(), b"hello");
}

#[tokio::test]
async fn test_local_files_are_uploaded_in_chunks() {
    let mut h = Harness::new().await;
    h.write("notes/a.txt", b"hello world");
    h.write("notes/empty.txt", b"");

    h.crawl().await;

    assert!(h.repo.object("/docs/notes").unwrap().is_folder());
    assert_eq!(h.repo.content("/docs/notes/a.txt").unwrap(), b"hello world");
    assert_eq!(h.repo.content("/docs/notes/empty.txt").unwrap(), b"");
    assert_eq!(h.repo.uploads(), 2);

    let mapped = h.mapping("notes/a.txt").await.unwrap();
    assert_eq!(mapped.last_checksum(), Some(&sha256(b"hello world")));
    assert_eq!(mapped.remote_id(), &h.repo.id_of("/docs/notes/a.txt").unwrap());
}

#[tokio::test]
async fn test_own_uploads_are_not_echoed_back() {
    let mut h = Harness::new().await;
    h.write("a.txt", b"local content");
    h.crawl().await;
    assert_eq!(h.repo.uploads(), 1);

    h.poll().await;

    assert_eq!(h.repo.uploads(), 1);
    assert_eq!(h.repo.downloads(), 0);
    assert_eq!(h.read("a.txt").unwrap(), b"local content");
}

#[tokio::test]
async fn test_local_edit_is_uploaded() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.crawl().await;
    let before = h.mapping("a.txt").await.unwrap();

    h.write("a.txt", b"hello again");
    h.crawl().await;

    assert_eq!(h.repo.content("/docs/a.txt").unwrap(), b"hello again");
    assert_eq!(h.repo.uploads(), 1);
    let after = h.mapping("a.txt").await.unwrap();
    assert_eq!(before.last_checksum(), Some(&sha256(b"hello")));
    assert_eq!(after.last_checksum(), Some(&sha256(b"hello again")));
    assert_ne!(after.last_change_token(), before.last_change_token());
    assert_eq!(
        after.last_change_token(),
        h.repo.object("/docs/a.txt").unwrap().change_token.as_ref()
    );
}

#[tokio::test]
async fn test_identical_changes_on_both_sides_converge() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.crawl().await;
    assert_eq!(h.repo.downloads(), 1);

    h.repo.put_document("/docs/a.txt", b"same on both sides");
    h.write("a.txt", b"same on both sides");
    h.crawl().await;

    assert_eq!(h.repo.uploads(), 0);
    assert_eq!(h.repo.downloads(), 1);
    let mapped = h.mapping("a.txt").await.unwrap();
    assert_eq!(mapped.last_checksum(), Some(&sha256(b"same on both sides")));
    assert_eq!(
        mapped.last_change_token(),
        h.repo.object("/docs/a.txt").unwrap().change_token.as_ref()
    );
}

#[tokio::test]
async fn test_local_delete_removes_remote_object() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.repo.put_folder("/docs/sub");
    h.repo.put_document("/docs/sub/b.txt", b"world");
    h.crawl().await;

    std::fs::remove_file(h.local("a.txt")).unwrap();
    std::fs::remove_dir_all(h.local("sub")).unwrap();
    h.crawl().await;

    assert!(!h.repo.exists("/docs/a.txt"));
    assert!(!h.repo.exists("/docs/sub"));
    assert!(h.mapping("a.txt").await.is_none());
    assert!(h.mapping("sub/b.txt").await.is_none());
}

#[tokio::test]
async fn test_remote_delete_removes_unchanged_local_file() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.crawl().await;

    h.repo.remove("/docs/a.txt");
    h.crawl().await;

    assert!(!h.exists("a.txt"));
    assert!(h.mapping("a.txt").await.is_none());
}

#[tokio::test]
async fn test_remote_delete_keeps_locally_edited_file() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.crawl().await;

    h.repo.remove("/docs/a.txt");
    h.write("a.txt", b"edited while deleted");
    h.crawl().await;

    assert_eq!(h.read("a.txt").unwrap(), b"edited while deleted");
    assert_eq!(h.repo.content("/docs/a.txt").unwrap(), b"edited while deleted");
    let mapped = h.mapping("a.txt").await.unwrap();
    assert_eq!(mapped.remote_id(), &h.repo.id_of("/docs/a.txt").unwrap());
}

#[tokio::test]
async fn test_local_move_is_replayed_remotely() {
    let mut h = Harness::new().await;
    let id = h.repo.put_document("/docs/a.txt", b"hello");
    h.repo.put_folder("/docs/sub");
    h.crawl().await;
    let downloads = h.repo.downloads();

    std::fs::rename(h.local("a.txt"), h.local("sub/moved.txt")).unwrap();
    h.crawl().await;

    assert!(!h.repo.exists("/docs/a.txt"));
    assert_eq!(h.repo.id_of("/docs/sub/moved.txt"), Some(id.clone()));
    assert_eq!(h.repo.content("/docs/sub/moved.txt").unwrap(), b"hello");
    assert_eq!(h.repo.uploads(), 0);
    assert_eq!(h.repo.downloads(), downloads);
    assert_eq!(h.mapping("sub/moved.txt").await.unwrap().remote_id(), &id);
}

#[tokio::test]
async fn test_remote_move_is_replayed_locally() {
    let mut h = Harness::new().await;
    let id = h.repo.put_document("/docs/a.txt", b"hello");
    h.repo.put_folder("/docs/sub");
    h.crawl().await;

    h.repo.relocate("/docs/a.txt", "/docs/sub/renamed.txt");
    h.crawl().await;

    assert!(!h.exists("a.txt"));
    assert_eq!(h.read("sub/renamed.txt").unwrap(), b"hello");
    assert_eq!(h.repo.downloads(), 1);
    assert_eq!(h.mapping("sub/renamed.txt").await.unwrap().remote_id(), &id);
    assert!(h.repo.exists("/docs/sub/renamed.txt"));
    assert_eq!(h.repo.id_of("/docs/sub/renamed.txt"), Some(id.clone()));
    let stored = h.storage.get_object_by_remote_id(&id).await.unwrap().unwrap();
    assert_eq!(stored.name(), "renamed.txt");
}

#[tokio::test]
async fn test_remote_rename_through_change_log_keeps_document() {
    let mut h = Harness::new().await;
    let id = h.repo.put_document("/docs/a.txt", b"hello");
    h.crawl().await;

    h.repo.relocate("/docs/a.txt", "/docs/b.txt");
    h.poll().await;

    assert!(!h.exists("a.txt"));
    assert_eq!(h.read("b.txt").unwrap(), b"hello");
    assert_eq!(h.repo.id_of("/docs/b.txt"), Some(id));
    assert_eq!(h.repo.uploads(), 0);
}

#[tokio::test]
async fn test_ignored_names_stay_local() {
    let mut h = Harness::new().await;
    h.write("draft.txt~", b"backup");
    h.write(".hidden/secret.txt", b"secret");
    h.write("kept.txt", b"kept");

    h.crawl().await;

    assert!(h.repo.exists("/docs/kept.txt"));
    assert!(!h.repo.exists("/docs/draft.txt~"));
    assert!(!h.repo.exists("/docs/.hidden"));
    assert!(h.exists("draft.txt~"));
}

#[tokio::test]
async fn test_offline_repository_leaves_state_untouched() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.repo.set_offline(true);

    h.crawl().await;

    assert!(!h.exists("a.txt"));
    assert!(h.storage.change_log_token().await.unwrap().is_none());

    h.repo.set_offline(false);
    h.crawl().await;
    assert_eq!(h.read("a.txt").unwrap(), b"hello");
}

#[tokio::test]
async fn test_poll_interval_changes_through_queue() {
    let mut h = Harness::new().await;
    let initial = h.sync.poll_interval().await;

    h.sync.set_poll_interval(std::time::Duration::ZERO);
    h.sync.run_until_idle().await.unwrap();
    assert_eq!(h.sync.poll_interval().await, initial);

    h.sync.set_poll_interval(std::time::Duration::from_secs(42));
    h.sync.run_until_idle().await.unwrap();
    assert_eq!(h.sync.poll_interval().await, std::time::Duration::from_secs(42));
}
