//! Incremental synchronization through the repository change log

mod common;

use common::*;
use docsync_core::ports::{IMetaDataStorage, RepositoryCapabilities};

#[tokio::test]
async fn test_poll_without_token_runs_full_crawl() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");

    h.poll().await;

    assert_eq!(h.read("a.txt").unwrap(), b"hello");
    assert!(h.storage.change_log_token().await.unwrap().is_some());
    assert!(h.mapping("a.txt").await.is_some());
}

#[tokio::test]
async fn test_poll_downloads_remote_modification() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.crawl().await;
    let committed = h.storage.change_log_token().await.unwrap();

    h.repo.put_document("/docs/a.txt", b"changed remotely");
    h.poll().await;

    assert_eq!(h.read("a.txt").unwrap(), b"changed remotely");
    assert_eq!(h.repo.downloads(), 2);
    let advanced = h.storage.change_log_token().await.unwrap();
    assert_ne!(advanced, committed);
    assert_eq!(
        h.mapping("a.txt").await.unwrap().last_checksum(),
        Some(&sha256(b"changed remotely"))
    );
}

#[tokio::test]
async fn test_poll_picks_up_remote_creation_and_deletion() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/old.txt", b"old");
    h.crawl().await;

    h.repo.put_folder("/docs/new");
    h.repo.put_document("/docs/new/fresh.txt", b"fresh");
    h.repo.remove("/docs/old.txt");
    h.poll().await;

    assert_eq!(h.read("new/fresh.txt").unwrap(), b"fresh");
    assert!(!h.exists("old.txt"));
    assert!(h.mapping("old.txt").await.is_none());
}

#[tokio::test]
async fn test_unchanged_change_log_does_nothing() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.crawl().await;
    h.poll().await;
    let token = h.storage.change_log_token().await.unwrap();

    h.poll().await;

    assert_eq!(h.storage.change_log_token().await.unwrap(), token);
    assert_eq!(h.repo.downloads(), 1);
}

#[tokio::test]
async fn test_stale_token_falls_back_to_full_crawl() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.crawl().await;
    let committed = h.storage.change_log_token().await.unwrap();

    h.repo.truncate_change_log();
    h.repo.put_document("/docs/b.txt", b"written after truncation");
    h.poll().await;

    assert_eq!(h.read("b.txt").unwrap(), b"written after truncation");
    let token = h.storage.change_log_token().await.unwrap();
    assert!(token.is_some());
    assert_ne!(token, committed);
}

#[tokio::test]
async fn test_repository_without_change_log_is_crawled() {
    let repo = MemoryRepository::with_capabilities(
        RepositoryCapabilities {
            change_log: false,
            private_working_copy: false,
            can_modify_dates: false,
        },
        false,
    );
    let mut h = Harness::with_repository(repo).await;
    h.repo.put_document("/docs/a.txt", b"hello");

    h.poll().await;

    assert_eq!(h.read("a.txt").unwrap(), b"hello");
    assert!(h.storage.change_log_token().await.unwrap().is_none());

    h.repo.put_document("/docs/a.txt", b"different size");
    h.poll().await;
    assert_eq!(h.read("a.txt").unwrap(), b"different size");
}
