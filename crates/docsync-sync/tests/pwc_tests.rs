//! Uploads through check-out / check-in on repositories with private working copies

mod common;

use common::*;
use docsync_core::ports::{IMetaDataStorage, ITransmissionStorage};

const EDITED: &[u8] = b"edited locally, longer";

/// Synced `a.txt`, then a local edit and a remote metadata-only change
async fn both_sides_touched() -> (Harness, docsync_core::domain::newtypes::RemoteId) {
    let mut h = Harness::with_repository(MemoryRepository::with_private_working_copies()).await;
    let id = h.repo.put_document("/docs/a.txt", b"hello");
    h.crawl().await;

    h.write("a.txt", EDITED);
    h.repo.describe("/docs/a.txt", "reviewed");
    (h, id)
}

#[tokio::test]
async fn test_local_edit_is_checked_in_and_mapping_rekeyed() {
    let (mut h, old_id) = both_sides_touched().await;

    h.crawl().await;

    assert_eq!(h.repo.check_outs(), 1);
    assert_eq!(h.repo.check_ins(), 1);
    assert_eq!(h.repo.open_working_copies(), 0);
    assert_eq!(h.repo.uploads(), 0);
    assert_eq!(h.repo.content("/docs/a.txt").unwrap(), EDITED);

    let new_id = h.repo.id_of("/docs/a.txt").unwrap();
    assert_ne!(new_id, old_id);
    let mapped = h.mapping("a.txt").await.unwrap();
    assert_eq!(mapped.remote_id(), &new_id);
    assert_eq!(mapped.last_checksum(), Some(&sha256(EDITED)));
    assert_eq!(
        mapped.last_change_token(),
        h.repo.object("/docs/a.txt").unwrap().change_token.as_ref()
    );
    assert!(h.storage.get_object_by_remote_id(&old_id).await.unwrap().is_none());
    assert!(h.storage.get_transmission(&old_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_checked_in_version_is_stable_on_next_crawl() {
    let (mut h, _) = both_sides_touched().await;
    h.crawl().await;

    h.crawl().await;

    assert_eq!(h.repo.check_outs(), 1);
    assert_eq!(h.repo.check_ins(), 1);
    assert_eq!(h.read("a.txt").unwrap(), EDITED);
}

#[tokio::test]
async fn test_failed_upload_cancels_check_out() {
    let (mut h, id) = both_sides_touched().await;
    h.repo.set_failing_uploads(true);

    h.crawl().await;

    assert_eq!(h.repo.check_outs(), 1);
    assert_eq!(h.repo.cancelled_check_outs(), 1);
    assert_eq!(h.repo.check_ins(), 0);
    assert_eq!(h.repo.open_working_copies(), 0);
    assert_eq!(h.repo.content("/docs/a.txt").unwrap(), b"hello");
    let mapped = h.mapping("a.txt").await.unwrap();
    assert_eq!(mapped.remote_id(), &id);
    assert_eq!(mapped.last_checksum(), Some(&sha256(b"hello")));

    h.repo.set_failing_uploads(false);
    h.crawl().await;
    assert_eq!(h.repo.check_ins(), 1);
    assert_eq!(h.repo.content("/docs/a.txt").unwrap(), EDITED);
}

#[tokio::test]
async fn test_plain_local_edit_skips_working_copy() {
    let mut h = Harness::with_repository(MemoryRepository::with_private_working_copies()).await;
    let id = h.repo.put_document("/docs/a.txt", b"hello");
    h.crawl().await;

    h.write("a.txt", EDITED);
    h.crawl().await;

    assert_eq!(h.repo.check_outs(), 0);
    assert_eq!(h.repo.uploads(), 1);
    assert_eq!(h.repo.id_of("/docs/a.txt"), Some(id));
    assert_eq!(h.repo.content("/docs/a.txt").unwrap(), EDITED);
}
