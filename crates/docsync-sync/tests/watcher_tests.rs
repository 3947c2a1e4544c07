//! Coalescing of raw filesystem notifications into queue events

mod common;

use std::time::Duration;

use common::*;
use docsync_core::domain::{FsChangeKind, SyncEvent};
use docsync_sync::queue::SyncEventQueue;
use docsync_sync::watcher::{RawChange, RawChangeKind, WatcherConsumer};

const DEBOUNCE: Duration = Duration::from_millis(200);

async fn synced_harness() -> Harness {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.repo.put_folder("/docs/sub");
    h.crawl().await;
    h
}

fn consumer(h: &Harness) -> (WatcherConsumer, SyncEventQueue) {
    let (queue, handle) = SyncEventQueue::new();
    let consumer = WatcherConsumer::new(handle, h.storage.clone(), h.fs.clone(), DEBOUNCE);
    (consumer, queue)
}

fn expect_move(event: SyncEvent, from: &std::path::Path, to: &std::path::Path) {
    match event {
        SyncEvent::FsMoved(moved) => {
            assert_eq!(moved.old_path, from);
            assert_eq!(moved.new_path, to);
            assert!(!moved.is_directory);
        }
        other => panic!("expected a move, got {other}"),
    }
}

#[tokio::test]
async fn test_delete_then_create_becomes_move() {
    let h = synced_harness().await;
    let (mut consumer, mut queue) = consumer(&h);
    let (from, to) = (h.local("a.txt"), h.local("sub/a.txt"));
    std::fs::rename(&from, &to).unwrap();

    consumer
        .process(RawChange::new(RawChangeKind::Deleted, &from, false))
        .await;
    assert_eq!(consumer.pending(), 1);
    consumer
        .process(RawChange::new(RawChangeKind::Created, &to, false))
        .await;

    assert_eq!(consumer.pending(), 0);
    expect_move(queue.next_event().await.unwrap(), &from, &to);
    assert!(queue.handle().is_empty());
}

#[tokio::test]
async fn test_create_then_delete_becomes_move() {
    let h = synced_harness().await;
    let (mut consumer, mut queue) = consumer(&h);
    let (from, to) = (h.local("a.txt"), h.local("b.txt"));
    std::fs::rename(&from, &to).unwrap();

    consumer
        .process(RawChange::new(RawChangeKind::Created, &to, false))
        .await;
    consumer
        .process(RawChange::new(RawChangeKind::Deleted, &from, false))
        .await;

    expect_move(queue.next_event().await.unwrap(), &from, &to);
    assert!(queue.handle().is_empty());
}

#[tokio::test]
async fn test_rename_pair_is_reported_once() {
    let h = synced_harness().await;
    let (mut consumer, mut queue) = consumer(&h);
    let (from, to) = (h.local("a.txt"), h.local("b.txt"));
    std::fs::rename(&from, &to).unwrap();

    consumer
        .process(RawChange::new(RawChangeKind::Deleted, &from, false))
        .await;
    consumer
        .process(RawChange::new(RawChangeKind::Created, &to, false))
        .await;
    consumer
        .process(RawChange::new(RawChangeKind::Renamed { from: from.clone() }, &to, false))
        .await;

    expect_move(queue.next_event().await.unwrap(), &from, &to);
    assert!(queue.handle().is_empty());
}

#[tokio::test]
async fn test_unmapped_delete_is_dropped() {
    let h = synced_harness().await;
    let (mut consumer, queue) = consumer(&h);

    consumer
        .process(RawChange::new(RawChangeKind::Deleted, h.local("never-synced.txt"), false))
        .await;
    consumer.flush_all().await;

    assert_eq!(consumer.pending(), 0);
    assert!(queue.handle().is_empty());
}

#[tokio::test]
async fn test_lone_delete_is_flushed_after_debounce() {
    let h = synced_harness().await;
    let (mut consumer, mut queue) = consumer(&h);
    let path = h.local("a.txt");
    std::fs::remove_file(&path).unwrap();

    consumer
        .process(RawChange::new(RawChangeKind::Deleted, &path, false))
        .await;
    consumer.flush_expired(tokio::time::Instant::now()).await;
    assert!(queue.handle().is_empty());

    consumer
        .flush_expired(tokio::time::Instant::now() + DEBOUNCE)
        .await;
    match queue.next_event().await.unwrap() {
        SyncEvent::Fs(fs) => {
            assert_eq!(fs.kind, FsChangeKind::Deleted);
            assert_eq!(fs.path, path);
        }
        other => panic!("expected a delete, got {other}"),
    }
}

#[tokio::test]
async fn test_new_directory_announces_its_content() {
    let h = synced_harness().await;
    let (mut consumer, mut queue) = consumer(&h);
    h.write("fresh/inner/file.txt", b"x");

    consumer
        .process(RawChange::new(RawChangeKind::Created, h.local("fresh"), true))
        .await;

    let mut created = Vec::new();
    while !queue.handle().is_empty() {
        match queue.next_event().await.unwrap() {
            SyncEvent::Fs(fs) if fs.kind == FsChangeKind::Created => created.push(fs.path),
            other => panic!("unexpected event {other}"),
        }
    }
    assert_eq!(
        created,
        vec![
            h.local("fresh"),
            h.local("fresh/inner"),
            h.local("fresh/inner/file.txt"),
        ]
    );
}

#[tokio::test]
async fn test_directory_changes_are_not_reported() {
    let h = synced_harness().await;
    let (mut consumer, queue) = consumer(&h);

    consumer
        .process(RawChange::new(RawChangeKind::Changed, h.local("sub"), true))
        .await;

    assert!(queue.handle().is_empty());
}

#[tokio::test]
async fn test_coalesced_move_is_synchronized() {
    let mut h = synced_harness().await;
    let id = h.repo.id_of("/docs/a.txt").unwrap();
    let (mut consumer, mut queue) = consumer(&h);
    let (from, to) = (h.local("a.txt"), h.local("sub/a.txt"));
    std::fs::rename(&from, &to).unwrap();

    consumer
        .process(RawChange::new(RawChangeKind::Deleted, &from, false))
        .await;
    consumer
        .process(RawChange::new(RawChangeKind::Created, &to, false))
        .await;
    let event = queue.next_event().await.unwrap();
    h.deliver(event).await;

    assert_eq!(h.repo.id_of("/docs/sub/a.txt"), Some(id));
    assert!(!h.repo.exists("/docs/a.txt"));
    assert_eq!(h.repo.uploads(), 0);
}
