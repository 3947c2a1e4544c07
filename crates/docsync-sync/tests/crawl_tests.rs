//! Crawl convergence, duplicate events and crawl failures needing the user

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::*;
use docsync_core::config::IgnoreConfig;
use docsync_core::domain::{
    ContentChange, EventSource, FileOrFolderEvent, FsChangeKind, FsEvent, MetaDataChange,
    RemoteHandle, StartNextSync, SyncEvent,
};
use docsync_sync::crawler::DescendantsCrawler;
use docsync_sync::filter::FilterAggregator;
use docsync_sync::queue::SyncEventQueue;

#[tokio::test]
async fn test_path_too_long_asks_for_interaction() {
    let mut h = Harness::new().await;
    h.crawl().await;
    h.write("deep/nested/x.txt", b"x");
    h.fs.reject_as_too_long(h.local("deep"));

    let (mut queue, handle) = SyncEventQueue::new();
    let rules = FilterAggregator::from_config(&IgnoreConfig::default(), &root_config(&h.root))
        .unwrap();
    queue.manager_mut().add_handler(Arc::new(DescendantsCrawler::new(
        h.repo.clone(),
        h.storage.clone(),
        h.fs.clone(),
        handle.clone(),
        matcher(&h.root),
        Arc::new(rules),
        h.ignored.clone(),
    )));
    handle.add_event(SyncEvent::StartNextSync(StartNextSync::full()));
    assert!(queue.try_step().await.is_some());

    let mut events = Vec::new();
    while !handle.is_empty() {
        events.push(queue.next_event().await.unwrap());
    }
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::InteractionNeeded { title, .. } if title == docsync_sync::PATH_TOO_LONG_TITLE
    )));
    assert!(events.iter().any(|e| matches!(e, SyncEvent::FullSyncFailed)));
    assert!(!events.iter().any(|e| matches!(e, SyncEvent::StartNextSync(_))));
    assert!(!h.repo.exists("/docs/deep"));
}

#[tokio::test]
async fn test_duplicate_local_event_uploads_once() {
    let mut h = Harness::new().await;
    h.crawl().await;
    h.write("new.txt", b"fresh");
    let event = SyncEvent::Fs(FsEvent::new(FsChangeKind::Created, h.local("new.txt"), false));

    h.deliver(event.clone()).await;
    let id = h.repo.id_of("/docs/new.txt").unwrap();
    h.deliver(event).await;

    assert_eq!(h.repo.uploads(), 1);
    assert_eq!(h.repo.id_of("/docs/new.txt"), Some(id.clone()));
    assert_eq!(h.mapping("new.txt").await.unwrap().remote_id(), &id);
}

#[tokio::test]
async fn test_duplicate_remote_event_downloads_once() {
    let mut h = Harness::new().await;
    h.repo.put_document("/docs/a.txt", b"hello");
    h.crawl().await;
    let downloads = h.repo.downloads();

    h.repo.put_document("/docs/a.txt", b"remote edit");
    let object = h.repo.object("/docs/a.txt").unwrap();
    let event = SyncEvent::FileOrFolder(FileOrFolderEvent::remote(
        RemoteHandle::Object(object),
        MetaDataChange::None,
        ContentChange::Changed,
        EventSource::ChangeLog,
    ));
    h.deliver(event.clone()).await;
    h.deliver(event).await;

    assert_eq!(h.repo.downloads(), downloads + 1);
    assert_eq!(h.read("a.txt").unwrap(), b"remote edit");
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Side {
    Local,
    Remote,
    Both,
}

/// Linear congruential generator, enough to shuffle tree shapes reproducibly
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

/// Relative file paths and where each one starts out
///
/// Directory names and file names never overlap, so no path is a folder on
/// one side and a document on the other.
fn random_tree(seed: u64, files: usize) -> BTreeMap<String, Side> {
    let mut rng = Lcg(seed);
    let mut tree = BTreeMap::new();
    for _ in 0..files {
        let depth = rng.next() % 3;
        let mut path = String::new();
        for _ in 0..depth {
            path.push_str(&format!("d{}/", rng.next() % 3));
        }
        path.push_str(&format!("f{}.txt", rng.next() % 5));
        let side = match rng.next() % 3 {
            0 => Side::Local,
            1 => Side::Remote,
            _ => Side::Both,
        };
        tree.entry(path).or_insert(side);
    }
    tree
}

fn content_of(seed: u64, path: &str) -> Vec<u8> {
    format!("seed {seed} at {path}").into_bytes()
}

fn put_remote(h: &Harness, relative: &str, content: &[u8]) {
    let mut folder = REMOTE_ROOT.to_string();
    let segments: Vec<&str> = relative.split('/').collect();
    for segment in &segments[..segments.len() - 1] {
        folder = format!("{folder}/{segment}");
        if !h.repo.exists(&folder) {
            h.repo.put_folder(&folder);
        }
    }
    h.repo.put_document(&Harness::remote_path(relative), content);
}

async fn assert_converges(seed: u64, tree: &BTreeMap<String, Side>) {
    let mut h = Harness::new().await;
    for (path, side) in tree {
        let content = content_of(seed, path);
        if matches!(side, Side::Local | Side::Both) {
            h.write(path, &content);
        }
        if matches!(side, Side::Remote | Side::Both) {
            put_remote(&h, path, &content);
        }
    }

    h.crawl().await;

    for path in tree.keys() {
        let content = content_of(seed, path);
        assert_eq!(h.read(path).as_ref(), Some(&content), "seed {seed}: local {path}");
        assert_eq!(
            h.repo.content(&Harness::remote_path(path)).as_ref(),
            Some(&content),
            "seed {seed}: remote {path}"
        );
        let mapped = h.mapping(path).await;
        assert_eq!(
            mapped.map(|m| m.remote_id().clone()),
            h.repo.id_of(&Harness::remote_path(path)),
            "seed {seed}: mapping of {path}"
        );
    }
    let expected_uploads = tree.values().filter(|s| **s == Side::Local).count();
    let expected_downloads = tree.values().filter(|s| **s == Side::Remote).count();
    assert_eq!(h.repo.uploads(), expected_uploads, "seed {seed}");
    assert_eq!(h.repo.downloads(), expected_downloads, "seed {seed}");

    h.crawl().await;
    assert_eq!(h.repo.uploads(), expected_uploads, "seed {seed}: second crawl");
    assert_eq!(h.repo.downloads(), expected_downloads, "seed {seed}: second crawl");
}

#[tokio::test]
async fn test_crawl_converges_on_fixed_trees() {
    let trees: [&[(&str, Side)]; 4] = [
        &[("a.txt", Side::Remote), ("d/b.txt", Side::Remote), ("d/e/c.txt", Side::Remote)],
        &[("a.txt", Side::Local), ("d/b.txt", Side::Local), ("d/e/c.txt", Side::Local)],
        &[("d/a.txt", Side::Local), ("d/b.txt", Side::Remote), ("d/c.txt", Side::Both)],
        &[("x/a.txt", Side::Remote), ("y/a.txt", Side::Local), ("z/a.txt", Side::Both)],
    ];
    for (seed, tree) in trees.iter().enumerate() {
        let tree = tree.iter().map(|(p, s)| (p.to_string(), *s)).collect();
        assert_converges(seed as u64, &tree).await;
    }
}

#[tokio::test]
async fn test_crawl_converges_on_generated_trees() {
    for seed in 1..=8 {
        let tree = random_tree(seed, 12);
        assert_converges(seed, &tree).await;
    }
}
