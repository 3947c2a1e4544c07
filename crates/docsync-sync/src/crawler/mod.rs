//! Descendants crawler - full comparison of both trees
//!
//! Answers `StartNextSync { full_sync_requested: true }` by reading the
//! whole local tree, the whole remote tree and every stored mapping, and
//! queueing one [`FileOrFolderEvent`](docsync_core::domain::FileOrFolderEvent)
//! per difference. A successful crawl ends with `FullSyncCompleted`
//! carrying the change-log token read before the crawl started, so changes
//! made while crawling are picked up by the next incremental poll.

pub mod generator;
pub mod tree;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use docsync_core::domain::{
    newtypes::{ChangeToken, RemoteId},
    MappedObject, PathMatcher, RemoteObject, StartNextSync, SyncEvent,
};
use docsync_core::ports::{FsError, ILocalFileSystem, IMetaDataStorage, IRepository, RepositoryError};
use tracing::{debug, error, info, instrument, warn};

use crate::filter::{FilterAggregator, IgnoredEntitiesCollection};
use crate::queue::{priority, QueueHandle, SyncEventHandler};
use crate::{ErrorLevel, SyncError, SyncResult};

pub use generator::{CrawlEventGenerator, CrawlEvents, LocalNode, MergePair};
pub use tree::{NodeId, ObjectTree};

/// Immediate retries of a failing crawl before waiting for the next request
pub const MAX_CRAWL_RETRIES: u32 = 3;

/// Handler running full crawls
pub struct DescendantsCrawler {
    repository: Arc<dyn IRepository>,
    storage: Arc<dyn IMetaDataStorage>,
    fs: Arc<dyn ILocalFileSystem>,
    queue: QueueHandle,
    matcher: PathMatcher,
    rules: Arc<FilterAggregator>,
    ignored: Arc<IgnoredEntitiesCollection>,
    failures: AtomicU32,
}

impl DescendantsCrawler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn IRepository>,
        storage: Arc<dyn IMetaDataStorage>,
        fs: Arc<dyn ILocalFileSystem>,
        queue: QueueHandle,
        matcher: PathMatcher,
        rules: Arc<FilterAggregator>,
        ignored: Arc<IgnoredEntitiesCollection>,
    ) -> Self {
        Self {
            repository,
            storage,
            fs,
            queue,
            matcher,
            rules,
            ignored,
            failures: AtomicU32::new(0),
        }
    }

    #[instrument(skip_all, fields(root = %self.matcher.local_root()))]
    async fn crawl(&self, request: &StartNextSync) -> SyncResult<()> {
        let server_token = match &request.last_token_on_server {
            Some(token) => Some(token.clone()),
            None => self.latest_token().await?,
        };

        let remote_root = self
            .repository
            .get_object_by_path(self.matcher.remote_root())
            .await?;
        self.ensure_root(&remote_root).await?;

        let remote = self.remote_tree(remote_root).await?;
        let local = self.local_tree().await?;
        let stored = self.storage.all_mapped_objects().await?;

        let events = CrawlEventGenerator::new(&self.matcher).generate(&local, &remote, &stored)?;
        let unchanged = events.unchanged;
        let events = events.into_events();
        info!(
            local = local.len(),
            remote = remote.len(),
            events = events.len(),
            unchanged,
            "Crawl finished"
        );
        for event in events {
            self.queue.add_event(SyncEvent::FileOrFolder(event));
        }
        self.queue.add_event(SyncEvent::FullSyncCompleted(
            StartNextSync::full().with_server_token(server_token),
        ));
        Ok(())
    }

    async fn latest_token(&self) -> SyncResult<Option<ChangeToken>> {
        if !self.repository.capabilities().change_log {
            return Ok(None);
        }
        match self.repository.latest_change_log_token().await {
            Ok(token) => Ok(token),
            Err(RepositoryError::ChangeLogUnavailable(reason)) => {
                debug!(reason = %reason, "No change log token for this crawl");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the root mapping on first use and mirrors the root's read-only flag
    async fn ensure_root(&self, remote_root: &RemoteObject) -> SyncResult<()> {
        let local_root = self.matcher.local_root().as_path();
        if self.fs.entry(local_root).await?.is_none() {
            info!(path = %local_root.display(), "Creating local root");
            self.fs.create_directory(local_root).await?;
        }

        if self.storage.get_object_by_remote_id(&remote_root.id).await?.is_none() {
            let name = match remote_root.name.as_str() {
                "" => self.matcher.local_root().file_name().unwrap_or("root"),
                name => name,
            };
            let mut root = MappedObject::new_root(name, remote_root.id.clone(), None)?;
            match self.fs.get_guid(local_root).await {
                Ok(Some(guid)) => root = root.with_guid(guid),
                Ok(None) | Err(FsError::AttributeUnsupported(_)) => {}
                Err(e) => return Err(e.into()),
            }
            root.set_read_only(remote_root.read_only);
            self.storage.save_mapped_object(&root).await?;
            match self.fs.set_guid(local_root, root.guid()).await {
                Ok(()) | Err(FsError::AttributeUnsupported(_)) => {}
                Err(e) => return Err(e.into()),
            }
            info!(id = %remote_root.id, "Root mapping created");
        }

        let entry = self.fs.entry(local_root).await?;
        if entry.is_some_and(|e| e.read_only != remote_root.read_only) {
            debug!(read_only = remote_root.read_only, "Local root follows remote root");
            self.fs.set_read_only(local_root, remote_root.read_only).await?;
        }
        Ok(())
    }

    /// Remote tree assembled from the flat descendants list
    async fn remote_tree(&self, mut root: RemoteObject) -> SyncResult<ObjectTree<RemoteObject>> {
        let descendants = self.repository.get_descendants(&root.id).await?;
        let mut by_parent: HashMap<RemoteId, Vec<RemoteObject>> = HashMap::new();
        for object in descendants {
            if let Some(parent) = object.parent_id.clone() {
                by_parent.entry(parent).or_default().push(object);
            }
        }

        root.path = Some(self.matcher.remote_root().clone());
        let mut tree = ObjectTree::new(root);
        let mut stack = vec![ObjectTree::<RemoteObject>::ROOT];
        while let Some(node) = stack.pop() {
            let parent = tree.item(node);
            let Some(mut children) = by_parent.remove(&parent.id) else {
                continue;
            };
            let Some(parent_path) = parent.path.clone() else {
                continue;
            };
            children.sort_by(|a, b| a.name.cmp(&b.name));
            for mut child in children {
                if let Some(exclusion) = self.rules.check_remote_name(&child.name, child.is_folder()) {
                    debug!(name = %child.name, exclusion = ?exclusion, "Skipping remote object");
                    continue;
                }
                if self.ignored.is_ignored_id(&child.id).is_ignored() {
                    debug!(id = %child.id, "Skipping ignored remote subtree");
                    continue;
                }
                match parent_path.join(&child.name) {
                    Ok(path) => child.path = Some(path),
                    Err(e) => {
                        warn!(id = %child.id, error = %e, "Skipping remote object with invalid name");
                        continue;
                    }
                }
                let is_folder = child.is_folder();
                let id = tree.add_child(node, child);
                if is_folder {
                    stack.push(id);
                }
            }
        }
        Ok(tree)
    }

    /// Local tree with the static rules and selective ignores applied
    async fn local_tree(&self) -> SyncResult<ObjectTree<LocalNode>> {
        let root_path = self.matcher.local_root().as_path();
        let root = self
            .fs
            .entry(root_path)
            .await?
            .ok_or_else(|| FsError::NotFound(root_path.to_path_buf()))?;
        let mut tree = ObjectTree::new(LocalNode {
            entry: root,
            guid: None,
        });

        let mut stack = vec![ObjectTree::<LocalNode>::ROOT];
        while let Some(node) = stack.pop() {
            let dir = tree.item(node).entry.path.clone();
            let children = match self.fs.read_dir(&dir).await {
                Ok(children) => children,
                Err(e) if e.is_not_found() => continue,
                Err(FsError::PathTooLong(path)) => return Err(SyncError::path_too_long(&path)),
                Err(e) => return Err(e.into()),
            };
            for entry in children {
                if entry.is_symlink && self.rules.skips_symlinks() {
                    continue;
                }
                if let Some(exclusion) = self.rules.check_path(&entry.path, entry.is_directory) {
                    debug!(path = %entry.path.display(), exclusion = ?exclusion, "Skipping local entry");
                    continue;
                }
                if self.ignored.is_ignored_path(&entry.path).is_ignored() {
                    continue;
                }
                let guid = match self.fs.get_guid(&entry.path).await {
                    Ok(guid) => guid,
                    Err(FsError::AttributeUnsupported(_)) => None,
                    Err(e) if e.is_not_found() => continue,
                    Err(FsError::PathTooLong(path)) => return Err(SyncError::path_too_long(&path)),
                    Err(e) => return Err(e.into()),
                };
                let is_directory = entry.is_directory;
                let id = tree.add_child(node, LocalNode { entry, guid });
                if is_directory {
                    stack.push(id);
                }
            }
        }
        Ok(tree)
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for DescendantsCrawler {
    fn priority(&self) -> i32 {
        priority::CRAWLER
    }

    fn name(&self) -> &'static str {
        "descendants_crawler"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        let SyncEvent::StartNextSync(request) = event else {
            return Ok(false);
        };
        if !request.full_sync_requested {
            return Ok(false);
        }

        let err = match self.crawl(request).await {
            Ok(()) => {
                self.failures.store(0, Ordering::Relaxed);
                return Ok(true);
            }
            Err(err) => err,
        };

        self.queue.add_event(SyncEvent::FullSyncFailed);
        if matches!(err.classify(), ErrorLevel::Connection | ErrorLevel::Interaction) {
            self.failures.store(0, Ordering::Relaxed);
            return Err(err);
        }

        let attempt = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt <= MAX_CRAWL_RETRIES {
            warn!(attempt, error = %err, "Crawl failed, retrying");
            self.queue.add_event(SyncEvent::StartNextSync(request.clone()));
        } else {
            error!(error = %err, "Crawl keeps failing, waiting for the next request");
            self.failures.store(0, Ordering::Relaxed);
        }
        Ok(false)
    }
}
