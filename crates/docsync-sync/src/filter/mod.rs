//! Event filters
//!
//! Filters are ordinary [`SyncEventHandler`]s that run before any producer
//! or solver. A filter "handles" an event by dropping it. The static
//! exclusion rules (ignored folders, name patterns, symlinks) are bundled in
//! a [`FilterAggregator`] so the crawler can apply exactly the same rules
//! while building the local and remote trees.

pub mod selective_ignore;

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use docsync_core::config::{IgnoreConfig, RootConfig};
use docsync_core::domain::{FsChangeKind, PathMatcher, SyncEvent};
use docsync_core::ports::{IMetaDataStorage, ILocalFileSystem};
use tracing::debug;

use crate::queue::{priority, SyncEventHandler};
use crate::SyncResult;

pub use selective_ignore::{IgnoredEntitiesCollection, SelectiveIgnoreFilter};

// ============================================================================
// Exclusion rules
// ============================================================================

/// Glob patterns matched against single names
#[derive(Debug, Clone, Default)]
pub struct IgnoredNames {
    patterns: Vec<glob::Pattern>,
}

impl IgnoredNames {
    /// # Errors
    ///
    /// Returns an error if a pattern is not a valid glob
    pub fn new(patterns: &[String]) -> Result<Self, glob::PatternError> {
        let patterns = patterns
            .iter()
            .map(|p| glob::Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }
}

/// Why an entry is excluded from synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    IgnoredFolder,
    IgnoredFileName,
    IgnoredFolderName,
    Symlink,
}

/// Static exclusion rules of one sync root
#[derive(Debug, Clone)]
pub struct FilterAggregator {
    local_root: PathBuf,
    ignored_folders: Vec<PathBuf>,
    file_names: IgnoredNames,
    folder_names: IgnoredNames,
    skip_symlinks: bool,
}

impl FilterAggregator {
    /// Builds the rules from the global ignore section and the root's folders
    ///
    /// # Errors
    ///
    /// Returns an error if a name pattern is not a valid glob
    pub fn from_config(ignore: &IgnoreConfig, root: &RootConfig) -> anyhow::Result<Self> {
        Ok(Self {
            local_root: root.local_path.clone(),
            ignored_folders: root.ignored_folders.clone(),
            file_names: IgnoredNames::new(&ignore.file_names)?,
            folder_names: IgnoredNames::new(&ignore.folder_names)?,
            skip_symlinks: ignore.symlinks,
        })
    }

    /// Returns true if symlinks are excluded
    pub fn skips_symlinks(&self) -> bool {
        self.skip_symlinks
    }

    /// Returns true if `path` is (inside) a configured ignored folder
    pub fn is_in_ignored_folder(&self, path: &Path) -> bool {
        self.ignored_folders.iter().any(|f| path.starts_with(f))
    }

    /// Returns true if `name` matches an ignored file-name pattern
    pub fn is_ignored_file_name(&self, name: &str) -> bool {
        self.file_names.matches(name)
    }

    /// Returns true if `name` matches an ignored folder-name pattern
    pub fn is_ignored_folder_name(&self, name: &str) -> bool {
        self.folder_names.matches(name)
    }

    /// Returns true if a directory component of `path` below the root
    /// matches an ignored folder-name pattern
    pub fn has_ignored_folder_component(&self, path: &Path, is_directory: bool) -> bool {
        let Ok(relative) = path.strip_prefix(&self.local_root) else {
            return false;
        };
        let names: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect();
        let folder_count = if is_directory {
            names.len()
        } else {
            names.len().saturating_sub(1)
        };
        names[..folder_count]
            .iter()
            .any(|name| self.folder_names.matches(name))
    }

    /// Checks a local path against every static rule except symlinks
    pub fn check_path(&self, path: &Path, is_directory: bool) -> Option<Exclusion> {
        if self.is_in_ignored_folder(path) {
            return Some(Exclusion::IgnoredFolder);
        }
        if self.has_ignored_folder_component(path, is_directory) {
            return Some(Exclusion::IgnoredFolderName);
        }
        if !is_directory {
            let name = path.file_name().and_then(|n| n.to_str());
            if name.is_some_and(|n| self.file_names.matches(n)) {
                return Some(Exclusion::IgnoredFileName);
            }
        }
        None
    }

    /// Checks a remote object name
    pub fn check_remote_name(&self, name: &str, is_folder: bool) -> Option<Exclusion> {
        if is_folder && self.folder_names.matches(name) {
            Some(Exclusion::IgnoredFolderName)
        } else if !is_folder && self.file_names.matches(name) {
            Some(Exclusion::IgnoredFileName)
        } else {
            None
        }
    }
}

/// A local path an event refers to, and whether it is a directory
struct Target {
    path: PathBuf,
    is_directory: bool,
}

/// Local targets of an event; remote-only events are mapped through the
/// root's path matcher when the repository reported a path
fn event_targets(event: &SyncEvent, matcher: &PathMatcher) -> Vec<Target> {
    match event {
        SyncEvent::Fs(e) => vec![Target {
            path: e.path.clone(),
            is_directory: e.is_directory,
        }],
        SyncEvent::FsMoved(e) => vec![Target {
            path: e.new_path.clone(),
            is_directory: e.is_directory,
        }],
        SyncEvent::FileOrFolder(e) => {
            let is_directory = e.is_directory();
            if let Some(path) = e.local_path() {
                return vec![Target {
                    path: path.to_path_buf(),
                    is_directory,
                }];
            }
            e.remote_object()
                .and_then(|o| o.path.as_ref())
                .and_then(|p| matcher.create_local_path(p).ok())
                .map(|p| Target {
                    path: p.into_path_buf(),
                    is_directory,
                })
                .into_iter()
                .collect()
        }
        _ => Vec::new(),
    }
}

// ============================================================================
// Path based filters
// ============================================================================

/// Drops every locally originated event (debug setting)
pub struct DropLocalEventsFilter;

#[async_trait::async_trait]
impl SyncEventHandler for DropLocalEventsFilter {
    fn priority(&self) -> i32 {
        priority::DROP_LOCAL_EVENTS
    }

    fn name(&self) -> &'static str {
        "drop_local_events"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        Ok(event.is_local_fs_event())
    }
}

/// Drops events below configured ignored folders
pub struct IgnoredFoldersFilter {
    rules: Arc<FilterAggregator>,
    matcher: PathMatcher,
}

impl IgnoredFoldersFilter {
    pub fn new(rules: Arc<FilterAggregator>, matcher: PathMatcher) -> Self {
        Self { rules, matcher }
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for IgnoredFoldersFilter {
    fn priority(&self) -> i32 {
        priority::IGNORED_FOLDERS
    }

    fn name(&self) -> &'static str {
        "ignored_folders"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        let ignored = event_targets(event, &self.matcher)
            .iter()
            .any(|t| self.rules.is_in_ignored_folder(&t.path));
        if ignored {
            debug!(event = %event, "Dropping event in ignored folder");
        }
        Ok(ignored)
    }
}

/// Drops events for files whose name matches an ignore pattern
pub struct IgnoredFileNamesFilter {
    rules: Arc<FilterAggregator>,
    matcher: PathMatcher,
}

impl IgnoredFileNamesFilter {
    pub fn new(rules: Arc<FilterAggregator>, matcher: PathMatcher) -> Self {
        Self { rules, matcher }
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for IgnoredFileNamesFilter {
    fn priority(&self) -> i32 {
        priority::IGNORED_FILE_NAMES
    }

    fn name(&self) -> &'static str {
        "ignored_file_names"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        let local = event_targets(event, &self.matcher).iter().any(|t| {
            !t.is_directory
                && t.path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| self.rules.is_ignored_file_name(n))
        });
        let remote = match event {
            SyncEvent::FileOrFolder(e) => e
                .remote_object()
                .is_some_and(|o| o.is_document() && self.rules.is_ignored_file_name(&o.name)),
            _ => false,
        };
        if local || remote {
            debug!(event = %event, "Dropping event for ignored file name");
        }
        Ok(local || remote)
    }
}

/// Drops events inside folders whose name matches an ignore pattern
pub struct IgnoredFolderNamesFilter {
    rules: Arc<FilterAggregator>,
    matcher: PathMatcher,
}

impl IgnoredFolderNamesFilter {
    pub fn new(rules: Arc<FilterAggregator>, matcher: PathMatcher) -> Self {
        Self { rules, matcher }
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for IgnoredFolderNamesFilter {
    fn priority(&self) -> i32 {
        priority::IGNORED_FOLDER_NAMES
    }

    fn name(&self) -> &'static str {
        "ignored_folder_names"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        let local = event_targets(event, &self.matcher)
            .iter()
            .any(|t| self.rules.has_ignored_folder_component(&t.path, t.is_directory));
        let remote = match event {
            SyncEvent::FileOrFolder(e) => e
                .remote_object()
                .is_some_and(|o| o.is_folder() && self.rules.is_ignored_folder_name(&o.name)),
            _ => false,
        };
        if local || remote {
            debug!(event = %event, "Dropping event for ignored folder name");
        }
        Ok(local || remote)
    }
}

/// Drops local events for symbolic links
pub struct SymlinkFilter {
    fs: Arc<dyn ILocalFileSystem>,
}

impl SymlinkFilter {
    pub fn new(fs: Arc<dyn ILocalFileSystem>) -> Self {
        Self { fs }
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for SymlinkFilter {
    fn priority(&self) -> i32 {
        priority::SYMLINKS
    }

    fn name(&self) -> &'static str {
        "symlinks"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        let path = match event {
            SyncEvent::Fs(e) if e.kind != FsChangeKind::Deleted => &e.path,
            SyncEvent::FsMoved(e) => &e.new_path,
            SyncEvent::FileOrFolder(e) => match e.local_path() {
                Some(path) => path,
                None => return Ok(false),
            },
            _ => return Ok(false),
        };
        let is_symlink = match self.fs.entry(path).await {
            Ok(entry) => entry.is_some_and(|e| e.is_symlink),
            Err(_) => false,
        };
        if is_symlink {
            debug!(path = %path.display(), "Dropping event for symbolic link");
        }
        Ok(is_symlink)
    }
}

// ============================================================================
// State based filters
// ============================================================================

/// Drops watcher events that only echo what the store already reflects
///
/// This covers the engine's own writes: a download or rename performed by a
/// solver produces watcher notifications for a state that is already
/// recorded in the metadata storage.
pub struct AlreadyHandledFsEventsFilter {
    storage: Arc<dyn IMetaDataStorage>,
    fs: Arc<dyn ILocalFileSystem>,
}

impl AlreadyHandledFsEventsFilter {
    pub fn new(storage: Arc<dyn IMetaDataStorage>, fs: Arc<dyn ILocalFileSystem>) -> Self {
        Self { storage, fs }
    }

    async fn matches_store(&self, path: &Path) -> SyncResult<bool> {
        let Some(mapped) = self.storage.get_object_by_local_path(path).await? else {
            return Ok(false);
        };
        let entry = match self.fs.entry(path).await {
            Ok(Some(entry)) => entry,
            Ok(None) | Err(_) => return Ok(false),
        };
        if entry.is_directory != mapped.is_folder() {
            return Ok(false);
        }
        if mapped.is_folder() {
            return Ok(true);
        }
        let size_matches = mapped.content_size().map_or(true, |size| size == entry.size);
        Ok(size_matches
            && entry.modified.is_some()
            && entry.modified == mapped.last_local_write_time())
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for AlreadyHandledFsEventsFilter {
    fn priority(&self) -> i32 {
        priority::ALREADY_HANDLED
    }

    fn name(&self) -> &'static str {
        "already_handled"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        let handled = match event {
            SyncEvent::Fs(e) => match e.kind {
                FsChangeKind::Created | FsChangeKind::Changed => {
                    self.matches_store(&e.path).await?
                }
                FsChangeKind::Deleted => self
                    .storage
                    .get_object_by_local_path(&e.path)
                    .await?
                    .is_none(),
            },
            SyncEvent::FsMoved(e) => {
                self.storage
                    .get_object_by_local_path(&e.old_path)
                    .await?
                    .is_none()
                    && self.matches_store(&e.new_path).await?
            }
            _ => false,
        };
        if handled {
            debug!(event = %event, "Dropping already handled event");
        }
        Ok(handled)
    }
}

/// Drops full crawl requests while a crawl is pending
#[derive(Default)]
pub struct DuplicateCrawlRequestFilter {
    in_progress: Mutex<bool>,
}

impl DuplicateCrawlRequestFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, value: bool) -> bool {
        let mut guard = match self.in_progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, value)
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for DuplicateCrawlRequestFilter {
    fn priority(&self) -> i32 {
        priority::DUPLICATE_CRAWL_REQUEST
    }

    fn name(&self) -> &'static str {
        "duplicate_crawl_request"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        match event {
            SyncEvent::StartNextSync(request) if request.full_sync_requested => {
                let was_pending = self.set(true);
                if was_pending {
                    debug!("Dropping duplicate full crawl request");
                }
                Ok(was_pending)
            }
            SyncEvent::FullSyncCompleted(_) | SyncEvent::FullSyncFailed => {
                self.set(false);
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}
