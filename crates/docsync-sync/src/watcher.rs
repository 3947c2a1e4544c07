//! File watching and move coalescing
//!
//! [`FileWatcher`] wraps the `notify` crate and forwards raw OS events as
//! [`RawChange`] values over an mpsc channel. The [`WatcherConsumer`] turns
//! them into queue events:
//!
//! ```text
//! inotify / fanotify
//!       │
//!       ▼
//!  FileWatcher  ──→  mpsc::channel  ──→  WatcherConsumer  ──→  SyncEventQueue
//! ```
//!
//! Most editors and file managers report a move as a delete followed by a
//! create. The consumer holds deletes of synchronized entries and creates
//! of entries with a known GUID for one debounce window and pairs them by
//! GUID into a single [`FsMovedEvent`]. Unpaired entries are flushed as
//! plain deletes and creates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use docsync_core::domain::{
    newtypes::LocalGuid, FsChangeKind, FsEvent, FsMovedEvent, StartNextSync, SyncEvent,
};
use docsync_core::ports::{FsError, ILocalFileSystem, IMetaDataStorage};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::QueueHandle;

// ============================================================================
// RawChange
// ============================================================================

/// What the OS reported for a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChangeKind {
    Created,
    Changed,
    Deleted,
    /// Native rename with both paths known
    Renamed { from: PathBuf },
}

/// One filesystem notification, decoupled from `notify`'s types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub kind: RawChangeKind,
    pub path: PathBuf,
    pub is_directory: bool,
}

impl RawChange {
    pub fn new(kind: RawChangeKind, path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self {
            kind,
            path: path.into(),
            is_directory,
        }
    }
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Watches a directory tree using the OS-native mechanism
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Creates a watcher and the receiver its changes arrive on
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new() -> Result<(Self, mpsc::Receiver<RawChange>)> {
        let (tx, rx) = mpsc::channel::<RawChange>(1024);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        if let Err(e) = tx.blocking_send(change) {
                            warn!(error = %e, "Failed to send change (receiver dropped)");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher }, rx))
    }

    /// Starts watching `path` recursively
    ///
    /// # Errors
    /// Returns an error if the path cannot be watched (missing, no
    /// permission, inotify watch limit reached)
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Starting recursive watch");
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", path.display()))
    }

    /// Stops watching `path`
    ///
    /// # Errors
    /// Returns an error if the path was not being watched
    pub fn unwatch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Stopping watch");
        self.watcher
            .unwatch(path)
            .with_context(|| format!("Failed to unwatch path: {}", path.display()))
    }
}

/// Converts a `notify::Event` into a [`RawChange`]
///
/// Rename halves become deletes and creates; the pair with both paths
/// becomes [`RawChangeKind::Renamed`]. Access events are ignored.
fn map_notify_event(event: &notify::Event) -> Option<RawChange> {
    let paths = &event.paths;
    let path = paths.first()?;

    let change = match &event.kind {
        EventKind::Create(kind) => RawChange::new(
            RawChangeKind::Created,
            path,
            matches!(kind, CreateKind::Folder) || path.is_dir(),
        ),
        EventKind::Remove(kind) => {
            RawChange::new(RawChangeKind::Deleted, path, matches!(kind, RemoveKind::Folder))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            RawChange::new(RawChangeKind::Deleted, path, false)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            RawChange::new(RawChangeKind::Created, path, path.is_dir())
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            let to = &paths[1];
            RawChange::new(
                RawChangeKind::Renamed { from: path.clone() },
                to,
                to.is_dir(),
            )
        }
        EventKind::Modify(_) => RawChange::new(RawChangeKind::Changed, path, path.is_dir()),
        _ => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            return None;
        }
    };
    debug!(change = ?change, "Mapped notify event");
    Some(change)
}

// ============================================================================
// WatcherConsumer
// ============================================================================

#[derive(Debug, Clone)]
struct Pending {
    path: PathBuf,
    is_directory: bool,
    since: Instant,
}

/// Turns raw changes into `Fs` and `FsMoved` queue events
pub struct WatcherConsumer {
    queue: QueueHandle,
    storage: Arc<dyn IMetaDataStorage>,
    fs: Arc<dyn ILocalFileSystem>,
    debounce: Duration,
    pending_deletes: HashMap<LocalGuid, Pending>,
    pending_creates: HashMap<LocalGuid, Pending>,
    last_move: Option<(PathBuf, PathBuf)>,
}

impl WatcherConsumer {
    pub fn new(
        queue: QueueHandle,
        storage: Arc<dyn IMetaDataStorage>,
        fs: Arc<dyn ILocalFileSystem>,
        debounce: Duration,
    ) -> Self {
        Self {
            queue,
            storage,
            fs,
            debounce,
            pending_deletes: HashMap::new(),
            pending_creates: HashMap::new(),
            last_move: None,
        }
    }

    /// Number of held deletes and creates
    pub fn pending(&self) -> usize {
        self.pending_deletes.len() + self.pending_creates.len()
    }

    /// Consumes changes until cancelled or the watcher goes away
    pub async fn run(mut self, mut rx: mpsc::Receiver<RawChange>, cancel: CancellationToken) {
        let period = (self.debounce / 2).max(Duration::from_millis(10));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = rx.recv() => match change {
                    Some(change) => self.process(change).await,
                    None => break,
                },
                _ = tick.tick() => self.flush_expired(Instant::now()).await,
            }
        }
        self.flush_all().await;
        debug!("Watcher consumer stopped");
    }

    /// Handles one raw change
    pub async fn process(&mut self, change: RawChange) {
        match change.kind {
            RawChangeKind::Deleted => self.on_deleted(change.path, change.is_directory).await,
            RawChangeKind::Created => self.on_created(change.path).await,
            RawChangeKind::Changed => {
                if !change.is_directory {
                    self.emit(FsChangeKind::Changed, change.path, false);
                }
            }
            RawChangeKind::Renamed { from } => {
                self.on_renamed(from, change.path, change.is_directory)
            }
        }
    }

    async fn on_deleted(&mut self, path: PathBuf, is_directory: bool) {
        let mapped = match self.storage.get_object_by_local_path(&path).await {
            Ok(mapped) => mapped,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Storage lookup failed, requesting crawl");
                self.request_crawl();
                return;
            }
        };
        let Some(mapped) = mapped else {
            debug!(path = %path.display(), "Deleted entry was never synchronized");
            return;
        };

        let guid = mapped.guid();
        if let Some(created) = self.pending_creates.remove(&guid) {
            self.emit_move(path, created.path, created.is_directory);
            return;
        }
        self.pending_deletes.insert(
            guid,
            Pending {
                path,
                is_directory: is_directory || mapped.is_folder(),
                since: Instant::now(),
            },
        );
    }

    async fn on_created(&mut self, path: PathBuf) {
        let entry = match self.fs.entry(&path).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(path = %path.display(), "Created entry vanished");
                return;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read metadata, requesting crawl");
                self.request_crawl();
                return;
            }
        };

        let guid = match self.fs.get_guid(&path).await {
            Ok(guid) => guid,
            Err(FsError::NotFound(_)) => return,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No GUID attribute");
                None
            }
        };

        if let Some(guid) = guid {
            if let Some(deleted) = self.pending_deletes.remove(&guid) {
                self.emit_move(deleted.path, path, entry.is_directory);
                return;
            }
            match self.storage.get_object_by_guid(&guid).await {
                Ok(Some(_)) => {
                    self.pending_creates.insert(
                        guid,
                        Pending {
                            path,
                            is_directory: entry.is_directory,
                            since: Instant::now(),
                        },
                    );
                    return;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "GUID lookup failed"),
            }
        }
        self.emit_created(path, entry.is_directory).await;
    }

    fn on_renamed(&mut self, from: PathBuf, to: PathBuf, is_directory: bool) {
        if self.last_move.as_ref() == Some(&(from.clone(), to.clone())) {
            return;
        }
        self.pending_deletes.retain(|_, p| p.path != from);
        self.pending_creates.retain(|_, p| p.path != to);
        self.emit_move(from, to, is_directory);
    }

    /// Flushes entries held longer than the debounce window
    pub async fn flush_expired(&mut self, now: Instant) {
        let debounce = self.debounce;
        let expired = |p: &Pending| now.saturating_duration_since(p.since) >= debounce;

        let deletes: Vec<_> = self
            .pending_deletes
            .iter()
            .filter(|(_, p)| expired(p))
            .map(|(g, _)| *g)
            .collect();
        for guid in deletes {
            if let Some(p) = self.pending_deletes.remove(&guid) {
                self.emit(FsChangeKind::Deleted, p.path, p.is_directory);
            }
        }

        let creates: Vec<_> = self
            .pending_creates
            .iter()
            .filter(|(_, p)| expired(p))
            .map(|(g, _)| *g)
            .collect();
        for guid in creates {
            if let Some(p) = self.pending_creates.remove(&guid) {
                self.emit_created(p.path, p.is_directory).await;
            }
        }
    }

    /// Flushes everything that is held
    pub async fn flush_all(&mut self) {
        for (_, p) in std::mem::take(&mut self.pending_deletes) {
            self.emit(FsChangeKind::Deleted, p.path, p.is_directory);
        }
        for (_, p) in std::mem::take(&mut self.pending_creates) {
            self.emit_created(p.path, p.is_directory).await;
        }
    }

    /// Announces a created entry, and everything below a created directory
    async fn emit_created(&mut self, path: PathBuf, is_directory: bool) {
        self.emit(FsChangeKind::Created, path.clone(), is_directory);
        if !is_directory {
            return;
        }
        let mut stack = vec![path];
        while let Some(dir) = stack.pop() {
            let children = match self.fs.read_dir(&dir).await {
                Ok(children) => children,
                Err(e) => {
                    debug!(path = %dir.display(), error = %e, "Cannot list new directory");
                    continue;
                }
            };
            for child in children {
                self.emit(FsChangeKind::Created, child.path.clone(), child.is_directory);
                if child.is_directory {
                    stack.push(child.path);
                }
            }
        }
    }

    fn emit_move(&mut self, old_path: PathBuf, new_path: PathBuf, is_directory: bool) {
        debug!(from = %old_path.display(), to = %new_path.display(), "Coalesced move");
        self.last_move = Some((old_path.clone(), new_path.clone()));
        self.queue.add_event(SyncEvent::FsMoved(FsMovedEvent {
            old_path,
            new_path,
            is_directory,
        }));
    }

    fn emit(&self, kind: FsChangeKind, path: PathBuf, is_directory: bool) {
        self.queue
            .add_event(SyncEvent::Fs(FsEvent::new(kind, path, is_directory)));
    }

    fn request_crawl(&self) {
        self.queue
            .add_event(SyncEvent::StartNextSync(StartNextSync::full()));
    }
}
