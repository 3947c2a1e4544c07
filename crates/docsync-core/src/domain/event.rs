//! Domain events flowing through a sync root's event queue
//!
//! Producers (filesystem watcher, change-log poller, crawler, scheduler)
//! only ever create these values and append them to the queue. Handlers
//! consume them in FIFO order.
//!
//! ## Event flow
//!
//! ```text
//! scheduler ──► StartNextSync ──► change-log poller ──► ContentChange ──► transformer ─┐
//!                     │                                                               │
//!                     └──(full)──► crawler ──────────────────────────────────────────►├─► FileOrFolder ──► detector ──► solver
//! watcher ──► Fs / FsMoved ──────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ChangeToken, RemoteId};
use super::remote_object::RemoteObject;

// ============================================================================
// Scheduling events
// ============================================================================

/// Payload of a "start next sync" request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartNextSync {
    /// Whether a full crawl is required instead of an incremental poll
    pub full_sync_requested: bool,
    /// Latest change-log token seen on the server, carried forward so that
    /// a successful crawl can commit it
    pub last_token_on_server: Option<ChangeToken>,
}

impl StartNextSync {
    /// Incremental request (change log if available)
    pub fn incremental() -> Self {
        Self::default()
    }

    /// Full crawl request
    pub fn full() -> Self {
        Self {
            full_sync_requested: true,
            last_token_on_server: None,
        }
    }

    /// Attaches the latest server token
    #[must_use]
    pub fn with_server_token(mut self, token: Option<ChangeToken>) -> Self {
        self.last_token_on_server = token;
        self
    }

    /// Returns a full-crawl request carrying this request's server token
    #[must_use]
    pub fn escalate(&self) -> Self {
        Self {
            full_sync_requested: true,
            last_token_on_server: self.last_token_on_server.clone(),
        }
    }
}

// ============================================================================
// Raw local events
// ============================================================================

/// Kind of a single-path filesystem notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsChangeKind {
    Created,
    Changed,
    Deleted,
}

/// Filesystem notification for one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEvent {
    pub kind: FsChangeKind,
    pub path: PathBuf,
    pub is_directory: bool,
}

impl FsEvent {
    pub fn new(kind: FsChangeKind, path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self {
            kind,
            path: path.into(),
            is_directory,
        }
    }
}

/// Filesystem rename or move of one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsMovedEvent {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub is_directory: bool,
}

// ============================================================================
// Raw remote events
// ============================================================================

/// Change-log entry type as reported by the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
    /// Permissions (ACL) changed
    Security,
}

/// One change-log entry, resolved against the repository where possible
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChangeEvent {
    pub change_type: ChangeType,
    pub object_id: RemoteId,
    /// Current state of the object; `None` for deletions or objects that
    /// vanished before they could be fetched
    pub object: Option<RemoteObject>,
}

// ============================================================================
// Correlated events
// ============================================================================

/// Metadata change on one side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaDataChange {
    #[default]
    None,
    Created,
    Changed,
    Deleted,
    Moved,
}

/// Content change on one side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentChange {
    #[default]
    None,
    Created,
    Changed,
}

impl ContentChange {
    /// Returns true unless `None`
    pub fn is_changed(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Producer that created an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Watcher,
    ChangeLog,
    Crawler,
}

/// Reference to a local entry (which may no longer exist)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalHandle {
    pub path: PathBuf,
    pub is_directory: bool,
}

impl LocalHandle {
    pub fn new(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self {
            path: path.into(),
            is_directory,
        }
    }
}

/// Reference to a remote object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteHandle {
    /// Live snapshot of the object
    Object(RemoteObject),
    /// Object known to be gone; only its identity remains
    Deleted { id: RemoteId },
}

impl RemoteHandle {
    /// Identity of the referenced object
    pub fn id(&self) -> &RemoteId {
        match self {
            Self::Object(object) => &object.id,
            Self::Deleted { id } => id,
        }
    }

    /// Live snapshot, if the object still exists
    pub fn object(&self) -> Option<&RemoteObject> {
        match self {
            Self::Object(object) => Some(object),
            Self::Deleted { .. } => None,
        }
    }
}

/// A change correlated to one file or folder, on one or both sides
///
/// At least one of the local and remote handles is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOrFolderEvent {
    local: Option<LocalHandle>,
    remote: Option<RemoteHandle>,
    pub local_change: MetaDataChange,
    pub remote_change: MetaDataChange,
    pub local_content: ContentChange,
    pub remote_content: ContentChange,
    /// Previous local path for local moves
    pub old_local_path: Option<PathBuf>,
    pub source: EventSource,
}

impl FileOrFolderEvent {
    /// Creates an event from optional handles
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ValidationFailed` if both handles are missing
    pub fn new(
        local: Option<LocalHandle>,
        remote: Option<RemoteHandle>,
        source: EventSource,
    ) -> Result<Self, DomainError> {
        if local.is_none() && remote.is_none() {
            return Err(DomainError::ValidationFailed(
                "An event needs a local or a remote handle".to_string(),
            ));
        }
        Ok(Self {
            local,
            remote,
            local_change: MetaDataChange::None,
            remote_change: MetaDataChange::None,
            local_content: ContentChange::None,
            remote_content: ContentChange::None,
            old_local_path: None,
            source,
        })
    }

    /// Creates an event describing a local change only
    pub fn local(
        handle: LocalHandle,
        change: MetaDataChange,
        content: ContentChange,
        source: EventSource,
    ) -> Self {
        Self {
            local: Some(handle),
            remote: None,
            local_change: change,
            remote_change: MetaDataChange::None,
            local_content: content,
            remote_content: ContentChange::None,
            old_local_path: None,
            source,
        }
    }

    /// Creates an event describing a remote change only
    pub fn remote(
        handle: RemoteHandle,
        change: MetaDataChange,
        content: ContentChange,
        source: EventSource,
    ) -> Self {
        Self {
            local: None,
            remote: Some(handle),
            local_change: MetaDataChange::None,
            remote_change: change,
            local_content: ContentChange::None,
            remote_content: content,
            old_local_path: None,
            source,
        }
    }

    /// Adds or replaces the local side
    #[must_use]
    pub fn with_local(
        mut self,
        handle: LocalHandle,
        change: MetaDataChange,
        content: ContentChange,
    ) -> Self {
        self.local = Some(handle);
        self.local_change = change;
        self.local_content = content;
        self
    }

    pub fn local_handle(&self) -> Option<&LocalHandle> {
        self.local.as_ref()
    }

    pub fn remote_handle(&self) -> Option<&RemoteHandle> {
        self.remote.as_ref()
    }

    /// Local path, if the event carries a local handle
    pub fn local_path(&self) -> Option<&Path> {
        self.local.as_ref().map(|h| h.path.as_path())
    }

    /// Remote id, if the event carries a remote handle
    pub fn remote_id(&self) -> Option<&RemoteId> {
        self.remote.as_ref().map(RemoteHandle::id)
    }

    /// Live remote snapshot, if any
    pub fn remote_object(&self) -> Option<&RemoteObject> {
        self.remote.as_ref().and_then(RemoteHandle::object)
    }

    /// Whether the entry is a directory/folder on whichever side is known
    pub fn is_directory(&self) -> bool {
        match (&self.local, self.remote_object()) {
            (Some(local), _) => local.is_directory,
            (None, Some(remote)) => remote.is_folder(),
            (None, None) => false,
        }
    }
}

// ============================================================================
// SyncEvent
// ============================================================================

/// Every event a sync root's queue can carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// Periodic or explicit request to synchronize
    StartNextSync(StartNextSync),
    /// A full crawl finished successfully
    FullSyncCompleted(StartNextSync),
    /// A full crawl failed and will be retried
    FullSyncFailed,
    /// Single-path local notification
    Fs(FsEvent),
    /// Local rename or move
    FsMoved(FsMovedEvent),
    /// Remote change-log entry
    ContentChange(ContentChangeEvent),
    /// Correlated change ready for situation detection
    FileOrFolder(FileOrFolderEvent),
    /// A condition the user has to act upon
    InteractionNeeded {
        title: String,
        description: String,
        details: Option<String>,
    },
    /// The root's configuration changed at runtime
    ConfigChanged { poll_interval: Duration },
}

impl SyncEvent {
    /// Short event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartNextSync(_) => "start_next_sync",
            Self::FullSyncCompleted(_) => "full_sync_completed",
            Self::FullSyncFailed => "full_sync_failed",
            Self::Fs(_) => "fs",
            Self::FsMoved(_) => "fs_moved",
            Self::ContentChange(_) => "content_change",
            Self::FileOrFolder(_) => "file_or_folder",
            Self::InteractionNeeded { .. } => "interaction_needed",
            Self::ConfigChanged { .. } => "config_changed",
        }
    }

    /// Returns true for events that originate from the local filesystem watcher
    pub fn is_local_fs_event(&self) -> bool {
        match self {
            Self::Fs(_) | Self::FsMoved(_) => true,
            Self::FileOrFolder(e) => e.source == EventSource::Watcher,
            _ => false,
        }
    }

    /// Local paths this event refers to (for path-based filters)
    pub fn local_paths(&self) -> Vec<&Path> {
        match self {
            Self::Fs(e) => vec![e.path.as_path()],
            Self::FsMoved(e) => vec![e.old_path.as_path(), e.new_path.as_path()],
            Self::FileOrFolder(e) => e
                .local_path()
                .into_iter()
                .chain(e.old_local_path.as_deref())
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartNextSync(s) | Self::FullSyncCompleted(s) => write!(
                f,
                "{}(full={}, token={})",
                self.name(),
                s.full_sync_requested,
                s.last_token_on_server
                    .as_ref()
                    .map_or("-", |t| t.as_str())
            ),
            Self::Fs(e) => write!(f, "fs({:?} {})", e.kind, e.path.display()),
            Self::FsMoved(e) => write!(
                f,
                "fs_moved({} -> {})",
                e.old_path.display(),
                e.new_path.display()
            ),
            Self::ContentChange(e) => {
                write!(f, "content_change({:?} {})", e.change_type, e.object_id)
            }
            Self::FileOrFolder(e) => write!(
                f,
                "file_or_folder(local={:?}/{:?} {}, remote={:?}/{:?} {})",
                e.local_change,
                e.local_content,
                e.local_path().map_or_else(|| "-".into(), |p| p.display().to_string()),
                e.remote_change,
                e.remote_content,
                e.remote_id().map_or("-", |id| id.as_str()),
            ),
            Self::InteractionNeeded { title, .. } => write!(f, "interaction_needed({title})"),
            Self::ConfigChanged { poll_interval } => {
                write!(f, "config_changed(poll={}ms)", poll_interval.as_millis())
            }
            Self::FullSyncFailed => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(s: &str) -> RemoteId {
        RemoteId::new(s.to_string()).unwrap()
    }

    #[test]
    fn test_file_or_folder_requires_a_handle() {
        assert!(FileOrFolderEvent::new(None, None, EventSource::Crawler).is_err());
        let local = LocalHandle::new("/sync/a", false);
        assert!(FileOrFolderEvent::new(Some(local), None, EventSource::Crawler).is_ok());
    }

    #[test]
    fn test_remote_deleted_handle_keeps_identity() {
        let event = FileOrFolderEvent::remote(
            RemoteHandle::Deleted { id: rid("doc-1") },
            MetaDataChange::Deleted,
            ContentChange::None,
            EventSource::ChangeLog,
        );
        assert_eq!(event.remote_id(), Some(&rid("doc-1")));
        assert!(event.remote_object().is_none());
    }

    #[test]
    fn test_is_directory_prefers_local_side() {
        let remote = RemoteObject::folder(rid("f"), Some(rid("root")), "f");
        let event = FileOrFolderEvent::remote(
            RemoteHandle::Object(remote),
            MetaDataChange::Created,
            ContentChange::None,
            EventSource::Crawler,
        );
        assert!(event.is_directory());
        let event = event.with_local(
            LocalHandle::new("/sync/f", false),
            MetaDataChange::None,
            ContentChange::None,
        );
        assert!(!event.is_directory());
    }

    #[test]
    fn test_escalate_keeps_token() {
        let token = ChangeToken::new("42".to_string()).unwrap();
        let start = StartNextSync::incremental().with_server_token(Some(token.clone()));
        let full = start.escalate();
        assert!(full.full_sync_requested);
        assert_eq!(full.last_token_on_server, Some(token));
    }

    #[test]
    fn test_local_paths_of_move() {
        let event = SyncEvent::FsMoved(FsMovedEvent {
            old_path: "/sync/a".into(),
            new_path: "/sync/b".into(),
            is_directory: false,
        });
        assert_eq!(
            event.local_paths(),
            vec![Path::new("/sync/a"), Path::new("/sync/b")]
        );
        assert!(event.is_local_fs_event());
    }

    #[test]
    fn test_display() {
        let event = SyncEvent::StartNextSync(StartNextSync::full());
        assert_eq!(event.to_string(), "start_next_sync(full=true, token=-)");
    }
}
