//! docsync Sync - event-driven synchronization engine
//!
//! Provides:
//! - A per-root FIFO event queue with prioritized handlers
//! - Change producers (filesystem watcher, change-log poller, descendants crawler)
//! - Situation detection and a closed set of situation solvers
//! - Chunked, pausable transfers with progress snapshots
//!
//! ## Modules
//!
//! - [`queue`] - Event queue, handler trait and dispatcher
//! - [`watcher`] - notify-based watcher and the debouncing watcher consumer
//! - [`changelog`] - Remote change-log poller and content change transformer
//! - [`crawler`] - Full tree comparison of local, remote and stored trees
//! - [`detection`] - Pure situation classification
//! - [`mechanism`] - Resolves events into observations and runs solvers
//! - [`solver`] - One strategy per situation
//! - [`filter`] - Event filters, including selective ignore
//! - [`transmission`] - Transfer progress, pause and abort
//! - [`scheduler`] - Periodic sync requests
//! - [`filesystem`] - Local filesystem adapter (atomic writes, SHA-256, xattr GUIDs)
//! - [`root`] - Wiring of one sync root

pub mod changelog;
pub mod crawler;
pub mod detection;
pub mod filesystem;
pub mod filter;
pub mod mechanism;
pub mod queue;
pub mod root;
pub mod scheduler;
pub mod solver;
pub mod transmission;
pub mod watcher;

use std::path::{Path, PathBuf};

use docsync_core::domain::{newtypes::RemoteId, DomainError};
use docsync_core::ports::{FsError, RepositoryError};
use thiserror::Error;

/// Title of the interaction raised when a local path exceeds OS limits
pub const PATH_TOO_LONG_TITLE: &str = "Local path is too long";

/// Errors that can occur while handling sync events
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Metadata storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// The event refers to an object that has no mapping yet
    #[error("No mapped object for {0}; a crawl sync is required")]
    MissingMapping(String),

    /// The server changed the object since it was last synchronized
    #[error("Change token of {remote_id} is stale")]
    StaleChangeToken { remote_id: RemoteId },

    #[error("Transmission aborted: {}", .0.display())]
    TransmissionAborted(PathBuf),

    /// Needs operator action; never retried automatically
    #[error("{title}: {description}")]
    InteractionNeeded {
        title: String,
        description: String,
        details: Option<String>,
    },
}

/// Routing class of a [`SyncError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    /// Deferred to the next cycle, other objects unaffected
    Recoverable,
    /// Network or authentication failure, the root is suspended
    Connection,
    /// Surfaced to the user, not retried
    Interaction,
    Unexpected,
}

impl SyncError {
    pub fn classify(&self) -> ErrorLevel {
        match self {
            Self::Repository(e) if e.is_connection_error() => ErrorLevel::Connection,
            Self::Repository(e) if e.is_recoverable() => ErrorLevel::Recoverable,
            Self::Fs(FsError::PermissionDenied(_)) => ErrorLevel::Recoverable,
            Self::Fs(FsError::PathTooLong(_)) => ErrorLevel::Interaction,
            Self::StaleChangeToken { .. } | Self::MissingMapping(_) => ErrorLevel::Recoverable,
            Self::TransmissionAborted(_) => ErrorLevel::Recoverable,
            Self::InteractionNeeded { .. } => ErrorLevel::Interaction,
            _ => ErrorLevel::Unexpected,
        }
    }

    /// Interaction raised for paths beyond the OS path-length limit
    pub fn path_too_long(path: &Path) -> Self {
        Self::InteractionNeeded {
            title: PATH_TOO_LONG_TITLE.to_string(),
            description: format!(
                "The path {} exceeds the maximum length supported by the local filesystem. \
                 Rename or move it on the server to synchronize it.",
                path.display()
            ),
            details: None,
        }
    }

    /// Converts filesystem path-length errors into an interaction request
    pub fn into_interaction(self) -> Self {
        match self {
            Self::Fs(FsError::PathTooLong(path)) => Self::path_too_long(&path),
            other => other,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
