//! Remote repository port (driven/secondary port)
//!
//! This module defines the interface to the remote content-management
//! repository. The sync engine is protocol-agnostic: it only assumes that
//! objects have stable string ids, carry an opaque change token, and that
//! incremental changes can be polled as a token-keyed feed (with an
//! "unavailable" escape hatch that forces a full crawl).
//!
//! ## Design Notes
//!
//! - Unlike the storage ports, this port returns a typed [`RepositoryError`]:
//!   the engine routes permission/storage errors, connection errors and
//!   change-log errors differently, so the classification is part of the
//!   contract.
//! - Content is transferred in chunks (`append_content`) so that transfers
//!   can be paused or aborted between chunks.
//! - Check-out/check-in has default implementations returning
//!   `NotSupported`; repositories advertise support via
//!   [`RepositoryCapabilities::private_working_copy`].

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::domain::newtypes::{ChangeToken, RemoteId, RemotePath};
use crate::domain::{ChangeType, RemoteObject};

/// Byte stream of a document's content
pub type ContentStream = Box<dyn AsyncRead + Send + Unpin>;

// ============================================================================
// Errors
// ============================================================================

/// Classified repository failure
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The object does not exist (anymore)
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// The current user may not perform the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Repository-side storage problem (quota exceeded, disk full, ...)
    #[error("Repository storage error: {0}")]
    Storage(String),

    /// The repository could not be reached
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Credentials were rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The change log is disabled or cannot be read
    #[error("Change log unavailable: {0}")]
    ChangeLogUnavailable(String),

    /// The change log no longer contains entries since the given token
    #[error("Change log token is stale: {0}")]
    StaleChangeToken(String),

    /// The repository does not implement the operation
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Anything else
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RepositoryError {
    /// Connection-level failures suspend the whole sync root
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Unauthorized(_))
    }

    /// Failures that defer a single object to the next sync cycle
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::Storage(_))
    }
}

// ============================================================================
// DTOs
// ============================================================================

/// Optional repository features, queried once per sync root start-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryCapabilities {
    /// Incremental change log is available
    pub change_log: bool,
    /// Check-out/check-in of private working copies is available
    pub private_working_copy: bool,
    /// The server accepts client-supplied modification dates
    pub can_modify_dates: bool,
}

/// One raw change-log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub object_id: RemoteId,
    pub change_type: ChangeType,
}

/// One page of the change log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeLogPage {
    pub entries: Vec<ChangeLogEntry>,
    /// Token to continue from (the latest token once `has_more` is false)
    pub next_token: Option<ChangeToken>,
    pub has_more: bool,
}

/// Properties to update on an object; `None` leaves a property untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectProperties {
    pub name: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

impl ObjectProperties {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn modified_at(time: DateTime<Utc>) -> Self {
        Self {
            last_modified: Some(time),
            ..Self::default()
        }
    }
}

// ============================================================================
// IRepository trait
// ============================================================================

/// Port trait for remote repository access
#[async_trait::async_trait]
pub trait IRepository: Send + Sync {
    /// Optional features of this repository
    fn capabilities(&self) -> RepositoryCapabilities;

    /// Resolves an object by id
    async fn get_object(&self, id: &RemoteId) -> Result<RemoteObject, RepositoryError>;

    /// Resolves an object by absolute repository path
    async fn get_object_by_path(&self, path: &RemotePath) -> Result<RemoteObject, RepositoryError>;

    /// Lists the direct children of a folder
    async fn get_children(&self, folder_id: &RemoteId)
        -> Result<Vec<RemoteObject>, RepositoryError>;

    /// Lists all descendants of a folder as a flat list (any order)
    async fn get_descendants(
        &self,
        folder_id: &RemoteId,
    ) -> Result<Vec<RemoteObject>, RepositoryError>;

    /// Latest token of the change log, `None` if the log is empty
    async fn latest_change_log_token(&self) -> Result<Option<ChangeToken>, RepositoryError> {
        Err(RepositoryError::ChangeLogUnavailable(
            "change log not supported".to_string(),
        ))
    }

    /// Reads change-log entries recorded after `since`
    async fn get_content_changes(
        &self,
        since: &ChangeToken,
        max_items: usize,
    ) -> Result<ChangeLogPage, RepositoryError> {
        let _ = (since, max_items);
        Err(RepositoryError::ChangeLogUnavailable(
            "change log not supported".to_string(),
        ))
    }

    /// Creates a folder below `parent_id`
    async fn create_folder(
        &self,
        parent_id: &RemoteId,
        name: &str,
    ) -> Result<RemoteObject, RepositoryError>;

    /// Creates an empty document below `parent_id`
    async fn create_document(
        &self,
        parent_id: &RemoteId,
        name: &str,
    ) -> Result<RemoteObject, RepositoryError>;

    /// Writes one chunk of content
    ///
    /// With `overwrite` set the existing content is replaced by `chunk`,
    /// otherwise `chunk` is appended. `is_last` marks the final chunk; the
    /// returned snapshot reflects the new change token.
    async fn append_content(
        &self,
        id: &RemoteId,
        chunk: &[u8],
        overwrite: bool,
        is_last: bool,
    ) -> Result<RemoteObject, RepositoryError>;

    /// Opens the content stream of a document
    async fn get_content_stream(&self, id: &RemoteId) -> Result<ContentStream, RepositoryError>;

    /// Updates name, modification date or description
    async fn update_properties(
        &self,
        id: &RemoteId,
        properties: &ObjectProperties,
    ) -> Result<RemoteObject, RepositoryError>;

    /// Moves an object from one folder to another
    async fn move_object(
        &self,
        id: &RemoteId,
        source_parent: &RemoteId,
        target_parent: &RemoteId,
    ) -> Result<RemoteObject, RepositoryError>;

    /// Deletes a document or an empty folder
    async fn delete_object(&self, id: &RemoteId) -> Result<(), RepositoryError>;

    /// Deletes a folder and everything below it
    async fn delete_tree(&self, folder_id: &RemoteId) -> Result<(), RepositoryError>;

    /// Checks out a private working copy, returning its id
    async fn check_out(&self, id: &RemoteId) -> Result<RemoteId, RepositoryError> {
        Err(RepositoryError::NotSupported(format!("check_out {id}")))
    }

    /// Checks a private working copy back in, returning the new version
    async fn check_in(&self, pwc_id: &RemoteId) -> Result<RemoteObject, RepositoryError> {
        Err(RepositoryError::NotSupported(format!("check_in {pwc_id}")))
    }

    /// Discards a private working copy
    async fn cancel_check_out(&self, pwc_id: &RemoteId) -> Result<(), RepositoryError> {
        Err(RepositoryError::NotSupported(format!(
            "cancel_check_out {pwc_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(RepositoryError::Connection("down".into()).is_connection_error());
        assert!(RepositoryError::Unauthorized("bad".into()).is_connection_error());
        assert!(!RepositoryError::Storage("quota".into()).is_connection_error());

        assert!(RepositoryError::PermissionDenied("ro".into()).is_recoverable());
        assert!(RepositoryError::Storage("quota".into()).is_recoverable());
        assert!(!RepositoryError::ObjectNotFound("x".into()).is_recoverable());
    }

    #[test]
    fn test_property_helpers() {
        let props = ObjectProperties::rename("b.txt");
        assert_eq!(props.name.as_deref(), Some("b.txt"));
        assert!(props.last_modified.is_none());
    }
}
