//! Snapshot of an object in the remote repository
//!
//! `RemoteObject` is what the repository port returns when resolving an
//! object by id or path, listing children, or reading the change log. It is
//! a plain value: holding one does not keep any server-side state alive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mapped_object::ObjectType;
use super::newtypes::{ChangeToken, Checksum, RemoteId, RemotePath};

/// Live view of a remote document or folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Repository-issued identifier
    pub id: RemoteId,
    /// Identifier of the containing folder (None for the repository root)
    pub parent_id: Option<RemoteId>,
    /// Object name (last path segment)
    pub name: String,
    /// Document or folder
    pub object_type: ObjectType,
    /// Absolute repository path, when the repository reports one
    pub path: Option<RemotePath>,
    /// Current change token
    pub change_token: Option<ChangeToken>,
    /// Server-side last modification time
    pub last_modified: Option<DateTime<Utc>>,
    /// Content stream length in bytes (documents only)
    pub content_length: Option<u64>,
    /// Content hash reported by the server, if it computes one
    pub content_hash: Option<Checksum>,
    /// Whether the current user may not modify the object
    pub read_only: bool,
    /// Whether a document has a content stream at all
    pub has_content_stream: bool,
    /// Free-form description property
    pub description: Option<String>,
}

impl RemoteObject {
    /// Creates a folder snapshot with the given identity
    pub fn folder(id: RemoteId, parent_id: Option<RemoteId>, name: impl Into<String>) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            object_type: ObjectType::Folder,
            path: None,
            change_token: None,
            last_modified: None,
            content_length: None,
            content_hash: None,
            read_only: false,
            has_content_stream: false,
            description: None,
        }
    }

    /// Creates a document snapshot with the given identity and length
    pub fn document(
        id: RemoteId,
        parent_id: RemoteId,
        name: impl Into<String>,
        content_length: u64,
    ) -> Self {
        Self {
            object_type: ObjectType::File,
            content_length: Some(content_length),
            has_content_stream: true,
            ..Self::folder(id, Some(parent_id), name)
        }
    }

    /// Returns true for folders
    pub fn is_folder(&self) -> bool {
        self.object_type == ObjectType::Folder
    }

    /// Returns true for documents
    pub fn is_document(&self) -> bool {
        self.object_type == ObjectType::File
    }
}
