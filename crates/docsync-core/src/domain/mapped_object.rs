//! MappedObject domain entity
//!
//! A `MappedObject` is the persisted record correlating one local filesystem
//! entry with one remote repository object. It remembers what both sides
//! looked like the last time they were known to be in sync, which is what
//! the situation detector compares live snapshots against.
//!
//! ## Invariants
//!
//! - `remote_id` is unique among the mapped objects of one sync root
//! - only the sync root has no `parent_id`
//! - a folder never carries a checksum or content size
//! - checksum and algorithm are present together or absent together
//!   (enforced by the [`Checksum`] type)

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ChangeToken, Checksum, LocalGuid, RemoteId};

/// Kind of a synchronized entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    /// Regular file (a document on the remote side)
    File,
    /// Directory (a folder on the remote side)
    Folder,
}

impl ObjectType {
    /// Returns the canonical storage name
    pub fn name(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
        }
    }

    /// Parses the canonical storage name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file" => Some(Self::File),
            "folder" => Some(Self::Folder),
            _ => None,
        }
    }

    /// Maps a directory flag to an object type
    pub fn from_is_directory(is_directory: bool) -> Self {
        if is_directory {
            Self::Folder
        } else {
            Self::File
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sentinel for "content size unknown"
pub const UNKNOWN_CONTENT_SIZE: i64 = -1;

/// Persisted mapping between a local entry and a remote object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedObject {
    guid: LocalGuid,
    parent_id: Option<RemoteId>,
    remote_id: RemoteId,
    object_type: ObjectType,
    last_change_token: Option<ChangeToken>,
    last_remote_write_time: Option<DateTime<Utc>>,
    last_local_write_time: Option<DateTime<Utc>>,
    last_checksum: Option<Checksum>,
    last_content_size: i64,
    name: String,
    description: Option<String>,
    read_only: bool,
}

impl MappedObject {
    /// Creates a new mapping with a fresh local GUID
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ValidationFailed` if `name` is empty
    pub fn new(
        name: impl Into<String>,
        remote_id: RemoteId,
        object_type: ObjectType,
        parent_id: Option<RemoteId>,
        change_token: Option<ChangeToken>,
    ) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::ValidationFailed(
                "Mapped object name cannot be empty".to_string(),
            ));
        }
        if parent_id.as_ref() == Some(&remote_id) {
            return Err(DomainError::ValidationFailed(format!(
                "Mapped object {remote_id} cannot be its own parent"
            )));
        }

        Ok(Self {
            guid: LocalGuid::new(),
            parent_id,
            remote_id,
            object_type,
            last_change_token: change_token,
            last_remote_write_time: None,
            last_local_write_time: None,
            last_checksum: None,
            last_content_size: UNKNOWN_CONTENT_SIZE,
            name,
            description: None,
            read_only: false,
        })
    }

    /// Creates the mapping of a sync root folder (no parent)
    pub fn new_root(
        name: impl Into<String>,
        remote_id: RemoteId,
        change_token: Option<ChangeToken>,
    ) -> Result<Self, DomainError> {
        Self::new(name, remote_id, ObjectType::Folder, None, change_token)
    }

    /// Replaces the generated GUID with an existing one
    #[must_use]
    pub fn with_guid(mut self, guid: LocalGuid) -> Self {
        self.guid = guid;
        self
    }

    // --- Getters ---

    /// Stable local identifier
    pub fn guid(&self) -> LocalGuid {
        self.guid
    }

    /// Remote id of the parent folder, `None` for the sync root
    pub fn parent_id(&self) -> Option<&RemoteId> {
        self.parent_id.as_ref()
    }

    /// Remote object id
    pub fn remote_id(&self) -> &RemoteId {
        &self.remote_id
    }

    /// File or folder
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// Returns true for folders
    pub fn is_folder(&self) -> bool {
        self.object_type == ObjectType::Folder
    }

    /// Returns true for files
    pub fn is_file(&self) -> bool {
        self.object_type == ObjectType::File
    }

    /// Returns true for the mapping of the sync root
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Last known remote change token
    pub fn last_change_token(&self) -> Option<&ChangeToken> {
        self.last_change_token.as_ref()
    }

    /// Last known remote modification time
    pub fn last_remote_write_time(&self) -> Option<DateTime<Utc>> {
        self.last_remote_write_time
    }

    /// Last known local modification time
    pub fn last_local_write_time(&self) -> Option<DateTime<Utc>> {
        self.last_local_write_time
    }

    /// Last known content checksum (files only)
    pub fn last_checksum(&self) -> Option<&Checksum> {
        self.last_checksum.as_ref()
    }

    /// Last known content length as stored (`-1` when unknown)
    pub fn last_content_size(&self) -> i64 {
        self.last_content_size
    }

    /// Last known content length, `None` when unknown
    pub fn content_size(&self) -> Option<u64> {
        u64::try_from(self.last_content_size).ok()
    }

    /// Display name, equal to the last path component on both sides
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Optional remote description
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Whether the local entry is kept read-only
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    // --- Mutators ---

    /// Re-keys the mapping to a new remote id (private working copy check-in)
    pub fn set_remote_id(&mut self, remote_id: RemoteId) {
        self.remote_id = remote_id;
    }

    /// Moves the mapping below another parent
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ValidationFailed` if the root would gain a parent
    /// or an object would become its own parent
    pub fn set_parent_id(&mut self, parent_id: RemoteId) -> Result<(), DomainError> {
        if self.is_root() {
            return Err(DomainError::ValidationFailed(
                "The sync root cannot be moved".to_string(),
            ));
        }
        if parent_id == self.remote_id {
            return Err(DomainError::ValidationFailed(format!(
                "Mapped object {} cannot be its own parent",
                self.remote_id
            )));
        }
        self.parent_id = Some(parent_id);
        Ok(())
    }

    pub fn set_change_token(&mut self, token: Option<ChangeToken>) {
        self.last_change_token = token;
    }

    pub fn set_remote_write_time(&mut self, time: Option<DateTime<Utc>>) {
        self.last_remote_write_time = time;
    }

    pub fn set_local_write_time(&mut self, time: Option<DateTime<Utc>>) {
        self.last_local_write_time = time;
    }

    /// Stores the content checksum
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ValidationFailed` when setting a checksum on a folder
    pub fn set_checksum(&mut self, checksum: Option<Checksum>) -> Result<(), DomainError> {
        if checksum.is_some() && self.is_folder() {
            return Err(DomainError::ValidationFailed(format!(
                "Folder {} cannot carry a checksum",
                self.remote_id
            )));
        }
        self.last_checksum = checksum;
        Ok(())
    }

    /// Stores the content length; negative values mean "unknown"
    pub fn set_content_size(&mut self, size: i64) {
        self.last_content_size = if size < 0 { UNKNOWN_CONTENT_SIZE } else { size };
    }

    /// Renames the mapping
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ValidationFailed` if `name` is empty
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), DomainError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::ValidationFailed(
                "Mapped object name cannot be empty".to_string(),
            ));
        }
        self.name = name;
        Ok(())
    }

    pub fn set_description(&mut self, description: Option<String>) {
        self.description = description;
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }
}

impl fmt::Display for MappedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' (remote: {}, guid: {})",
            self.object_type, self.name, self.remote_id, self.guid
        )
    }
}
