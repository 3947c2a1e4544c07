//! Metadata storage port (driven/secondary port)
//!
//! This module defines the interface for persisting the mapping between
//! local entries and remote objects of one sync root, the scalar change-log
//! token, and partial-transfer records.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific and
//!   don't need domain-level classification.
//! - One storage instance serves exactly one sync root; it owns that root's
//!   [`PathMatcher`] so that local paths can be derived from the chain of
//!   parent ids.
//! - Local paths are never stored. They are derived from the names along
//!   the parent chain, which keeps path resolution bijective by construction.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::domain::newtypes::{ChangeToken, LocalGuid, RemoteId, RemotePath};
use crate::domain::{MappedObject, PathMatcher};

// ============================================================================
// IMetaDataStorage trait
// ============================================================================

/// Port trait for the per-root mapped object store
#[async_trait::async_trait]
pub trait IMetaDataStorage: Send + Sync {
    /// The root's local/remote path pair
    fn matcher(&self) -> &PathMatcher;

    async fn get_object_by_remote_id(&self, id: &RemoteId)
        -> anyhow::Result<Option<MappedObject>>;

    async fn get_object_by_guid(&self, guid: &LocalGuid) -> anyhow::Result<Option<MappedObject>>;

    /// Resolves a local path by walking names down from the root mapping
    async fn get_object_by_local_path(&self, path: &Path)
        -> anyhow::Result<Option<MappedObject>>;

    /// Direct children of a mapped folder
    async fn get_children(&self, parent_id: &RemoteId) -> anyhow::Result<Vec<MappedObject>>;

    /// Inserts or updates a mapping
    async fn save_mapped_object(&self, object: &MappedObject) -> anyhow::Result<()>;

    /// Removes a mapping and all mappings below it
    async fn remove_object(&self, id: &RemoteId) -> anyhow::Result<()>;

    /// Changes the remote id of a mapping, re-parenting its children
    async fn rekey_object(&self, old_id: &RemoteId, new_id: &RemoteId) -> anyhow::Result<()>;

    /// Local path of a mapping, `None` if its parent chain is broken
    async fn get_local_path(&self, object: &MappedObject) -> anyhow::Result<Option<PathBuf>>;

    /// Remote path of a mapping, `None` if its parent chain is broken
    async fn get_remote_path(&self, object: &MappedObject) -> anyhow::Result<Option<RemotePath>>;

    /// Last committed change-log token
    async fn change_log_token(&self) -> anyhow::Result<Option<ChangeToken>>;

    async fn set_change_log_token(&self, token: Option<&ChangeToken>) -> anyhow::Result<()>;

    /// Every stored mapping (crawl diff and validation tooling)
    async fn all_mapped_objects(&self) -> anyhow::Result<Vec<MappedObject>>;

    /// Checks structural invariants, returning one message per violation
    async fn validate_object_structure(&self) -> anyhow::Result<Vec<String>>;
}

// ============================================================================
// Transmission records
// ============================================================================

/// Progress of an upload that may be resumed after a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmissionRecord {
    pub remote_id: RemoteId,
    pub local_path: PathBuf,
    /// Bytes already committed on the server
    pub position: u64,
    /// Local file length when the upload started
    pub length: u64,
    /// Local modification time when the upload started
    pub local_modified: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TransmissionRecord {
    /// Returns true if the local file still looks like it did when the upload started
    pub fn matches_local(&self, length: u64, modified: Option<DateTime<Utc>>) -> bool {
        self.length == length && self.local_modified == modified && self.position < length
    }
}

/// Port trait for partial-upload bookkeeping, keyed by remote id
#[async_trait::async_trait]
pub trait ITransmissionStorage: Send + Sync {
    async fn save_transmission(&self, record: &TransmissionRecord) -> anyhow::Result<()>;

    async fn get_transmission(&self, remote_id: &RemoteId)
        -> anyhow::Result<Option<TransmissionRecord>>;

    async fn remove_transmission(&self, remote_id: &RemoteId) -> anyhow::Result<()>;
}
