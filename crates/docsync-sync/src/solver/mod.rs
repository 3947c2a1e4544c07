//! Situation solvers
//!
//! One solver per [`Situation`]. Solvers receive a [`SolveRequest`] with the
//! already-resolved state of one object and act on the repository, the
//! local filesystem and the metadata storage through the [`SyncContext`].
//!
//! Every solver leaves the stored mapping in a state that makes a repeated
//! detection of the same object yield [`Situation::NoChange`].
//!
//! ## Strategy selection
//!
//! [`SolverTable`] picks the strategy for situations that have more than one
//! implementation. Repositories with private working copies get check-out /
//! check-in uploads when both sides changed.

pub mod created;
pub mod local_changed;
pub mod moved;
pub mod pwc;
pub mod reconcile;
pub mod remote_changed;
pub mod removed;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use docsync_core::domain::{
    newtypes::{Checksum, RemoteId},
    ConflictKind, ContentChange, MappedObject, RemoteObject, Situation, SyncEvent,
};
use docsync_core::ports::{
    FsError, ILocalFileSystem, IMetaDataStorage, IRepository, ITransmissionStorage, LocalEntry,
    ObjectProperties, RepositoryCapabilities, RepositoryError, TransmissionRecord,
};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::queue::QueueHandle;
use crate::transmission::{ProgressReader, TransmissionManager, TransmissionType};
use crate::{SyncError, SyncResult};

// ============================================================================
// SyncContext
// ============================================================================

/// Ports and shared state a solver acts through
pub struct SyncContext {
    pub repository: Arc<dyn IRepository>,
    pub storage: Arc<dyn IMetaDataStorage>,
    pub transmission_storage: Arc<dyn ITransmissionStorage>,
    pub fs: Arc<dyn ILocalFileSystem>,
    pub transmissions: Arc<TransmissionManager>,
    pub queue: QueueHandle,
    /// Upload chunk size in bytes
    pub chunk_size: usize,
    capabilities: RepositoryCapabilities,
}

impl SyncContext {
    pub fn new(
        repository: Arc<dyn IRepository>,
        storage: Arc<dyn IMetaDataStorage>,
        transmission_storage: Arc<dyn ITransmissionStorage>,
        fs: Arc<dyn ILocalFileSystem>,
        transmissions: Arc<TransmissionManager>,
        queue: QueueHandle,
        chunk_size: usize,
    ) -> Self {
        let capabilities = repository.capabilities();
        Self {
            repository,
            storage,
            transmission_storage,
            fs,
            transmissions,
            queue,
            chunk_size: chunk_size.max(1),
            capabilities,
        }
    }

    pub fn capabilities(&self) -> RepositoryCapabilities {
        self.capabilities
    }

    pub(crate) async fn save(&self, object: &MappedObject) -> SyncResult<()> {
        self.storage.save_mapped_object(object).await?;
        Ok(())
    }

    /// Current modification time of a local entry
    pub(crate) async fn local_modified(&self, path: &Path) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.fs.entry(path).await?.and_then(|e| e.modified))
    }

    /// Local path of the mapping stored for `parent_id`
    pub(crate) async fn parent_local_path(&self, parent_id: &RemoteId) -> SyncResult<PathBuf> {
        let parent = self
            .storage
            .get_object_by_remote_id(parent_id)
            .await?
            .ok_or_else(|| SyncError::MissingMapping(parent_id.to_string()))?;
        self.storage
            .get_local_path(&parent)
            .await?
            .ok_or_else(|| SyncError::MissingMapping(parent_id.to_string()))
    }

    /// Mapping of the folder containing a local path
    pub(crate) async fn parent_mapping(&self, path: &Path) -> SyncResult<MappedObject> {
        let parent = path
            .parent()
            .ok_or_else(|| SyncError::MissingMapping(path.display().to_string()))?;
        let mapped = self
            .storage
            .get_object_by_local_path(parent)
            .await?
            .ok_or_else(|| SyncError::MissingMapping(parent.display().to_string()))?;
        if !mapped.is_folder() {
            return Err(SyncError::MissingMapping(parent.display().to_string()));
        }
        Ok(mapped)
    }

    /// Writes a GUID to a local entry; unsupported filesystems only warn
    pub(crate) async fn tag_local(&self, path: &Path, object: &MappedObject) -> SyncResult<()> {
        match self.fs.set_guid(path, object.guid()).await {
            Ok(()) => Ok(()),
            Err(FsError::AttributeUnsupported(_)) => {
                warn!(path = %path.display(), "Filesystem does not support GUID attributes");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Queues an interaction request for a conflict
    pub(crate) fn surface_conflict(&self, kind: ConflictKind, path: Option<&Path>) {
        warn!(conflict = ?kind, path = ?path, "Unresolved conflict");
        self.queue.add_event(SyncEvent::InteractionNeeded {
            title: "Synchronization conflict".to_string(),
            description: kind.description().to_string(),
            details: path.map(|p| p.display().to_string()),
        });
    }

    /// Streams a local file to the repository in chunks
    ///
    /// Resumes a previously interrupted upload of the same, unchanged file.
    /// Returns the new remote state and the checksum of the uploaded bytes.
    pub(crate) async fn upload(
        &self,
        remote_id: &RemoteId,
        local: &LocalEntry,
        kind: TransmissionType,
    ) -> SyncResult<(RemoteObject, Checksum)> {
        let transmission = self.transmissions.create(kind, &local.path);
        transmission.set_length(Some(local.size));

        let result = self.upload_chunks(remote_id, local, &transmission).await;
        match &result {
            Ok(_) => transmission.finish(),
            Err(e) => transmission.fail(e.to_string()),
        }
        result
    }

    async fn upload_chunks(
        &self,
        remote_id: &RemoteId,
        local: &LocalEntry,
        transmission: &crate::transmission::Transmission,
    ) -> SyncResult<(RemoteObject, Checksum)> {
        let mut stream = self.fs.open_read(&local.path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];

        let resume_from = match self.transmission_storage.get_transmission(remote_id).await? {
            Some(record)
                if record.local_path == local.path
                    && record.matches_local(local.size, local.modified) =>
            {
                record.position
            }
            _ => 0,
        };

        let mut position = 0u64;
        while position < resume_from {
            let want = (resume_from - position).min(buf.len() as u64) as usize;
            let read = read_full(&mut stream, &mut buf[..want], &local.path).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            position += read as u64;
        }
        if position > 0 {
            debug!(position, "Resuming upload");
            transmission.set_position(position);
        }

        let mut first = position == 0;
        let mut remote = None;
        loop {
            transmission.checkpoint().await?;
            let read = read_full(&mut stream, &mut buf, &local.path).await?;
            hasher.update(&buf[..read]);
            let is_last = read < buf.len() || position + read as u64 >= local.size;

            let updated = self
                .repository
                .append_content(remote_id, &buf[..read], first, is_last)
                .await?;
            position += read as u64;
            transmission.advance(read as u64);
            first = false;

            if is_last {
                remote = Some(updated);
                break;
            }
            self.transmission_storage
                .save_transmission(&TransmissionRecord {
                    remote_id: remote_id.clone(),
                    local_path: local.path.clone(),
                    position,
                    length: local.size,
                    local_modified: local.modified,
                    updated_at: Utc::now(),
                })
                .await?;
        }

        self.transmission_storage.remove_transmission(remote_id).await?;
        let checksum = Checksum::sha256(hasher.finalize().to_vec())?;
        let remote = match remote {
            Some(remote) => remote,
            None => self.repository.get_object(remote_id).await?,
        };
        Ok((remote, checksum))
    }

    /// Downloads a document into `target` atomically
    ///
    /// Returns the checksum and size of the written file. An aborted
    /// transfer leaves `target` untouched.
    pub(crate) async fn download(
        &self,
        remote: &RemoteObject,
        target: &Path,
        kind: TransmissionType,
    ) -> SyncResult<(Checksum, u64)> {
        let transmission = self.transmissions.create(kind, target);
        transmission.set_length(remote.content_length);
        transmission.set_cache_path(Some(crate::filesystem::staging_path(target)));

        let result = async {
            let stream = self.repository.get_content_stream(&remote.id).await?;
            let reader = ProgressReader::new(stream, transmission.clone());
            let written = match self.fs.write_atomic(target, Box::new(reader)).await {
                Ok(written) => written,
                Err(_) if transmission.is_aborted() => {
                    return Err(SyncError::TransmissionAborted(target.to_path_buf()))
                }
                Err(e) => return Err(e.into()),
            };
            let checksum = self.fs.checksum(target).await?;
            Ok((checksum, written))
        }
        .await;

        match &result {
            Ok(_) => transmission.finish(),
            Err(e) => transmission.fail(e.to_string()),
        }
        result
    }

    /// SHA-256 of a remote document's content, streamed without storing it
    pub(crate) async fn remote_checksum(&self, id: &RemoteId) -> SyncResult<Checksum> {
        let mut stream = self.repository.get_content_stream(id).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = stream.read(&mut buf).await.map_err(|e| {
                SyncError::Repository(RepositoryError::Other(anyhow::anyhow!(
                    "reading content of {id}: {e}"
                )))
            })?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Checksum::sha256(hasher.finalize().to_vec())?)
    }

    /// Brings both modification dates in line, favoring the newer one
    ///
    /// Returns the remote state after a possible server update.
    pub(crate) async fn sync_dates(
        &self,
        path: &Path,
        local_modified: Option<DateTime<Utc>>,
        remote: RemoteObject,
    ) -> SyncResult<RemoteObject> {
        match (local_modified, remote.last_modified) {
            (Some(local), Some(server)) if local > server && self.capabilities.can_modify_dates => {
                match self
                    .repository
                    .update_properties(&remote.id, &ObjectProperties::modified_at(local))
                    .await
                {
                    Ok(updated) => Ok(updated),
                    Err(RepositoryError::PermissionDenied(reason)) => {
                        debug!(reason = %reason, "Cannot update remote modification date");
                        Ok(remote)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            (local, Some(server)) if local != Some(server) => {
                self.fs.set_modified(path, server).await?;
                Ok(remote)
            }
            _ => Ok(remote),
        }
    }

    /// Mirrors the remote read-only flag onto a local file
    pub(crate) async fn sync_read_only(&self, path: &Path, remote: &RemoteObject) -> SyncResult<()> {
        if remote.is_folder() {
            return Ok(());
        }
        let current = self.fs.entry(path).await?.map(|e| e.read_only);
        if current.is_some_and(|ro| ro != remote.read_only) {
            self.fs.set_read_only(path, remote.read_only).await?;
        }
        Ok(())
    }

    /// Records the synchronized state of both sides in a mapping and saves it
    pub(crate) async fn commit(
        &self,
        mapped: &mut MappedObject,
        local_path: &Path,
        remote: &RemoteObject,
    ) -> SyncResult<()> {
        mapped.set_change_token(remote.change_token.clone());
        mapped.set_remote_write_time(remote.last_modified);
        mapped.set_local_write_time(self.local_modified(local_path).await?);
        mapped.set_description(remote.description.clone());
        mapped.set_read_only(remote.read_only);
        self.save(mapped).await
    }
}

async fn read_full(
    stream: &mut docsync_core::ports::ContentStream,
    buf: &mut [u8],
    path: &Path,
) -> SyncResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = stream
            .read(&mut buf[filled..])
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Treats permission and storage failures as "try again next cycle"
pub(crate) fn defer_recoverable<T>(result: SyncResult<T>, what: &str) -> SyncResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(SyncError::Repository(e)) if e.is_recoverable() => {
            warn!(error = %e, "{what} deferred to next sync");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// SolveRequest
// ============================================================================

/// Resolved state of one object, handed to a solver
#[derive(Debug, Clone, Default)]
pub struct SolveRequest {
    pub mapped: Option<MappedObject>,
    /// Current local entry
    pub local: Option<LocalEntry>,
    /// Current remote object
    pub remote: Option<RemoteObject>,
    /// Where the object lives locally (or should be created)
    pub local_path: Option<PathBuf>,
    /// Local path derived from the stored mapping
    pub stored_local_path: Option<PathBuf>,
    /// Local path the current remote location maps to
    pub remote_target_path: Option<PathBuf>,
    pub local_content: ContentChange,
    pub remote_content: ContentChange,
    /// Checksum of the local file, when it was computed during detection
    pub local_checksum: Option<Checksum>,
}

impl SolveRequest {
    pub(crate) fn require_mapping(&self) -> SyncResult<&MappedObject> {
        self.mapped
            .as_ref()
            .ok_or_else(|| SyncError::MissingMapping(self.describe()))
    }

    pub(crate) fn require_local(&self) -> SyncResult<&LocalEntry> {
        self.local
            .as_ref()
            .ok_or_else(|| SyncError::MissingMapping(self.describe()))
    }

    pub(crate) fn require_remote(&self) -> SyncResult<&RemoteObject> {
        self.remote
            .as_ref()
            .ok_or_else(|| SyncError::MissingMapping(self.describe()))
    }

    /// Best available local path
    pub fn path(&self) -> Option<&Path> {
        self.local
            .as_ref()
            .map(|l| l.path.as_path())
            .or(self.local_path.as_deref())
            .or(self.stored_local_path.as_deref())
    }

    fn describe(&self) -> String {
        match (self.path(), &self.remote, &self.mapped) {
            (Some(path), _, _) => path.display().to_string(),
            (None, Some(remote), _) => remote.id.to_string(),
            (None, None, Some(mapped)) => mapped.remote_id().to_string(),
            (None, None, None) => "<unknown>".to_string(),
        }
    }

    /// Local checksum, computing it if detection did not
    pub(crate) async fn local_checksum(&self, ctx: &SyncContext) -> SyncResult<Checksum> {
        if let Some(checksum) = &self.local_checksum {
            return Ok(checksum.clone());
        }
        let local = self.require_local()?;
        Ok(ctx.fs.checksum(&local.path).await?)
    }
}

// ============================================================================
// SolverTable
// ============================================================================

/// Implementations available for a local-only change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LocalChangedStrategy {
    #[default]
    Plain,
}

/// Implementations available when both sides changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BothChangedStrategy {
    #[default]
    Plain,
    /// Upload through a private working copy
    PrivateWorkingCopy,
}

/// Maps each situation to its solver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolverTable {
    pub local_changed: LocalChangedStrategy,
    pub both_changed: BothChangedStrategy,
}

impl SolverTable {
    /// Picks the strategies a repository supports
    pub fn for_capabilities(capabilities: RepositoryCapabilities) -> Self {
        Self {
            local_changed: LocalChangedStrategy::Plain,
            both_changed: if capabilities.private_working_copy {
                BothChangedStrategy::PrivateWorkingCopy
            } else {
                BothChangedStrategy::Plain
            },
        }
    }

    /// Runs the solver for `situation`
    pub async fn solve(
        &self,
        ctx: &SyncContext,
        situation: Situation,
        request: SolveRequest,
    ) -> SyncResult<()> {
        debug!(situation = %situation, path = ?request.path(), "Solving");
        match situation {
            Situation::NoChange => Ok(()),
            Situation::LocalOnlyCreated => created::local_created(ctx, request).await,
            Situation::RemoteOnlyCreated => created::remote_created(ctx, request).await,
            Situation::BothCreated => created::both_created(ctx, request).await,
            Situation::LocalOnlyChanged => match self.local_changed {
                LocalChangedStrategy::Plain => local_changed::solve(ctx, request).await,
            },
            Situation::RemoteOnlyChanged => remote_changed::solve(ctx, request).await,
            Situation::BothChanged(reconciliation) => match self.both_changed {
                BothChangedStrategy::Plain => {
                    reconcile::solve(ctx, request, reconciliation).await
                }
                BothChangedStrategy::PrivateWorkingCopy => {
                    pwc::solve(ctx, request, reconciliation).await
                }
            },
            Situation::LocalOnlyRemoved => removed::local_removed(ctx, request).await,
            Situation::RemoteOnlyRemoved => removed::remote_removed(ctx, request).await,
            Situation::BothRemoved => removed::both_removed(ctx, request).await,
            Situation::Moved(side) => moved::solve(ctx, request, side).await,
            Situation::UnresolvedConflict(kind) => {
                ctx.surface_conflict(kind, request.path());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_follows_capabilities() {
        let plain = SolverTable::for_capabilities(RepositoryCapabilities::default());
        assert_eq!(plain.both_changed, BothChangedStrategy::Plain);

        let pwc = SolverTable::for_capabilities(RepositoryCapabilities {
            private_working_copy: true,
            ..Default::default()
        });
        assert_eq!(pwc.both_changed, BothChangedStrategy::PrivateWorkingCopy);
        assert_eq!(pwc.local_changed, LocalChangedStrategy::Plain);
    }
}
