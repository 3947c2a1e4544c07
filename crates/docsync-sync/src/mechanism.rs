//! Sync mechanism - from events to solved situations
//!
//! The [`SyncMechanism`] is the last handler in the chain. For every
//! local filesystem event and every [`FileOrFolderEvent`] it
//!
//! 1. finds the stored mapping (remote id, GUID attribute, stored path),
//! 2. reads the current local entry and remote object,
//! 3. derives content change hints, hashing a local file only when its
//!    modification date or size moved away from the stored state,
//! 4. classifies the result with [`detect`] and
//! 5. runs the solver the [`SolverTable`] picks for the situation.
//!
//! After a move was replayed the object is detected once more, so content
//! changes that arrived together with the move are handled in the same
//! dispatch.

use std::path::{Path, PathBuf};

use docsync_core::domain::{
    newtypes::{Checksum, RemoteId},
    ContentChange, FileOrFolderEvent, FsChangeKind, MappedObject,
    PathMatcher, RemoteHandle, RemoteObject, Situation, StartNextSync, SyncEvent,
};
use docsync_core::ports::{LocalEntry, RepositoryError};
use tracing::{debug, info, instrument};

use crate::detection::{detect, ContentEvidence, Observation};
use crate::queue::{priority, SyncEventHandler};
use crate::solver::{SolveRequest, SolverTable, SyncContext};
use crate::{SyncError, SyncResult};

/// Passes per event: the situation and, after a move, one more
const MAX_PASSES: usize = 2;

#[derive(Debug, Clone)]
enum RemoteState {
    /// Read the object from the repository
    Fetch,
    Known(RemoteObject),
    Deleted,
}

/// What an event says about one object
#[derive(Debug, Clone)]
struct Subject {
    remote_id: Option<RemoteId>,
    local_path: Option<PathBuf>,
    old_local_path: Option<PathBuf>,
    remote: RemoteState,
    local_content: ContentChange,
    remote_content: ContentChange,
}

impl Subject {
    fn from_event(event: &SyncEvent) -> Option<Self> {
        match event {
            SyncEvent::Fs(fs) => Some(Self {
                remote_id: None,
                local_path: Some(fs.path.clone()),
                old_local_path: None,
                remote: RemoteState::Fetch,
                local_content: match (fs.kind, fs.is_directory) {
                    (FsChangeKind::Created, false) => ContentChange::Created,
                    (FsChangeKind::Changed, false) => ContentChange::Changed,
                    _ => ContentChange::None,
                },
                remote_content: ContentChange::None,
            }),
            SyncEvent::FsMoved(moved) => Some(Self {
                remote_id: None,
                local_path: Some(moved.new_path.clone()),
                old_local_path: Some(moved.old_path.clone()),
                remote: RemoteState::Fetch,
                local_content: ContentChange::None,
                remote_content: ContentChange::None,
            }),
            SyncEvent::FileOrFolder(event) => Some(Self::from_file_or_folder(event)),
            _ => None,
        }
    }

    fn from_file_or_folder(event: &FileOrFolderEvent) -> Self {
        Self {
            remote_id: event.remote_id().cloned(),
            local_path: event.local_path().map(Path::to_path_buf),
            old_local_path: event.old_local_path.clone(),
            remote: match event.remote_handle() {
                Some(RemoteHandle::Object(object)) => RemoteState::Known(object.clone()),
                Some(RemoteHandle::Deleted { .. }) => RemoteState::Deleted,
                None => RemoteState::Fetch,
            },
            local_content: event.local_content,
            remote_content: event.remote_content,
        }
    }

    /// Same object after a move, keyed by its mapping
    ///
    /// Both local paths are dropped: the mapping already points at the new
    /// location, and the old path no longer holds the entry.
    fn refreshed(&self, remote_id: Option<RemoteId>) -> Self {
        let mut next = self.clone();
        if matches!(next.remote, RemoteState::Known(_)) {
            next.remote = RemoteState::Fetch;
        }
        if let Some(id) = remote_id {
            next.remote_id = Some(id);
            next.local_path = None;
        }
        next.old_local_path = None;
        next
    }
}

/// Resolves events into situations and solves them
pub struct SyncMechanism {
    ctx: SyncContext,
    table: SolverTable,
    matcher: PathMatcher,
}

impl SyncMechanism {
    pub fn new(ctx: SyncContext, matcher: PathMatcher) -> Self {
        let table = SolverTable::for_capabilities(ctx.capabilities());
        info!(table = ?table, "Solver strategies selected");
        Self {
            ctx,
            table,
            matcher,
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    async fn synchronize(&self, subject: Subject) -> SyncResult<()> {
        let mut subject = subject;
        for _ in 0..MAX_PASSES {
            let Some((situation, request)) = self.resolve(&subject).await? else {
                return Ok(());
            };
            if situation == Situation::NoChange {
                debug!(path = ?request.path(), "Nothing to do");
                return Ok(());
            }
            let moved = matches!(situation, Situation::Moved(_));
            let mapped_id = request.mapped.as_ref().map(|m| m.remote_id().clone());
            self.table.solve(&self.ctx, situation, request).await?;
            if !moved {
                return Ok(());
            }
            subject = subject.refreshed(mapped_id);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(path = ?subject.local_path, id = ?subject.remote_id))]
    async fn resolve(&self, subject: &Subject) -> SyncResult<Option<(Situation, SolveRequest)>> {
        if subject
            .local_path
            .as_deref()
            .is_some_and(|p| self.matcher.is_local_root(p))
        {
            return Ok(None);
        }

        let storage = &self.ctx.storage;
        let mut mapped = None;
        if let Some(id) = &subject.remote_id {
            mapped = storage.get_object_by_remote_id(id).await?;
        }
        if mapped.is_none() {
            if let Some(old) = &subject.old_local_path {
                mapped = storage.get_object_by_local_path(old).await?;
            }
        }
        if mapped.is_none() {
            if let Some(path) = &subject.local_path {
                mapped = self.mapping_for_local(path).await?;
            }
        }
        if mapped.as_ref().is_some_and(MappedObject::is_root) {
            return Ok(None);
        }

        let stored_local_path = match &mapped {
            Some(m) => storage.get_local_path(m).await?,
            None => None,
        };

        let remote = match &subject.remote {
            RemoteState::Known(object) => Some(object.clone()),
            RemoteState::Deleted => None,
            RemoteState::Fetch => match &mapped {
                Some(m) => self.fetch(m.remote_id()).await?,
                None => match &subject.local_path {
                    Some(path) => self.fetch_unmapped_by_path(path).await?,
                    None => None,
                },
            },
        };

        let remote_target_path = match &remote {
            Some(r) => self.remote_local_path(r).await?,
            None => None,
        };

        let local_path = match subject.local_path.clone().or_else(|| stored_local_path.clone()) {
            Some(path) => Some(path),
            None => match &remote {
                Some(r) if remote_target_path.is_none() && mapped.is_none() => {
                    return self.outside_or_missing(r);
                }
                _ => remote_target_path.clone(),
            },
        };

        let local = match &local_path {
            Some(path) => self.ctx.fs.entry(path).await?,
            None => None,
        };
        if local.as_ref().is_some_and(|l| l.is_symlink) {
            debug!("Skipping symbolic link");
            return Ok(None);
        }

        let (local_content, mut local_checksum) =
            self.local_content(mapped.as_ref(), local.as_ref()).await?;
        let remote_content =
            Self::remote_content(subject, mapped.as_ref(), remote.as_ref());

        let mut evidence = ContentEvidence::Unknown;
        if local_content.is_changed() && remote_content.is_changed() {
            if let (Some(hash), Some(l)) = (remote.as_ref().and_then(|r| r.content_hash.as_ref()), &local) {
                let checksum = match local_checksum.take() {
                    Some(c) => c,
                    None => self.ctx.fs.checksum(&l.path).await?,
                };
                evidence = if hash == &checksum {
                    ContentEvidence::Identical
                } else {
                    ContentEvidence::Different
                };
                local_checksum = Some(checksum);
            }
        }

        let situation = detect(&Observation {
            mapped: mapped.as_ref(),
            stored_local_path: stored_local_path.as_deref(),
            local: local.as_ref(),
            remote: remote.as_ref(),
            remote_target_path: remote_target_path.as_deref(),
            local_content,
            remote_content,
            evidence,
        });
        debug!(situation = %situation, "Detected");

        Ok(Some((
            situation,
            SolveRequest {
                mapped,
                local,
                remote,
                local_path,
                stored_local_path,
                remote_target_path,
                local_content,
                remote_content,
                local_checksum,
            },
        )))
    }

    /// Unmapped remote object whose parent is not mapped either
    fn outside_or_missing(
        &self,
        remote: &RemoteObject,
    ) -> SyncResult<Option<(Situation, SolveRequest)>> {
        match &remote.path {
            Some(path) if self.matcher.can_create_local_path(path) => {
                Err(SyncError::MissingMapping(path.to_string()))
            }
            _ => {
                debug!(id = %remote.id, "Object is outside of the sync root");
                Ok(None)
            }
        }
    }

    /// Mapping of a local entry, by GUID attribute first, then by path
    ///
    /// A GUID whose owner still exists at its stored path marks a copy and
    /// is not trusted.
    async fn mapping_for_local(&self, path: &Path) -> SyncResult<Option<MappedObject>> {
        let storage = &self.ctx.storage;
        let guid = match self.ctx.fs.get_guid(path).await {
            Ok(guid) => guid,
            Err(e) => {
                debug!(error = %e, "No GUID attribute");
                None
            }
        };
        if let Some(guid) = guid {
            if let Some(mapped) = storage.get_object_by_guid(&guid).await? {
                let stored = storage.get_local_path(&mapped).await?;
                let copied = match &stored {
                    Some(stored) if stored != path => {
                        matches!(self.ctx.fs.get_guid(stored).await, Ok(Some(g)) if g == guid)
                    }
                    _ => false,
                };
                if !copied {
                    return Ok(Some(mapped));
                }
            }
        }
        Ok(storage.get_object_by_local_path(path).await?)
    }

    async fn fetch(&self, id: &RemoteId) -> SyncResult<Option<RemoteObject>> {
        match self.ctx.repository.get_object(id).await {
            Ok(object) => Ok(Some(object)),
            Err(RepositoryError::ObjectNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remote object at the position of an unmapped local entry
    async fn fetch_unmapped_by_path(&self, path: &Path) -> SyncResult<Option<RemoteObject>> {
        let Ok(remote_path) = self.matcher.create_remote_path(path) else {
            return Ok(None);
        };
        let object = match self.ctx.repository.get_object_by_path(&remote_path).await {
            Ok(object) => object,
            Err(RepositoryError::ObjectNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if self
            .ctx
            .storage
            .get_object_by_remote_id(&object.id)
            .await?
            .is_some()
        {
            return Ok(None);
        }
        Ok(Some(object))
    }

    /// Local path the current remote location corresponds to
    async fn remote_local_path(&self, remote: &RemoteObject) -> SyncResult<Option<PathBuf>> {
        let Some(parent_id) = &remote.parent_id else {
            return Ok(None);
        };
        let Some(parent) = self.ctx.storage.get_object_by_remote_id(parent_id).await? else {
            return Ok(None);
        };
        Ok(self
            .ctx
            .storage
            .get_local_path(&parent)
            .await?
            .map(|p| p.join(&remote.name)))
    }

    async fn local_content(
        &self,
        mapped: Option<&MappedObject>,
        local: Option<&LocalEntry>,
    ) -> SyncResult<(ContentChange, Option<Checksum>)> {
        let Some(local) = local.filter(|l| !l.is_directory) else {
            return Ok((ContentChange::None, None));
        };
        let Some(mapped) = mapped.filter(|m| m.is_file()) else {
            return Ok((ContentChange::Created, None));
        };
        if mapped.content_size() != Some(local.size) {
            return Ok((ContentChange::Changed, None));
        }
        if local.modified == mapped.last_local_write_time() && mapped.last_checksum().is_some() {
            return Ok((ContentChange::None, None));
        }
        let checksum = self.ctx.fs.checksum(&local.path).await?;
        let change = if Some(&checksum) == mapped.last_checksum() {
            ContentChange::None
        } else {
            ContentChange::Changed
        };
        Ok((change, Some(checksum)))
    }

    fn remote_content(
        subject: &Subject,
        mapped: Option<&MappedObject>,
        remote: Option<&RemoteObject>,
    ) -> ContentChange {
        let Some(remote) = remote.filter(|r| r.is_document()) else {
            return ContentChange::None;
        };
        let Some(mapped) = mapped else {
            return if remote.has_content_stream {
                ContentChange::Created
            } else {
                ContentChange::None
            };
        };
        if remote.change_token.as_ref() == mapped.last_change_token() {
            return ContentChange::None;
        }
        match (&remote.content_hash, mapped.last_checksum()) {
            (Some(hash), Some(stored)) if hash.algorithm() == stored.algorithm() => {
                if hash == stored {
                    ContentChange::None
                } else {
                    ContentChange::Changed
                }
            }
            _ => {
                if subject.remote_content.is_changed()
                    || remote.content_length != mapped.content_size()
                    || remote.last_modified != mapped.last_remote_write_time()
                {
                    ContentChange::Changed
                } else {
                    ContentChange::None
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for SyncMechanism {
    fn priority(&self) -> i32 {
        priority::SYNC_MECHANISM
    }

    fn name(&self) -> &'static str {
        "sync_mechanism"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        let Some(subject) = Subject::from_event(event) else {
            return Ok(false);
        };
        match self.synchronize(subject).await {
            Ok(()) => Ok(true),
            Err(SyncError::MissingMapping(what)) => {
                info!(object = %what, "Parent not synchronized yet, requesting crawl");
                self.ctx
                    .queue
                    .add_event(SyncEvent::StartNextSync(StartNextSync::full()));
                Err(SyncError::MissingMapping(what))
            }
            Err(e) => Err(e),
        }
    }
}
