//! Shared fakes for the sync integration tests
//!
//! - [`MemoryRepository`]: an in-memory repository with a change log
//! - [`InodeGuidFs`]: the real filesystem adapter with GUIDs kept per inode,
//!   so tests do not depend on extended attribute support of the temp dir
//! - [`Harness`]: a sync root over a temp dir, the in-memory SQLite store
//!   and a [`MemoryRepository`]

#![allow(dead_code)]

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use docsync_cache::{DatabasePool, SqliteIgnoredEntitiesStorage, SqliteMetaDataStorage};
use docsync_core::config::{IgnoreConfig, RootConfig};
use docsync_core::domain::{
    newtypes::{ChangeToken, Checksum, LocalGuid, RemoteId, RemotePath, SyncPath},
    ChangeType, MappedObject, ObjectType, PathMatcher, RemoteObject,
};
use docsync_core::ports::{
    ChangeLogEntry, ChangeLogPage, ContentStream, FsError, ILocalFileSystem, IMetaDataStorage,
    IRepository, LocalEntry, ObjectProperties, RepositoryCapabilities, RepositoryError,
};
use docsync_sync::filesystem::LocalFileSystemAdapter;
use docsync_sync::filter::IgnoredEntitiesCollection;
use docsync_sync::root::{SyncBackend, SyncRoot};

pub const REMOTE_ROOT: &str = "/docs";
pub const REMOTE_ROOT_ID: &str = "docs";

pub fn id(s: &str) -> RemoteId {
    RemoteId::new(s.to_string()).unwrap()
}

pub fn sha256(content: &[u8]) -> Checksum {
    Checksum::sha256(Sha256::digest(content).to_vec()).unwrap()
}

// ============================================================================
// MemoryRepository
// ============================================================================

#[derive(Debug, Clone)]
struct Stored {
    object: RemoteObject,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct RepoState {
    objects: HashMap<RemoteId, Stored>,
    next_id: u64,
    version: u64,
    log: Vec<(u64, ChangeLogEntry)>,
    log_seq: u64,
    log_floor: u64,
    uploads: usize,
    downloads: usize,
    offline: bool,
    failing_uploads: bool,
    /// Private working copy id -> (checked-out document, new content)
    working_copies: HashMap<RemoteId, (RemoteId, Vec<u8>)>,
    check_outs: usize,
    check_ins: usize,
    cancelled_check_outs: usize,
}

impl RepoState {
    fn bump(&mut self, id: &RemoteId, change_type: ChangeType) {
        self.version += 1;
        let token = ChangeToken::new(format!("v{}", self.version)).unwrap();
        if let Some(stored) = self.objects.get_mut(id) {
            stored.object.change_token = Some(token);
            stored.object.last_modified = Some(Utc::now());
        }
        self.record(id, change_type);
    }

    fn record(&mut self, id: &RemoteId, change_type: ChangeType) {
        self.log_seq += 1;
        self.log.push((
            self.log_seq,
            ChangeLogEntry {
                object_id: id.clone(),
                change_type,
            },
        ));
    }

    fn path_of(&self, id: &RemoteId) -> Option<RemotePath> {
        let stored = self.objects.get(id)?;
        match &stored.object.parent_id {
            None => Some(RemotePath::root()),
            Some(parent) => self.path_of(parent)?.join(&stored.object.name).ok(),
        }
    }

    fn snapshot(&self, id: &RemoteId, hashes: bool) -> Result<RemoteObject, RepositoryError> {
        let stored = self
            .objects
            .get(id)
            .ok_or_else(|| RepositoryError::ObjectNotFound(id.to_string()))?;
        let mut object = stored.object.clone();
        object.path = self.path_of(id);
        if object.is_document() {
            object.content_length = Some(stored.content.len() as u64);
            if hashes {
                object.content_hash = Some(sha256(&stored.content));
            }
        }
        Ok(object)
    }

    fn child_named(&self, parent: &RemoteId, name: &str) -> Option<RemoteId> {
        self.objects
            .values()
            .find(|s| s.object.parent_id.as_ref() == Some(parent) && s.object.name == name)
            .map(|s| s.object.id.clone())
    }

    fn children_of(&self, parent: &RemoteId) -> Vec<RemoteId> {
        self.objects
            .values()
            .filter(|s| s.object.parent_id.as_ref() == Some(parent))
            .map(|s| s.object.id.clone())
            .collect()
    }

    fn insert(
        &mut self,
        parent: &RemoteId,
        name: &str,
        object_type: ObjectType,
    ) -> Result<RemoteId, RepositoryError> {
        match self.objects.get(parent) {
            Some(p) if p.object.is_folder() => {}
            Some(_) => return Err(RepositoryError::Other(anyhow::anyhow!("{parent} is no folder"))),
            None => return Err(RepositoryError::ObjectNotFound(parent.to_string())),
        }
        if self.child_named(parent, name).is_some() {
            return Err(RepositoryError::Other(anyhow::anyhow!(
                "{name} already exists in {parent}"
            )));
        }
        self.next_id += 1;
        let new_id = id(&format!("obj-{}", self.next_id));
        let object = match object_type {
            ObjectType::Folder => RemoteObject::folder(new_id.clone(), Some(parent.clone()), name),
            ObjectType::File => RemoteObject::document(new_id.clone(), parent.clone(), name, 0),
        };
        self.objects.insert(
            new_id.clone(),
            Stored {
                object,
                content: Vec::new(),
            },
        );
        self.bump(&new_id, ChangeType::Created);
        Ok(new_id)
    }

    fn remove_tree(&mut self, id: &RemoteId) {
        for child in self.children_of(id) {
            self.remove_tree(&child);
        }
        self.objects.remove(id);
        self.record(id, ChangeType::Deleted);
    }
}

type TransferHook = Arc<dyn Fn() + Send + Sync>;

/// Repository fake; every mutation bumps a global version used as change token
///
/// Check-in re-keys the document, the way repositories that create a new
/// object per version do.
pub struct MemoryRepository {
    state: Mutex<RepoState>,
    capabilities: RepositoryCapabilities,
    hashes: bool,
    transfer_hook: Mutex<Option<TransferHook>>,
}

impl MemoryRepository {
    /// Repository with `/docs` and a change log
    pub fn new() -> Self {
        Self::with_capabilities(
            RepositoryCapabilities {
                change_log: true,
                private_working_copy: false,
                can_modify_dates: false,
            },
            true,
        )
    }

    pub fn with_capabilities(capabilities: RepositoryCapabilities, hashes: bool) -> Self {
        let mut state = RepoState::default();
        let root = id("repo-root");
        state.objects.insert(
            root.clone(),
            Stored {
                object: RemoteObject::folder(root.clone(), None, ""),
                content: Vec::new(),
            },
        );
        let docs = id(REMOTE_ROOT_ID);
        state.objects.insert(
            docs.clone(),
            Stored {
                object: RemoteObject::folder(docs.clone(), Some(root), "docs"),
                content: Vec::new(),
            },
        );
        state.bump(&docs, ChangeType::Created);
        Self {
            state: Mutex::new(state),
            capabilities,
            hashes,
            transfer_hook: Mutex::new(None),
        }
    }

    /// Repository with check-out/check-in support
    pub fn with_private_working_copies() -> Self {
        Self::with_capabilities(
            RepositoryCapabilities {
                change_log: true,
                private_working_copy: true,
                can_modify_dates: false,
            },
            true,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RepoState> {
        self.state.lock().unwrap()
    }

    fn resolve(&self, state: &RepoState, path: &str) -> Option<RemoteId> {
        let mut current = id("repo-root");
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = state.child_named(&current, segment)?;
        }
        Some(current)
    }

    fn split(path: &str) -> (&str, &str) {
        let (parent, name) = path.rsplit_once('/').unwrap();
        (if parent.is_empty() { "/" } else { parent }, name)
    }

    /// Id of the object at an absolute repository path
    pub fn id_of(&self, path: &str) -> Option<RemoteId> {
        let state = self.lock();
        self.resolve(&state, path)
    }

    pub fn object(&self, path: &str) -> Option<RemoteObject> {
        let state = self.lock();
        let id = self.resolve(&state, path)?;
        state.snapshot(&id, self.hashes).ok()
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        let id = self.resolve(&state, path)?;
        state.objects.get(&id).map(|s| s.content.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.id_of(path).is_some()
    }

    /// Creates a folder as another repository user
    pub fn put_folder(&self, path: &str) -> RemoteId {
        let (parent, name) = Self::split(path);
        let mut state = self.lock();
        let parent = self.resolve(&state, parent).unwrap();
        state.insert(&parent, name, ObjectType::Folder).unwrap()
    }

    /// Creates or overwrites a document as another repository user
    pub fn put_document(&self, path: &str, content: &[u8]) -> RemoteId {
        let (parent, name) = Self::split(path);
        let mut state = self.lock();
        let id = match self.resolve(&state, path) {
            Some(id) => id,
            None => {
                let parent = self.resolve(&state, parent).unwrap();
                state.insert(&parent, name, ObjectType::File).unwrap()
            }
        };
        state.objects.get_mut(&id).unwrap().content = content.to_vec();
        state.bump(&id, ChangeType::Updated);
        id
    }

    /// Renames and moves an object as another repository user
    pub fn relocate(&self, from: &str, to: &str) {
        let (parent, name) = Self::split(to);
        let mut state = self.lock();
        let id = self.resolve(&state, from).unwrap();
        let parent = self.resolve(&state, parent).unwrap();
        let stored = state.objects.get_mut(&id).unwrap();
        stored.object.parent_id = Some(parent);
        stored.object.name = name.to_string();
        state.bump(&id, ChangeType::Updated);
    }

    /// Deletes an object and everything below it as another repository user
    pub fn remove(&self, path: &str) {
        let mut state = self.lock();
        let id = self.resolve(&state, path).unwrap();
        state.remove_tree(&id);
    }

    /// Forgets the change log so older tokens become stale
    pub fn truncate_change_log(&self) {
        let mut state = self.lock();
        state.log.clear();
        state.log_floor = state.log_seq + 1;
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Makes every content upload fail with a storage error
    pub fn set_failing_uploads(&self, failing: bool) {
        self.lock().failing_uploads = failing;
    }

    /// Changes a description as another repository user; content stays
    pub fn describe(&self, path: &str, description: &str) {
        let mut state = self.lock();
        let id = self.resolve(&state, path).unwrap();
        state.objects.get_mut(&id).unwrap().object.description = Some(description.to_string());
        state.bump(&id, ChangeType::Updated);
    }

    pub fn set_read_only(&self, path: &str, read_only: bool) {
        let mut state = self.lock();
        let id = self.resolve(&state, path).unwrap();
        state.objects.get_mut(&id).unwrap().object.read_only = read_only;
        state.bump(&id, ChangeType::Updated);
    }

    /// Runs `hook` after every uploaded chunk and every opened content stream
    pub fn on_transfer(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.transfer_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn clear_transfer_hook(&self) {
        *self.transfer_hook.lock().unwrap() = None;
    }

    fn fire_transfer_hook(&self) {
        let hook = self.transfer_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn check_outs(&self) -> usize {
        self.lock().check_outs
    }

    pub fn check_ins(&self) -> usize {
        self.lock().check_ins
    }

    pub fn cancelled_check_outs(&self) -> usize {
        self.lock().cancelled_check_outs
    }

    pub fn open_working_copies(&self) -> usize {
        self.lock().working_copies.len()
    }

    /// Completed uploads (last chunk written)
    pub fn uploads(&self) -> usize {
        self.lock().uploads
    }

    /// Opened content streams
    pub fn downloads(&self) -> usize {
        self.lock().downloads
    }

    fn online(&self) -> Result<std::sync::MutexGuard<'_, RepoState>, RepositoryError> {
        let state = self.lock();
        if state.offline {
            return Err(RepositoryError::Connection("repository offline".into()));
        }
        Ok(state)
    }
}

#[async_trait::async_trait]
impl IRepository for MemoryRepository {
    fn capabilities(&self) -> RepositoryCapabilities {
        self.capabilities
    }

    async fn get_object(&self, id: &RemoteId) -> Result<RemoteObject, RepositoryError> {
        self.online()?.snapshot(id, self.hashes)
    }

    async fn get_object_by_path(&self, path: &RemotePath) -> Result<RemoteObject, RepositoryError> {
        let state = self.online()?;
        let id = self
            .resolve(&state, path.as_str())
            .ok_or_else(|| RepositoryError::ObjectNotFound(path.to_string()))?;
        state.snapshot(&id, self.hashes)
    }

    async fn get_children(&self, folder_id: &RemoteId) -> Result<Vec<RemoteObject>, RepositoryError> {
        let state = self.online()?;
        state
            .children_of(folder_id)
            .iter()
            .map(|id| state.snapshot(id, self.hashes))
            .collect()
    }

    async fn get_descendants(
        &self,
        folder_id: &RemoteId,
    ) -> Result<Vec<RemoteObject>, RepositoryError> {
        let state = self.online()?;
        let mut result = Vec::new();
        let mut stack = state.children_of(folder_id);
        while let Some(id) = stack.pop() {
            stack.extend(state.children_of(&id));
            result.push(state.snapshot(&id, self.hashes)?);
        }
        Ok(result)
    }

    async fn latest_change_log_token(&self) -> Result<Option<ChangeToken>, RepositoryError> {
        if !self.capabilities.change_log {
            return Err(RepositoryError::ChangeLogUnavailable("disabled".into()));
        }
        let state = self.online()?;
        Ok(Some(ChangeToken::new(format!("c{}", state.log_seq)).unwrap()))
    }

    async fn get_content_changes(
        &self,
        since: &ChangeToken,
        max_items: usize,
    ) -> Result<ChangeLogPage, RepositoryError> {
        if !self.capabilities.change_log {
            return Err(RepositoryError::ChangeLogUnavailable("disabled".into()));
        }
        let state = self.online()?;
        let seq: u64 = since
            .as_str()
            .trim_start_matches('c')
            .parse()
            .map_err(|_| RepositoryError::StaleChangeToken(since.to_string()))?;
        if seq < state.log_floor {
            return Err(RepositoryError::StaleChangeToken(since.to_string()));
        }
        let pending: Vec<_> = state.log.iter().filter(|(s, _)| *s > seq).collect();
        let page: Vec<_> = pending.iter().take(max_items).collect();
        let last = page.last().map_or(seq, |(s, _)| *s);
        Ok(ChangeLogPage {
            entries: page.iter().map(|(_, e)| e.clone()).collect(),
            next_token: Some(ChangeToken::new(format!("c{last}")).unwrap()),
            has_more: pending.len() > page.len(),
        })
    }

    async fn create_folder(
        &self,
        parent_id: &RemoteId,
        name: &str,
    ) -> Result<RemoteObject, RepositoryError> {
        let mut state = self.online()?;
        let id = state.insert(parent_id, name, ObjectType::Folder)?;
        state.snapshot(&id, self.hashes)
    }

    async fn create_document(
        &self,
        parent_id: &RemoteId,
        name: &str,
    ) -> Result<RemoteObject, RepositoryError> {
        let mut state = self.online()?;
        let id = state.insert(parent_id, name, ObjectType::File)?;
        state.snapshot(&id, self.hashes)
    }

    async fn append_content(
        &self,
        id: &RemoteId,
        chunk: &[u8],
        overwrite: bool,
        is_last: bool,
    ) -> Result<RemoteObject, RepositoryError> {
        let result = {
            let mut state = self.online()?;
            if state.failing_uploads {
                return Err(RepositoryError::Storage("quota exceeded".into()));
            }
            if let Some((document, content)) = state.working_copies.get_mut(id) {
                if overwrite {
                    content.clear();
                }
                content.extend_from_slice(chunk);
                let document = document.clone();
                let mut object = state.snapshot(&document, self.hashes)?;
                object.id = id.clone();
                Ok(object)
            } else {
                let stored = state
                    .objects
                    .get_mut(id)
                    .ok_or_else(|| RepositoryError::ObjectNotFound(id.to_string()))?;
                if overwrite {
                    stored.content.clear();
                }
                stored.content.extend_from_slice(chunk);
                if is_last {
                    state.uploads += 1;
                    state.bump(id, ChangeType::Updated);
                }
                state.snapshot(id, self.hashes)
            }
        };
        self.fire_transfer_hook();
        result
    }

    async fn get_content_stream(&self, id: &RemoteId) -> Result<ContentStream, RepositoryError> {
        let content = {
            let mut state = self.online()?;
            let content = state
                .objects
                .get(id)
                .ok_or_else(|| RepositoryError::ObjectNotFound(id.to_string()))?
                .content
                .clone();
            state.downloads += 1;
            content
        };
        self.fire_transfer_hook();
        Ok(Box::new(std::io::Cursor::new(content)))
    }

    async fn update_properties(
        &self,
        id: &RemoteId,
        properties: &ObjectProperties,
    ) -> Result<RemoteObject, RepositoryError> {
        let mut state = self.online()?;
        if let Some(name) = &properties.name {
            let parent = state
                .objects
                .get(id)
                .and_then(|s| s.object.parent_id.clone())
                .ok_or_else(|| RepositoryError::ObjectNotFound(id.to_string()))?;
            if state.child_named(&parent, name).is_some_and(|other| &other != id) {
                return Err(RepositoryError::Other(anyhow::anyhow!("{name} already exists")));
            }
        }
        let stored = state
            .objects
            .get_mut(id)
            .ok_or_else(|| RepositoryError::ObjectNotFound(id.to_string()))?;
        if let Some(name) = &properties.name {
            stored.object.name = name.clone();
        }
        if let Some(description) = &properties.description {
            stored.object.description = Some(description.clone());
        }
        let modified = properties.last_modified;
        state.bump(id, ChangeType::Updated);
        if let (Some(modified), Some(stored)) = (modified, state.objects.get_mut(id)) {
            stored.object.last_modified = Some(modified);
        }
        state.snapshot(id, self.hashes)
    }

    async fn move_object(
        &self,
        id: &RemoteId,
        source_parent: &RemoteId,
        target_parent: &RemoteId,
    ) -> Result<RemoteObject, RepositoryError> {
        let mut state = self.online()?;
        if !state.objects.get(target_parent).is_some_and(|p| p.object.is_folder()) {
            return Err(RepositoryError::ObjectNotFound(target_parent.to_string()));
        }
        let stored = state
            .objects
            .get_mut(id)
            .ok_or_else(|| RepositoryError::ObjectNotFound(id.to_string()))?;
        if stored.object.parent_id.as_ref() != Some(source_parent) {
            return Err(RepositoryError::Other(anyhow::anyhow!(
                "{id} is not in {source_parent}"
            )));
        }
        stored.object.parent_id = Some(target_parent.clone());
        state.bump(id, ChangeType::Updated);
        state.snapshot(id, self.hashes)
    }

    async fn delete_object(&self, id: &RemoteId) -> Result<(), RepositoryError> {
        let mut state = self.online()?;
        if !state.objects.contains_key(id) {
            return Err(RepositoryError::ObjectNotFound(id.to_string()));
        }
        if !state.children_of(id).is_empty() {
            return Err(RepositoryError::Other(anyhow::anyhow!("{id} is not empty")));
        }
        state.remove_tree(id);
        Ok(())
    }

    async fn delete_tree(&self, folder_id: &RemoteId) -> Result<(), RepositoryError> {
        let mut state = self.online()?;
        if !state.objects.contains_key(folder_id) {
            return Err(RepositoryError::ObjectNotFound(folder_id.to_string()));
        }
        state.remove_tree(folder_id);
        Ok(())
    }

    async fn check_out(&self, id: &RemoteId) -> Result<RemoteId, RepositoryError> {
        let mut state = self.online()?;
        let content = match state.objects.get(id) {
            Some(stored) if stored.object.is_document() => stored.content.clone(),
            Some(_) => return Err(RepositoryError::Other(anyhow::anyhow!("{id} is no document"))),
            None => return Err(RepositoryError::ObjectNotFound(id.to_string())),
        };
        if state.working_copies.values().any(|(document, _)| document == id) {
            return Err(RepositoryError::Other(anyhow::anyhow!("{id} is checked out")));
        }
        state.next_id += 1;
        let pwc = self::id(&format!("pwc-{}", state.next_id));
        state.working_copies.insert(pwc.clone(), (id.clone(), content));
        state.check_outs += 1;
        Ok(pwc)
    }

    async fn check_in(&self, pwc_id: &RemoteId) -> Result<RemoteObject, RepositoryError> {
        let mut state = self.online()?;
        let (document, content) = state
            .working_copies
            .remove(pwc_id)
            .ok_or_else(|| RepositoryError::ObjectNotFound(pwc_id.to_string()))?;
        let mut stored = state
            .objects
            .remove(&document)
            .ok_or_else(|| RepositoryError::ObjectNotFound(document.to_string()))?;
        state.next_id += 1;
        let version = self::id(&format!("obj-{}", state.next_id));
        stored.object.id = version.clone();
        stored.content = content;
        state.objects.insert(version.clone(), stored);
        state.record(&document, ChangeType::Deleted);
        state.bump(&version, ChangeType::Created);
        state.check_ins += 1;
        state.snapshot(&version, self.hashes)
    }

    async fn cancel_check_out(&self, pwc_id: &RemoteId) -> Result<(), RepositoryError> {
        let mut state = self.online()?;
        state
            .working_copies
            .remove(pwc_id)
            .ok_or_else(|| RepositoryError::ObjectNotFound(pwc_id.to_string()))?;
        state.cancelled_check_outs += 1;
        Ok(())
    }
}

// ============================================================================
// InodeGuidFs
// ============================================================================

/// Real filesystem access, GUIDs kept in memory per inode
///
/// An inode survives renames, so GUIDs move along with their entry just
/// like the extended attribute does.
#[derive(Default)]
pub struct InodeGuidFs {
    inner: LocalFileSystemAdapter,
    guids: Mutex<HashMap<u64, LocalGuid>>,
    too_long: Mutex<Option<PathBuf>>,
}

impl InodeGuidFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listing `dir` fails as if the path exceeded the OS limit
    pub fn reject_as_too_long(&self, dir: impl Into<PathBuf>) {
        *self.too_long.lock().unwrap() = Some(dir.into());
    }

    fn inode(path: &Path) -> Result<u64, FsError> {
        std::fs::symlink_metadata(path)
            .map(|m| m.ino())
            .map_err(|e| FsError::from_io(path, e))
    }
}

#[async_trait::async_trait]
impl ILocalFileSystem for InodeGuidFs {
    async fn entry(&self, path: &Path) -> Result<Option<LocalEntry>, FsError> {
        self.inner.entry(path).await
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<LocalEntry>, FsError> {
        if self.too_long.lock().unwrap().as_deref() == Some(path) {
            return Err(FsError::PathTooLong(path.to_path_buf()));
        }
        self.inner.read_dir(path).await
    }

    async fn open_read(&self, path: &Path) -> Result<ContentStream, FsError> {
        self.inner.open_read(path).await
    }

    async fn write_atomic(&self, path: &Path, content: ContentStream) -> Result<u64, FsError> {
        self.inner.write_atomic(path, content).await
    }

    async fn create_directory(&self, path: &Path) -> Result<(), FsError> {
        self.inner.create_directory(path).await
    }

    async fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        self.inner.remove_file(path).await
    }

    async fn remove_directory(&self, path: &Path, recursive: bool) -> Result<(), FsError> {
        self.inner.remove_directory(path, recursive).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        self.inner.rename(from, to).await
    }

    async fn set_modified(&self, path: &Path, time: DateTime<Utc>) -> Result<(), FsError> {
        self.inner.set_modified(path, time).await
    }

    async fn set_read_only(&self, path: &Path, read_only: bool) -> Result<(), FsError> {
        self.inner.set_read_only(path, read_only).await
    }

    async fn get_guid(&self, path: &Path) -> Result<Option<LocalGuid>, FsError> {
        let inode = Self::inode(path)?;
        Ok(self.guids.lock().unwrap().get(&inode).copied())
    }

    async fn set_guid(&self, path: &Path, guid: LocalGuid) -> Result<(), FsError> {
        let inode = Self::inode(path)?;
        self.guids.lock().unwrap().insert(inode, guid);
        Ok(())
    }

    async fn checksum(&self, path: &Path) -> Result<Checksum, FsError> {
        self.inner.checksum(path).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn matcher(local_root: &Path) -> PathMatcher {
    PathMatcher::new(
        SyncPath::new(local_root.to_path_buf()).unwrap(),
        RemotePath::new(REMOTE_ROOT.to_string()).unwrap(),
    )
}

pub fn root_config(local_root: &Path) -> RootConfig {
    RootConfig {
        name: "test".to_string(),
        local_path: local_root.to_path_buf(),
        remote_path: REMOTE_ROOT.to_string(),
        chunk_size_bytes: 4,
        ..RootConfig::default()
    }
}

/// A sync root over a temp dir, driven one queue drain at a time
pub struct Harness {
    _dir: TempDir,
    pub root: PathBuf,
    pub repo: Arc<MemoryRepository>,
    pub storage: Arc<SqliteMetaDataStorage>,
    pub fs: Arc<InodeGuidFs>,
    pub ignored: Arc<IgnoredEntitiesCollection>,
    pub sync: SyncRoot,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_repository(MemoryRepository::new()).await
    }

    pub async fn with_repository(repo: MemoryRepository) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("Docs");
        let pool = DatabasePool::in_memory().await.unwrap();
        let storage = Arc::new(SqliteMetaDataStorage::new(pool.pool().clone(), matcher(&root)));
        let ignored_storage = Arc::new(SqliteIgnoredEntitiesStorage::new(pool.pool().clone()));
        let ignored = Arc::new(IgnoredEntitiesCollection::load(ignored_storage).await.unwrap());
        let repo = Arc::new(repo);
        let fs = Arc::new(InodeGuidFs::new());

        let backend = SyncBackend {
            repository: repo.clone(),
            storage: storage.clone(),
            transmission_storage: storage.clone(),
            ignored: ignored.clone(),
            fs: fs.clone(),
        };
        let sync = SyncRoot::new(root_config(&root), &IgnoreConfig::default(), backend).unwrap();
        Self {
            _dir: dir,
            root,
            repo,
            storage,
            fs,
            ignored,
            sync,
        }
    }

    /// Full crawl, then every event it produced
    pub async fn crawl(&mut self) -> usize {
        self.sync.sync_once().await.unwrap()
    }

    /// Queues `event` and processes the queue until it is empty
    pub async fn deliver(&mut self, event: docsync_core::domain::SyncEvent) -> usize {
        self.sync.queue().add_event(event);
        self.sync.run_until_idle().await.unwrap()
    }

    /// Incremental sync request
    pub async fn poll(&mut self) -> usize {
        self.deliver(docsync_core::domain::SyncEvent::StartNextSync(
            docsync_core::domain::StartNextSync::incremental(),
        ))
        .await
    }

    pub fn local(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn write(&self, relative: &str, content: &[u8]) {
        let path = self.local(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, relative: &str) -> Option<Vec<u8>> {
        std::fs::read(self.local(relative)).ok()
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.local(relative).exists()
    }

    /// Stored mapping of a local entry
    pub async fn mapping(&self, relative: &str) -> Option<MappedObject> {
        self.storage
            .get_object_by_local_path(&self.local(relative))
            .await
            .unwrap()
    }

    pub fn remote_path(relative: &str) -> String {
        format!("{REMOTE_ROOT}/{relative}")
    }
}
