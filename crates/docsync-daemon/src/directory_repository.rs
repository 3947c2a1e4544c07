//! Repository adapter over a plain directory
//!
//! Lets `docsyncd` synchronize against a mounted share or a second local
//! tree without a network client. Object ids, change tokens and the change
//! log live in a JSON catalog at the repository root. Ids follow objects
//! that are renamed or moved through the adapter; entries created by other
//! programs are adopted with fresh ids the first time they are listed.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use docsync_core::domain::newtypes::{ChangeToken, RemoteId, RemotePath};
use docsync_core::domain::{ChangeType, RemoteObject};
use docsync_core::ports::{
    ChangeLogEntry, ChangeLogPage, ContentStream, IRepository, ObjectProperties,
    RepositoryCapabilities, RepositoryError,
};

/// Catalog file name at the repository root
pub const CATALOG_FILE: &str = ".docsync-catalog.json";

const ROOT_ID: &str = "root";

/// Change-log entries kept; tokens older than the oldest entry are stale
const MAX_LOG_ENTRIES: usize = 10_000;

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Stamp {
    modified: DateTime<Utc>,
    size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogEntry {
    /// `/`-separated path below the repository directory, empty for the root
    path: String,
    version: u64,
    /// File state when `version` was assigned; `None` for folders
    stamp: Option<Stamp>,
    description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    seq: u64,
    id: String,
    change: ChangeType,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    next_id: u64,
    next_version: u64,
    objects: HashMap<String, CatalogEntry>,
    log: Vec<LogRecord>,
    log_seq: u64,
    /// Highest sequence number dropped from the log
    log_floor: u64,
    #[serde(skip)]
    by_path: HashMap<String, String>,
    #[serde(skip)]
    dirty: bool,
}

impl Catalog {
    fn reindex(&mut self) {
        self.by_path = self
            .objects
            .iter()
            .map(|(id, entry)| (entry.path.clone(), id.clone()))
            .collect();
    }

    fn ensure_root(&mut self) {
        if !self.objects.contains_key(ROOT_ID) {
            self.next_version += 1;
            self.objects.insert(
                ROOT_ID.to_string(),
                CatalogEntry {
                    path: String::new(),
                    version: self.next_version,
                    stamp: None,
                    description: None,
                },
            );
            self.dirty = true;
        }
        self.reindex();
    }

    fn entry(&self, id: &str) -> Result<&CatalogEntry, RepositoryError> {
        self.objects
            .get(id)
            .ok_or_else(|| RepositoryError::ObjectNotFound(id.to_string()))
    }

    fn register(&mut self, path: String, stamp: Option<Stamp>) -> String {
        self.next_id += 1;
        self.next_version += 1;
        let id = format!("d{}", self.next_id);
        self.by_path.insert(path.clone(), id.clone());
        self.objects.insert(
            id.clone(),
            CatalogEntry {
                path,
                version: self.next_version,
                stamp,
                description: None,
            },
        );
        self.record(&id, ChangeType::Created);
        id
    }

    /// New version for a changed object
    fn touch(&mut self, id: &str, stamp: Option<Stamp>) {
        self.next_version += 1;
        if let Some(entry) = self.objects.get_mut(id) {
            entry.version = self.next_version;
            entry.stamp = stamp;
        }
        self.record(id, ChangeType::Updated);
    }

    /// Remembers the file state without announcing a change
    fn restamp(&mut self, id: &str, stamp: Option<Stamp>) {
        if let Some(entry) = self.objects.get_mut(id) {
            entry.stamp = stamp;
            self.dirty = true;
        }
    }

    fn record(&mut self, id: &str, change: ChangeType) {
        self.log_seq += 1;
        self.log.push(LogRecord {
            seq: self.log_seq,
            id: id.to_string(),
            change,
        });
        if self.log.len() > MAX_LOG_ENTRIES {
            let excess = self.log.len() - MAX_LOG_ENTRIES;
            if let Some(last) = self.log.drain(..excess).last() {
                self.log_floor = last.seq;
            }
        }
        self.dirty = true;
    }

    /// Removes `path` and everything below it; returns the removed ids
    fn forget_tree(&mut self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        let ids: Vec<String> = self
            .objects
            .iter()
            .filter(|(_, e)| e.path == path || e.path.starts_with(&prefix))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = self.objects.remove(id) {
                self.by_path.remove(&entry.path);
            }
            self.record(id, ChangeType::Deleted);
        }
        ids
    }

    /// Rewrites the paths of an entry and its descendants after a rename
    fn relocate(&mut self, from: &str, to: &str) {
        let prefix = format!("{from}/");
        for entry in self.objects.values_mut() {
            if entry.path == from {
                entry.path = to.to_string();
            } else if let Some(rest) = entry.path.strip_prefix(&prefix) {
                entry.path = format!("{to}/{rest}");
            }
        }
        self.reindex();
        self.dirty = true;
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map_or("", |(parent, _)| parent))
}

fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn check_name(name: &str) -> Result<(), RepositoryError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(RepositoryError::Other(anyhow::anyhow!("Invalid object name: {name:?}")));
    }
    Ok(())
}

fn io_error(path: &Path, e: io::Error) -> RepositoryError {
    let location = path.display().to_string();
    match (e.kind(), e.raw_os_error()) {
        (io::ErrorKind::NotFound, _) => RepositoryError::ObjectNotFound(location),
        (io::ErrorKind::PermissionDenied, _) => RepositoryError::PermissionDenied(location),
        (_, Some(code)) if code == libc::ENOSPC || code == libc::EDQUOT => {
            RepositoryError::Storage(format!("{location}: {e}"))
        }
        _ => RepositoryError::Other(anyhow::Error::new(e).context(location)),
    }
}

fn invalid<E>(e: E) -> RepositoryError
where
    E: std::error::Error + Send + Sync + 'static,
{
    RepositoryError::Other(anyhow::Error::new(e))
}

// ============================================================================
// DirectoryRepository
// ============================================================================

/// [`IRepository`] backed by a directory
pub struct DirectoryRepository {
    base: PathBuf,
    catalog: Mutex<Catalog>,
}

impl DirectoryRepository {
    /// Opens the repository at `base`, creating the catalog on first use
    pub async fn open(base: &Path) -> anyhow::Result<Self> {
        let meta = tokio::fs::metadata(base)
            .await
            .with_context(|| format!("Repository directory {} is not accessible", base.display()))?;
        anyhow::ensure!(meta.is_dir(), "{} is not a directory", base.display());

        let catalog_path = base.join(CATALOG_FILE);
        let mut catalog: Catalog = match tokio::fs::read(&catalog_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Corrupt catalog {}", catalog_path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Catalog::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", catalog_path.display()))
            }
        };
        catalog.ensure_root();

        let repository = Self {
            base: base.to_path_buf(),
            catalog: Mutex::new(Catalog::default()),
        };
        repository.persist(&mut catalog).await?;
        info!(
            path = %base.display(),
            objects = catalog.objects.len(),
            "Opened directory repository"
        );
        *repository.catalog.lock().await = catalog;
        Ok(repository)
    }

    fn local(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base.clone()
        } else {
            self.base.join(path)
        }
    }

    /// Writes the catalog if it changed, through a temp file and a rename
    async fn persist(&self, catalog: &mut Catalog) -> Result<(), RepositoryError> {
        if !catalog.dirty {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&*catalog).map_err(invalid)?;
        let target = self.base.join(CATALOG_FILE);
        let tmp = self.base.join(format!("{CATALOG_FILE}.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| io_error(&target, e))?;
        catalog.dirty = false;
        Ok(())
    }

    async fn stamp(&self, path: &str) -> Result<Option<Stamp>, RepositoryError> {
        let local = self.local(path);
        let meta = tokio::fs::symlink_metadata(&local)
            .await
            .map_err(|e| io_error(&local, e))?;
        if meta.is_dir() {
            return Ok(None);
        }
        let modified = meta.modified().map_err(|e| io_error(&local, e))?;
        Ok(Some(Stamp {
            modified: DateTime::<Utc>::from(modified),
            size: meta.len(),
        }))
    }

    /// Current view of an object
    ///
    /// Objects that vanished from disk are dropped from the catalog, files
    /// changed by other programs get a new version.
    async fn snapshot(&self, catalog: &mut Catalog, id: &str) -> Result<RemoteObject, RepositoryError> {
        let entry = catalog.entry(id)?.clone();
        let local = self.local(&entry.path);
        let meta = match tokio::fs::symlink_metadata(&local).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(id, path = %entry.path, "Object vanished from disk");
                catalog.forget_tree(&entry.path);
                return Err(RepositoryError::ObjectNotFound(id.to_string()));
            }
            Err(e) => return Err(io_error(&local, e)),
        };

        let mut version = entry.version;
        if !meta.is_dir() {
            let current = self.stamp(&entry.path).await?;
            if current != entry.stamp {
                debug!(id, path = %entry.path, "File changed outside the repository");
                catalog.touch(id, current);
                version = catalog.next_version;
            }
        }

        let object_id = RemoteId::new(id.to_string()).map_err(invalid)?;
        let parent_id = match parent_of(&entry.path) {
            Some(parent) => {
                let parent = catalog
                    .by_path
                    .get(parent)
                    .ok_or_else(|| RepositoryError::ObjectNotFound(parent.to_string()))?;
                Some(RemoteId::new(parent.clone()).map_err(invalid)?)
            }
            None => None,
        };
        let name = name_of(&entry.path);
        let mut object = if meta.is_dir() {
            RemoteObject::folder(object_id, parent_id, name)
        } else {
            let parent_id = parent_id.ok_or_else(|| RepositoryError::ObjectNotFound(id.to_string()))?;
            RemoteObject::document(object_id, parent_id, name, meta.len())
        };
        object.path = Some(RemotePath::new(format!("/{}", entry.path)).map_err(invalid)?);
        object.change_token = Some(ChangeToken::new(format!("v{version}")).map_err(invalid)?);
        object.last_modified = meta.modified().ok().map(DateTime::<Utc>::from);
        object.read_only = meta.permissions().readonly();
        object.description = entry.description;
        Ok(object)
    }

    async fn folder_path(&self, catalog: &mut Catalog, id: &str) -> Result<String, RepositoryError> {
        let object = self.snapshot(catalog, id).await?;
        if !object.is_folder() {
            return Err(RepositoryError::Other(anyhow::anyhow!("{id} is not a folder")));
        }
        Ok(catalog.entry(id)?.path.clone())
    }

    /// Ids of the entries in a folder, adopting unknown ones
    async fn list(&self, catalog: &mut Catalog, folder: &str) -> Result<Vec<String>, RepositoryError> {
        let dir = self.local(folder);
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        let mut ids = Vec::new();
        while let Some(item) = reader.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                debug!(path = %item.path().display(), "Skipping non UTF-8 name");
                continue;
            };
            if folder.is_empty() && name.starts_with(CATALOG_FILE) {
                continue;
            }
            let file_type = item.file_type().await.map_err(|e| io_error(&item.path(), e))?;
            if file_type.is_symlink() {
                continue;
            }
            let path = child_path(folder, &name);
            let id = match catalog.by_path.get(&path) {
                Some(id) => id.clone(),
                None => {
                    let stamp = self.stamp(&path).await?;
                    debug!(path = %path, "Adopting entry");
                    catalog.register(path, stamp)
                }
            };
            ids.push(id);
        }
        Ok(ids)
    }

    /// Resolves a path, adopting unknown entries along the way
    async fn resolve(&self, catalog: &mut Catalog, path: &str) -> Result<String, RepositoryError> {
        let mut current = String::new();
        let mut id = ROOT_ID.to_string();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = child_path(&current, segment);
            id = match catalog.by_path.get(&current) {
                Some(id) => id.clone(),
                None => {
                    let stamp = self.stamp(&current).await?;
                    catalog.register(current.clone(), stamp)
                }
            };
        }
        Ok(id)
    }

    async fn create(&self, parent_id: &RemoteId, name: &str, folder: bool) -> Result<RemoteObject, RepositoryError> {
        check_name(name)?;
        let mut catalog = self.catalog.lock().await;
        let parent = self.folder_path(&mut catalog, parent_id.as_str()).await?;
        let path = child_path(&parent, name);
        let local = self.local(&path);
        let created = if folder {
            tokio::fs::create_dir(&local).await
        } else {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&local)
                .await
                .map(drop)
        };
        if let Err(e) = created {
            if e.kind() == io::ErrorKind::AlreadyExists {
                return Err(RepositoryError::Other(anyhow::anyhow!("{path} already exists")));
            }
            return Err(io_error(&local, e));
        }

        let stamp = self.stamp(&path).await?;
        let id = catalog.register(path, stamp);
        let object = self.snapshot(&mut catalog, &id).await?;
        self.persist(&mut catalog).await?;
        Ok(object)
    }

    async fn finish(&self, catalog: &mut Catalog, id: &str) -> Result<RemoteObject, RepositoryError> {
        let object = self.snapshot(catalog, id).await;
        self.persist(catalog).await?;
        object
    }
}

#[async_trait::async_trait]
impl IRepository for DirectoryRepository {
    fn capabilities(&self) -> RepositoryCapabilities {
        RepositoryCapabilities {
            change_log: true,
            private_working_copy: false,
            can_modify_dates: true,
        }
    }

    async fn get_object(&self, id: &RemoteId) -> Result<RemoteObject, RepositoryError> {
        let mut catalog = self.catalog.lock().await;
        self.finish(&mut catalog, id.as_str()).await
    }

    async fn get_object_by_path(&self, path: &RemotePath) -> Result<RemoteObject, RepositoryError> {
        let mut catalog = self.catalog.lock().await;
        let id = self.resolve(&mut catalog, path.as_str()).await?;
        self.finish(&mut catalog, &id).await
    }

    async fn get_children(&self, folder_id: &RemoteId) -> Result<Vec<RemoteObject>, RepositoryError> {
        let mut catalog = self.catalog.lock().await;
        let folder = self.folder_path(&mut catalog, folder_id.as_str()).await?;
        let mut children = Vec::new();
        for id in self.list(&mut catalog, &folder).await? {
            match self.snapshot(&mut catalog, &id).await {
                Ok(object) => children.push(object),
                Err(RepositoryError::ObjectNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.persist(&mut catalog).await?;
        Ok(children)
    }

    #[instrument(skip(self), fields(folder = %folder_id))]
    async fn get_descendants(&self, folder_id: &RemoteId) -> Result<Vec<RemoteObject>, RepositoryError> {
        let mut catalog = self.catalog.lock().await;
        let root = self.folder_path(&mut catalog, folder_id.as_str()).await?;
        let mut descendants = Vec::new();
        let mut stack = vec![root];
        while let Some(folder) = stack.pop() {
            for id in self.list(&mut catalog, &folder).await? {
                let object = match self.snapshot(&mut catalog, &id).await {
                    Ok(object) => object,
                    Err(RepositoryError::ObjectNotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                if object.is_folder() {
                    stack.push(catalog.entry(&id)?.path.clone());
                }
                descendants.push(object);
            }
        }
        self.persist(&mut catalog).await?;
        debug!(count = descendants.len(), "Listed descendants");
        Ok(descendants)
    }

    async fn latest_change_log_token(&self) -> Result<Option<ChangeToken>, RepositoryError> {
        let catalog = self.catalog.lock().await;
        let token = ChangeToken::new(format!("c{}", catalog.log_seq)).map_err(invalid)?;
        Ok(Some(token))
    }

    async fn get_content_changes(
        &self,
        since: &ChangeToken,
        max_items: usize,
    ) -> Result<ChangeLogPage, RepositoryError> {
        let catalog = self.catalog.lock().await;
        let seq: u64 = since
            .as_str()
            .strip_prefix('c')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| RepositoryError::StaleChangeToken(since.to_string()))?;
        if seq < catalog.log_floor || seq > catalog.log_seq {
            return Err(RepositoryError::StaleChangeToken(since.to_string()));
        }

        let pending = catalog.log.iter().filter(|r| r.seq > seq);
        let mut entries = Vec::new();
        let mut last = seq;
        for record in pending.clone().take(max_items.max(1)) {
            entries.push(ChangeLogEntry {
                object_id: RemoteId::new(record.id.clone()).map_err(invalid)?,
                change_type: record.change,
            });
            last = record.seq;
        }
        Ok(ChangeLogPage {
            has_more: pending.count() > entries.len(),
            next_token: Some(ChangeToken::new(format!("c{last}")).map_err(invalid)?),
            entries,
        })
    }

    async fn create_folder(&self, parent_id: &RemoteId, name: &str) -> Result<RemoteObject, RepositoryError> {
        self.create(parent_id, name, true).await
    }

    async fn create_document(&self, parent_id: &RemoteId, name: &str) -> Result<RemoteObject, RepositoryError> {
        self.create(parent_id, name, false).await
    }

    async fn append_content(
        &self,
        id: &RemoteId,
        chunk: &[u8],
        overwrite: bool,
        is_last: bool,
    ) -> Result<RemoteObject, RepositoryError> {
        let mut catalog = self.catalog.lock().await;
        let path = catalog.entry(id.as_str())?.path.clone();
        let local = self.local(&path);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(overwrite)
            .append(!overwrite)
            .open(&local)
            .await
            .map_err(|e| io_error(&local, e))?;
        file.write_all(chunk).await.map_err(|e| io_error(&local, e))?;
        file.flush().await.map_err(|e| io_error(&local, e))?;
        drop(file);

        let stamp = self.stamp(&path).await?;
        if is_last {
            catalog.touch(id.as_str(), stamp);
        } else {
            catalog.restamp(id.as_str(), stamp);
        }
        self.finish(&mut catalog, id.as_str()).await
    }

    async fn get_content_stream(&self, id: &RemoteId) -> Result<ContentStream, RepositoryError> {
        let catalog = self.catalog.lock().await;
        let local = self.local(&catalog.entry(id.as_str())?.path);
        let file = tokio::fs::File::open(&local)
            .await
            .map_err(|e| io_error(&local, e))?;
        Ok(Box::new(file))
    }

    async fn update_properties(
        &self,
        id: &RemoteId,
        properties: &ObjectProperties,
    ) -> Result<RemoteObject, RepositoryError> {
        let mut catalog = self.catalog.lock().await;
        let mut path = catalog.entry(id.as_str())?.path.clone();
        let parent = parent_of(&path)
            .ok_or_else(|| RepositoryError::PermissionDenied("repository root".to_string()))?
            .to_string();

        if let Some(name) = properties.name.as_deref().filter(|n| *n != name_of(&path)) {
            check_name(name)?;
            let target = child_path(&parent, name);
            let to = self.local(&target);
            if tokio::fs::symlink_metadata(&to).await.is_ok() {
                return Err(RepositoryError::Other(anyhow::anyhow!("{target} already exists")));
            }
            let from = self.local(&path);
            tokio::fs::rename(&from, &to)
                .await
                .map_err(|e| io_error(&from, e))?;
            catalog.relocate(&path, &target);
            path = target;
        }
        if let Some(time) = properties.last_modified {
            let local = self.local(&path);
            filetime::set_file_mtime(&local, filetime::FileTime::from_system_time(time.into()))
                .map_err(|e| io_error(&local, e))?;
        }
        if let Some(entry) = catalog.objects.get_mut(id.as_str()) {
            if let Some(description) = &properties.description {
                entry.description = Some(description.clone());
            }
        }

        let stamp = self.stamp(&path).await?;
        catalog.touch(id.as_str(), stamp);
        self.finish(&mut catalog, id.as_str()).await
    }

    async fn move_object(
        &self,
        id: &RemoteId,
        source_parent: &RemoteId,
        target_parent: &RemoteId,
    ) -> Result<RemoteObject, RepositoryError> {
        let mut catalog = self.catalog.lock().await;
        let path = catalog.entry(id.as_str())?.path.clone();
        let current_parent = parent_of(&path)
            .and_then(|p| catalog.by_path.get(p))
            .cloned()
            .ok_or_else(|| RepositoryError::PermissionDenied("repository root".to_string()))?;
        if current_parent != source_parent.as_str() {
            return Err(RepositoryError::Other(anyhow::anyhow!(
                "{id} is not in {source_parent}"
            )));
        }

        let target = self.folder_path(&mut catalog, target_parent.as_str()).await?;
        let destination = child_path(&target, name_of(&path));
        let to = self.local(&destination);
        if tokio::fs::symlink_metadata(&to).await.is_ok() {
            return Err(RepositoryError::Other(anyhow::anyhow!("{destination} already exists")));
        }
        let from = self.local(&path);
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| io_error(&from, e))?;
        catalog.relocate(&path, &destination);

        let stamp = self.stamp(&destination).await?;
        catalog.touch(id.as_str(), stamp);
        self.finish(&mut catalog, id.as_str()).await
    }

    async fn delete_object(&self, id: &RemoteId) -> Result<(), RepositoryError> {
        let mut catalog = self.catalog.lock().await;
        let path = catalog.entry(id.as_str())?.path.clone();
        if path.is_empty() {
            return Err(RepositoryError::PermissionDenied("repository root".to_string()));
        }
        let local = self.local(&path);
        let meta = tokio::fs::symlink_metadata(&local)
            .await
            .map_err(|e| io_error(&local, e))?;
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir(&local).await
        } else {
            tokio::fs::remove_file(&local).await
        };
        removed.map_err(|e| io_error(&local, e))?;
        catalog.forget_tree(&path);
        self.persist(&mut catalog).await
    }

    async fn delete_tree(&self, folder_id: &RemoteId) -> Result<(), RepositoryError> {
        let mut catalog = self.catalog.lock().await;
        let path = self.folder_path(&mut catalog, folder_id.as_str()).await?;
        if path.is_empty() {
            return Err(RepositoryError::PermissionDenied("repository root".to_string()));
        }
        let local = self.local(&path);
        tokio::fs::remove_dir_all(&local)
            .await
            .map_err(|e| io_error(&local, e))?;
        let removed = catalog.forget_tree(&path);
        debug!(path = %path, objects = removed.len(), "Deleted folder tree");
        self.persist(&mut catalog).await
    }
}
