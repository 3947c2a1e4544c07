//! Selective ignore
//!
//! The user can exclude remote subtrees from synchronization. Entries are
//! persisted through [`IIgnoredEntitiesStorage`] and cached in an
//! [`IgnoredEntitiesCollection`]; the [`SelectiveIgnoreFilter`] drops every
//! event that touches an ignored subtree on either side.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use docsync_core::domain::{
    newtypes::RemoteId, IgnoredEntity, IgnoredState, PathMatcher, RemoteObject, SyncEvent,
};
use docsync_core::ports::{IIgnoredEntitiesStorage, IRepository, RepositoryError};
use tracing::{debug, info};

use crate::queue::{priority, SyncEventHandler};
use crate::{SyncError, SyncResult};

/// Upper bound on remote parent lookups per query
const MAX_PARENT_WALK: usize = 256;

// ============================================================================
// IgnoredEntitiesCollection
// ============================================================================

/// In-memory view of the ignored entities of one sync root
pub struct IgnoredEntitiesCollection {
    storage: Arc<dyn IIgnoredEntitiesStorage>,
    entries: RwLock<HashMap<RemoteId, IgnoredEntity>>,
}

impl IgnoredEntitiesCollection {
    /// Loads all persisted entries
    pub async fn load(storage: Arc<dyn IIgnoredEntitiesStorage>) -> anyhow::Result<Self> {
        let entries = storage
            .all()
            .await?
            .into_iter()
            .map(|e| (e.object_id.clone(), e))
            .collect::<HashMap<_, _>>();
        debug!(count = entries.len(), "Loaded ignored entities");
        Ok(Self {
            storage,
            entries: RwLock::new(entries),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<RemoteId, IgnoredEntity>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<RemoteId, IgnoredEntity>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Adds or replaces an entry
    pub async fn add(&self, entity: IgnoredEntity) -> anyhow::Result<()> {
        self.storage.add(&entity).await?;
        info!(id = %entity.object_id, path = %entity.local_path.display(), "Ignoring subtree");
        self.write().insert(entity.object_id.clone(), entity);
        Ok(())
    }

    /// Removes the entry of `object_id`
    pub async fn remove(&self, object_id: &RemoteId) -> anyhow::Result<()> {
        self.storage.remove(object_id).await?;
        info!(id = %object_id, "No longer ignoring subtree");
        self.write().remove(object_id);
        Ok(())
    }

    /// Ignores a remote object, resolving its local path through `matcher`
    ///
    /// Returns `NotIgnored` (and stores nothing) if the object has no
    /// repository path inside the sync root.
    pub async fn ignore_object(
        &self,
        object: &RemoteObject,
        matcher: &PathMatcher,
    ) -> anyhow::Result<IgnoredState> {
        let local = object
            .path
            .as_ref()
            .and_then(|p| matcher.create_local_path(p).ok());
        let Some(local) = local else {
            debug!(id = %object.id, "Cannot resolve local path of object to ignore");
            return Ok(IgnoredState::NotIgnored);
        };
        self.add(IgnoredEntity::new(object.id.clone(), local.into_path_buf()))
            .await?;
        Ok(IgnoredState::Ignored)
    }

    pub fn entries(&self) -> Vec<IgnoredEntity> {
        let mut entries: Vec<_> = self.read().values().cloned().collect();
        entries.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// State of a local path
    pub fn is_ignored_path(&self, path: &Path) -> IgnoredState {
        let entries = self.read();
        if entries.values().any(|e| e.local_path == path) {
            IgnoredState::Ignored
        } else if entries.values().any(|e| path.starts_with(&e.local_path)) {
            IgnoredState::Inherited
        } else {
            IgnoredState::NotIgnored
        }
    }

    /// State of a remote id, without looking at ancestors
    pub fn is_ignored_id(&self, id: &RemoteId) -> IgnoredState {
        if self.read().contains_key(id) {
            IgnoredState::Ignored
        } else {
            IgnoredState::NotIgnored
        }
    }

    /// State of a remote object, walking its remote parents
    ///
    /// A parent that cannot be found ends the walk as `NotIgnored`.
    pub async fn is_ignored(
        &self,
        object: &RemoteObject,
        repository: &dyn IRepository,
    ) -> Result<IgnoredState, RepositoryError> {
        if self.is_ignored_id(&object.id).is_ignored() {
            return Ok(IgnoredState::Ignored);
        }
        if self.is_empty() {
            return Ok(IgnoredState::NotIgnored);
        }

        let mut parent = object.parent_id.clone();
        for _ in 0..MAX_PARENT_WALK {
            let Some(id) = parent else { break };
            if self.is_ignored_id(&id).is_ignored() {
                return Ok(IgnoredState::Inherited);
            }
            match repository.get_object(&id).await {
                Ok(parent_object) => parent = parent_object.parent_id,
                Err(RepositoryError::ObjectNotFound(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(IgnoredState::NotIgnored)
    }
}

// ============================================================================
// SelectiveIgnoreFilter
// ============================================================================

/// Drops events inside ignored subtrees
pub struct SelectiveIgnoreFilter {
    ignored: Arc<IgnoredEntitiesCollection>,
    repository: Arc<dyn IRepository>,
}

impl SelectiveIgnoreFilter {
    pub fn new(ignored: Arc<IgnoredEntitiesCollection>, repository: Arc<dyn IRepository>) -> Self {
        Self {
            ignored,
            repository,
        }
    }

    async fn remote_ignored(&self, object: &RemoteObject) -> SyncResult<bool> {
        match self.ignored.is_ignored(object, self.repository.as_ref()).await {
            Ok(state) => Ok(state.is_ignored()),
            Err(e) if e.is_connection_error() => Err(SyncError::from(e)),
            Err(e) => {
                debug!(id = %object.id, error = %e, "Ignore lookup failed, treating as not ignored");
                Ok(false)
            }
        }
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for SelectiveIgnoreFilter {
    fn priority(&self) -> i32 {
        priority::SELECTIVE_IGNORE
    }

    fn name(&self) -> &'static str {
        "selective_ignore"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        if self.ignored.is_empty() {
            return Ok(false);
        }

        let path_ignored = event
            .local_paths()
            .iter()
            .any(|p| self.ignored.is_ignored_path(p).is_ignored());
        let ignored = path_ignored
            || match event {
                SyncEvent::FileOrFolder(e) => match e.remote_object() {
                    Some(object) => self.remote_ignored(object).await?,
                    None => e
                        .remote_id()
                        .is_some_and(|id| self.ignored.is_ignored_id(id).is_ignored()),
                },
                SyncEvent::ContentChange(e) => match &e.object {
                    Some(object) => self.remote_ignored(object).await?,
                    None => self.ignored.is_ignored_id(&e.object_id).is_ignored(),
                },
                _ => false,
            };

        if ignored {
            debug!(event = %event, "Dropping event in selectively ignored subtree");
        }
        Ok(ignored)
    }
}
