//! Remote change-log producer
//!
//! The [`ChangeLogPoller`] answers incremental sync requests by reading the
//! repository's change log from the last committed token and appending one
//! [`ContentChangeEvent`] per entry. When the log is unavailable, stale, or
//! no token was committed yet, it escalates to a full crawl instead.
//!
//! The [`ContentChangeTransformer`] later turns each raw entry into a
//! [`FileOrFolderEvent`] by fetching the object and comparing it with the
//! stored mapping.

use std::sync::Arc;

use docsync_core::domain::{
    newtypes::ChangeToken, ChangeType, ContentChange, ContentChangeEvent, EventSource,
    FileOrFolderEvent, MetaDataChange, RemoteHandle, StartNextSync, SyncEvent,
};
use docsync_core::ports::{IMetaDataStorage, IRepository, RepositoryError};
use tracing::{debug, info, instrument, warn};

use crate::queue::{priority, QueueHandle, SyncEventHandler};
use crate::SyncResult;

/// Default number of entries requested per change-log page
pub const DEFAULT_PAGE_SIZE: usize = 100;

// ============================================================================
// ChangeLogPoller
// ============================================================================

/// Turns incremental sync requests into content change events
pub struct ChangeLogPoller {
    repository: Arc<dyn IRepository>,
    storage: Arc<dyn IMetaDataStorage>,
    queue: QueueHandle,
    page_size: usize,
}

impl ChangeLogPoller {
    pub fn new(
        repository: Arc<dyn IRepository>,
        storage: Arc<dyn IMetaDataStorage>,
        queue: QueueHandle,
    ) -> Self {
        Self {
            repository,
            storage,
            queue,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    fn request_full_sync(&self, server_token: Option<ChangeToken>) {
        self.queue.add_event(SyncEvent::StartNextSync(
            StartNextSync::full().with_server_token(server_token),
        ));
    }

    #[instrument(skip(self))]
    async fn poll(&self) -> SyncResult<()> {
        if !self.repository.capabilities().change_log {
            debug!("Repository has no change log, requesting crawl");
            self.request_full_sync(None);
            return Ok(());
        }

        let server_token = match self.repository.latest_change_log_token().await {
            Ok(token) => token,
            Err(RepositoryError::ChangeLogUnavailable(reason)) => {
                warn!(reason = %reason, "Change log unavailable, requesting crawl");
                self.request_full_sync(None);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let Some(stored) = self.storage.change_log_token().await? else {
            info!("No change log token committed yet, requesting crawl");
            self.request_full_sync(server_token);
            return Ok(());
        };

        if server_token.as_ref() == Some(&stored) {
            debug!(token = %stored, "Change log up to date");
            return Ok(());
        }

        let mut since = stored;
        let mut count = 0usize;
        loop {
            let page = match self
                .repository
                .get_content_changes(&since, self.page_size)
                .await
            {
                Ok(page) => page,
                Err(
                    RepositoryError::StaleChangeToken(reason)
                    | RepositoryError::ChangeLogUnavailable(reason),
                ) => {
                    warn!(token = %since, reason = %reason, "Cannot continue change log, requesting crawl");
                    self.request_full_sync(server_token);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            for entry in page.entries {
                count += 1;
                self.queue
                    .add_event(SyncEvent::ContentChange(ContentChangeEvent {
                        change_type: entry.change_type,
                        object_id: entry.object_id,
                        object: None,
                    }));
            }

            match page.next_token {
                Some(next) if page.has_more && next != since => since = next,
                Some(next) => {
                    since = next;
                    break;
                }
                None => {
                    if let Some(token) = server_token.clone() {
                        since = token;
                    }
                    break;
                }
            }
        }

        self.storage.set_change_log_token(Some(&since)).await?;
        info!(changes = count, token = %since, "Change log read");
        Ok(())
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for ChangeLogPoller {
    fn priority(&self) -> i32 {
        priority::CHANGE_LOG_POLLER
    }

    fn name(&self) -> &'static str {
        "change_log_poller"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        match event {
            SyncEvent::StartNextSync(request) if !request.full_sync_requested => {
                self.poll().await?;
                Ok(true)
            }
            SyncEvent::FullSyncCompleted(request) => {
                if let Some(token) = &request.last_token_on_server {
                    debug!(token = %token, "Committing change log token of completed crawl");
                    self.storage.set_change_log_token(Some(token)).await?;
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// ContentChangeTransformer
// ============================================================================

/// Correlates raw change-log entries with stored mappings
pub struct ContentChangeTransformer {
    repository: Arc<dyn IRepository>,
    storage: Arc<dyn IMetaDataStorage>,
    queue: QueueHandle,
}

impl ContentChangeTransformer {
    pub fn new(
        repository: Arc<dyn IRepository>,
        storage: Arc<dyn IMetaDataStorage>,
        queue: QueueHandle,
    ) -> Self {
        Self {
            repository,
            storage,
            queue,
        }
    }

    async fn transform(&self, change: &ContentChangeEvent) -> SyncResult<Option<FileOrFolderEvent>> {
        let mapped = self.storage.get_object_by_remote_id(&change.object_id).await?;

        if change.change_type == ChangeType::Deleted {
            if mapped.is_none() {
                debug!(id = %change.object_id, "Deleted object was never synchronized");
                return Ok(None);
            }
            return Ok(Some(FileOrFolderEvent::remote(
                RemoteHandle::Deleted {
                    id: change.object_id.clone(),
                },
                MetaDataChange::Deleted,
                ContentChange::None,
                EventSource::ChangeLog,
            )));
        }

        let object = match &change.object {
            Some(object) => object.clone(),
            None => match self.repository.get_object(&change.object_id).await {
                Ok(object) => object,
                Err(RepositoryError::ObjectNotFound(_)) => {
                    debug!(id = %change.object_id, "Changed object vanished before it was fetched");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            },
        };

        let known = mapped.is_some();
        let (change_kind, content) = match (change.change_type, known) {
            (ChangeType::Created, _) | (_, false) => (
                MetaDataChange::Created,
                if object.is_document() && object.has_content_stream {
                    ContentChange::Created
                } else {
                    ContentChange::None
                },
            ),
            (ChangeType::Updated, true) if object.is_document() => {
                (MetaDataChange::Changed, ContentChange::Changed)
            }
            _ => (MetaDataChange::Changed, ContentChange::None),
        };

        Ok(Some(FileOrFolderEvent::remote(
            RemoteHandle::Object(object),
            change_kind,
            content,
            EventSource::ChangeLog,
        )))
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for ContentChangeTransformer {
    fn priority(&self) -> i32 {
        priority::CONTENT_CHANGE_TRANSFORMER
    }

    fn name(&self) -> &'static str {
        "content_change_transformer"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        let SyncEvent::ContentChange(change) = event else {
            return Ok(false);
        };
        if let Some(transformed) = self.transform(change).await? {
            self.queue.add_event(SyncEvent::FileOrFolder(transformed));
        }
        Ok(true)
    }
}
