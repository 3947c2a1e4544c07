//! Per-root wiring
//!
//! A [`SyncRoot`] owns everything that synchronizes one local directory
//! with one remote folder: the event queue and its handlers, the file
//! watcher, the scheduler and a supervisor that suspends polling while the
//! repository is unreachable. Roots share no mutable state; the daemon
//! builds one per configured root and hands it explicit backend handles.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use docsync_core::config::{IgnoreConfig, RootConfig};
use docsync_core::domain::{
    newtypes::{RemotePath, SyncPath},
    PathMatcher, StartNextSync, SyncEvent,
};
use docsync_core::ports::{ILocalFileSystem, IMetaDataStorage, IRepository, ITransmissionStorage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::changelog::{ChangeLogPoller, ContentChangeTransformer};
use crate::crawler::DescendantsCrawler;
use crate::filter::{
    AlreadyHandledFsEventsFilter, DropLocalEventsFilter, DuplicateCrawlRequestFilter,
    FilterAggregator, IgnoredEntitiesCollection, IgnoredFileNamesFilter, IgnoredFolderNamesFilter,
    IgnoredFoldersFilter, SelectiveIgnoreFilter, SymlinkFilter,
};
use crate::mechanism::SyncMechanism;
use crate::queue::{DebugLoggingHandler, ErrorReport, QueueHandle, SyncEventQueue};
use crate::scheduler::SyncScheduler;
use crate::solver::SyncContext;
use crate::transmission::TransmissionManager;
use crate::watcher::{FileWatcher, WatcherConsumer};
use crate::ErrorLevel;

/// What a sync root is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootStatus {
    Idle,
    Syncing,
    /// The repository is unreachable; waiting for [`SyncRoot::resume`]
    Suspended,
}

/// Storage and adapter handles a root works against
#[derive(Clone)]
pub struct SyncBackend {
    pub repository: Arc<dyn IRepository>,
    pub storage: Arc<dyn IMetaDataStorage>,
    pub transmission_storage: Arc<dyn ITransmissionStorage>,
    pub ignored: Arc<IgnoredEntitiesCollection>,
    pub fs: Arc<dyn ILocalFileSystem>,
}

/// One synchronized directory
pub struct SyncRoot {
    config: RootConfig,
    matcher: PathMatcher,
    queue: Option<SyncEventQueue>,
    handle: QueueHandle,
    scheduler: Arc<SyncScheduler>,
    transmissions: Arc<TransmissionManager>,
    backend: SyncBackend,
    status: Arc<watch::Sender<RootStatus>>,
    watcher: Option<FileWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncRoot {
    /// Builds the queue and registers every handler in dispatch order
    ///
    /// # Errors
    /// Returns an error if the root paths are invalid or an ignore pattern
    /// does not compile
    pub fn new(config: RootConfig, ignore: &IgnoreConfig, backend: SyncBackend) -> Result<Self> {
        let matcher = path_matcher(&config)?;
        let rules = Arc::new(FilterAggregator::from_config(ignore, &config)?);

        let (mut queue, handle) = SyncEventQueue::new();
        let scheduler = Arc::new(SyncScheduler::new(handle.clone(), config.poll_interval()));
        let transmissions = Arc::new(TransmissionManager::new());

        let ctx = SyncContext::new(
            Arc::clone(&backend.repository),
            Arc::clone(&backend.storage),
            Arc::clone(&backend.transmission_storage),
            Arc::clone(&backend.fs),
            Arc::clone(&transmissions),
            handle.clone(),
            usize::try_from(config.chunk_size_bytes).unwrap_or(usize::MAX),
        );

        let manager = queue.manager_mut();
        manager.add_handler(Arc::new(DebugLoggingHandler));
        if config.debug.drop_local_events {
            warn!(root = %config.name, "Local filesystem events are dropped (debug mode)");
            manager.add_handler(Arc::new(DropLocalEventsFilter));
        }
        manager.add_handler(Arc::new(IgnoredFoldersFilter::new(
            Arc::clone(&rules),
            matcher.clone(),
        )));
        manager.add_handler(Arc::new(IgnoredFileNamesFilter::new(
            Arc::clone(&rules),
            matcher.clone(),
        )));
        manager.add_handler(Arc::new(IgnoredFolderNamesFilter::new(
            Arc::clone(&rules),
            matcher.clone(),
        )));
        if rules.skips_symlinks() {
            manager.add_handler(Arc::new(SymlinkFilter::new(Arc::clone(&backend.fs))));
        }
        manager.add_handler(Arc::new(AlreadyHandledFsEventsFilter::new(
            Arc::clone(&backend.storage),
            Arc::clone(&backend.fs),
        )));
        manager.add_handler(Arc::new(DuplicateCrawlRequestFilter::new()));
        manager.add_handler(Arc::new(SelectiveIgnoreFilter::new(
            Arc::clone(&backend.ignored),
            Arc::clone(&backend.repository),
        )));
        manager.add_handler(scheduler.clone());
        manager.add_handler(Arc::new(ChangeLogPoller::new(
            Arc::clone(&backend.repository),
            Arc::clone(&backend.storage),
            handle.clone(),
        )));
        manager.add_handler(Arc::new(DescendantsCrawler::new(
            Arc::clone(&backend.repository),
            Arc::clone(&backend.storage),
            Arc::clone(&backend.fs),
            handle.clone(),
            matcher.clone(),
            Arc::clone(&rules),
            Arc::clone(&backend.ignored),
        )));
        manager.add_handler(Arc::new(ContentChangeTransformer::new(
            Arc::clone(&backend.repository),
            Arc::clone(&backend.storage),
            handle.clone(),
        )));
        manager.add_handler(Arc::new(SyncMechanism::new(ctx, matcher.clone())));
        info!(root = %config.name, handlers = ?manager.handler_names(), "Sync root assembled");

        let (status, _) = watch::channel(RootStatus::Idle);
        let status = Arc::new(status);
        Ok(Self {
            config,
            matcher,
            queue: Some(queue),
            handle,
            scheduler,
            transmissions,
            backend,
            status,
            watcher: None,
            tasks: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn local_root(&self) -> PathBuf {
        self.matcher.local_root().as_path().to_path_buf()
    }

    /// Producer handle of this root's queue
    pub fn queue(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Running transfers, for pause and abort
    pub fn transmissions(&self) -> Arc<TransmissionManager> {
        Arc::clone(&self.transmissions)
    }

    pub fn status(&self) -> RootStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RootStatus> {
        self.status.subscribe()
    }

    /// Starts the watcher, the scheduler, the queue consumer and the
    /// supervisor, then requests the initial full crawl
    ///
    /// # Errors
    /// Returns an error if the root was already started, the local root
    /// cannot be created or the watcher cannot be installed
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut queue = self
            .queue
            .take()
            .with_context(|| format!("Sync root {} already started", self.config.name))?;
        let local_root = self.local_root();

        if self.backend.fs.entry(&local_root).await?.is_none() {
            info!(path = %local_root.display(), "Creating local root");
            self.backend.fs.create_directory(&local_root).await?;
        }

        let (mut watcher, rx) = FileWatcher::new()?;
        watcher.watch(&local_root)?;
        self.watcher = Some(watcher);
        let consumer = WatcherConsumer::new(
            self.handle.clone(),
            Arc::clone(&self.backend.storage),
            Arc::clone(&self.backend.fs),
            self.config.debounce(),
        );
        self.tasks
            .push(tokio::spawn(consumer.run(rx, cancel.child_token())));

        let (report_tx, report_rx) = mpsc::unbounded_channel();
        queue.set_error_reporter(report_tx);
        self.tasks.push(tokio::spawn(supervise(
            report_rx,
            Arc::clone(&self.scheduler),
            Arc::clone(&self.status),
            cancel.child_token(),
        )));

        self.scheduler.start().await;
        self.handle
            .add_event(SyncEvent::StartNextSync(StartNextSync::full()));
        self.tasks.push(tokio::spawn(consume(
            queue,
            self.handle.clone(),
            Arc::clone(&self.status),
            cancel.child_token(),
        )));

        info!(root = %self.config.name, path = %local_root.display(), "Sync root started");
        Ok(())
    }

    /// Processes queued events in the calling task until the queue is empty
    ///
    /// Only valid before [`start`](Self::start). Returns the number of
    /// processed events.
    ///
    /// # Errors
    /// Returns an error if the root was already started
    pub async fn run_until_idle(&mut self) -> Result<usize> {
        let queue = self
            .queue
            .as_mut()
            .with_context(|| format!("Sync root {} is running", self.config.name))?;
        set_unless_suspended(&self.status, RootStatus::Syncing);
        let processed = queue.drain().await;
        set_unless_suspended(&self.status, RootStatus::Idle);
        Ok(processed)
    }

    /// Runs one full synchronization without watcher or scheduler
    ///
    /// # Errors
    /// Returns an error if the root was already started
    pub async fn sync_once(&mut self) -> Result<usize> {
        self.handle
            .add_event(SyncEvent::StartNextSync(StartNextSync::full()));
        let processed = self.run_until_idle().await?;
        info!(root = %self.config.name, events = processed, "One-shot synchronization finished");
        Ok(processed)
    }

    /// Lifts a suspension and requests a full crawl
    pub async fn resume(&self) {
        info!(root = %self.config.name, "Resuming sync root");
        self.status.send_replace(RootStatus::Idle);
        self.scheduler.resume().await;
        self.handle
            .add_event(SyncEvent::StartNextSync(StartNextSync::full()));
    }

    /// Changes the incremental poll interval through the queue
    pub fn set_poll_interval(&self, interval: std::time::Duration) {
        self.handle
            .add_event(SyncEvent::ConfigChanged { poll_interval: interval });
    }

    pub async fn poll_interval(&self) -> std::time::Duration {
        self.scheduler.interval().await
    }

    /// Stops the scheduler, aborts transfers and waits for the tasks
    ///
    /// The tasks stop once the token passed to [`start`](Self::start) is
    /// cancelled.
    pub async fn shutdown(&mut self) {
        self.scheduler.stop().await;
        self.transmissions.abort_all();
        let local_root = self.local_root();
        if let Some(mut watcher) = self.watcher.take() {
            if let Err(e) = watcher.unwatch(&local_root) {
                debug!(error = %e, "Unwatch failed");
            }
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Sync root task ended abnormally");
            }
        }
        info!(root = %self.config.name, "Sync root stopped");
    }
}

/// Path matcher of a configured root
///
/// # Errors
/// Returns an error if the local path is not absolute or the remote path
/// is malformed
pub fn path_matcher(config: &RootConfig) -> Result<PathMatcher> {
    let local_root = SyncPath::new(config.local_path.clone())
        .with_context(|| format!("Invalid local path for root {}", config.name))?;
    let remote_root = RemotePath::new(config.remote_path.clone())
        .with_context(|| format!("Invalid remote path for root {}", config.name))?;
    Ok(PathMatcher::new(local_root, remote_root))
}

/// Queue consumer publishing Idle/Syncing transitions
async fn consume(
    mut queue: SyncEventQueue,
    handle: QueueHandle,
    status: Arc<watch::Sender<RootStatus>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = queue.next_event() => {
                let Some(event) = event else { break };
                set_unless_suspended(&status, RootStatus::Syncing);
                queue.process(event).await;
                if handle.is_empty() {
                    set_unless_suspended(&status, RootStatus::Idle);
                }
            }
        }
    }
    debug!("Queue consumer stopped");
}

/// Suspends polling on connection failures
async fn supervise(
    mut reports: mpsc::UnboundedReceiver<ErrorReport>,
    scheduler: Arc<SyncScheduler>,
    status: Arc<watch::Sender<RootStatus>>,
    cancel: CancellationToken,
) {
    loop {
        let report = tokio::select! {
            _ = cancel.cancelled() => break,
            report = reports.recv() => match report {
                Some(report) => report,
                None => break,
            },
        };
        if report.level != ErrorLevel::Connection {
            continue;
        }
        if status.send_replace(RootStatus::Suspended) != RootStatus::Suspended {
            warn!(error = %report.message, "Repository unreachable, suspending sync root");
        }
        scheduler.suspend().await;
    }
}

fn set_unless_suspended(status: &watch::Sender<RootStatus>, next: RootStatus) {
    status.send_if_modified(|current| {
        if *current == RootStatus::Suspended || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspended_status_is_sticky() {
        let (status, rx) = watch::channel(RootStatus::Idle);
        set_unless_suspended(&status, RootStatus::Syncing);
        assert_eq!(*rx.borrow(), RootStatus::Syncing);

        status.send_replace(RootStatus::Suspended);
        set_unless_suspended(&status, RootStatus::Idle);
        assert_eq!(*rx.borrow(), RootStatus::Suspended);
    }

    #[tokio::test]
    async fn test_supervisor_suspends_on_connection_errors() {
        let (_queue, handle) = SyncEventQueue::new();
        let scheduler = Arc::new(SyncScheduler::new(handle, std::time::Duration::from_secs(60)));
        scheduler.start().await;
        let (status, mut rx) = watch::channel(RootStatus::Idle);
        let (tx, reports) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            reports,
            Arc::clone(&scheduler),
            Arc::new(status),
            cancel.clone(),
        ));

        tx.send(ErrorReport {
            event: SyncEvent::FullSyncFailed,
            level: ErrorLevel::Recoverable,
            message: "quota".into(),
        })
        .unwrap();
        tx.send(ErrorReport {
            event: SyncEvent::StartNextSync(StartNextSync::full()),
            level: ErrorLevel::Connection,
            message: "down".into(),
        })
        .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow(), RootStatus::Suspended);
        cancel.cancel();
        task.await.unwrap();
        assert!(!scheduler.is_running().await);
    }
}
