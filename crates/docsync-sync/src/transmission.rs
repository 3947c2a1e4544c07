//! Transfer progress, pause and abort
//!
//! Every upload or download creates a [`Transmission`] in the root's
//! [`TransmissionManager`]. The transfer loop reports progress into it and
//! checks for pause/abort requests at chunk boundaries; observers subscribe
//! to a `watch` channel of [`TransmissionSnapshot`]s.
//!
//! ## Status transitions
//!
//! ```text
//! Transmitting ──pause()──→ PauseRequested ──(chunk boundary)──→ Paused
//!      ▲                          │                                 │
//!      └──────────resume()────────┴─────────────────────────────────┘
//! any non-terminal ──abort()──→ AbortRequested ──(chunk boundary)──→ Aborted
//! Transmitting ──finish()──→ Finished
//! ```

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{SyncError, SyncResult};

// ============================================================================
// Types
// ============================================================================

/// Direction and purpose of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmissionType {
    UploadNewFile,
    UploadModifiedFile,
    DownloadNewFile,
    DownloadModifiedFile,
}

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmissionStatus {
    Transmitting,
    PauseRequested,
    Paused,
    AbortRequested,
    Aborted,
    Finished,
}

impl TransmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted | Self::Finished)
    }
}

/// Point-in-time view of a transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionSnapshot {
    pub kind: TransmissionType,
    pub path: PathBuf,
    /// Temporary file used while downloading, if any
    pub cache_path: Option<PathBuf>,
    pub status: TransmissionStatus,
    /// Total length, `None` while unknown
    pub length: Option<u64>,
    /// Bytes transferred, `None` before the first chunk
    pub position: Option<u64>,
    pub bits_per_second: Option<u64>,
    pub last_modified: DateTime<Utc>,
    pub failure: Option<String>,
}

impl TransmissionSnapshot {
    /// Progress in percent
    ///
    /// `None` while length or position is unknown; an empty transfer is
    /// complete.
    pub fn percent(&self) -> Option<f64> {
        let (length, position) = (self.length?, self.position?);
        if length == 0 {
            return Some(100.0);
        }
        Some(position as f64 * 100.0 / length as f64)
    }
}

// ============================================================================
// Transmission
// ============================================================================

/// One running or finished transfer
pub struct Transmission {
    id: u64,
    started: Instant,
    tx: watch::Sender<TransmissionSnapshot>,
}

impl Transmission {
    fn new(id: u64, kind: TransmissionType, path: &Path) -> Self {
        let (tx, _rx) = watch::channel(TransmissionSnapshot {
            kind,
            path: path.to_path_buf(),
            cache_path: None,
            status: TransmissionStatus::Transmitting,
            length: None,
            position: None,
            bits_per_second: None,
            last_modified: Utc::now(),
            failure: None,
        });
        Self {
            id,
            started: Instant::now(),
            tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    pub fn snapshot(&self) -> TransmissionSnapshot {
        self.tx.borrow().clone()
    }

    pub fn status(&self) -> TransmissionStatus {
        self.tx.borrow().status
    }

    /// Receives a new snapshot on every change
    pub fn subscribe(&self) -> watch::Receiver<TransmissionSnapshot> {
        self.tx.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut TransmissionSnapshot)) {
        self.tx.send_modify(|snapshot| {
            f(snapshot);
            snapshot.last_modified = Utc::now();
        });
    }

    pub fn set_length(&self, length: Option<u64>) {
        self.update(|s| s.length = length);
    }

    pub fn set_cache_path(&self, path: Option<PathBuf>) {
        self.update(|s| s.cache_path = path);
    }

    /// Sets the absolute position, e.g. when resuming an upload
    pub fn set_position(&self, position: u64) {
        self.update(|s| s.position = Some(position));
    }

    /// Records `bytes` more transferred bytes
    pub fn advance(&self, bytes: u64) {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.update(|s| {
            let position = s.position.unwrap_or(0) + bytes;
            s.position = Some(position);
            if elapsed > 0.0 {
                s.bits_per_second = Some((position as f64 * 8.0 / elapsed) as u64);
            }
        });
    }

    /// Requests a pause; only a transmitting transfer can be paused
    pub fn pause(&self) -> bool {
        self.transition(|status| {
            (status == TransmissionStatus::Transmitting).then_some(TransmissionStatus::PauseRequested)
        })
    }

    /// Resumes a paused or pausing transfer
    pub fn resume(&self) -> bool {
        self.transition(|status| {
            matches!(
                status,
                TransmissionStatus::PauseRequested | TransmissionStatus::Paused
            )
            .then_some(TransmissionStatus::Transmitting)
        })
    }

    /// Requests an abort of any non-terminal transfer
    pub fn abort(&self) -> bool {
        self.transition(|status| {
            (!status.is_terminal() && status != TransmissionStatus::AbortRequested)
                .then_some(TransmissionStatus::AbortRequested)
        })
    }

    pub fn finish(&self) {
        self.update(|s| {
            s.status = TransmissionStatus::Finished;
            s.bits_per_second = None;
            if s.length.is_some() && s.position.is_none() {
                s.position = Some(0);
            }
        });
    }

    /// Marks the transfer as aborted with a failure cause
    pub fn fail(&self, cause: impl Into<String>) {
        let cause = cause.into();
        self.update(|s| {
            s.status = TransmissionStatus::Aborted;
            s.bits_per_second = None;
            s.failure = Some(cause);
        });
    }

    fn transition(
        &self,
        next: impl FnOnce(TransmissionStatus) -> Option<TransmissionStatus>,
    ) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|s| {
            if let Some(status) = next(s.status) {
                s.status = status;
                if status.is_terminal() {
                    s.bits_per_second = None;
                }
                s.last_modified = Utc::now();
                changed = true;
            }
            changed
        });
        changed
    }

    /// Honors pending pause and abort requests at a chunk boundary
    ///
    /// Waits while the transfer is paused.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::TransmissionAborted` once an abort was requested
    pub async fn checkpoint(&self) -> SyncResult<()> {
        let mut rx = self.subscribe();
        loop {
            let status = rx.borrow_and_update().status;
            match status {
                TransmissionStatus::AbortRequested | TransmissionStatus::Aborted => {
                    let path = self.mark_aborted();
                    return Err(SyncError::TransmissionAborted(path));
                }
                TransmissionStatus::PauseRequested => {
                    self.transition(|s| {
                        (s == TransmissionStatus::PauseRequested)
                            .then_some(TransmissionStatus::Paused)
                    });
                    debug!(id = self.id, "Transmission paused");
                }
                TransmissionStatus::Paused => {
                    if rx.changed().await.is_err() {
                        return Ok(());
                    }
                }
                TransmissionStatus::Transmitting | TransmissionStatus::Finished => {
                    return Ok(())
                }
            }
        }
    }

    fn mark_aborted(&self) -> PathBuf {
        self.transition(|s| {
            (s == TransmissionStatus::AbortRequested).then_some(TransmissionStatus::Aborted)
        });
        self.tx.borrow().path.clone()
    }

    /// Returns true once an abort was requested or performed
    pub fn is_aborted(&self) -> bool {
        matches!(
            self.status(),
            TransmissionStatus::AbortRequested | TransmissionStatus::Aborted
        )
    }
}

// ============================================================================
// TransmissionManager
// ============================================================================

/// All transfers of one sync root
#[derive(Default)]
pub struct TransmissionManager {
    next_id: AtomicU64,
    transmissions: DashMap<u64, Arc<Transmission>>,
}

impl TransmissionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new transfer in `Transmitting` state
    pub fn create(&self, kind: TransmissionType, path: &Path) -> Arc<Transmission> {
        self.prune();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transmission = Arc::new(Transmission::new(id, kind, path));
        info!(id, kind = ?kind, path = %path.display(), "Transmission started");
        self.transmissions.insert(id, transmission.clone());
        transmission
    }

    pub fn get(&self, id: u64) -> Option<Arc<Transmission>> {
        self.transmissions.get(&id).map(|t| t.value().clone())
    }

    /// Transfers that have not reached a terminal state
    pub fn active(&self) -> Vec<Arc<Transmission>> {
        let mut active: Vec<_> = self
            .transmissions
            .iter()
            .filter(|t| !t.status().is_terminal())
            .map(|t| t.value().clone())
            .collect();
        active.sort_by_key(|t| t.id());
        active
    }

    /// Requests an abort of every active transfer
    pub fn abort_all(&self) {
        for transmission in self.active() {
            transmission.abort();
        }
    }

    /// Drops finished and aborted transfers
    pub fn prune(&self) {
        self.transmissions.retain(|_, t| !t.status().is_terminal());
    }

    pub fn len(&self) -> usize {
        self.transmissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transmissions.is_empty()
    }
}

// ============================================================================
// ProgressReader
// ============================================================================

type PauseWait = Pin<Box<dyn Future<Output = ()> + Send>>;

/// `AsyncRead` adapter that reports progress and honors pause/abort
///
/// An abort surfaces as an I/O error, so a consumer such as an atomic file
/// write discards its partial output.
pub struct ProgressReader<R> {
    inner: R,
    transmission: Arc<Transmission>,
    paused: Option<PauseWait>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, transmission: Arc<Transmission>) -> Self {
        Self {
            inner,
            transmission,
            paused: None,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if let Some(wait) = this.paused.as_mut() {
                match wait.as_mut().poll(cx) {
                    Poll::Ready(()) => this.paused = None,
                    Poll::Pending => return Poll::Pending,
                }
            }
            match this.transmission.status() {
                TransmissionStatus::AbortRequested | TransmissionStatus::Aborted => {
                    this.transmission.mark_aborted();
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "transmission aborted",
                    )));
                }
                TransmissionStatus::PauseRequested | TransmissionStatus::Paused => {
                    this.transmission.transition(|s| {
                        (s == TransmissionStatus::PauseRequested)
                            .then_some(TransmissionStatus::Paused)
                    });
                    let mut rx = this.transmission.subscribe();
                    this.paused = Some(Box::pin(async move {
                        while rx.borrow_and_update().status == TransmissionStatus::Paused {
                            if rx.changed().await.is_err() {
                                break;
                            }
                        }
                    }));
                }
                TransmissionStatus::Transmitting | TransmissionStatus::Finished => break,
            }
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = (buf.filled().len() - before) as u64;
                if read > 0 {
                    this.transmission.advance(read);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    fn snapshot(length: Option<u64>, position: Option<u64>) -> TransmissionSnapshot {
        TransmissionSnapshot {
            kind: TransmissionType::DownloadNewFile,
            path: PathBuf::from("/sync/a"),
            cache_path: None,
            status: TransmissionStatus::Transmitting,
            length,
            position,
            bits_per_second: None,
            last_modified: Utc::now(),
            failure: None,
        }
    }

    #[test]
    fn test_percent() {
        assert_eq!(snapshot(None, Some(1)).percent(), None);
        assert_eq!(snapshot(Some(10), None).percent(), None);
        assert_eq!(snapshot(Some(0), Some(0)).percent(), Some(100.0));
        assert_eq!(snapshot(Some(200), Some(50)).percent(), Some(25.0));
    }

    #[test]
    fn test_status_transitions() {
        let manager = TransmissionManager::new();
        let t = manager.create(TransmissionType::UploadNewFile, Path::new("/sync/a"));

        assert!(!t.resume());
        assert!(t.pause());
        assert!(!t.pause());
        assert_eq!(t.status(), TransmissionStatus::PauseRequested);
        assert!(t.resume());
        assert!(t.abort());
        assert!(!t.abort());
        assert!(!t.pause());

        t.fail("stopped");
        assert_eq!(t.status(), TransmissionStatus::Aborted);
        assert_eq!(t.snapshot().failure.as_deref(), Some("stopped"));
        assert!(!t.abort());
        assert!(manager.active().is_empty());
    }

    #[test]
    fn test_terminal_states_clear_rate() {
        let manager = TransmissionManager::new();

        let done = manager.create(TransmissionType::DownloadNewFile, Path::new("/a"));
        done.set_length(Some(4_000));
        done.advance(1_000);
        done.finish();
        assert_eq!(done.snapshot().bits_per_second, None);

        let failed = manager.create(TransmissionType::UploadNewFile, Path::new("/b"));
        failed.advance(1_000);
        failed.fail("connection reset");
        let snapshot = failed.snapshot();
        assert_eq!(snapshot.status, TransmissionStatus::Aborted);
        assert_eq!(snapshot.bits_per_second, None);

        let aborted = manager.create(TransmissionType::UploadNewFile, Path::new("/c"));
        aborted.advance(1_000);
        assert!(aborted.abort());
        aborted.mark_aborted();
        assert_eq!(aborted.status(), TransmissionStatus::Aborted);
        assert_eq!(aborted.snapshot().bits_per_second, None);
    }

    #[test]
    fn test_manager_prunes_terminal_transmissions() {
        let manager = TransmissionManager::new();
        let done = manager.create(TransmissionType::DownloadNewFile, Path::new("/a"));
        done.finish();
        let _running = manager.create(TransmissionType::DownloadNewFile, Path::new("/b"));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.active().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_waits_while_paused() {
        let manager = TransmissionManager::new();
        let t = manager.create(TransmissionType::UploadModifiedFile, Path::new("/a"));
        t.pause();

        let waiter = {
            let t = t.clone();
            tokio::spawn(async move { t.checkpoint().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(t.status(), TransmissionStatus::Paused);
        assert!(!waiter.is_finished());

        t.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_reports_abort() {
        let manager = TransmissionManager::new();
        let t = manager.create(TransmissionType::UploadModifiedFile, Path::new("/a"));
        t.abort();
        assert!(matches!(
            t.checkpoint().await,
            Err(SyncError::TransmissionAborted(_))
        ));
        assert_eq!(t.status(), TransmissionStatus::Aborted);
    }

    #[tokio::test]
    async fn test_progress_reader_counts_bytes_and_aborts() {
        let manager = TransmissionManager::new();
        let t = manager.create(TransmissionType::DownloadNewFile, Path::new("/a"));
        t.set_length(Some(5));

        let mut reader = ProgressReader::new(&b"hello"[..], t.clone());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(t.snapshot().position, Some(5));
        assert_eq!(t.snapshot().percent(), Some(100.0));

        let aborted = manager.create(TransmissionType::DownloadNewFile, Path::new("/b"));
        aborted.abort();
        let mut reader = ProgressReader::new(&b"data"[..], aborted.clone());
        assert!(reader.read_to_end(&mut Vec::new()).await.is_err());
        assert_eq!(aborted.status(), TransmissionStatus::Aborted);
    }
}
