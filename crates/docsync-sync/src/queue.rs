//! Per-root event queue and prioritized handler dispatch
//!
//! Every sync root owns exactly one [`SyncEventQueue`]. Producers hold a
//! cheap, clonable [`QueueHandle`] and only ever append events; a single
//! consumer drains the queue in FIFO order and offers each event to the
//! registered [`SyncEventHandler`]s.
//!
//! ## Dispatch
//!
//! ```text
//! QueueHandle::add_event ──→ mpsc (unbounded) ──→ SyncEventQueue::process
//!                                                     │
//!                                        EventManager (ascending priority)
//!                                        handler 1 ─ handler 2 ─ ... ─ handler N
//!                                        first handler returning true stops
//! ```
//!
//! Handler errors are classified with [`SyncError::classify`]; interaction
//! errors become [`SyncEvent::InteractionNeeded`] events, and unexpected
//! errors while handling a [`SyncEvent::StartNextSync`] re-enqueue a full
//! crawl request.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use docsync_core::domain::SyncEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{ErrorLevel, SyncError, SyncResult};

// ============================================================================
// Handler priorities
// ============================================================================

/// Handler priorities; lower numbers run first
pub mod priority {
    pub const DEBUG_LOGGING: i32 = 0;
    pub const DROP_LOCAL_EVENTS: i32 = 1_000;
    pub const IGNORED_FOLDERS: i32 = 1_010;
    pub const IGNORED_FILE_NAMES: i32 = 1_020;
    pub const IGNORED_FOLDER_NAMES: i32 = 1_030;
    pub const SYMLINKS: i32 = 1_040;
    pub const ALREADY_HANDLED: i32 = 1_050;
    pub const DUPLICATE_CRAWL_REQUEST: i32 = 1_060;
    pub const SELECTIVE_IGNORE: i32 = 1_500;
    pub const SCHEDULER: i32 = 2_000;
    pub const CHANGE_LOG_POLLER: i32 = 3_000;
    pub const CRAWLER: i32 = 3_100;
    pub const CONTENT_CHANGE_TRANSFORMER: i32 = 4_000;
    pub const SYNC_MECHANISM: i32 = 5_000;
}

// ============================================================================
// SyncEventHandler trait
// ============================================================================

/// A consumer of queue events
///
/// Returning `Ok(true)` marks the event as handled and stops dispatch;
/// `Ok(false)` passes it on to the next handler.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Dispatch position, lower runs first
    fn priority(&self) -> i32;

    /// Handler name for logs
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool>;
}

// ============================================================================
// EventManager
// ============================================================================

/// Ordered list of handlers
#[derive(Default)]
pub struct EventManager {
    handlers: Vec<Arc<dyn SyncEventHandler>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler
    ///
    /// Handlers with equal priority keep their registration order.
    pub fn add_handler(&mut self, handler: Arc<dyn SyncEventHandler>) {
        let position = self
            .handlers
            .iter()
            .position(|h| h.priority() > handler.priority())
            .unwrap_or(self.handlers.len());
        debug!(
            handler = handler.name(),
            priority = handler.priority(),
            "Registering event handler"
        );
        self.handlers.insert(position, handler);
    }

    /// Removes every handler registered under `name`
    pub fn remove_handler(&mut self, name: &str) {
        self.handlers.retain(|h| h.name() != name);
    }

    /// Handler names in dispatch order
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Offers `event` to each handler until one handles it
    pub async fn dispatch(&self, event: &SyncEvent) -> SyncResult<bool> {
        for handler in &self.handlers {
            if handler.handle(event).await? {
                trace!(handler = handler.name(), event = %event, "Event handled");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ============================================================================
// QueueHandle
// ============================================================================

/// Producer side of a [`SyncEventQueue`]
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<SyncEvent>,
    pending: Arc<AtomicUsize>,
}

impl QueueHandle {
    /// Appends an event; dropped with a warning if the queue is gone
    pub fn add_event(&self, event: SyncEvent) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.tx.send(event) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!(event = %err.0, "Event queue closed, dropping event");
        }
    }

    /// Number of events not yet taken by the consumer
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

// ============================================================================
// ErrorReport
// ============================================================================

/// A failed dispatch, forwarded to the root supervisor
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub event: SyncEvent,
    pub level: ErrorLevel,
    pub message: String,
}

// ============================================================================
// SyncEventQueue
// ============================================================================

/// Consumer side of a sync root's event queue
pub struct SyncEventQueue {
    rx: mpsc::UnboundedReceiver<SyncEvent>,
    handle: QueueHandle,
    manager: EventManager,
    reports: Option<mpsc::UnboundedSender<ErrorReport>>,
}

impl SyncEventQueue {
    /// Creates an empty queue and a producer handle for it
    pub fn new() -> (Self, QueueHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = QueueHandle {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
        };
        let queue = Self {
            rx,
            handle: handle.clone(),
            manager: EventManager::new(),
            reports: None,
        };
        (queue, handle)
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn manager(&self) -> &EventManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut EventManager {
        &mut self.manager
    }

    /// Forwards every failed dispatch to `tx`
    pub fn set_error_reporter(&mut self, tx: mpsc::UnboundedSender<ErrorReport>) {
        self.reports = Some(tx);
    }

    /// Waits for the next event
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        let event = self.rx.recv().await?;
        self.handle.pending.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }

    /// Processes the next event if one is queued, without waiting
    ///
    /// Returns `None` if the queue is empty, otherwise whether a handler
    /// handled the event.
    pub async fn try_step(&mut self) -> Option<bool> {
        let event = self.rx.try_recv().ok()?;
        self.handle.pending.fetch_sub(1, Ordering::AcqRel);
        Some(self.process(event).await)
    }

    /// Processes events until the queue is empty
    ///
    /// Events enqueued by handlers while draining are processed as well.
    /// Returns the number of processed events.
    pub async fn drain(&mut self) -> usize {
        let mut processed = 0;
        while self.try_step().await.is_some() {
            processed += 1;
        }
        processed
    }

    /// Consumes events until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Event queue consumer starting");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.next_event() => match event {
                    Some(event) => {
                        self.process(event).await;
                    }
                    None => break,
                },
            }
        }
        info!("Event queue consumer stopped");
    }

    /// Dispatches one event and routes handler errors
    pub async fn process(&self, event: SyncEvent) -> bool {
        debug!(event = %event, "Dispatching event");
        match self.manager.dispatch(&event).await {
            Ok(handled) => {
                if !handled {
                    trace!(event = %event, "No handler took the event");
                }
                handled
            }
            Err(err) => {
                self.route_error(&event, err);
                false
            }
        }
    }

    fn route_error(&self, event: &SyncEvent, err: SyncError) {
        let err = err.into_interaction();
        let level = err.classify();
        match (&err, level) {
            (
                SyncError::InteractionNeeded {
                    title,
                    description,
                    details,
                },
                _,
            ) => {
                warn!(title = %title, event = %event, "User interaction needed");
                self.handle.add_event(SyncEvent::InteractionNeeded {
                    title: title.clone(),
                    description: description.clone(),
                    details: details.clone(),
                });
            }
            (_, ErrorLevel::Connection) => {
                warn!(error = %err, event = %event, "Connection problem while handling event");
            }
            (_, ErrorLevel::Recoverable) => {
                warn!(error = %err, event = %event, "Event deferred to next sync");
            }
            (_, ErrorLevel::Interaction | ErrorLevel::Unexpected) => {
                error!(error = %err, event = %event, "Unexpected error while handling event");
                if let SyncEvent::StartNextSync(request) = event {
                    self.handle
                        .add_event(SyncEvent::StartNextSync(request.escalate()));
                }
            }
        }

        if let Some(reports) = &self.reports {
            let report = ErrorReport {
                event: event.clone(),
                level,
                message: err.to_string(),
            };
            if reports.send(report).is_err() {
                warn!(event = %event, "Error report dropped, supervisor is gone");
            }
        }
    }
}

// ============================================================================
// DebugLoggingHandler
// ============================================================================

/// Logs every event before any other handler sees it
pub struct DebugLoggingHandler;

#[async_trait::async_trait]
impl SyncEventHandler for DebugLoggingHandler {
    fn priority(&self) -> i32 {
        priority::DEBUG_LOGGING
    }

    fn name(&self) -> &'static str {
        "debug_logging"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        if let SyncEvent::InteractionNeeded {
            title, description, ..
        } = event
        {
            warn!(title = %title, description = %description, "Interaction needed");
        } else {
            debug!(event = %event, "Queue event");
        }
        Ok(false)
    }
}
