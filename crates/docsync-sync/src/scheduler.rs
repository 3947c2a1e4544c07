//! Sync scheduler - periodic sync requests
//!
//! The [`SyncScheduler`] appends an incremental
//! [`StartNextSync`](docsync_core::domain::StartNextSync) to the root's
//! queue every poll interval. It also listens on the queue itself:
//!
//! - a full sync request restarts the timer, so the next periodic request
//!   comes one full interval after the crawl was requested;
//! - a [`SyncEvent::ConfigChanged`] with a positive interval replaces the
//!   interval and restarts the timer.
//!
//! The timer runs as a tokio task and is stopped while the root is
//! suspended.

use std::time::Duration;

use docsync_core::domain::{StartNextSync, SyncEvent};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::queue::{priority, QueueHandle, SyncEventHandler};
use crate::SyncResult;

struct TimerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct SchedulerState {
    interval: Duration,
    suspended: bool,
    timer: Option<TimerTask>,
}

/// Emits periodic incremental sync requests
pub struct SyncScheduler {
    queue: QueueHandle,
    state: Mutex<SchedulerState>,
}

impl SyncScheduler {
    /// Creates a stopped scheduler
    pub fn new(queue: QueueHandle, interval: Duration) -> Self {
        info!(interval_ms = interval.as_millis() as u64, "Creating sync scheduler");
        Self {
            queue,
            state: Mutex::new(SchedulerState {
                interval,
                suspended: false,
                timer: None,
            }),
        }
    }

    /// Starts the timer; no-op if it already runs or the scheduler is suspended
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state);
    }

    /// Stops the timer
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        Self::stop_locked(&mut state).await;
    }

    /// Replaces the poll interval, restarting a running timer
    pub async fn set_interval(&self, interval: Duration) {
        let mut state = self.state.lock().await;
        if state.interval == interval {
            return;
        }
        info!(interval_ms = interval.as_millis() as u64, "Poll interval changed");
        state.interval = interval;
        if state.timer.is_some() {
            Self::stop_locked(&mut state).await;
            self.start_locked(&mut state);
        }
    }

    /// Stops the timer until [`resume`](Self::resume) is called
    pub async fn suspend(&self) {
        let mut state = self.state.lock().await;
        if !state.suspended {
            info!("Scheduler suspended");
        }
        state.suspended = true;
        Self::stop_locked(&mut state).await;
    }

    /// Lifts a suspension and restarts the timer
    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        if state.suspended {
            info!("Scheduler resumed");
        }
        state.suspended = false;
        self.start_locked(&mut state);
    }

    /// Restarts a running timer so the next tick is a full interval away
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if state.timer.is_some() {
            Self::stop_locked(&mut state).await;
            self.start_locked(&mut state);
        }
    }

    pub async fn interval(&self) -> Duration {
        self.state.lock().await.interval
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.timer.is_some()
    }

    pub async fn is_suspended(&self) -> bool {
        self.state.lock().await.suspended
    }

    fn start_locked(&self, state: &mut SchedulerState) {
        if state.timer.is_some() || state.suspended {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let queue = self.queue.clone();
        let period = state.interval;

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        debug!("Scheduling incremental sync");
                        queue.add_event(SyncEvent::StartNextSync(StartNextSync::incremental()));
                    }
                }
            }
        });
        debug!(interval_ms = period.as_millis() as u64, "Scheduler timer started");
        state.timer = Some(TimerTask { cancel, handle });
    }

    async fn stop_locked(state: &mut SchedulerState) {
        if let Some(timer) = state.timer.take() {
            timer.cancel.cancel();
            let _ = timer.handle.await;
            debug!("Scheduler timer stopped");
        }
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for SyncScheduler {
    fn priority(&self) -> i32 {
        priority::SCHEDULER
    }

    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn handle(&self, event: &SyncEvent) -> SyncResult<bool> {
        match event {
            SyncEvent::StartNextSync(request) if request.full_sync_requested => {
                self.reset().await;
            }
            SyncEvent::ConfigChanged { poll_interval } if !poll_interval.is_zero() => {
                self.set_interval(*poll_interval).await;
            }
            _ => {}
        }
        Ok(false)
    }
}
