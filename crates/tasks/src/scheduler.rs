//! Periodic and on-demand triggering for a [`LockingBackgroundTask`].

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::task::{LockingBackgroundTask, RunError};

struct Ticker {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives one task from a ticker and from [`TaskScheduler::trigger_now`].
///
/// Stopping the ticker never interrupts a run that already started; only
/// [`TaskScheduler::shutdown`] cancels the context handed to the work.
/// Shutdown is terminal: the scheduler cannot be started or triggered again.
pub struct TaskScheduler {
    task: LockingBackgroundTask,
    period: Duration,
    work_cancel: CancellationToken,
    ticker: Mutex<Option<Ticker>>,
}

impl TaskScheduler {
    /// A stopped scheduler for `task` ticking every `period` once started.
    pub fn new(task: LockingBackgroundTask, period: Duration) -> Self {
        Self {
            task,
            period,
            work_cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
        }
    }

    /// The task this scheduler drives.
    pub fn task(&self) -> &LockingBackgroundTask {
        &self.task
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the ticker is active.
    pub fn is_started(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Whether [`TaskScheduler::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        self.work_cancel.is_cancelled()
    }

    /// Start periodic ticking. The first tick fires immediately.
    /// Returns `false` if ticking was already active or the scheduler is shut down.
    pub fn start(&self) -> bool {
        let mut ticker = self.ticker.lock();
        if self.is_shut_down() {
            warn!(task = %self.task.name(), "scheduler is shut down, not starting");
            return false;
        }
        if ticker.is_some() {
            debug!(task = %self.task.name(), "scheduler already started");
            return false;
        }

        let stop = CancellationToken::new();
        let handle = tokio::spawn(tick_loop(
            self.task.clone(),
            self.period,
            stop.clone(),
            self.work_cancel.clone(),
        ));
        *ticker = Some(Ticker { stop, handle });

        info!(
            task = %self.task.name(),
            period_secs = self.period.as_secs(),
            "scheduler started"
        );
        true
    }

    /// Stop periodic ticking. Returns `false` if ticking was not active.
    pub fn stop(&self) -> bool {
        let Some(ticker) = self.ticker.lock().take() else {
            debug!(task = %self.task.name(), "scheduler already stopped");
            return false;
        };
        ticker.stop.cancel();
        // The loop exits on its own once any in-flight run returns.
        drop(ticker.handle);
        info!(task = %self.task.name(), "scheduler stopped");
        true
    }

    /// Run the task now from the caller, sharing the ticker's exclusion.
    pub async fn trigger_now(&self) -> Result<(), RunError> {
        if self.is_shut_down() {
            debug!(task = %self.task.name(), "scheduler is shut down, ignoring trigger");
            return Err(RunError::ShutDown {
                task: self.task.name().to_string(),
            });
        }
        debug!(task = %self.task.name(), "on-demand trigger");
        self.task.run(self.work_cancel.child_token()).await
    }

    /// Stop ticking and cancel the context of any in-flight work.
    pub fn shutdown(&self) {
        // Under the ticker lock so a concurrent `start` sees the cancellation.
        let mut ticker = self.ticker.lock();
        self.work_cancel.cancel();
        if let Some(ticker) = ticker.take() {
            ticker.stop.cancel();
        }
        info!(task = %self.task.name(), "scheduler shut down");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.stop.cancel();
        }
    }
}

async fn tick_loop(
    task: LockingBackgroundTask,
    period: Duration,
    stop: CancellationToken,
    work_cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = interval.tick() => {}
        }

        match task.run(work_cancel.child_token()).await {
            Ok(()) => {}
            Err(RunError::AlreadyRunning { .. }) => {
                debug!(task = %task.name(), "previous run still in flight, waiting for next tick");
            }
            Err(e) => {
                error!(task = %task.name(), error = %e, "scheduled run failed");
            }
        }
    }

    debug!(task = %task.name(), "tick loop exited");
}
