//! The locking task and its release handle.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a run did not complete.
#[derive(Debug, Error)]
pub enum RunError {
    /// Another run holds the task. Wait for the next trigger.
    #[error("task {task} is already running")]
    AlreadyRunning { task: String },
    /// The scheduler driving the task was shut down.
    #[error("task {task} is shut down")]
    ShutDown { task: String },
    #[error("task {task} failed: {source}")]
    Failed {
        task: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RunError {
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }
}

/// Run state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running { generation: u64, started: Instant },
}

struct RunSlot {
    state: TaskState,
    next_generation: u64,
}

struct Shared {
    name: String,
    slot: Mutex<RunSlot>,
}

/// Releases the run that created it. Idempotent, and bound to that run only:
/// a handle kept from an earlier run never releases a later one.
#[derive(Clone)]
pub struct Done {
    shared: Arc<Shared>,
    generation: u64,
}

impl Done {
    /// Returns `true` if this call moved the task back to idle.
    pub fn release(&self) -> bool {
        let started = {
            let mut slot = self.shared.slot.lock();
            match slot.state {
                TaskState::Running { generation, started } if generation == self.generation => {
                    slot.state = TaskState::Idle;
                    started
                }
                _ => return false,
            }
        };
        info!(
            task = %self.shared.name,
            generation = self.generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task finished"
        );
        true
    }

    /// Generation of the run this handle releases.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for Done {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Done")
            .field("task", &self.shared.name)
            .field("generation", &self.generation)
            .finish()
    }
}

/// What the wrapped work receives for one run.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Checked by the work between cost-bearing steps.
    pub cancel: CancellationToken,
    /// Must be released when the work is complete.
    pub done: Done,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

type TaskFn = dyn Fn(TaskContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Named unit of work that never runs twice concurrently.
#[derive(Clone)]
pub struct LockingBackgroundTask {
    shared: Arc<Shared>,
    description: Arc<str>,
    work: Arc<TaskFn>,
}

impl LockingBackgroundTask {
    /// `work` is called once per run with a fresh [`TaskContext`].
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, work: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let work: Arc<TaskFn> =
            Arc::new(move |ctx| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(work(ctx)) });
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                slot: Mutex::new(RunSlot {
                    state: TaskState::Idle,
                    next_generation: 0,
                }),
            }),
            description: Arc::from(description.into()),
            work,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Snapshot of the run state.
    pub fn state(&self) -> TaskState {
        self.shared.slot.lock().state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), TaskState::Running { .. })
    }

    /// Try-acquire the task and run the work.
    ///
    /// Returns `AlreadyRunning` without waiting if a run is in flight. The
    /// work is awaited here; if it fails or panics the task is released before
    /// the error is returned, if it succeeds the work owns the release through
    /// [`TaskContext::done`]. Dropping this future before the work completes
    /// also releases the task.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RunError> {
        let done = match self.try_acquire() {
            Some(done) => done,
            None => {
                debug!(task = %self.name(), "task already running, not starting another");
                return Err(RunError::AlreadyRunning {
                    task: self.name().to_string(),
                });
            }
        };

        info!(
            task = %self.name(),
            description = %self.description,
            generation = done.generation,
            "task started"
        );

        let mut guard = ReleaseOnDrop(Some(done.clone()));
        let ctx = TaskContext {
            cancel,
            done: done.clone(),
        };

        let work = Arc::clone(&self.work);
        let outcome = match AssertUnwindSafe(async move { work(ctx).await }).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!("task panicked: {}", panic_message(&*payload))),
        };

        match outcome {
            Ok(()) => {
                guard.disarm();
                Ok(())
            }
            Err(source) => {
                guard.disarm();
                done.release();
                warn!(task = %self.name(), error = %source, "task failed");
                Err(RunError::Failed {
                    task: self.name().to_string(),
                    source,
                })
            }
        }
    }

    fn try_acquire(&self) -> Option<Done> {
        let mut slot = self.shared.slot.lock();
        if let TaskState::Running { .. } = slot.state {
            return None;
        }
        let generation = slot.next_generation;
        slot.next_generation += 1;
        slot.state = TaskState::Running {
            generation,
            started: Instant::now(),
        };
        Some(Done {
            shared: Arc::clone(&self.shared),
            generation,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

impl std::fmt::Debug for LockingBackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockingBackgroundTask")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

struct ReleaseOnDrop(Option<Done>);

impl ReleaseOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(done) = self.0.take() {
            if done.release() {
                warn!(task = %done.shared.name, "task run dropped before completion");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;

    fn releasing_task(name: &str) -> LockingBackgroundTask {
        LockingBackgroundTask::new(name, "test", |ctx: TaskContext| async move {
            ctx.done.release();
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_second_run_is_rejected_without_blocking() {
        let gate = Arc::new(Notify::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let executions = Arc::new(AtomicUsize::new(0));

        let task = {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            let executions = executions.clone();
            LockingBackgroundTask::new("exclusive", "blocks until signalled", move |ctx: TaskContext| {
                let gate = gate.clone();
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                let executions = executions.clone();
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    gate.notified().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    ctx.done.release();
                    Ok(())
                }
            })
        };

        let first = {
            let task = task.clone();
            tokio::spawn(async move { task.run(CancellationToken::new()).await })
        };
        while !task.is_running() {
            tokio::task::yield_now().await;
        }

        let second = tokio::time::timeout(Duration::from_secs(1), task.run(CancellationToken::new()))
            .await
            .expect("second run must not block");
        assert!(matches!(second, Err(RunError::AlreadyRunning { .. })));

        gate.notify_one();
        first.await.unwrap().unwrap();

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Idle);
    }

    #[tokio::test]
    async fn test_failed_run_releases_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = {
            let calls = calls.clone();
            LockingBackgroundTask::new("flaky", "fails once", move |ctx: TaskContext| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("rpc unavailable");
                    }
                    ctx.done.release();
                    Ok(())
                }
            })
        };

        let err = task.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Failed { .. }));
        assert!(err.to_string().contains("rpc unavailable"));
        assert!(!task.is_running());

        task.run(CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_run_releases_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = {
            let calls = calls.clone();
            LockingBackgroundTask::new("panicky", "panics once", move |ctx: TaskContext| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("decoder blew up");
                    }
                    ctx.done.release();
                    Ok(())
                }
            })
        };

        let err = task.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Failed { .. }));
        assert!(err.to_string().contains("decoder blew up"));
        assert!(!task.is_running());

        task.run(CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_success_holds_task_until_done() {
        let parked: Arc<Mutex<Option<Done>>> = Arc::new(Mutex::new(None));
        let task = {
            let parked = parked.clone();
            LockingBackgroundTask::new("deferred", "hands done to background work", move |ctx: TaskContext| {
                let parked = parked.clone();
                async move {
                    *parked.lock() = Some(ctx.done);
                    Ok(())
                }
            })
        };

        task.run(CancellationToken::new()).await.unwrap();
        assert!(task.is_running());
        assert!(task.run(CancellationToken::new()).await.unwrap_err().is_already_running());

        let done = parked.lock().take().unwrap();
        assert!(done.release());
        assert!(!done.release(), "second release is a no-op");
        assert_eq!(task.state(), TaskState::Idle);

        task.run(CancellationToken::new()).await.unwrap();
        assert!(task.is_running());
    }

    #[tokio::test]
    async fn test_stale_done_cannot_release_later_run() {
        let parked: Arc<Mutex<Vec<Done>>> = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let parked = parked.clone();
            LockingBackgroundTask::new("generations", "keeps every handle", move |ctx: TaskContext| {
                let parked = parked.clone();
                async move {
                    parked.lock().push(ctx.done);
                    Ok(())
                }
            })
        };

        task.run(CancellationToken::new()).await.unwrap();
        let first = parked.lock()[0].clone();
        assert!(first.release());

        task.run(CancellationToken::new()).await.unwrap();
        assert!(!first.release());
        assert!(task.is_running());

        let second = parked.lock()[1].clone();
        assert_ne!(first.generation(), second.generation());
        assert!(second.release());
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_dropped_run_releases_task() {
        let task = LockingBackgroundTask::new("stuck", "never finishes", |_ctx: TaskContext| async move {
            futures::future::pending::<()>().await;
            Ok(())
        });

        let handle = {
            let task = task.clone();
            tokio::spawn(async move { task.run(CancellationToken::new()).await })
        };
        while !task.is_running() {
            tokio::task::yield_now().await;
        }

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_context_carries_cancellation() {
        let task = LockingBackgroundTask::new("cancellable", "observes cancel", |ctx: TaskContext| async move {
            if ctx.is_cancelled() {
                ctx.done.release();
                anyhow::bail!("cancelled before start");
            }
            ctx.done.release();
            Ok(())
        });

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(task.run(cancel).await, Err(RunError::Failed { .. })));
        assert!(task.run(CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_releasing_task_is_reusable() {
        let task = releasing_task("simple");
        for _ in 0..3 {
            task.run(CancellationToken::new()).await.unwrap();
            assert_eq!(task.state(), TaskState::Idle);
        }
        assert_eq!(task.name(), "simple");
        assert_eq!(task.description(), "test");
    }
}
