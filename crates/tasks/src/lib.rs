//! Stakenode Tasks
//!
//! Recurring background work with at-most-one execution in flight per task.
//!
//! A [`LockingBackgroundTask`] wraps a unit of work. [`LockingBackgroundTask::run`]
//! try-acquires the task; a second caller gets [`RunError::AlreadyRunning`]
//! immediately instead of queueing. A failed run releases the task before the
//! error is returned. A successful run stays acquired until the work calls
//! [`Done::release`], which may happen later from background work it spawned.
//!
//! [`TaskScheduler`] drives a task from a periodic ticker and from explicit
//! on-demand triggers, both going through the same try-acquire.

pub mod scheduler;
pub mod task;

pub use scheduler::TaskScheduler;
pub use task::{Done, LockingBackgroundTask, RunError, TaskContext, TaskState};
