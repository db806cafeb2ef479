//! Scheduler errors and worker faults.

use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;

use super::task::{Task, TaskId};
use super::worker::WorkerId;

/// What went wrong on a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A job returned `Err`.
    TaskFailed,
    /// A job panicked.
    TaskPanicked,
    /// The worker loop itself panicked outside of a job.
    WorkerPanicked,
    /// `WorkerResource::on_stop` panicked.
    StopPanicked,
}

impl fmt::Display for FaultKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            FaultKind::TaskFailed => "task failed",
            FaultKind::TaskPanicked => "task panicked",
            FaultKind::WorkerPanicked => "worker panicked",
            FaultKind::StopPanicked => "stop hook panicked",
        };
        f.write_str(s)
    }
}

/// A runtime fault captured on a worker thread and relayed to the host.
#[derive(Debug, Error)]
#[error("{kind} on {worker}{}: {error:#}", task_suffix(.task))]
pub struct WorkerFault {
    /// Worker that observed the fault.
    pub worker: WorkerId,
    /// Task being executed, if any.
    pub task: Option<TaskId>,
    /// Fault category.
    pub kind: FaultKind,
    /// The captured error.
    #[source]
    pub error: anyhow::Error,
}

fn task_suffix(task: &Option<TaskId>) -> String {
    match task {
        Some(id) => format!(" ({})", id),
        None => String::new(),
    }
}

impl WorkerFault {
    pub(crate) fn new(
        worker: WorkerId,
        task: Option<TaskId>,
        kind: FaultKind,
        error: anyhow::Error,
    ) -> Self {
        Self {
            worker,
            task,
            kind,
            error,
        }
    }
}

/// A submission handed back by [`SchedulerError::FaultPending`].
///
/// Jobs are only `Send`, so the task sits behind a lock to keep the error
/// `Sync`.
pub struct RejectedTask(Mutex<Task>);

impl RejectedTask {
    pub(crate) fn new(task: Task) -> Self {
        Self(Mutex::new(task))
    }

    /// Take the task back, ready to resubmit.
    pub fn into_inner(self) -> Task {
        self.0.into_inner()
    }
}

impl fmt::Debug for RejectedTask {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.0.try_lock() {
            Some(task) => f.debug_tuple("RejectedTask").field(&task.name()).finish(),
            None => f.write_str("RejectedTask(..)"),
        }
    }
}

/// Errors returned by the scheduler pool.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `WorkerResource::on_start` failed (or panicked); the worker never ran.
    #[error("{worker} failed to start: {error:#}")]
    WorkerStartFailed {
        worker: WorkerId,
        #[source]
        error: anyhow::Error,
    },

    /// A worker fault is waiting to be handled; submissions are rejected
    /// until it is consumed with `poll_fault` or `run`. The refused task is
    /// returned in `rejected`.
    #[error("task rejected: unhandled fault from {worker}")]
    FaultPending {
        worker: WorkerId,
        task: Option<TaskId>,
        rejected: RejectedTask,
    },

    /// A fault delivered by the host tick.
    #[error(transparent)]
    Worker(#[from] WorkerFault),

    /// No worker with this id is registered.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// The native thread could not be created.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The worker thread exited or stalled without reporting startup.
    #[error("{0} did not report startup")]
    WorkerLost(WorkerId),

    /// The pool is shutting down.
    #[error("scheduler is shut down")]
    ShutDown,
}

impl SchedulerError {
    /// The task refused by a submission, if this error carries one.
    pub fn into_rejected_task(self) -> Option<Task> {
        match self {
            SchedulerError::FaultPending { rejected, .. } => Some(rejected.into_inner()),
            _ => None,
        }
    }
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
