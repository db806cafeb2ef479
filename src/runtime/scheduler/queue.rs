//! Shared dispatch queue
//!
//! One mutex guards the whole queue. Workers hold it only while scanning for
//! or mutating tasks, never while a task runs.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use super::error::{RejectedTask, SchedulerError, SchedulerResult, WorkerFault};
use super::task::{Job, Task, TaskId, TaskIdGenerator, TaskInfo, TaskState};
use super::worker::{WorkerId, WorkerState, WorkerStatus};
use super::SchedulerStats;

/// Identifies one claim of one task.
///
/// Handles are plain values; completing the same handle twice is a contract
/// violation that the queue detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    task: TaskId,
    worker: WorkerId,
}

impl TaskHandle {
    #[cfg(test)]
    pub(crate) fn new(
        task: TaskId,
        worker: WorkerId,
    ) -> Self {
        Self { task, worker }
    }

    /// The claimed task.
    #[inline]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// The claiming worker.
    #[inline]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

/// A task claimed by a worker: its handle plus the job to run.
pub struct ClaimedTask {
    handle: TaskHandle,
    invocation: u32,
    job: Box<dyn Job>,
}

impl ClaimedTask {
    #[cfg(test)]
    pub(crate) fn new(
        handle: TaskHandle,
        invocation: u32,
        job: Box<dyn Job>,
    ) -> Self {
        Self {
            handle,
            invocation,
            job,
        }
    }

    /// Get the handle.
    #[inline]
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    /// Claim counter for this task, starting at 1.
    #[inline]
    pub fn invocation(&self) -> u32 {
        self.invocation
    }

    /// The job to run.
    #[inline]
    pub fn job_mut(&mut self) -> &mut dyn Job {
        self.job.as_mut()
    }
}

impl fmt::Debug for ClaimedTask {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ClaimedTask")
            .field("handle", &self.handle)
            .field("invocation", &self.invocation)
            .finish()
    }
}

/// Bounded FIFO of undelivered worker faults.
///
/// With capacity 1 this is a single-slot relay. Faults arriving while the
/// relay is full are dropped and counted.
#[derive(Debug)]
struct FaultRelay {
    faults: VecDeque<WorkerFault>,
    capacity: usize,
}

impl FaultRelay {
    fn new(capacity: usize) -> Self {
        Self {
            faults: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }
}

#[derive(Debug)]
struct QueueInner {
    /// Insertion order is scan order.
    tasks: IndexMap<TaskId, Task>,
    ids: TaskIdGenerator,
    shutdown: bool,
    relay: FaultRelay,
}

impl QueueInner {
    /// First eligible task for `worker`, in queue order.
    ///
    /// A priority pass over the eligible candidates would slot in here.
    fn first_eligible(
        &self,
        worker: WorkerId,
    ) -> Option<usize> {
        self.tasks.values().position(|task| {
            task.state() != TaskState::Running
                && task.runs_on(worker)
                && !task
                    .dependencies()
                    .iter()
                    .any(|dep| self.tasks.contains_key(dep))
        })
    }
}

/// The single cross-thread scheduler object.
pub struct SharedSchedulerState {
    inner: Mutex<QueueInner>,
    wakeup: Condvar,
    stats: Arc<SchedulerStats>,
}

impl fmt::Debug for SharedSchedulerState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SharedSchedulerState")
            .field("tasks", &inner.tasks.len())
            .field("shutdown", &inner.shutdown)
            .field("pending_faults", &inner.relay.faults.len())
            .finish()
    }
}

impl SharedSchedulerState {
    /// Create an empty queue whose fault relay holds `fault_capacity` faults.
    pub fn new(
        fault_capacity: usize,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: IndexMap::new(),
                ids: TaskIdGenerator::new(),
                shutdown: false,
                relay: FaultRelay::new(fault_capacity),
            }),
            wakeup: Condvar::new(),
            stats,
        }
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    /// Submit a task at the back of the queue.
    ///
    /// Rejected while a worker fault is waiting in the relay, and after
    /// shutdown. A task refused because of a pending fault comes back inside
    /// the error.
    pub fn add_task(
        &self,
        mut task: Task,
    ) -> SchedulerResult<TaskId> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            self.stats.record_rejected();
            return Err(SchedulerError::ShutDown);
        }
        if let Some(fault) = inner.relay.faults.front() {
            self.stats.record_rejected();
            return Err(SchedulerError::FaultPending {
                worker: fault.worker,
                task: fault.task,
                rejected: RejectedTask::new(task),
            });
        }

        let id = inner.ids.next();
        task.assign_id(id);
        trace!(%id, name = task.name(), "task queued");
        inner.tasks.insert(id, task);
        drop(inner);

        self.stats.record_scheduled();
        self.wakeup.notify_all();
        Ok(id)
    }

    /// Claim the first eligible task for `worker`, without blocking.
    ///
    /// Skips tasks that are running, tasks whose affinity excludes `worker`,
    /// and tasks with a dependency still present in the queue.
    pub fn find_work(
        &self,
        worker: WorkerId,
    ) -> Option<ClaimedTask> {
        let mut inner = self.inner.lock();
        Self::claim(&mut inner, worker)
    }

    fn claim(
        inner: &mut QueueInner,
        worker: WorkerId,
    ) -> Option<ClaimedTask> {
        let index = inner.first_eligible(worker)?;
        let (&task, entry) = inner.tasks.get_index_mut(index)?;
        let (job, invocation) = entry.claim(worker)?;
        Some(ClaimedTask {
            handle: TaskHandle { task, worker },
            invocation,
            job,
        })
    }

    /// Blocking form of [`find_work`](Self::find_work) used by worker threads.
    ///
    /// Returns `None` once the pool shuts down or the worker is asked to
    /// exit.
    pub(crate) fn next_task(
        &self,
        worker: WorkerId,
        status: &WorkerStatus,
    ) -> Option<ClaimedTask> {
        let mut inner = self.inner.lock();
        loop {
            if inner.shutdown || status.should_exit() {
                return None;
            }
            if let Some(claimed) = Self::claim(&mut inner, worker) {
                return Some(claimed);
            }
            status.set_state(WorkerState::Idle);
            self.wakeup.wait(&mut inner);
        }
    }

    /// Remove a finished task from the queue.
    pub fn task_completed(
        &self,
        handle: TaskHandle,
    ) {
        self.task_completed_as(handle, TaskState::Finished);
    }

    pub(crate) fn task_completed_as(
        &self,
        handle: TaskHandle,
        state: TaskState,
    ) {
        let mut inner = self.inner.lock();
        match inner.tasks.get(&handle.task).map(Task::running_worker) {
            None => {
                drop(inner);
                contract_violation!("{} completed twice or never queued", handle.task);
                return;
            }
            Some(running) if running != Some(handle.worker) => {
                drop(inner);
                contract_violation!("{} completed by {} which does not run it", handle.task, handle.worker);
                return;
            }
            Some(_) => {}
        }

        inner.tasks.shift_remove(&handle.task);
        drop(inner);

        if state == TaskState::Error {
            self.stats.record_failed();
        } else {
            self.stats.record_completed();
        }
        self.wakeup.notify_all();
    }

    /// Move a claimed task to the back of the queue as `Paused`.
    ///
    /// Existing dependencies are kept; `extra_dependencies` are merged in.
    pub fn reschedule(
        &self,
        claimed: ClaimedTask,
        extra_dependencies: Vec<TaskId>,
    ) {
        let ClaimedTask { handle, job, .. } = claimed;
        let mut inner = self.inner.lock();
        match inner.tasks.get(&handle.task).map(Task::running_worker) {
            None => {
                drop(inner);
                contract_violation!("{} rescheduled but not queued", handle.task);
                return;
            }
            Some(running) if running != Some(handle.worker) => {
                drop(inner);
                contract_violation!("{} rescheduled by {} which does not run it", handle.task, handle.worker);
                return;
            }
            Some(_) => {}
        }

        let Some(mut task) = inner.tasks.shift_remove(&handle.task) else {
            return;
        };
        task.pause(job, extra_dependencies);
        inner.tasks.insert(handle.task, task);
        drop(inner);

        self.stats.record_rescheduled();
        self.wakeup.notify_all();
    }

    /// Snapshot of a queued task. `None` once it has left the queue.
    pub fn task_info(
        &self,
        id: TaskId,
    ) -> Option<TaskInfo> {
        self.inner.lock().tasks.get(&id).map(Task::info)
    }

    /// Queued task ids in scan order.
    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.inner.lock().tasks.keys().copied().collect()
    }

    /// Tasks queued that may only run on `worker`.
    pub(crate) fn pinned_only_to(
        &self,
        worker: WorkerId,
    ) -> usize {
        self.inner
            .lock()
            .tasks
            .values()
            .filter(|task| matches!(task.affinity(), [only] if *only == worker))
            .count()
    }

    /// Number of queued tasks, running ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().tasks.is_empty()
    }

    /// Put a fault into the relay.
    pub fn push_fault(
        &self,
        fault: WorkerFault,
    ) {
        let mut inner = self.inner.lock();
        if inner.relay.faults.len() >= inner.relay.capacity {
            drop(inner);
            error!(fault = %fault, "fault relay full, dropping fault");
            self.stats.record_fault_dropped();
            return;
        }
        inner.relay.faults.push_back(fault);
    }

    /// Take the oldest undelivered fault.
    pub fn take_fault(&self) -> Option<WorkerFault> {
        self.inner.lock().relay.faults.pop_front()
    }

    /// Whether a fault is waiting to be handled.
    pub fn has_pending_fault(&self) -> bool {
        !self.inner.lock().relay.faults.is_empty()
    }

    /// Number of faults waiting to be handled.
    pub fn pending_faults(&self) -> usize {
        self.inner.lock().relay.faults.len()
    }

    /// Block until the queue is empty or `timeout` elapses.
    ///
    /// A timeout too large to express as a deadline waits without one.
    pub fn wait_idle(
        &self,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();
        while !inner.tasks.is_empty() {
            match deadline {
                Some(deadline) => {
                    if self.wakeup.wait_until(&mut inner, deadline).timed_out() {
                        return inner.tasks.is_empty();
                    }
                }
                None => self.wakeup.wait(&mut inner),
            }
        }
        true
    }

    /// Stop handing out work and wake every waiter.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if !inner.shutdown {
            inner.shutdown = true;
            if !inner.tasks.is_empty() {
                debug!(discarded = inner.tasks.len(), "shutting down with queued tasks");
            }
        }
        drop(inner);
        self.wakeup.notify_all();
    }

    /// Check if the queue was shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    /// Wake every waiter.
    ///
    /// Takes the lock first so a worker between its exit check and its wait
    /// cannot miss the signal.
    pub fn wake_all(&self) {
        let _inner = self.inner.lock();
        self.wakeup.notify_all();
    }
}
