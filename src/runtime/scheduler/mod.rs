//! Task scheduler for cooperative multi-worker execution
//!
//! This module provides the [`SchedulerPool`], which runs tasks on a dynamic
//! set of worker threads that share one dispatch queue.
//!
//! # Architecture
//!
//! ```text
//! host ── add_worker ──► spawn thread ─► on_start ─► loop {
//!   │                                                  find_work ─► Job::run
//!   │                                                  ─► task_completed / reschedule
//!   │                                                }
//!   ├── add_task ──► SharedSchedulerState (one lock, one condvar)
//!   └── run ───────► reap exited workers, deliver relayed faults
//! ```
//!
//! # Guarantees
//!
//! - A task runs on at most one worker at a time.
//! - A task is never claimed while any of its dependencies is still queued.
//! - A task with a non-empty affinity list only runs on the listed workers.
//! - Shutdown is cooperative: a running invocation is never interrupted.
//!
//! # Contract checks
//!
//! Misuse that indicates a programmer error (completing a task twice,
//! adding a dependency from the wrong thread, removing an unknown worker)
//! panics when `debug_assertions` or the `strict-contracts` feature is
//! enabled. Other builds log the violation at `error` and skip the
//! offending operation.

macro_rules! contract_violation {
    ($($arg:tt)*) => {{
        if cfg!(any(debug_assertions, feature = "strict-contracts")) {
            panic!($($arg)*);
        } else {
            tracing::error!($($arg)*);
        }
    }};
}

pub mod error;
pub mod queue;
pub mod task;
pub mod worker;

pub use error::{FaultKind, RejectedTask, SchedulerError, SchedulerResult, WorkerFault};
pub use queue::{ClaimedTask, SharedSchedulerState, TaskHandle};
pub use task::{
    job_fn, FnJob, Job, RunStatus, Task, TaskBuilder, TaskContext, TaskId, TaskIdGenerator,
    TaskInfo, TaskPriority, TaskState,
};
pub use worker::{
    current_worker, WorkerDescriptor, WorkerId, WorkerResource, WorkerState, WorkerStatus,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use self::worker::{worker_main, StartupReport};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker thread name prefix; the worker id is appended.
    pub thread_name_prefix: String,
    /// Native stack size for worker threads.
    pub stack_size: Option<usize>,
    /// Number of undelivered faults the relay keeps.
    pub fault_capacity: usize,
    /// How long `add_worker` waits for `on_start`. `None` waits forever.
    pub startup_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "taskweave-worker".to_string(),
            stack_size: None,
            fault_capacity: 8,
            startup_timeout: None,
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total tasks accepted.
    pub tasks_scheduled: AtomicUsize,
    /// Tasks that finished successfully.
    pub tasks_completed: AtomicUsize,
    /// Tasks that ended in `Error`.
    pub tasks_failed: AtomicUsize,
    /// Invocations that ended in `Paused`.
    pub tasks_rescheduled: AtomicUsize,
    /// Submissions refused.
    pub tasks_rejected: AtomicUsize,
    /// Faults dropped because the relay was full.
    pub faults_dropped: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Invocations currently executing.
    pub running: AtomicUsize,
    /// Peak number of concurrent invocations.
    pub peak_parallelism: AtomicUsize,
}

impl SchedulerStats {
    /// Record a scheduled task.
    #[inline]
    pub fn record_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a completed task.
    #[inline]
    pub fn record_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a failed task.
    #[inline]
    pub fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a reschedule.
    #[inline]
    pub fn record_rescheduled(&self) {
        self.tasks_rescheduled.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a rejected submission.
    #[inline]
    pub fn record_rejected(&self) {
        self.tasks_rejected.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a dropped fault.
    #[inline]
    pub fn record_fault_dropped(&self) {
        self.faults_dropped.fetch_add(1, Ordering::SeqCst);
    }

    /// An invocation is about to run.
    #[inline]
    pub fn task_started(&self) {
        let current = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_parallelism(current);
    }

    /// An invocation returned after `duration_us`.
    #[inline]
    pub fn task_finished(
        &self,
        duration_us: usize,
    ) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::SeqCst);
    }

    /// Update parallelism.
    #[inline]
    pub fn update_parallelism(
        &self,
        current: usize,
    ) {
        loop {
            let peak = self.peak_parallelism.load(Ordering::SeqCst);
            if current <= peak {
                break;
            }
            if self
                .peak_parallelism
                .compare_exchange(peak, current, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Tasks that reached a terminal state.
    pub fn tasks_done(&self) -> usize {
        self.tasks_completed.load(Ordering::SeqCst) + self.tasks_failed.load(Ordering::SeqCst)
    }
}

/// Worker pool over one shared dispatch queue.
///
/// The pool is an explicit context object: independent pools do not share
/// any state. Dropping the pool shuts it down and joins every worker.
#[derive(Debug)]
pub struct SchedulerPool {
    /// Configuration.
    config: SchedulerConfig,
    /// Queue shared with every worker thread.
    shared: Arc<SharedSchedulerState>,
    /// Live workers by id.
    workers: BTreeMap<WorkerId, WorkerDescriptor>,
    /// Next worker id; never reused.
    next_worker: u32,
    /// Statistics.
    stats: Arc<SchedulerStats>,
}

impl SchedulerPool {
    /// Create a pool with default config and no workers.
    #[inline]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a pool with custom configuration and no workers.
    pub fn with_config(config: SchedulerConfig) -> Self {
        let stats = Arc::new(SchedulerStats::default());
        let shared = Arc::new(SharedSchedulerState::new(config.fault_capacity, stats.clone()));

        Self {
            config,
            shared,
            workers: BTreeMap::new(),
            next_worker: 0,
            stats,
        }
    }

    /// Start a worker that owns `resource`.
    ///
    /// Blocks until the worker has run `on_start`. See
    /// [`add_worker_with`](Self::add_worker_with).
    pub fn add_worker<R>(
        &mut self,
        resource: R,
    ) -> SchedulerResult<WorkerId>
    where
        R: WorkerResource + Send,
    {
        self.add_worker_with(move || resource)
    }

    /// Start a worker whose resource is built by `ctor` on the worker thread.
    ///
    /// The resource never leaves that thread, so it does not have to be
    /// `Send`. Blocks until `on_start` returns. If it fails, the worker is
    /// stopped and joined, the set of workers is left unchanged, and the
    /// error from `on_start` is returned.
    pub fn add_worker_with<R, F>(
        &mut self,
        ctor: F,
    ) -> SchedulerResult<WorkerId>
    where
        R: WorkerResource,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.shared.is_shutdown() {
            return Err(SchedulerError::ShutDown);
        }

        let id = WorkerId(self.next_worker);
        self.next_worker += 1;

        let name = format!("{}-{}", self.config.thread_name_prefix, id.inner());
        let status = Arc::new(WorkerStatus::new());
        let (started_tx, started_rx) = crossbeam::channel::bounded::<StartupReport>(1);

        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }

        let handle = {
            let status = status.clone();
            let shared = self.shared.clone();
            builder.spawn(move || worker_main(id, ctor, status, shared, started_tx))?
        };
        let mut descriptor = WorkerDescriptor::new(id, name, handle, status);

        let report = match self.config.startup_timeout {
            Some(timeout) => match started_rx.recv_timeout(timeout) {
                Ok(report) => Some(report),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    descriptor.join();
                    return Err(SchedulerError::WorkerLost(id));
                }
            },
            None => match started_rx.recv() {
                Ok(report) => Some(report),
                Err(_) => {
                    descriptor.join();
                    return Err(SchedulerError::WorkerLost(id));
                }
            },
        };

        match report {
            Some(Ok(())) => {
                info!(worker = %id, "worker added");
                self.workers.insert(id, descriptor);
                Ok(id)
            }
            Some(Err(error)) => {
                descriptor.join();
                warn!(worker = %id, error = %format!("{:#}", error), "worker failed to start");
                Err(SchedulerError::WorkerStartFailed { worker: id, error })
            }
            None => {
                // Still inside on_start: ask it to leave as soon as it is done.
                descriptor.status().request_exit();
                self.shared.wake_all();
                descriptor.detach();
                warn!(worker = %id, "worker did not start in time, detaching");
                Err(SchedulerError::WorkerLost(id))
            }
        }
    }

    /// Stop a worker and join its thread.
    ///
    /// The worker finishes its current invocation, runs `on_stop` and exits.
    /// Tasks pinned only to this worker stay queued and will not run.
    pub fn remove_worker(
        &mut self,
        id: WorkerId,
    ) -> SchedulerResult<()> {
        let Some(mut descriptor) = self.workers.remove(&id) else {
            contract_violation!("remove_worker: unknown {}", id);
            return Err(SchedulerError::UnknownWorker(id));
        };

        descriptor.status().request_exit();
        self.shared.wake_all();
        descriptor.join();

        let stranded = self.shared.pinned_only_to(id);
        if stranded > 0 {
            warn!(worker = %id, stranded, "removed worker still has pinned tasks queued");
        }
        info!(worker = %id, "worker removed");
        Ok(())
    }

    /// Submit a task.
    ///
    /// Returns the assigned id. Fails with [`SchedulerError::FaultPending`]
    /// while a relayed fault has not been handled; the task can be taken
    /// back with [`SchedulerError::into_rejected_task`].
    pub fn add_task(
        &self,
        task: Task,
    ) -> SchedulerResult<TaskId> {
        self.shared.add_task(task)
    }

    /// Host tick.
    ///
    /// Joins workers that have exited on their own and delivers the oldest
    /// relayed fault, if any. Does not dispatch tasks.
    pub fn run(&mut self) -> SchedulerResult<()> {
        let exited: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.status().ready_to_join())
            .map(WorkerDescriptor::id)
            .collect();
        for id in exited {
            if let Some(mut descriptor) = self.workers.remove(&id) {
                descriptor.join();
                debug!(worker = %id, "reaped exited worker");
            }
        }

        match self.shared.take_fault() {
            Some(fault) => Err(SchedulerError::Worker(fault)),
            None => Ok(()),
        }
    }

    /// Take the oldest relayed fault.
    #[inline]
    pub fn poll_fault(&self) -> Option<WorkerFault> {
        self.shared.take_fault()
    }

    /// Block until every submitted task has left the queue, or `timeout`
    /// elapses. Returns whether the queue drained.
    #[inline]
    pub fn wait_idle(
        &self,
        timeout: Duration,
    ) -> bool {
        self.shared.wait_idle(timeout)
    }

    /// Number of live workers.
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Ids of live workers, ascending.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    /// State of a live worker.
    pub fn worker_state(
        &self,
        id: WorkerId,
    ) -> Option<WorkerState> {
        self.workers.get(&id).map(|w| w.status().state())
    }

    /// Snapshot of a queued task.
    #[inline]
    pub fn task_info(
        &self,
        id: TaskId,
    ) -> Option<TaskInfo> {
        self.shared.task_info(id)
    }

    /// Number of queued tasks, running ones included.
    #[inline]
    pub fn pending_tasks(&self) -> usize {
        self.shared.len()
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get the shared queue.
    #[inline]
    pub fn shared(&self) -> &Arc<SharedSchedulerState> {
        &self.shared
    }

    /// Check if the pool accepts work.
    #[inline]
    pub fn is_running(&self) -> bool {
        !self.shared.is_shutdown()
    }

    /// Shutdown the pool.
    ///
    /// Workers finish their current invocation, run `on_stop` and are
    /// joined. Queued tasks are discarded.
    pub fn shutdown(&mut self) {
        self.shared.shutdown();

        for (_, mut worker) in std::mem::take(&mut self.workers) {
            worker.status().request_exit();
            worker.join();
        }
    }
}

impl Default for SchedulerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SchedulerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests;
