//! Worker threads.
//!
//! A worker is a native thread paired with a host-supplied
//! [`WorkerResource`]. The resource is constructed on the worker thread and
//! never leaves it, so resources that must stay on one thread (graphics
//! contexts and the like) can skip their own locking.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::Sender;
use tracing::{debug, error, trace};

use super::error::{FaultKind, WorkerFault};
use super::queue::{ClaimedTask, SharedSchedulerState};
use super::task::{RunStatus, TaskContext, TaskState};

/// Unique worker identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u32);

impl WorkerId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Worker({})", self.0)
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// The worker running on the calling thread, if any.
pub fn current_worker() -> Option<WorkerId> {
    CURRENT_WORKER.with(|w| w.get())
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Thread spawned, `on_start` not finished yet.
    Uninitialized,
    /// Executing or looking for work.
    Running,
    /// Waiting for work.
    Idle,
    /// `on_start` failed; the worker never entered its loop.
    InitializationError,
    /// `on_stop` has run.
    Stopped,
}

impl WorkerState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => WorkerState::Uninitialized,
            1 => WorkerState::Running,
            2 => WorkerState::Idle,
            3 => WorkerState::InitializationError,
            4 => WorkerState::Stopped,
            _ => WorkerState::Uninitialized,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            WorkerState::Uninitialized => 0,
            WorkerState::Running => 1,
            WorkerState::Idle => 2,
            WorkerState::InitializationError => 3,
            WorkerState::Stopped => 4,
        }
    }
}

/// Thread-exclusive state owned by a worker.
///
/// `on_start` runs on the worker thread before it takes any task; an error
/// there is handed back to the `add_worker` caller. `on_stop` always runs
/// before the thread exits, including after a failed start.
pub trait WorkerResource: 'static {
    /// Acquire thread-bound resources.
    fn on_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release them.
    fn on_stop(&mut self) {}
}

impl WorkerResource for () {}

/// Flags shared between the host-side descriptor and the worker thread.
#[derive(Debug)]
pub struct WorkerStatus {
    state: AtomicU8,
    should_exit: AtomicBool,
    ready_to_join: AtomicBool,
}

impl WorkerStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Uninitialized.as_u8()),
            should_exit: AtomicBool::new(false),
            ready_to_join: AtomicBool::new(false),
        }
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_state(
        &self,
        state: WorkerState,
    ) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Whether the worker was asked to exit.
    #[inline]
    pub fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn request_exit(&self) {
        self.should_exit.store(true, Ordering::SeqCst);
    }

    /// Whether the thread has run `on_stop` and can be joined.
    #[inline]
    pub fn ready_to_join(&self) -> bool {
        self.ready_to_join.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn mark_ready_to_join(&self) {
        self.ready_to_join.store(true, Ordering::SeqCst);
    }
}

/// Host-side bookkeeping for one worker.
pub struct WorkerDescriptor {
    id: WorkerId,
    name: String,
    handle: Option<JoinHandle<()>>,
    status: Arc<WorkerStatus>,
}

impl fmt::Debug for WorkerDescriptor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WorkerDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.status.state())
            .field("should_exit", &self.status.should_exit())
            .field("ready_to_join", &self.status.ready_to_join())
            .field("joined", &self.handle.is_none())
            .finish()
    }
}

impl WorkerDescriptor {
    pub(crate) fn new(
        id: WorkerId,
        name: String,
        handle: JoinHandle<()>,
        status: Arc<WorkerStatus>,
    ) -> Self {
        Self {
            id,
            name,
            handle: Some(handle),
            status,
        }
    }

    /// Get the worker ID.
    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Native thread name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the shared status.
    #[inline]
    pub fn status(&self) -> &Arc<WorkerStatus> {
        &self.status
    }

    /// Wait for the native thread to finish.
    ///
    /// The worker catches every panic it can observe, so a join error means
    /// the thread died in a way the loop could not report.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.id, "worker thread terminated abnormally");
            }
        }
    }

    /// Give up on the native thread without waiting for it.
    pub(crate) fn detach(&mut self) {
        self.handle.take();
    }
}

/// What the worker reports back to `add_worker`.
pub(crate) type StartupReport = Result<(), anyhow::Error>;

/// Native thread entry point.
pub(crate) fn worker_main<R, F>(
    id: WorkerId,
    ctor: F,
    status: Arc<WorkerStatus>,
    shared: Arc<SharedSchedulerState>,
    started: Sender<StartupReport>,
) where
    R: WorkerResource,
    F: FnOnce() -> R,
{
    CURRENT_WORKER.with(|w| w.set(Some(id)));

    let mut resource = match start_resource(ctor) {
        Ok(resource) => resource,
        Err((resource, err)) => {
            status.set_state(WorkerState::InitializationError);
            if let Some(mut resource) = resource {
                stop_resource(id, &mut resource, &shared);
            }
            status.mark_ready_to_join();
            debug!(worker = %id, "worker failed to start");
            // The receiver may have timed out already.
            let _ = started.send(Err(err));
            return;
        }
    };

    status.set_state(WorkerState::Running);
    let _ = started.send(Ok(()));
    drop(started);
    debug!(worker = %id, "worker started");

    let looped = panic::catch_unwind(AssertUnwindSafe(|| {
        run_loop(id, &mut resource, &status, &shared);
    }));
    if let Err(payload) = looped {
        let err = anyhow::anyhow!("{}", panic_message(payload.as_ref()));
        error!(worker = %id, error = %err, "worker loop panicked");
        shared.push_fault(WorkerFault::new(id, None, FaultKind::WorkerPanicked, err));
    }

    stop_resource(id, &mut resource, &shared);
    status.set_state(WorkerState::Stopped);
    status.mark_ready_to_join();
    shared.wake_all();
    debug!(worker = %id, "worker stopped");
}

type StartFailure<R> = (Option<R>, anyhow::Error);

fn start_resource<R, F>(ctor: F) -> Result<R, StartFailure<R>>
where
    R: WorkerResource,
    F: FnOnce() -> R,
{
    let mut resource = match panic::catch_unwind(AssertUnwindSafe(ctor)) {
        Ok(resource) => resource,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            return Err((None, anyhow::anyhow!("worker resource constructor panicked: {}", msg)));
        }
    };

    match panic::catch_unwind(AssertUnwindSafe(|| resource.on_start())) {
        Ok(Ok(())) => Ok(resource),
        Ok(Err(err)) => Err((Some(resource), err)),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            Err((Some(resource), anyhow::anyhow!("on_start panicked: {}", msg)))
        }
    }
}

fn stop_resource<R: WorkerResource>(
    id: WorkerId,
    resource: &mut R,
    shared: &SharedSchedulerState,
) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| resource.on_stop())) {
        let err = anyhow::anyhow!("{}", panic_message(payload.as_ref()));
        error!(worker = %id, error = %err, "on_stop panicked");
        shared.push_fault(WorkerFault::new(id, None, FaultKind::StopPanicked, err));
    }
}

fn run_loop<R: WorkerResource>(
    id: WorkerId,
    resource: &mut R,
    status: &WorkerStatus,
    shared: &SharedSchedulerState,
) {
    while let Some(claimed) = shared.next_task(id, status) {
        status.set_state(WorkerState::Running);
        execute(id, resource, claimed, shared);
    }
}

/// Run one invocation and route the result back to the queue.
fn execute<R: WorkerResource>(
    id: WorkerId,
    resource: &mut R,
    mut claimed: ClaimedTask,
    shared: &SharedSchedulerState,
) {
    let handle = claimed.handle();
    let task = handle.task();
    let stats = shared.stats();
    stats.task_started();
    let start = Instant::now();

    let mut cx = TaskContext::new(task, id, claimed.invocation(), resource as &mut dyn Any);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| claimed.job_mut().run(&mut cx)));
    let added = cx.into_added_dependencies();

    stats.task_finished(start.elapsed().as_micros() as usize);

    if let Ok(Ok(RunStatus::Paused)) = outcome {
        trace!(worker = %id, %task, "task paused");
        shared.reschedule(claimed, added);
        return;
    }

    // Terminal: the job is dropped here, and its destructor is task code too.
    let dropped = panic::catch_unwind(AssertUnwindSafe(move || drop(claimed)));

    let mut failed = false;
    match outcome {
        Ok(Ok(_)) => {}
        // Faults go in before the task leaves the queue so that they are
        // visible to anyone woken by the removal.
        Ok(Err(err)) => {
            error!(worker = %id, %task, error = %format!("{:#}", err), "task failed");
            shared.push_fault(WorkerFault::new(id, Some(task), FaultKind::TaskFailed, err));
            failed = true;
        }
        Err(payload) => {
            let err = anyhow::anyhow!("{}", panic_message(payload.as_ref()));
            error!(worker = %id, %task, error = %err, "task panicked");
            shared.push_fault(WorkerFault::new(id, Some(task), FaultKind::TaskPanicked, err));
            failed = true;
        }
    }
    if let Err(payload) = dropped {
        let err = anyhow::anyhow!("job dropped with a panic: {}", panic_message(payload.as_ref()));
        error!(worker = %id, %task, error = %err, "task panicked");
        shared.push_fault(WorkerFault::new(id, Some(task), FaultKind::TaskPanicked, err));
        failed = true;
    }

    if failed {
        shared.task_completed_as(handle, TaskState::Error);
    } else {
        trace!(worker = %id, %task, "task finished");
        shared.task_completed_as(handle, TaskState::Finished);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
