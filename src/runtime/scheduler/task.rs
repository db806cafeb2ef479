//! Task definitions for the scheduler.
//!
//! A task is a unit of deferred work that may take several invocations to
//! complete. Each invocation re-enters [`Job::run`] from the top: pausing a
//! task does not keep a continuation, so a job keeps its progress in its own
//! fields (resumable polling).

use std::any::Any;
use std::fmt;

use super::worker::{current_worker, WorkerId};

/// Unique task identifier.
///
/// Assigned when a task is submitted. Identifiers increase monotonically and
/// are never reused within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl From<TaskId> for u64 {
    fn from(val: TaskId) -> Self {
        val.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// Submitted, never claimed.
    #[default]
    NotStarted,
    /// Claimed by exactly one worker.
    Running,
    /// Yielded; waiting at the back of the queue to be claimed again.
    Paused,
    /// Completed successfully. Terminal.
    Finished,
    /// Failed or panicked. Terminal.
    Error,
}

impl TaskState {
    /// Whether the state is terminal (`Finished` or `Error`).
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Error)
    }
}

/// Task priority levels.
///
/// Carried on every task and reported through [`TaskInfo`]. Selection is
/// strictly first-eligible in queue order; a priority pass over the eligible
/// candidates is not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Default, Hash)]
pub enum TaskPriority {
    /// Low priority tasks.
    Low = 0,
    /// Normal priority (default).
    #[default]
    Normal = 1,
    /// High priority tasks.
    High = 2,
    /// Critical priority tasks.
    Critical = 3,
}

/// Result of one successful invocation of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// More work remains; requeue at the back.
    Paused,
    /// Done; remove from the queue.
    Finished,
}

/// The body of a task.
///
/// `run` is called once per claim. Returning `Err` (or panicking) moves the
/// task to [`TaskState::Error`] and reports a fault to the pool.
pub trait Job: Send + 'static {
    /// Execute one invocation.
    fn run(
        &mut self,
        cx: &mut TaskContext<'_>,
    ) -> anyhow::Result<RunStatus>;
}

/// A [`Job`] backed by a closure. See [`job_fn`].
pub struct FnJob<F>(F);

/// Wrap a closure as a [`Job`].
pub fn job_fn<F>(f: F) -> FnJob<F>
where
    F: FnMut(&mut TaskContext<'_>) -> anyhow::Result<RunStatus> + Send + 'static,
{
    FnJob(f)
}

impl<F> Job for FnJob<F>
where
    F: FnMut(&mut TaskContext<'_>) -> anyhow::Result<RunStatus> + Send + 'static,
{
    fn run(
        &mut self,
        cx: &mut TaskContext<'_>,
    ) -> anyhow::Result<RunStatus> {
        (self.0)(cx)
    }
}

impl<F> fmt::Debug for FnJob<F> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str("FnJob")
    }
}

/// Per-invocation view handed to [`Job::run`].
///
/// Lives only for the duration of one invocation on the worker that claimed
/// the task.
pub struct TaskContext<'a> {
    task: TaskId,
    worker: WorkerId,
    invocation: u32,
    resource: &'a mut dyn Any,
    added_dependencies: Vec<TaskId>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        task: TaskId,
        worker: WorkerId,
        invocation: u32,
        resource: &'a mut dyn Any,
    ) -> Self {
        Self {
            task,
            worker,
            invocation,
            resource,
            added_dependencies: Vec::new(),
        }
    }

    /// The running task.
    #[inline]
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// The worker executing this invocation.
    #[inline]
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Number of times this task has been claimed, starting at 1.
    #[inline]
    pub fn invocation(&self) -> u32 {
        self.invocation
    }

    /// Borrow the executing worker's resource, if it is an `R`.
    pub fn resource<R: 'static>(&mut self) -> Option<&mut R> {
        self.resource.downcast_mut::<R>()
    }

    /// Add a dependency to the running task.
    ///
    /// Takes effect when the invocation returns [`RunStatus::Paused`]: the
    /// task will not be claimed again while `id` is still queued. Must be
    /// called on the worker that owns this invocation.
    pub fn add_dependency(
        &mut self,
        id: TaskId,
    ) {
        if current_worker() != Some(self.worker) {
            contract_violation!(
                "add_dependency for {} called off its worker {}",
                self.task,
                self.worker
            );
            return;
        }
        if id == self.task {
            contract_violation!("{} cannot depend on itself", self.task);
            return;
        }
        if !self.added_dependencies.contains(&id) {
            self.added_dependencies.push(id);
        }
    }

    /// Dependencies added during this invocation.
    #[inline]
    pub fn added_dependencies(&self) -> &[TaskId] {
        &self.added_dependencies
    }

    pub(crate) fn into_added_dependencies(self) -> Vec<TaskId> {
        self.added_dependencies
    }
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task)
            .field("worker", &self.worker)
            .field("invocation", &self.invocation)
            .field("added_dependencies", &self.added_dependencies)
            .finish()
    }
}

/// A task: identity, scheduling constraints, lifecycle state and body.
pub struct Task {
    /// Assigned on submission.
    id: Option<TaskId>,
    /// Task name for debugging.
    name: String,
    /// Current state.
    state: TaskState,
    /// Priority of the task.
    priority: TaskPriority,
    /// Tasks that must leave the queue before this one is eligible.
    dependencies: Vec<TaskId>,
    /// Workers allowed to run this task; empty means any.
    affinity: Vec<WorkerId>,
    /// Worker currently running the task.
    running_worker: Option<WorkerId>,
    /// Claim counter.
    invocations: u32,
    /// The actual work; taken out while a worker runs it.
    job: Option<Box<dyn Job>>,
}

impl fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("affinity", &self.affinity)
            .field("running_worker", &self.running_worker)
            .finish()
    }
}

impl Task {
    /// Create a task with default settings.
    pub fn new<J: Job>(job: J) -> Self {
        TaskBuilder::new().build(job)
    }

    /// Create a task with default settings from a closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut(&mut TaskContext<'_>) -> anyhow::Result<RunStatus> + Send + 'static,
    {
        TaskBuilder::new().build(job_fn(f))
    }

    /// Get the task ID, if the task has been submitted.
    #[inline]
    pub fn id(&self) -> Option<TaskId> {
        self.id
    }

    /// Get the task name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Get the priority.
    #[inline]
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Get the dependency list.
    #[inline]
    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    /// Get the affinity list.
    #[inline]
    pub fn affinity(&self) -> &[WorkerId] {
        &self.affinity
    }

    /// Worker currently running the task.
    #[inline]
    pub fn running_worker(&self) -> Option<WorkerId> {
        self.running_worker
    }

    /// Check if the task may run on `worker`.
    #[inline]
    pub fn runs_on(
        &self,
        worker: WorkerId,
    ) -> bool {
        self.affinity.is_empty() || self.affinity.contains(&worker)
    }

    pub(crate) fn assign_id(
        &mut self,
        id: TaskId,
    ) {
        self.id = Some(id);
        if self.name.is_empty() {
            self.name = id.to_string();
        }
    }

    /// Mark as running on `worker` and hand out the job.
    pub(crate) fn claim(
        &mut self,
        worker: WorkerId,
    ) -> Option<(Box<dyn Job>, u32)> {
        let job = self.job.take()?;
        self.state = TaskState::Running;
        self.running_worker = Some(worker);
        self.invocations += 1;
        Some((job, self.invocations))
    }

    /// Put the job back and park the task as `Paused`.
    pub(crate) fn pause(
        &mut self,
        job: Box<dyn Job>,
        extra_dependencies: Vec<TaskId>,
    ) {
        for dep in extra_dependencies {
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self.job = Some(job);
        self.running_worker = None;
        self.state = TaskState::Paused;
    }

    pub(crate) fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            dependencies: self.dependencies.clone(),
            affinity: self.affinity.clone(),
            running_worker: self.running_worker,
            invocations: self.invocations,
        }
    }
}

/// Snapshot of a queued task, taken under the queue lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: Option<TaskId>,
    pub name: String,
    pub state: TaskState,
    pub priority: TaskPriority,
    pub dependencies: Vec<TaskId>,
    pub affinity: Vec<WorkerId>,
    pub running_worker: Option<WorkerId>,
    pub invocations: u32,
}

/// Task builder for constructing tasks with various options.
#[derive(Debug, Default)]
pub struct TaskBuilder {
    name: Option<String>,
    priority: TaskPriority,
    dependencies: Vec<TaskId>,
    affinity: Vec<WorkerId>,
}

impl TaskBuilder {
    /// Create a new task builder.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task name.
    #[inline]
    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the task priority.
    #[inline]
    pub fn priority(
        mut self,
        priority: TaskPriority,
    ) -> Self {
        self.priority = priority;
        self
    }

    /// Require `id` to leave the queue before this task may run.
    #[inline]
    pub fn depends_on(
        mut self,
        id: TaskId,
    ) -> Self {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    /// Allow the task to run on `worker`. Calling this at least once
    /// restricts the task to the listed workers.
    #[inline]
    pub fn run_on(
        mut self,
        worker: WorkerId,
    ) -> Self {
        if !self.affinity.contains(&worker) {
            self.affinity.push(worker);
        }
        self
    }

    /// Build the task with the given job.
    pub fn build<J: Job>(
        self,
        job: J,
    ) -> Task {
        Task {
            id: None,
            name: self.name.unwrap_or_default(),
            state: TaskState::NotStarted,
            priority: self.priority,
            dependencies: self.dependencies,
            affinity: self.affinity,
            running_worker: None,
            invocations: 0,
            job: Some(Box::new(job)),
        }
    }

    /// Build the task from a closure.
    pub fn build_fn<F>(
        self,
        f: F,
    ) -> Task
    where
        F: FnMut(&mut TaskContext<'_>) -> anyhow::Result<RunStatus> + Send + 'static,
    {
        self.build(job_fn(f))
    }
}

/// Generator for task IDs.
#[derive(Debug)]
pub struct TaskIdGenerator {
    next_id: u64,
}

impl TaskIdGenerator {
    /// Create a new task ID generator. The first ID is 1.
    #[inline]
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    /// Generate the next task ID.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        TaskId(id)
    }
}

impl Default for TaskIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
