//! Taskweave
//!
//! A cooperative multi-worker task scheduler. Tasks carry dependencies on
//! other tasks and may be pinned to specific workers; workers own
//! thread-exclusive resources and can be added or removed at any time.
//!
//! # Example
//!
//! ```no_run
//! use taskweave::runtime::scheduler::{RunStatus, SchedulerPool, Task};
//!
//! fn main() -> taskweave::Result<()> {
//!     let mut pool = SchedulerPool::new();
//!     pool.add_worker(())?;
//!
//!     let first = pool.add_task(Task::from_fn(|_cx| Ok(RunStatus::Finished)))?;
//!     pool.add_task(
//!         taskweave::runtime::scheduler::TaskBuilder::new()
//!             .depends_on(first)
//!             .build_fn(|_cx| Ok(RunStatus::Finished)),
//!     )?;
//!
//!     pool.wait_idle(std::time::Duration::from_secs(1));
//!     pool.run()?;
//!     Ok(())
//! }
//! ```
//!
//! # Crate Features
//!
//! - `strict-contracts`: keep contract checks fatal in release builds

#![doc(html_root_url = "https://docs.rs/taskweave")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use runtime::scheduler::{
    FaultKind, RunStatus, SchedulerConfig, SchedulerError, SchedulerPool, Task, TaskBuilder,
    TaskContext, TaskId, TaskState, WorkerFault, WorkerId, WorkerResource,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = "Taskweave";
