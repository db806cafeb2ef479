//! Cooperative tasks: pausing, resuming and runtime dependencies.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskweave::runtime::scheduler::{Job, TaskPriority};
use taskweave::{RunStatus, Task, TaskBuilder, TaskContext};

use crate::common::{drain, pool_with_workers, Ledger};

/// Processes `total` items in slices of `chunk`, pausing between slices.
struct Chunked {
    done: usize,
    total: usize,
    chunk: usize,
    invocations: Arc<Mutex<Vec<u32>>>,
}

impl Job for Chunked {
    fn run(
        &mut self,
        cx: &mut TaskContext<'_>,
    ) -> anyhow::Result<RunStatus> {
        self.invocations.lock().unwrap().push(cx.invocation());
        self.done = (self.done + self.chunk).min(self.total);
        if self.done < self.total {
            Ok(RunStatus::Paused)
        } else {
            Ok(RunStatus::Finished)
        }
    }
}

#[test]
fn test_paused_job_keeps_progress() {
    let mut pool = pool_with_workers(2);
    let invocations = Arc::new(Mutex::new(Vec::new()));

    pool.add_task(
        TaskBuilder::new().name("chunked").build(Chunked {
            done: 0,
            total: 10,
            chunk: 3,
            invocations: invocations.clone(),
        }),
    )
    .unwrap();

    drain(&mut pool);
    assert_eq!(*invocations.lock().unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(pool.stats().tasks_rescheduled.load(Ordering::SeqCst), 3);
    assert_eq!(pool.stats().tasks_completed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_paused_task_goes_behind_others() {
    let mut pool = pool_with_workers(1);
    let ledger = Ledger::new();

    let yielding = {
        let ledger = ledger.clone();
        Task::from_fn(move |cx| {
            if cx.invocation() == 1 {
                return Ok(RunStatus::Paused);
            }
            ledger.finish(0);
            Ok(RunStatus::Finished)
        })
    };

    // Submit everything before the worker can pick anything up.
    let gate = Arc::new(AtomicBool::new(false));
    let blocker = {
        let gate = gate.clone();
        Task::from_fn(move |_cx| {
            while !gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(RunStatus::Finished)
        })
    };
    pool.add_task(blocker).unwrap();
    pool.add_task(yielding).unwrap();
    for key in 1..=3u64 {
        let ledger = ledger.clone();
        pool.add_task(Task::from_fn(move |_cx| {
            ledger.finish(key);
            Ok(RunStatus::Finished)
        }))
        .unwrap();
    }
    gate.store(true, Ordering::SeqCst);

    drain(&mut pool);
    assert_eq!(ledger.finished(), vec![1, 2, 3, 0]);
}

#[test]
fn test_add_dependency_defers_task() {
    let mut pool = pool_with_workers(2);
    let ledger = Ledger::new();
    let child_id = Arc::new(Mutex::new(None));

    let parent = {
        let ledger = ledger.clone();
        let child_id = child_id.clone();
        Task::from_fn(move |cx| {
            if cx.invocation() == 1 {
                // Wait for the child to be submitted, then depend on it.
                let child = loop {
                    if let Some(id) = *child_id.lock().unwrap() {
                        break id;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                };
                cx.add_dependency(child);
                return Ok(RunStatus::Paused);
            }
            ledger.finish(1);
            Ok(RunStatus::Finished)
        })
    };
    let parent_id = pool.add_task(parent).unwrap();

    let child = {
        let ledger = ledger.clone();
        Task::from_fn(move |_cx| {
            std::thread::sleep(Duration::from_millis(10));
            ledger.finish(2);
            Ok(RunStatus::Finished)
        })
    };
    let id = pool.add_task(child).unwrap();
    *child_id.lock().unwrap() = Some(id);

    drain(&mut pool);
    assert_eq!(ledger.finished(), vec![2, 1]);
    assert!(pool.task_info(parent_id).is_none());
}

#[test]
fn test_paused_task_can_move_between_workers() {
    let mut pool = pool_with_workers(3);
    let workers_seen = Arc::new(Mutex::new(Vec::new()));
    let rounds = Arc::new(AtomicUsize::new(0));

    {
        let workers_seen = workers_seen.clone();
        let rounds = rounds.clone();
        pool.add_task(
            TaskBuilder::new()
                .priority(TaskPriority::High)
                .build_fn(move |cx| {
                    workers_seen.lock().unwrap().push(cx.worker_id());
                    if rounds.fetch_add(1, Ordering::SeqCst) < 19 {
                        Ok(RunStatus::Paused)
                    } else {
                        Ok(RunStatus::Finished)
                    }
                }),
        )
        .unwrap();
    }

    drain(&mut pool);
    assert_eq!(rounds.load(Ordering::SeqCst), 20);
    let workers = pool.worker_ids();
    assert!(workers_seen
        .lock()
        .unwrap()
        .iter()
        .all(|w| workers.contains(w)));
}
