//! Shared helpers for the integration tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskweave::SchedulerPool;

pub const WAIT: Duration = Duration::from_secs(20);

/// Tracks which tasks are executing right now and in what order they ran.
#[derive(Debug, Default)]
pub struct Ledger {
    running: Mutex<HashSet<u64>>,
    finished: Mutex<Vec<u64>>,
    overlaps: Mutex<Vec<u64>>,
}

impl Ledger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark `key` as running; records an overlap if it already was.
    pub fn enter(
        &self,
        key: u64,
    ) {
        if !self.running.lock().unwrap().insert(key) {
            self.overlaps.lock().unwrap().push(key);
        }
    }

    pub fn leave(
        &self,
        key: u64,
    ) {
        self.running.lock().unwrap().remove(&key);
    }

    pub fn finish(
        &self,
        key: u64,
    ) {
        self.finished.lock().unwrap().push(key);
    }

    pub fn finished(&self) -> Vec<u64> {
        self.finished.lock().unwrap().clone()
    }

    pub fn overlaps(&self) -> Vec<u64> {
        self.overlaps.lock().unwrap().clone()
    }

    /// Position of `key` in completion order.
    pub fn position(
        &self,
        key: u64,
    ) -> Option<usize> {
        self.finished.lock().unwrap().iter().position(|k| *k == key)
    }
}

/// Pool with `n` plain workers.
pub fn pool_with_workers(n: usize) -> SchedulerPool {
    taskweave::util::logger::init_test();
    let mut pool = SchedulerPool::new();
    for _ in 0..n {
        pool.add_worker(()).unwrap();
    }
    pool
}

/// Drain the pool, failing on any relayed fault.
pub fn drain(pool: &mut SchedulerPool) {
    assert!(pool.wait_idle(WAIT), "pool did not drain in time");
    pool.run().unwrap();
}
