//! Scheduler 单元测试
//!
//! 测试任务、配置与统计，以及队列和工作线程的调度行为

use crate::runtime::scheduler::{
    RunStatus, SchedulerConfig, SchedulerStats, Task, TaskBuilder, TaskContext, TaskId,
    TaskIdGenerator, TaskPriority, TaskState, WorkerId, WorkerState,
};


/// A job that finishes on its first invocation.
pub(super) fn noop_task() -> Task {
    Task::from_fn(|_cx| Ok(RunStatus::Finished))
}

#[cfg(test)]
mod task_id_tests {
    use super::*;

    #[test]
    fn test_task_id_inner() {
        let id = TaskId(7);
        assert_eq!(id.inner(), 7);
        assert_eq!(u64::from(id), 7);
        assert_eq!(TaskId::from(7u64), id);
    }

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId(42).to_string(), "Task(42)");
        assert_eq!(WorkerId(3).to_string(), "Worker(3)");
    }

    #[test]
    fn test_task_id_generator_monotonic() {
        let mut generator = TaskIdGenerator::new();
        let a = generator.next();
        let b = generator.next();
        let c = generator.next();
        assert_eq!(a, TaskId(1));
        assert!(a < b && b < c);
    }
}

#[cfg(test)]
mod task_state_tests {
    use super::*;

    #[test]
    fn test_task_state_default() {
        assert_eq!(TaskState::default(), TaskState::NotStarted);
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Error.is_terminal());
        assert!(!TaskState::Paused.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::NotStarted.is_terminal());
    }

    #[test]
    fn test_worker_state_u8_roundtrip() {
        for state in [
            WorkerState::Uninitialized,
            WorkerState::Running,
            WorkerState::Idle,
            WorkerState::InitializationError,
            WorkerState::Stopped,
        ] {
            assert_eq!(WorkerState::from_u8(state.as_u8()), state);
        }
        assert_eq!(WorkerState::from_u8(200), WorkerState::Uninitialized);
    }
}

#[cfg(test)]
mod task_priority_tests {
    use super::*;

    #[test]
    fn test_task_priority_ord() {
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Critical);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }
}

#[cfg(test)]
mod task_tests {
    use super::*;

    #[test]
    fn test_task_new() {
        let task = noop_task();
        assert_eq!(task.id(), None);
        assert_eq!(task.state(), TaskState::NotStarted);
        assert_eq!(task.priority(), TaskPriority::Normal);
        assert!(task.dependencies().is_empty());
        assert!(task.affinity().is_empty());
        assert_eq!(task.running_worker(), None);
    }

    #[test]
    fn test_task_builder() {
        let task = TaskBuilder::new()
            .name("upload")
            .priority(TaskPriority::High)
            .depends_on(TaskId(1))
            .depends_on(TaskId(2))
            .depends_on(TaskId(1))
            .run_on(WorkerId(0))
            .build_fn(|_cx| Ok(RunStatus::Finished));

        assert_eq!(task.name(), "upload");
        assert_eq!(task.priority(), TaskPriority::High);
        assert_eq!(task.dependencies(), &[TaskId(1), TaskId(2)]);
        assert_eq!(task.affinity(), &[WorkerId(0)]);
    }

    #[test]
    fn test_task_runs_on() {
        let anywhere = noop_task();
        assert!(anywhere.runs_on(WorkerId(0)));
        assert!(anywhere.runs_on(WorkerId(9)));

        let pinned = TaskBuilder::new()
            .run_on(WorkerId(1))
            .run_on(WorkerId(2))
            .build_fn(|_cx| Ok(RunStatus::Finished));
        assert!(!pinned.runs_on(WorkerId(0)));
        assert!(pinned.runs_on(WorkerId(1)));
        assert!(pinned.runs_on(WorkerId(2)));
    }

    #[test]
    fn test_task_debug() {
        let debug = format!("{:?}", noop_task());
        assert!(debug.contains("Task"));
        assert!(debug.contains("NotStarted"));
    }

    #[test]
    fn test_task_context_resource_downcast() {
        let mut counter = 5usize;
        let mut cx = TaskContext::new(TaskId(1), WorkerId(0), 1, &mut counter);
        assert!(cx.resource::<String>().is_none());
        *cx.resource::<usize>().unwrap() += 1;
        assert_eq!(cx.invocation(), 1);
        drop(cx);
        assert_eq!(counter, 6);
    }

    #[test]
    #[cfg(any(debug_assertions, feature = "strict-contracts"))]
    #[should_panic(expected = "called off its worker")]
    fn test_add_dependency_off_worker_panics() {
        let mut resource = ();
        let mut cx = TaskContext::new(TaskId(1), WorkerId(0), 1, &mut resource);
        cx.add_dependency(TaskId(2));
    }

    #[test]
    #[cfg(not(any(debug_assertions, feature = "strict-contracts")))]
    fn test_add_dependency_off_worker_ignored() {
        let mut resource = ();
        let mut cx = TaskContext::new(TaskId(1), WorkerId(0), 1, &mut resource);
        cx.add_dependency(TaskId(2));
        assert!(cx.added_dependencies().is_empty());
    }
}

#[cfg(test)]
mod scheduler_config_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.thread_name_prefix, "taskweave-worker");
        assert_eq!(config.fault_capacity, 8);
        assert_eq!(config.stack_size, None);
        assert_eq!(config.startup_timeout, None);
    }

    #[test]
    fn test_scheduler_config_custom() {
        let config = SchedulerConfig {
            fault_capacity: 1,
            startup_timeout: Some(Duration::from_millis(500)),
            ..SchedulerConfig::default()
        };
        assert_eq!(config.fault_capacity, 1);
        assert_eq!(config.clone(), config);
    }
}

#[cfg(test)]
mod scheduler_stats_tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_parallelism_tracks_peak() {
        let stats = SchedulerStats::default();
        stats.task_started();
        stats.task_started();
        stats.task_finished(10);
        stats.task_started();
        stats.task_finished(5);
        stats.task_finished(5);

        assert_eq!(stats.running.load(Ordering::SeqCst), 0);
        assert_eq!(stats.peak_parallelism.load(Ordering::SeqCst), 2);
        assert_eq!(stats.total_exec_time_us.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_tasks_done() {
        let stats = SchedulerStats::default();
        stats.record_completed();
        stats.record_completed();
        stats.record_failed();
        assert_eq!(stats.tasks_done(), 3);
    }
}
