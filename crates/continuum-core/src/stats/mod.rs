//! Worker Stats: process-local counters and a snapshot of the task
//! currently executing, readable by the (external) status endpoint.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

/// A structural, serialisable snapshot of the current task.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentTask {
    pub task_id: i64,
    pub name: String,
}

/// A point-in-time, serialisable copy of the worker's counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub worker_id: Uuid,
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub database_failures: u64,
    pub uptime_secs: u64,
    pub current_task: Option<CurrentTask>,
}

#[derive(Debug, Default)]
struct Counters {
    tasks_processed: u64,
    tasks_successful: u64,
    tasks_failed: u64,
    database_failures: u64,
    current_task: Option<CurrentTask>,
}

/// Process-wide, lock-protected record of a worker's activity. Assigned
/// once at startup; shared-read, exclusive-write for the lifetime of the
/// process.
pub struct WorkerStats {
    worker_id: Uuid,
    start_time: Instant,
    inner: RwLock<Counters>,
}

impl WorkerStats {
    pub fn new(worker_id: Uuid) -> Self {
        Self {
            worker_id,
            start_time: Instant::now(),
            inner: RwLock::new(Counters::default()),
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn increment_processed(&self) {
        self.inner.write().unwrap().tasks_processed += 1;
    }

    pub fn increment_successful(&self) {
        self.inner.write().unwrap().tasks_successful += 1;
    }

    pub fn increment_failed(&self) {
        self.inner.write().unwrap().tasks_failed += 1;
    }

    pub fn increment_database_failures(&self) {
        self.inner.write().unwrap().database_failures += 1;
    }

    pub fn set_current_task(&self, task: Option<CurrentTask>) {
        self.inner.write().unwrap().current_task = task;
    }

    /// A structural copy safe to serialise for the status endpoint, with
    /// `uptime` truncated to the second.
    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.inner.read().unwrap();
        StatsSnapshot {
            worker_id: self.worker_id,
            tasks_processed: counters.tasks_processed,
            tasks_successful: counters.tasks_successful,
            tasks_failed: counters.tasks_failed,
            database_failures: counters.database_failures,
            uptime_secs: self.uptime().as_secs(),
            current_task: counters.current_task.clone(),
        }
    }

    fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_are_zeroed() {
        let stats = WorkerStats::new(Uuid::new_v4());
        let snap = stats.snapshot();
        assert_eq!(snap.tasks_processed, 0);
        assert_eq!(snap.tasks_successful, 0);
        assert_eq!(snap.tasks_failed, 0);
        assert_eq!(snap.database_failures, 0);
        assert!(snap.current_task.is_none());
    }

    #[test]
    fn increments_are_additive() {
        let stats = WorkerStats::new(Uuid::new_v4());
        stats.increment_processed();
        stats.increment_processed();
        stats.increment_successful();
        stats.increment_database_failures();

        let snap = stats.snapshot();
        assert_eq!(snap.tasks_processed, 2);
        assert_eq!(snap.tasks_successful, 1);
        assert_eq!(snap.database_failures, 1);
    }

    #[test]
    fn current_task_round_trips() {
        let stats = WorkerStats::new(Uuid::new_v4());
        stats.set_current_task(Some(CurrentTask {
            task_id: 42,
            name: "t".to_string(),
        }));
        let snap = stats.snapshot();
        assert_eq!(snap.current_task.unwrap().task_id, 42);

        stats.set_current_task(None);
        assert!(stats.snapshot().current_task.is_none());
    }
}
