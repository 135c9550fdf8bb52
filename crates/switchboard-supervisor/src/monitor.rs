use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Per-worker counters kept by the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Executions started.
    pub tasks: u64,
    /// Executions that ended in error.
    pub failures: u64,
    /// Times this worker's failure sent work to its backup.
    pub failovers: u64,
    /// Handoffs from this worker refused by validation.
    pub rejected_handoffs: u64,
    /// Total execution time.
    pub duration_ms: u64,
}

/// Live view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerActivity {
    /// Worker id.
    pub worker_id: String,
    /// Tasks currently executing on this worker.
    pub active: Vec<Uuid>,
    /// Cumulative counters.
    pub metrics: WorkerMetrics,
}

impl WorkerActivity {
    fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            active: Vec::new(),
            metrics: WorkerMetrics::default(),
        }
    }
}

/// Task-level counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCounters {
    /// Tasks that reached `Done`.
    pub completed: u64,
    /// Tasks that reached `Failed`.
    pub failed: u64,
    /// Tasks that were cancelled.
    pub cancelled: u64,
    /// Completed tasks whose result was merged.
    pub synthesized: u64,
}

/// Tracks worker activity and outcome metrics across all supervised tasks.
pub struct SupervisorMonitor {
    workers: Arc<RwLock<HashMap<String, WorkerActivity>>>,
    tasks: Arc<RwLock<TaskCounters>>,
}

impl SupervisorMonitor {
    /// Monitor with no activity.
    pub fn new() -> Self {
        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(TaskCounters::default())),
        }
    }

    /// Mark a worker as executing a task.
    pub async fn start_task(&self, worker_id: &str, task_id: Uuid) {
        let mut workers = self.workers.write().await;
        let activity = workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerActivity::new(worker_id));
        activity.active.push(task_id);
        activity.metrics.tasks += 1;
    }

    /// Mark a task as no longer executing on a worker. Returns how many tasks
    /// the worker still has in flight.
    pub async fn finish_task(&self, worker_id: &str, task_id: Uuid, duration_ms: u64) -> usize {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(activity) => {
                activity.active.retain(|id| *id != task_id);
                activity.metrics.duration_ms += duration_ms;
                activity.active.len()
            }
            None => 0,
        }
    }

    /// Count a failed execution.
    pub async fn record_failure(&self, worker_id: &str) {
        self.with_worker(worker_id, |m| m.failures += 1).await;
    }

    /// Count a failover away from `worker_id`.
    pub async fn record_failover(&self, worker_id: &str) {
        self.with_worker(worker_id, |m| m.failovers += 1).await;
    }

    /// Count a rejected handoff.
    pub async fn record_rejection(&self, worker_id: &str) {
        self.with_worker(worker_id, |m| m.rejected_handoffs += 1).await;
    }

    async fn with_worker(&self, worker_id: &str, update: impl FnOnce(&mut WorkerMetrics)) {
        let mut workers = self.workers.write().await;
        let activity = workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerActivity::new(worker_id));
        update(&mut activity.metrics);
    }

    /// Count a completed task.
    pub async fn record_task_completed(&self, synthesized: bool) {
        let mut tasks = self.tasks.write().await;
        tasks.completed += 1;
        if synthesized {
            tasks.synthesized += 1;
        }
    }

    /// Count a failed task.
    pub async fn record_task_failed(&self) {
        self.tasks.write().await.failed += 1;
    }

    /// Count a cancelled task.
    pub async fn record_task_cancelled(&self) {
        self.tasks.write().await.cancelled += 1;
    }

    /// Activity of every worker seen so far, sorted by id.
    pub async fn snapshot(&self) -> Vec<WorkerActivity> {
        let workers = self.workers.read().await;
        let mut out: Vec<WorkerActivity> = workers.values().cloned().collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }

    /// Activity of one worker.
    pub async fn get(&self, worker_id: &str) -> Option<WorkerActivity> {
        self.workers.read().await.get(worker_id).cloned()
    }

    /// Snapshot of the task counters.
    pub async fn task_counters(&self) -> TaskCounters {
        self.tasks.read().await.clone()
    }

    /// Sum of all per-worker metrics.
    pub async fn aggregate_metrics(&self) -> WorkerMetrics {
        let workers = self.workers.read().await;
        let mut total = WorkerMetrics::default();
        for activity in workers.values() {
            total.tasks += activity.metrics.tasks;
            total.failures += activity.metrics.failures;
            total.failovers += activity.metrics.failovers;
            total.rejected_handoffs += activity.metrics.rejected_handoffs;
            total.duration_ms += activity.metrics.duration_ms;
        }
        total
    }

    /// Current state as JSON, for dashboards and health endpoints.
    pub async fn to_json(&self) -> serde_json::Value {
        let workers = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        let tasks = self.task_counters().await;
        serde_json::json!({
            "workers": workers,
            "aggregate": aggregate,
            "tasks": tasks,
        })
    }
}

impl Default for SupervisorMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_finish_task() {
        let monitor = SupervisorMonitor::new();
        let task_id = Uuid::new_v4();

        monitor.start_task("crm", task_id).await;
        let activity = monitor.get("crm").await.unwrap();
        assert_eq!(activity.active, vec![task_id]);
        assert_eq!(activity.metrics.tasks, 1);

        let other = Uuid::new_v4();
        monitor.start_task("crm", other).await;
        assert_eq!(monitor.finish_task("crm", other, 0).await, 1);
        assert_eq!(monitor.finish_task("crm", task_id, 40).await, 0);
        let activity = monitor.get("crm").await.unwrap();
        assert!(activity.active.is_empty());
        assert_eq!(activity.metrics.duration_ms, 40);
    }

    #[tokio::test]
    async fn test_aggregate_metrics() {
        let monitor = SupervisorMonitor::new();
        monitor.start_task("a", Uuid::new_v4()).await;
        monitor.start_task("b", Uuid::new_v4()).await;
        monitor.record_failure("a").await;
        monitor.record_failover("a").await;
        monitor.record_rejection("b").await;

        let agg = monitor.aggregate_metrics().await;
        assert_eq!(agg.tasks, 2);
        assert_eq!(agg.failures, 1);
        assert_eq!(agg.failovers, 1);
        assert_eq!(agg.rejected_handoffs, 1);
    }

    #[tokio::test]
    async fn test_to_json() {
        let monitor = SupervisorMonitor::new();
        monitor.record_failure("mailer").await;
        monitor.record_task_completed(true).await;
        monitor.record_task_cancelled().await;

        let json = monitor.to_json().await;
        assert!(json["workers"].is_array());
        assert_eq!(json["workers"][0]["worker_id"], "mailer");
        assert_eq!(json["tasks"]["synthesized"], 1);
        assert_eq!(json["tasks"]["cancelled"], 1);
    }
}
