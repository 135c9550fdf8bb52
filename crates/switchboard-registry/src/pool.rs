use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_core::{
    SwitchboardError, SwitchboardResult, Task, TaskResult, Worker, WorkingContext,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

struct PoolEntry {
    worker: Arc<dyn Worker>,
    permits: Arc<Semaphore>,
    limit: usize,
}

/// Live worker instances keyed by worker id.
///
/// Kept apart from [`AgentRegistry`](crate::AgentRegistry): the registry
/// answers "who can do this", the pool answers "call it". Each worker gets a
/// semaphore sized to its `max_concurrent_tasks`.
#[derive(Default)]
pub struct WorkerPool {
    workers: RwLock<HashMap<String, PoolEntry>>,
}

impl WorkerPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a live worker with a concurrency limit.
    pub fn insert(&self, worker: Arc<dyn Worker>, max_concurrent: usize) {
        let limit = max_concurrent.max(1);
        let id = worker.id().to_string();
        debug!(worker_id = %id, limit, "Worker instance added to pool");
        self.workers.write().insert(
            id,
            PoolEntry {
                worker,
                permits: Arc::new(Semaphore::new(limit)),
                limit,
            },
        );
    }

    /// Drop a worker instance. Returns whether it was present.
    pub fn remove(&self, worker_id: &str) -> bool {
        self.workers.write().remove(worker_id).is_some()
    }

    /// Live instance of a worker.
    pub fn get(&self, worker_id: &str) -> Option<Arc<dyn Worker>> {
        self.workers.read().get(worker_id).map(|e| e.worker.clone())
    }

    /// Whether an instance is pooled.
    pub fn contains(&self, worker_id: &str) -> bool {
        self.workers.read().contains_key(worker_id)
    }

    /// Free execution slots of a worker.
    pub fn available(&self, worker_id: &str) -> Option<usize> {
        self.workers
            .read()
            .get(worker_id)
            .map(|e| e.permits.available_permits())
    }

    /// Configured concurrency limit of a worker.
    pub fn limit(&self, worker_id: &str) -> Option<usize> {
        self.workers.read().get(worker_id).map(|e| e.limit)
    }

    /// Wait for a free slot on a worker.
    pub async fn acquire(
        &self,
        worker_id: &str,
    ) -> SwitchboardResult<(Arc<dyn Worker>, OwnedSemaphorePermit)> {
        let (worker, permits) = {
            let workers = self.workers.read();
            let entry = workers
                .get(worker_id)
                .ok_or_else(|| SwitchboardError::WorkerNotFound(worker_id.to_string()))?;
            (entry.worker.clone(), entry.permits.clone())
        };
        let permit = permits
            .acquire_owned()
            .await
            .map_err(|e| SwitchboardError::Worker(format!("pool closed for '{worker_id}': {e}")))?;
        Ok((worker, permit))
    }

    /// Execute a task on a worker, holding one of its slots for the duration.
    pub async fn dispatch(
        &self,
        worker_id: &str,
        task: &Task,
        context: &WorkingContext,
    ) -> SwitchboardResult<TaskResult> {
        let (worker, _permit) = self.acquire(worker_id).await?;
        worker.execute(task, context).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use switchboard_core::TenantId;

    struct SlowWorker {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Worker for SlowWorker {
        fn id(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _task: &Task, _ctx: &WorkingContext) -> SwitchboardResult<TaskResult> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(TaskResult::success(serde_json::json!({}), 1.0))
        }
    }

    #[tokio::test]
    async fn test_dispatch_unknown_worker() {
        let pool = WorkerPool::new();
        let tenant = TenantId::new("t1").unwrap();
        let task = Task::new(tenant.clone(), "x");
        let ctx = WorkingContext::empty(tenant, 100);
        assert!(matches!(
            pool.dispatch("ghost", &task, &ctx).await,
            Err(SwitchboardError::WorkerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrency_limit_enforced() {
        let worker = Arc::new(SlowWorker {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = Arc::new(WorkerPool::new());
        pool.insert(worker.clone(), 2);
        assert_eq!(pool.limit("slow"), Some(2));

        let tenant = TenantId::new("t1").unwrap();
        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let tenant = tenant.clone();
            handles.push(tokio::spawn(async move {
                let task = Task::new(tenant.clone(), "x");
                let ctx = WorkingContext::empty(tenant, 100);
                pool.dispatch("slow", &task, &ctx).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(worker.peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.available("slow"), Some(2));
    }
}
