//! Engine facade: builds and owns the queue, pool, registry, and
//! scheduler, and exposes the operations the HTTP layer calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vantage_core::error::CoreError;
use vantage_core::job::Job;
use vantage_core::types::{EntityId, ExecutionId, JobId};
use vantage_events::ProgressHub;

use crate::config::EngineConfig;
use crate::dispatch::HandlerMap;
use crate::pool::{ExecutionRegistry, WorkerPool};
use crate::queue::JobQueue;
use crate::scheduler::CronScheduler;

pub struct JobEngine {
    config: EngineConfig,
    queue: Arc<JobQueue>,
    pool: Arc<WorkerPool>,
    hub: Arc<ProgressHub>,
    registry: Arc<ExecutionRegistry>,
    scheduler: Arc<CronScheduler>,
    scheduler_cancel: CancellationToken,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

impl JobEngine {
    /// Wire the full execution graph. Nothing runs until [`start`](Self::start).
    pub fn new(config: EngineConfig, handlers: HandlerMap, hub: Arc<ProgressHub>) -> Self {
        let queue = Arc::new(JobQueue::new(config.queue_capacity));
        let registry = Arc::new(ExecutionRegistry::new());
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            Arc::new(handlers),
            Arc::clone(&hub),
            Arc::clone(&registry),
            config.retry_policy(),
        ));
        let scheduler = Arc::new(CronScheduler::new(
            Arc::clone(&queue),
            config.scheduler_tick_cap(),
        ));

        // Release the scheduler's no-overlap latch only once the job is
        // settled. A failed attempt with a retry queued keeps the latch
        // held, so the schedule cannot fire a second concurrent run.
        let latch = Arc::clone(&scheduler);
        pool.on_job_settled(Arc::new(move |job, _event| {
            if let Some(schedule_id) = job.schedule_id {
                latch.mark_finished(schedule_id);
            }
        }));

        Self {
            config,
            queue,
            pool,
            hub,
            registry,
            scheduler,
            scheduler_cancel: CancellationToken::new(),
            scheduler_task: Mutex::new(None),
        }
    }

    /// Start the worker pool and the scheduler loop.
    pub fn start(&self) {
        self.pool.start(self.config.worker_count);
        let scheduler = Arc::clone(&self.scheduler);
        let cancel = self.scheduler_cancel.clone();
        let task = tokio::spawn(async move { scheduler.run(cancel).await });
        *self.scheduler_task.lock().expect("engine lock poisoned") = Some(task);
    }

    /// Graceful shutdown: stop materializing new jobs first, then wait
    /// up to `grace` for in-flight executions to finish before
    /// cancelling the remainder.
    pub async fn stop(&self, grace: Duration) {
        self.scheduler_cancel.cancel();
        if let Some(task) = self.scheduler_task.lock().expect("engine lock poisoned").take() {
            let _ = task.await;
        }
        self.pool.stop(grace).await;
    }

    /// Enqueue a job, optionally delayed.
    pub fn enqueue(
        &self,
        kind: vantage_core::job::JobKind,
        entity_id: EntityId,
        priority: i32,
        delay: Option<Duration>,
    ) -> Result<JobId, CoreError> {
        let mut job = Job::new(kind, entity_id, priority);
        if let Some(delay) = delay {
            job = job.with_delay(delay);
        }
        let job_id = job.job_id;
        self.queue.enqueue(job)?;
        tracing::info!(job_id = %job_id, kind = %kind, priority, "Job enqueued");
        Ok(job_id)
    }

    /// Request cancellation of a live execution. Returns whether it was
    /// live; terminal and unknown executions are a no-op.
    pub fn cancel(&self, execution_id: ExecutionId) -> bool {
        self.registry.cancel(execution_id)
    }

    /// Register a pool status listener (persistence mirrors, metrics).
    /// Must happen before [`start`](Self::start).
    pub fn on_status_change(&self, listener: crate::pool::StatusListener) {
        self.pool.on_status_change(listener);
    }

    /// Register a listener for jobs reaching their final attempt.
    /// Must happen before [`start`](Self::start).
    pub fn on_job_settled(&self, listener: crate::pool::StatusListener) {
        self.pool.on_job_settled(listener);
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queued_jobs(&self) -> usize {
        self.queue.len()
    }

    pub fn live_executions(&self) -> usize {
        self.registry.live_count()
    }
}

#[cfg(test)]
mod tests {
    use vantage_core::job::{JobKind, PRIORITY_NORMAL};

    use super::*;

    fn engine() -> JobEngine {
        JobEngine::new(
            EngineConfig::default(),
            HandlerMap::new(),
            Arc::new(ProgressHub::default()),
        )
    }

    #[tokio::test]
    async fn enqueue_returns_job_id_and_queues() {
        let e = engine();
        let job_id = e
            .enqueue(JobKind::Pipeline, uuid::Uuid::now_v7(), PRIORITY_NORMAL, None)
            .unwrap();
        assert!(!job_id.is_nil());
        assert_eq!(e.queued_jobs(), 1);
    }

    #[tokio::test]
    async fn cancel_of_unknown_execution_is_a_noop() {
        let e = engine();
        assert!(!e.cancel(uuid::Uuid::now_v7()));
    }
}
