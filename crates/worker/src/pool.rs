//! Worker pool: claims jobs from the queue, dispatches them to their
//! handlers, and owns the execution lifecycle.
//!
//! The pool is the only writer of terminal progress events. Failures are
//! classified by the core error taxonomy; retryable ones are re-enqueued
//! under the retry policy, everything else is dead-lettered with a
//! `dead_letter` log record. Panics are caught at the worker boundary
//! and treated as permanent failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vantage_core::error::{CoreError, ErrorKind};
use vantage_core::job::Job;
use vantage_core::retry::{RetryDecision, RetryPolicy};
use vantage_core::status::ExecStatus;
use vantage_core::types::ExecutionId;
use vantage_events::{ProgressEvent, ProgressHub};

use crate::dispatch::{HandlerMap, HandlerOutcome, JobContext};
use crate::queue::JobQueue;

/// Observer invoked on every status transition the pool publishes.
/// Persistence mirrors and the scheduler's overlap tracking hang off
/// this seam.
pub type StatusListener = Arc<dyn Fn(&Job, &ProgressEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// ExecutionRegistry
// ---------------------------------------------------------------------------

/// Live executions and their cancel handles.
///
/// Entries exist from claim until the terminal event; cancelling an
/// unknown (already terminal) execution is a no-op returning `false`.
#[derive(Default)]
pub struct ExecutionRegistry {
    entries: RwLock<HashMap<ExecutionId, CancellationToken>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, execution_id: ExecutionId, cancel: CancellationToken) {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .insert(execution_id, cancel);
    }

    fn remove(&self, execution_id: ExecutionId) {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .remove(&execution_id);
    }

    /// Request cancellation. Returns whether the execution was live.
    pub fn cancel(&self, execution_id: ExecutionId) -> bool {
        let entries = self.entries.read().expect("registry lock poisoned");
        match entries.get(&execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handlers: Arc<HandlerMap>,
    hub: Arc<ProgressHub>,
    registry: Arc<ExecutionRegistry>,
    retry: RetryPolicy,
    listeners: RwLock<Vec<StatusListener>>,
    settled_listeners: RwLock<Vec<StatusListener>>,
    /// Stops workers from claiming new jobs; running jobs are unaffected.
    drain: CancellationToken,
    /// Parent of every per-execution token; cancelled only after the
    /// stop grace expires.
    exec_cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        handlers: Arc<HandlerMap>,
        hub: Arc<ProgressHub>,
        registry: Arc<ExecutionRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            handlers,
            hub,
            registry,
            retry,
            listeners: RwLock::new(Vec::new()),
            settled_listeners: RwLock::new(Vec::new()),
            drain: CancellationToken::new(),
            exec_cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Register a status listener. Must happen before `start`.
    pub fn on_status_change(&self, listener: StatusListener) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Register a listener invoked once per job, with the terminal event
    /// of its final attempt. Not called for attempts that re-enqueue a
    /// retry, so overlap latches stay held until the job truly ends.
    pub fn on_job_settled(&self, listener: StatusListener) {
        self.settled_listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Spawn `count` worker loops.
    pub fn start(self: &Arc<Self>, count: usize) {
        let mut workers = self.workers.lock().expect("worker lock poisoned");
        for worker_index in 0..count {
            let pool = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                tracing::debug!(worker_index, "Worker started");
                while let Some(job) = pool.queue.dequeue(&pool.drain).await {
                    pool.process(job).await;
                }
                tracing::debug!(worker_index, "Worker stopped");
            }));
        }
        tracing::info!(worker_count = count, "Worker pool started");
    }

    /// Stop the pool: stop claiming new work, wait up to `grace` for
    /// running jobs to reach a terminal state, then cancel whatever is
    /// still in flight. `grace = 0` cancels immediately.
    pub async fn stop(&self, grace: Duration) {
        self.drain.cancel();
        let workers: Vec<JoinHandle<()>> =
            self.workers.lock().expect("worker lock poisoned").drain(..).collect();
        let drain_all = async {
            for w in workers {
                let _ = w.await;
            }
        };
        tokio::pin!(drain_all);
        if tokio::time::timeout(grace, &mut drain_all).await.is_err() {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                live = self.registry.live_count(),
                "Stop grace expired, cancelling in-flight executions"
            );
            self.exec_cancel.cancel();
            // Cancellation is cooperative; give handlers a bounded
            // window to observe it before abandoning the join.
            if tokio::time::timeout(Duration::from_secs(5), &mut drain_all)
                .await
                .is_err()
            {
                tracing::error!("Workers did not observe cancellation in time");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    /// Run one claimed job through its full lifecycle.
    async fn process(&self, job: Job) {
        let execution_id = uuid::Uuid::now_v7();
        let cancel = self.exec_cancel.child_token();
        self.registry.register(execution_id, cancel.clone());

        let ctx = JobContext {
            job: job.clone(),
            execution_id,
            cancel: cancel.clone(),
            hub: Arc::clone(&self.hub),
            started: Instant::now(),
        };

        let initial = ctx.event(ExecStatus::Pending, 0);
        self.hub.open(initial.clone());
        self.emit(&job, &initial);

        let running = ctx.event(ExecStatus::Running, 0);
        self.hub.publish(running.clone());
        self.emit(&job, &running);
        tracing::info!(
            job_id = %job.job_id,
            execution_id = %execution_id,
            kind = %job.kind,
            attempt = job.attempt,
            "Execution started"
        );

        let result = match self.handlers.get(job.kind) {
            Some(handler) => {
                let deadline = job.kind.default_timeout();
                match tokio::time::timeout(
                    deadline,
                    std::panic::AssertUnwindSafe(handler.run(&ctx)).catch_unwind(),
                )
                .await
                {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "non-string panic payload".into());
                        tracing::error!(
                            job_id = %job.job_id,
                            execution_id = %execution_id,
                            kind = %job.kind,
                            panic = %message,
                            backtrace = %std::backtrace::Backtrace::force_capture(),
                            "Handler panicked"
                        );
                        Err(CoreError::Internal(format!("handler panicked: {message}")))
                    }
                    Err(_elapsed) => {
                        cancel.cancel();
                        Err(CoreError::Timeout(deadline))
                    }
                }
            }
            None => Err(CoreError::Configuration(format!(
                "no handler registered for kind {}",
                job.kind
            ))),
        };

        match result {
            Ok(outcome) => self.finish_completed(&job, &ctx, outcome),
            Err(error) => self.finish_failed(&job, &ctx, error),
        }

        self.registry.remove(execution_id);
        self.hub.close(execution_id);
    }

    fn finish_completed(&self, job: &Job, ctx: &JobContext, outcome: HandlerOutcome) {
        let mut event = ctx.event(ExecStatus::Completed, 100);
        event.rows_processed = outcome.rows_processed;
        event.warnings = outcome.warnings;
        tracing::info!(
            job_id = %job.job_id,
            execution_id = %ctx.execution_id,
            kind = %job.kind,
            rows = outcome.rows_processed,
            warnings = outcome.warnings,
            elapsed_ms = event.elapsed_ms,
            "Execution completed"
        );
        self.hub.publish(event.clone());
        self.emit(job, &event);
        self.emit_settled(job, &event);
    }

    fn finish_failed(&self, job: &Job, ctx: &JobContext, error: CoreError) {
        // Terminal events keep the last reported progress; only
        // Completed reaches 100.
        let last_progress = self
            .hub
            .latest(ctx.execution_id)
            .map(|e| e.progress)
            .unwrap_or(0);

        let kind = error.kind();
        let status = if kind == ErrorKind::Cancelled {
            ExecStatus::Cancelled
        } else {
            ExecStatus::Failed
        };
        let mut event = ctx.event(status, last_progress);
        if status == ExecStatus::Failed {
            event.error = Some(error.to_string());
        }

        // A re-enqueued retry means the job is not done; the settled
        // seam (and with it the scheduler's overlap latch) stays quiet
        // until the final attempt.
        let mut settled = true;
        if status == ExecStatus::Cancelled {
            tracing::info!(
                job_id = %job.job_id,
                execution_id = %ctx.execution_id,
                kind = %job.kind,
                "Execution cancelled"
            );
        } else {
            match self.retry.decide(job.attempt, kind, job.kind) {
                RetryDecision::Retry { after } => {
                    let mut next = job.clone();
                    next.attempt += 1;
                    next.scheduled_for =
                        Utc::now() + chrono::Duration::from_std(after).unwrap_or_default();
                    tracing::warn!(
                        job_id = %job.job_id,
                        execution_id = %ctx.execution_id,
                        kind = %job.kind,
                        attempt = job.attempt,
                        retry_in_ms = after.as_millis() as u64,
                        error = %error,
                        "Execution failed, retry scheduled"
                    );
                    match self.queue.enqueue(next) {
                        Ok(()) => settled = false,
                        Err(enqueue_err) => self.log_dead_letter(job, ctx, &enqueue_err),
                    }
                }
                RetryDecision::GiveUp => self.log_dead_letter(job, ctx, &error),
            }
        }

        self.hub.publish(event.clone());
        self.emit(job, &event);
        if settled {
            self.emit_settled(job, &event);
        }
    }

    fn log_dead_letter(&self, job: &Job, ctx: &JobContext, error: &CoreError) {
        tracing::error!(
            code = "dead_letter",
            job_id = %job.job_id,
            execution_id = %ctx.execution_id,
            kind = %job.kind,
            attempt = job.attempt,
            error = %error,
            "Job dead-lettered"
        );
    }

    fn emit(&self, job: &Job, event: &ProgressEvent) {
        for listener in self.listeners.read().expect("listener lock poisoned").iter() {
            listener(job, event);
        }
    }

    fn emit_settled(&self, job: &Job, event: &ProgressEvent) {
        for listener in self
            .settled_listeners
            .read()
            .expect("listener lock poisoned")
            .iter()
        {
            listener(job, event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use vantage_core::job::{JobKind, PRIORITY_NORMAL};

    use crate::dispatch::JobHandler;

    use super::*;

    struct Fixed(Result<HandlerOutcome, fn() -> CoreError>);

    #[async_trait]
    impl JobHandler for Fixed {
        async fn run(&self, _ctx: &JobContext) -> Result<HandlerOutcome, CoreError> {
            match &self.0 {
                Ok(outcome) => Ok(outcome.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn run(&self, _ctx: &JobContext) -> Result<HandlerOutcome, CoreError> {
            panic!("handler bug")
        }
    }

    struct Stalls;

    #[async_trait]
    impl JobHandler for Stalls {
        async fn run(&self, ctx: &JobContext) -> Result<HandlerOutcome, CoreError> {
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(CoreError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(HandlerOutcome::default()),
            }
        }
    }

    /// Runs for a short while, ignoring cancellation. Can only finish by
    /// completing.
    struct SlowThenOk;

    #[async_trait]
    impl JobHandler for SlowThenOk {
        async fn run(&self, _ctx: &JobContext) -> Result<HandlerOutcome, CoreError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(HandlerOutcome::default())
        }
    }

    /// Fails the first run with a transient error, succeeds after.
    #[derive(Default)]
    struct FlakyOnce(std::sync::atomic::AtomicU32);

    #[async_trait]
    impl JobHandler for FlakyOnce {
        async fn run(&self, _ctx: &JobContext) -> Result<HandlerOutcome, CoreError> {
            if self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Err(CoreError::SourceUnavailable("connection refused".into()))
            } else {
                Ok(HandlerOutcome::default())
            }
        }
    }

    struct Harness {
        pool: Arc<WorkerPool>,
        queue: Arc<JobQueue>,
        hub: Arc<ProgressHub>,
        events: Arc<Mutex<Vec<(Job, ProgressEvent)>>>,
        settled: Arc<Mutex<Vec<(Job, ProgressEvent)>>>,
    }

    fn harness(handlers: HandlerMap) -> Harness {
        let queue = Arc::new(JobQueue::default());
        let hub = Arc::new(ProgressHub::default());
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            Arc::new(handlers),
            Arc::clone(&hub),
            Arc::new(ExecutionRegistry::new()),
            RetryPolicy::default(),
        ));
        let events: Arc<Mutex<Vec<(Job, ProgressEvent)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        pool.on_status_change(Arc::new(move |job, event| {
            sink.lock().unwrap().push((job.clone(), event.clone()));
        }));
        let settled: Arc<Mutex<Vec<(Job, ProgressEvent)>>> = Arc::new(Mutex::new(Vec::new()));
        let settled_sink = Arc::clone(&settled);
        pool.on_job_settled(Arc::new(move |job, event| {
            settled_sink.lock().unwrap().push((job.clone(), event.clone()));
        }));
        Harness {
            pool,
            queue,
            hub,
            events,
            settled,
        }
    }

    async fn wait_terminal(h: &Harness, job_id: uuid::Uuid) -> ProgressEvent {
        for _ in 0..200 {
            if let Some((_, e)) = h
                .events
                .lock()
                .unwrap()
                .iter()
                .find(|(j, e)| j.job_id == job_id && e.is_terminal())
            {
                return e.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no terminal event for job {job_id}");
    }

    async fn wait_status(h: &Harness, job_id: uuid::Uuid, status: ExecStatus) -> ProgressEvent {
        for _ in 0..200 {
            if let Some((_, e)) = h
                .events
                .lock()
                .unwrap()
                .iter()
                .find(|(j, e)| j.job_id == job_id && e.status == status)
            {
                return e.clone();
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    #[tokio::test]
    async fn successful_job_completes_at_full_progress() {
        let h = harness(HandlerMap::new().register(
            JobKind::Pulse,
            Arc::new(Fixed(Ok(HandlerOutcome {
                rows_processed: 7,
                warnings: 1,
            }))),
        ));
        h.pool.start(1);

        let job = Job::new(JobKind::Pulse, uuid::Uuid::now_v7(), PRIORITY_NORMAL);
        let job_id = job.job_id;
        h.queue.enqueue(job).unwrap();

        let terminal = wait_terminal(&h, job_id).await;
        assert_eq!(terminal.status, ExecStatus::Completed);
        assert_eq!(terminal.progress, 100);
        assert_eq!(terminal.rows_processed, 7);
        assert_eq!(terminal.warnings, 1);
        assert_eq!(h.hub.open_count(), 0);

        h.pool.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn missing_handler_fails_permanently() {
        let h = harness(HandlerMap::new());
        h.pool.start(1);

        let job = Job::new(JobKind::EmailSend, uuid::Uuid::now_v7(), PRIORITY_NORMAL);
        let job_id = job.job_id;
        h.queue.enqueue(job).unwrap();

        let terminal = wait_terminal(&h, job_id).await;
        assert_eq!(terminal.status, ExecStatus::Failed);
        assert!(terminal.error.is_some());
        // Permanent: nothing re-enqueued.
        assert!(h.queue.is_empty());

        h.pool.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn panicking_handler_is_failed_not_crashed() {
        let h = harness(HandlerMap::new().register(JobKind::Pulse, Arc::new(Panics)));
        h.pool.start(1);

        let job = Job::new(JobKind::Pulse, uuid::Uuid::now_v7(), PRIORITY_NORMAL);
        let job_id = job.job_id;
        h.queue.enqueue(job).unwrap();

        let terminal = wait_terminal(&h, job_id).await;
        assert_eq!(terminal.status, ExecStatus::Failed);
        // The panic payload is surfaced in the terminal error.
        assert!(terminal.error.as_deref().unwrap_or("").contains("handler bug"));
        assert!(h.queue.is_empty());

        // The worker survives and processes the next job.
        h.pool.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn stop_grace_allows_running_job_to_finish() {
        let h = harness(HandlerMap::new().register(JobKind::Pulse, Arc::new(SlowThenOk)));
        h.pool.start(1);

        let job = Job::new(JobKind::Pulse, uuid::Uuid::now_v7(), PRIORITY_NORMAL);
        let job_id = job.job_id;
        h.queue.enqueue(job).unwrap();
        wait_status(&h, job_id, ExecStatus::Running).await;

        // The handler needs a moment more; the grace covers it.
        h.pool.stop(Duration::from_secs(5)).await;

        let terminal = wait_terminal(&h, job_id).await;
        assert_eq!(terminal.status, ExecStatus::Completed);
    }

    #[tokio::test]
    async fn stop_with_zero_grace_cancels_immediately() {
        let h = harness(HandlerMap::new().register(JobKind::Pipeline, Arc::new(Stalls)));
        h.pool.start(1);

        let job = Job::new(JobKind::Pipeline, uuid::Uuid::now_v7(), PRIORITY_NORMAL);
        let job_id = job.job_id;
        h.queue.enqueue(job).unwrap();
        wait_status(&h, job_id, ExecStatus::Running).await;

        h.pool.stop(Duration::ZERO).await;

        let terminal = wait_terminal(&h, job_id).await;
        assert_eq!(terminal.status, ExecStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_job_settles_only_after_final_attempt() {
        let h = harness(
            HandlerMap::new().register(JobKind::Pipeline, Arc::new(FlakyOnce::default())),
        );
        h.pool.start(1);

        let schedule_id = uuid::Uuid::now_v7();
        let job = Job::new(JobKind::Pipeline, uuid::Uuid::now_v7(), PRIORITY_NORMAL)
            .with_schedule(schedule_id);
        let job_id = job.job_id;
        h.queue.enqueue(job).unwrap();

        // First attempt fails transiently: terminal for the attempt,
        // but the job is not settled while its retry is queued.
        wait_status(&h, job_id, ExecStatus::Failed).await;
        assert!(h.settled.lock().unwrap().is_empty());

        // The retry succeeds and settles the job exactly once.
        wait_status(&h, job_id, ExecStatus::Completed).await;
        let settled = h.settled.lock().unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].0.schedule_id, Some(schedule_id));
        assert_eq!(settled[0].1.status, ExecStatus::Completed);
        drop(settled);

        h.pool.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn explicit_cancel_yields_cancelled_terminal() {
        let h = harness(HandlerMap::new().register(JobKind::Pipeline, Arc::new(Stalls)));
        let registry = Arc::clone(&h.pool.registry);
        h.pool.start(1);

        let job = Job::new(JobKind::Pipeline, uuid::Uuid::now_v7(), PRIORITY_NORMAL);
        let job_id = job.job_id;
        h.queue.enqueue(job).unwrap();

        // Wait until the execution is live, then cancel it.
        let execution_id = loop {
            if let Some((_, e)) = h
                .events
                .lock()
                .unwrap()
                .iter()
                .find(|(j, e)| j.job_id == job_id && e.status == ExecStatus::Running)
            {
                break e.execution_id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(registry.cancel(execution_id));

        let terminal = wait_terminal(&h, job_id).await;
        assert_eq!(terminal.status, ExecStatus::Cancelled);
        // Cancelled is never retried.
        assert!(h.queue.is_empty());
        // Idempotent once terminal.
        assert!(!registry.cancel(execution_id));

        h.pool.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_and_respects_attempt_cap() {
        let h = harness(HandlerMap::new().register(JobKind::AlertCheck, Arc::new(Stalls)));
        h.pool.start(1);

        let job = Job::new(JobKind::AlertCheck, uuid::Uuid::now_v7(), PRIORITY_NORMAL);
        let job_id = job.job_id;
        h.queue.enqueue(job).unwrap();

        let terminal = wait_terminal(&h, job_id).await;
        assert_eq!(terminal.status, ExecStatus::Failed);
        assert!(terminal.error.as_deref().unwrap_or("").contains("timed out"));
        // AlertCheck has max_attempts 1, so even a retryable timeout
        // dead-letters instead of re-enqueueing.
        assert!(h.queue.is_empty());

        h.pool.stop(Duration::from_millis(100)).await;
    }
}
