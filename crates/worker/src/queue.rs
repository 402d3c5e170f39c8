//! Bounded in-memory job queue.
//!
//! Ordering at dequeue is priority ascending (lower runs first), then
//! `enqueued_at` ascending among equals. A job whose `scheduled_for`
//! lies in the future is held back; readiness is tracked on the tokio
//! clock so delayed jobs work under paused test time. Claiming removes
//! the job under the lock, so a job is handed to exactly one worker.

use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vantage_core::error::CoreError;
use vantage_core::job::Job;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Furthest-out `scheduled_for` accepted, in hours.
pub const DEFAULT_HORIZON_HOURS: i64 = 24;

struct QueuedJob {
    job: Job,
    /// `scheduled_for` mapped onto the tokio clock at enqueue time.
    ready_at: Instant,
}

/// Bounded priority queue with delayed readiness.
pub struct JobQueue {
    jobs: Mutex<Vec<QueuedJob>>,
    /// Woken on every enqueue; dequeuers also keep a head timer for the
    /// earliest future `ready_at`.
    notify: Notify,
    capacity: usize,
    horizon: chrono::Duration,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            notify: Notify::new(),
            capacity,
            horizon: chrono::Duration::hours(DEFAULT_HORIZON_HOURS),
        }
    }

    /// Add a job.
    ///
    /// Fails with `QueueFull` at capacity and with a validation error
    /// when `scheduled_for` lies beyond the acceptance horizon; both are
    /// surfaced to the caller, never retried internally.
    pub fn enqueue(&self, job: Job) -> Result<(), CoreError> {
        let now = Utc::now();
        if job.scheduled_for > now + self.horizon {
            return Err(CoreError::Validation(format!(
                "scheduled_for {} is beyond the {}h acceptance horizon",
                job.scheduled_for, self.horizon.num_hours()
            )));
        }

        {
            let mut jobs = self.jobs.lock().expect("queue lock poisoned");
            if jobs.len() >= self.capacity {
                return Err(CoreError::QueueFull);
            }
            let delay = (job.scheduled_for - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            jobs.push(QueuedJob {
                job,
                ready_at: Instant::now() + delay,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Claim the next ready job, waiting as long as needed.
    ///
    /// Returns `None` only when `cancel` fires. Safe to call from many
    /// workers at once.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<Job> {
        loop {
            // Register for wakeups before inspecting the queue, so an
            // enqueue between the check and the await is not lost.
            let notified = self.notify.notified();

            let head_timer = {
                let mut jobs = self.jobs.lock().expect("queue lock poisoned");
                let now = Instant::now();
                if let Some(index) = best_ready(&jobs, now) {
                    return Some(jobs.swap_remove(index).job);
                }
                jobs.iter().map(|q| q.ready_at).min()
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
                _ = sleep_until_head(head_timer) => {}
            }
        }
    }

    /// Claim the next ready job without waiting.
    pub fn try_dequeue(&self) -> Option<Job> {
        let mut jobs = self.jobs.lock().expect("queue lock poisoned");
        best_ready(&jobs, Instant::now()).map(|i| jobs.swap_remove(i).job)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Index of the best ready job: lowest priority value, FIFO among equals.
fn best_ready(jobs: &[QueuedJob], now: Instant) -> Option<usize> {
    jobs.iter()
        .enumerate()
        .filter(|(_, q)| q.ready_at <= now)
        .min_by(|(_, a), (_, b)| {
            a.job
                .priority
                .cmp(&b.job.priority)
                .then(a.job.enqueued_at.cmp(&b.job.enqueued_at))
        })
        .map(|(i, _)| i)
}

async fn sleep_until_head(head: Option<Instant>) {
    match head {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
