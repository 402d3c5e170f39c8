//! Cron scheduler: materializes jobs from recurring schedule specs.
//!
//! A single long-lived task sleeps until the earliest `next_run_at`
//! (capped, so edits and clock drift are picked up within a tick) and
//! fires everything due. A schedule that missed ticks while the process
//! was down or inactive fires exactly once and then catches up to now;
//! `next_run_at` always advances strictly past the current instant.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use vantage_core::error::CoreError;
use vantage_core::job::{Job, JobKind};
use vantage_core::schedule::ScheduleSpec;
use vantage_core::types::{ScheduleId, Timestamp};

use crate::queue::JobQueue;

/// Upper bound on the scheduler's sleep, so schedule edits are noticed
/// within a tick even without a wakeup.
pub const DEFAULT_TICK_CAP: Duration = Duration::from_secs(60);

/// Pause after a full queue before re-checking due schedules.
const BACKPRESSURE_DELAY: Duration = Duration::from_secs(1);

pub struct CronScheduler {
    schedules: Mutex<HashMap<ScheduleId, ScheduleSpec>>,
    /// Schedules with a live materialized job; enforced by the
    /// no-overlap policy, cleared via [`mark_finished`](Self::mark_finished).
    running: Mutex<HashSet<ScheduleId>>,
    queue: Arc<JobQueue>,
    /// Woken on register/delete/activate so the loop re-plans its sleep.
    notify: Notify,
    tick_cap: Duration,
}

impl CronScheduler {
    pub fn new(queue: Arc<JobQueue>, tick_cap: Duration) -> Self {
        Self {
            schedules: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            queue,
            notify: Notify::new(),
            tick_cap,
        }
    }

    /// Add a schedule. `next_run_at` is computed now when unset.
    pub fn register(&self, mut spec: ScheduleSpec) -> Result<ScheduleId, CoreError> {
        if spec.next_run_at.is_none() {
            spec.next_run_at = Some(spec.next_occurrence(Utc::now())?);
        }
        let schedule_id = spec.schedule_id;
        tracing::info!(
            schedule_id = %schedule_id,
            kind = %spec.kind,
            next_run_at = ?spec.next_run_at,
            "Schedule registered"
        );
        self.schedules
            .lock()
            .expect("scheduler lock poisoned")
            .insert(schedule_id, spec);
        self.notify.notify_waiters();
        Ok(schedule_id)
    }

    /// Remove a schedule. Returns whether it existed. A job already
    /// materialized from it keeps running.
    pub fn delete(&self, schedule_id: ScheduleId) -> bool {
        let removed = self
            .schedules
            .lock()
            .expect("scheduler lock poisoned")
            .remove(&schedule_id)
            .is_some();
        if removed {
            tracing::info!(schedule_id = %schedule_id, "Schedule deleted");
            self.notify.notify_waiters();
        }
        removed
    }

    /// Activate or deactivate. A reactivated schedule with a stale
    /// `next_run_at` fires once on the next tick, then catches up.
    pub fn set_active(&self, schedule_id: ScheduleId, active: bool) -> bool {
        let mut schedules = self.schedules.lock().expect("scheduler lock poisoned");
        let Some(spec) = schedules.get_mut(&schedule_id) else {
            return false;
        };
        spec.active = active;
        drop(schedules);
        self.notify.notify_waiters();
        true
    }

    pub fn get(&self, schedule_id: ScheduleId) -> Option<ScheduleSpec> {
        self.schedules
            .lock()
            .expect("scheduler lock poisoned")
            .get(&schedule_id)
            .cloned()
    }

    /// Schedules, optionally filtered by kind, ordered by next run.
    pub fn list(&self, kind: Option<JobKind>) -> Vec<ScheduleSpec> {
        let mut specs: Vec<ScheduleSpec> = self
            .schedules
            .lock()
            .expect("scheduler lock poisoned")
            .values()
            .filter(|s| kind.map_or(true, |k| s.kind == k))
            .cloned()
            .collect();
        specs.sort_by_key(|s| s.next_run_at);
        specs
    }

    /// Clear the no-overlap latch once a materialized job reached a
    /// terminal state. Wired to the pool's status listeners.
    pub fn mark_finished(&self, schedule_id: ScheduleId) {
        self.running
            .lock()
            .expect("scheduler lock poisoned")
            .remove(&schedule_id);
        self.notify.notify_waiters();
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            tick_cap_secs = self.tick_cap.as_secs(),
            "Cron scheduler started"
        );
        loop {
            // Register for wakeups before planning, so a concurrent
            // register is not missed.
            let notified = self.notify.notified();
            let backpressure = self.fire_due(Utc::now());
            let sleep_for = if backpressure {
                BACKPRESSURE_DELAY
            } else {
                self.until_next_due(Utc::now())
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Cron scheduler shutting down");
                    break;
                }
                _ = notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Fire every due active schedule once. Returns whether the queue
    /// pushed back.
    fn fire_due(&self, now: Timestamp) -> bool {
        let mut backpressure = false;
        let mut schedules = self.schedules.lock().expect("scheduler lock poisoned");
        let mut running = self.running.lock().expect("scheduler lock poisoned");

        for spec in schedules.values_mut() {
            if !spec.active {
                continue;
            }
            let Some(due) = spec.next_run_at else { continue };
            if due > now {
                continue;
            }

            if running.contains(&spec.schedule_id) {
                tracing::warn!(
                    code = "skipped_overlap",
                    schedule_id = %spec.schedule_id,
                    kind = %spec.kind,
                    "Previous run still live, skipping this occurrence"
                );
                advance(spec, now);
                continue;
            }

            let job = Job::new(spec.kind, spec.entity_id, spec.priority)
                .with_schedule(spec.schedule_id);
            match self.queue.enqueue(job) {
                Ok(()) => {
                    tracing::info!(
                        schedule_id = %spec.schedule_id,
                        kind = %spec.kind,
                        due = %due,
                        "Schedule fired"
                    );
                    running.insert(spec.schedule_id);
                    spec.last_run_at = Some(now);
                    advance(spec, now);
                }
                Err(CoreError::QueueFull) => {
                    // Keep next_run_at: the fire is still owed and will
                    // be attempted again after the backpressure delay.
                    tracing::warn!(
                        code = "scheduler_backpressure",
                        schedule_id = %spec.schedule_id,
                        kind = %spec.kind,
                        "Queue full, schedule fire deferred"
                    );
                    backpressure = true;
                }
                Err(e) => {
                    tracing::error!(
                        schedule_id = %spec.schedule_id,
                        error = %e,
                        "Schedule fire rejected, advancing past it"
                    );
                    advance(spec, now);
                }
            }
        }
        backpressure
    }

    /// Time until the earliest due active schedule, clamped to the cap.
    fn until_next_due(&self, now: Timestamp) -> Duration {
        let schedules = self.schedules.lock().expect("scheduler lock poisoned");
        schedules
            .values()
            .filter(|s| s.active)
            .filter_map(|s| s.next_run_at)
            .map(|due| (due - now).to_std().unwrap_or(Duration::ZERO))
            .min()
            .unwrap_or(self.tick_cap)
            .min(self.tick_cap)
    }
}

/// Advance strictly past `now`, catching up over any missed occurrences.
fn advance(spec: &mut ScheduleSpec, now: Timestamp) {
    match spec.next_occurrence(now) {
        Ok(next) => spec.next_run_at = Some(next),
        Err(e) => {
            // Unsatisfiable recurrence; a fire loop would be worse.
            tracing::error!(
                schedule_id = %spec.schedule_id,
                error = %e,
                "Cannot compute next occurrence, deactivating schedule"
            );
            spec.active = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
