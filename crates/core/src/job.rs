//! Job descriptors and per-kind defaults.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{EntityId, JobId, ScheduleId, Timestamp};

// ---------------------------------------------------------------------------
// Priority constants
// ---------------------------------------------------------------------------

/// Priority value for urgent jobs. Dequeued before all others.
pub const PRIORITY_URGENT: i32 = -10;

/// Priority value for normal jobs. Default.
pub const PRIORITY_NORMAL: i32 = 0;

/// Priority value for background jobs. Dequeued last.
pub const PRIORITY_BACKGROUND: i32 = 10;

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// The routing key: each kind has exactly one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Pipeline,
    ScheduledReport,
    AlertCheck,
    EmailSend,
    Pulse,
    AiStream,
}

impl JobKind {
    /// Per-execution deadline imposed by the worker pool. Exceeding it
    /// cancels the handler and yields a retryable timeout error.
    pub fn default_timeout(self) -> Duration {
        match self {
            JobKind::Pipeline => Duration::from_secs(30 * 60),
            JobKind::ScheduledReport => Duration::from_secs(10 * 60),
            JobKind::AlertCheck => Duration::from_secs(60),
            JobKind::EmailSend => Duration::from_secs(2 * 60),
            JobKind::Pulse => Duration::from_secs(2 * 60),
            JobKind::AiStream => Duration::from_secs(10 * 60),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobKind::Pipeline => "pipeline",
            JobKind::ScheduledReport => "scheduled_report",
            JobKind::AlertCheck => "alert_check",
            JobKind::EmailSend => "email_send",
            JobKind::Pulse => "pulse",
            JobKind::AiStream => "ai_stream",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work sitting in the queue.
///
/// Descriptors are in-memory only; they are removed when the execution
/// reaches a terminal state. Ownership transfers from the queue to a
/// worker at claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub kind: JobKind,
    /// Row in the collaborator's store this job operates on.
    pub entity_id: EntityId,
    /// Lower value dequeues first.
    pub priority: i32,
    pub enqueued_at: Timestamp,
    /// 0-based attempt counter; bumped on each retry re-enqueue.
    pub attempt: u32,
    /// The job is not eligible for dequeue before this instant.
    pub scheduled_for: Timestamp,
    /// Set when the job was materialized by the cron scheduler; used to
    /// enforce the no-overlap policy.
    pub schedule_id: Option<ScheduleId>,
}

impl Job {
    /// Create a job eligible to run immediately.
    pub fn new(kind: JobKind, entity_id: EntityId, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            job_id: uuid::Uuid::now_v7(),
            kind,
            entity_id,
            priority,
            enqueued_at: now,
            attempt: 0,
            scheduled_for: now,
            schedule_id: None,
        }
    }

    /// Delay eligibility by `delay` from now.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.scheduled_for = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self
    }

    /// Tag the job with its originating schedule.
    pub fn with_schedule(mut self, schedule_id: ScheduleId) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    /// Whether the job is eligible for dequeue at `now`.
    pub fn is_ready(&self, now: Timestamp) -> bool {
        self.scheduled_for <= now
    }
}
