/// Queue-side identifier of a unit of work.
pub type JobId = uuid::Uuid;

/// Identifier of a single execution attempt of a job. Retries mint a
/// fresh one, so subscribers never see an execution restart.
pub type ExecutionId = uuid::Uuid;

/// Identifier of a recurring schedule.
pub type ScheduleId = uuid::Uuid;

/// External entity a job points at (pipeline, report, alert, ...).
/// Owned by the persistence collaborator; opaque to the core.
pub type EntityId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
