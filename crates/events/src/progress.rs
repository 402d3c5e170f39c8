//! Progress event payload.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use vantage_core::job::JobKind;
use vantage_core::status::ExecStatus;
use vantage_core::types::{EntityId, ExecutionId, JobId, Timestamp};

/// One observation of a running execution.
///
/// Events for a given execution are published by a single writer, so
/// subscribers see them in publish order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub entity_id: EntityId,
    pub kind: JobKind,
    pub status: ExecStatus,
    /// 0-100, non-decreasing; 100 exactly when status is `Completed`.
    pub progress: u8,
    pub rows_processed: u64,
    /// Warn-severity quality violations observed so far.
    pub warnings: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub timestamp: Timestamp,
}

impl ProgressEvent {
    /// A fresh `Pending` event at progress 0.
    pub fn pending(execution_id: ExecutionId, job_id: JobId, entity_id: EntityId, kind: JobKind) -> Self {
        Self {
            execution_id,
            job_id,
            entity_id,
            kind,
            status: ExecStatus::Pending,
            progress: 0,
            rows_processed: 0,
            warnings: 0,
            error: None,
            elapsed_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
