//! Job handler registry.
//!
//! Each [`JobKind`](vantage_core::job::JobKind) routes to exactly one
//! handler; a kind without a handler is dead-lettered at dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use vantage_core::error::CoreError;
use vantage_core::job::{Job, JobKind};
use vantage_core::status::ExecStatus;
use vantage_core::types::ExecutionId;
use vantage_events::{ProgressEvent, ProgressHub};

/// Everything a handler gets for one attempt.
pub struct JobContext {
    pub job: Job,
    pub execution_id: ExecutionId,
    /// Fires on explicit cancel and on pool shutdown. Handlers observe
    /// it at their suspension points.
    pub cancel: CancellationToken,
    /// For handlers that report intermediate progress. The pool owns the
    /// terminal event.
    pub hub: Arc<ProgressHub>,
    pub started: Instant,
}

impl JobContext {
    /// Build a progress event carrying this attempt's correlation ids.
    pub fn event(&self, status: ExecStatus, progress: u8) -> ProgressEvent {
        let mut event = ProgressEvent::pending(
            self.execution_id,
            self.job.job_id,
            self.job.entity_id,
            self.job.kind,
        );
        event.status = status;
        event.progress = progress;
        event.elapsed_ms = self.started.elapsed().as_millis() as u64;
        event.timestamp = Utc::now();
        event
    }
}

/// What a successful attempt reports back.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    pub rows_processed: u64,
    pub warnings: u64,
}

/// One job kind's execution logic.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<HandlerOutcome, CoreError>;
}

/// Kind-to-handler routing table. Built once at startup, then read-only.
#[derive(Default)]
pub struct HandlerMap {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }
}
