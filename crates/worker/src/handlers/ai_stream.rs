//! AI stream jobs: relay generated chunks into the progress hub so a
//! subscriber can render the stream live.

use std::sync::Arc;

use async_trait::async_trait;
use vantage_core::error::CoreError;
use vantage_core::status::ExecStatus;
use vantage_core::types::EntityId;

use crate::dispatch::{HandlerOutcome, JobContext, JobHandler};

/// Where the generated chunks come from (model client in production).
#[async_trait]
pub trait ChunkProvider: Send + Sync {
    async fn chunks(&self, entity_id: EntityId) -> Result<Vec<String>, CoreError>;
}

/// Fixed chunk list; test double and local-dev default.
pub struct StaticChunks(pub Vec<String>);

#[async_trait]
impl ChunkProvider for StaticChunks {
    async fn chunks(&self, _entity_id: EntityId) -> Result<Vec<String>, CoreError> {
        Ok(self.0.clone())
    }
}

pub struct AiStreamHandler {
    provider: Arc<dyn ChunkProvider>,
}

impl AiStreamHandler {
    pub fn new(provider: Arc<dyn ChunkProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl JobHandler for AiStreamHandler {
    async fn run(&self, ctx: &JobContext) -> Result<HandlerOutcome, CoreError> {
        let chunks = self.provider.chunks(ctx.job.entity_id).await?;
        let total = chunks.len();

        for (index, _chunk) in chunks.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            // 100 is reserved for the pool's terminal event.
            let progress = (((index + 1) * 100 / total.max(1)) as u8).min(99);
            let mut event = ctx.event(ExecStatus::Running, progress);
            event.rows_processed = (index + 1) as u64;
            ctx.hub.publish(event);
            tokio::task::yield_now().await;
        }

        Ok(HandlerOutcome {
            rows_processed: total as u64,
            warnings: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio_util::sync::CancellationToken;
    use vantage_core::job::{Job, JobKind, PRIORITY_NORMAL};
    use vantage_events::{ProgressEvent, ProgressHub};

    use super::*;

    fn ctx(hub: Arc<ProgressHub>) -> JobContext {
        JobContext {
            job: Job::new(JobKind::AiStream, uuid::Uuid::now_v7(), PRIORITY_NORMAL),
            execution_id: uuid::Uuid::now_v7(),
            cancel: CancellationToken::new(),
            hub,
            started: Instant::now(),
        }
    }

    #[tokio::test]
    async fn streams_progress_per_chunk() {
        let hub = Arc::new(ProgressHub::default());
        let handler = AiStreamHandler::new(Arc::new(StaticChunks(vec![
            "alpha".into(),
            "beta".into(),
            "gamma".into(),
        ])));
        let ctx = ctx(Arc::clone(&hub));
        hub.open(ProgressEvent::pending(
            ctx.execution_id,
            ctx.job.job_id,
            ctx.job.entity_id,
            ctx.job.kind,
        ));
        let mut rx = hub.subscribe(ctx.execution_id).receiver.unwrap();

        let outcome = handler.run(&ctx).await.unwrap();
        assert_eq!(outcome.rows_processed, 3);

        let mut progresses = Vec::new();
        while let Ok(e) = rx.try_recv() {
            progresses.push(e.progress);
        }
        assert_eq!(progresses, vec![33, 66, 99]);
    }

    #[tokio::test]
    async fn cancelled_stream_stops_early() {
        let hub = Arc::new(ProgressHub::default());
        let handler = AiStreamHandler::new(Arc::new(StaticChunks(vec!["only".into()])));
        let ctx = ctx(hub);
        ctx.cancel.cancel();

        let err = handler.run(&ctx).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }
}
