//! Pipeline jobs: thin adapter over the staged executor.

use std::sync::Arc;

use async_trait::async_trait;
use vantage_core::error::CoreError;
use vantage_pipeline::PipelineExecutor;

use crate::dispatch::{HandlerOutcome, JobContext, JobHandler};

pub struct PipelineJobHandler {
    executor: Arc<PipelineExecutor>,
}

impl PipelineJobHandler {
    pub fn new(executor: Arc<PipelineExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl JobHandler for PipelineJobHandler {
    async fn run(&self, ctx: &JobContext) -> Result<HandlerOutcome, CoreError> {
        let outcome = self
            .executor
            .run(&ctx.job, ctx.execution_id, ctx.cancel.clone())
            .await?;
        Ok(HandlerOutcome {
            rows_processed: outcome.rows_processed,
            warnings: outcome.warnings,
        })
    }
}
