//! Pulse jobs: periodic dashboard digest notification.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use vantage_core::error::CoreError;

use crate::dispatch::{HandlerOutcome, JobContext, JobHandler};
use crate::notify::{Notice, Notifier};

pub struct PulseHandler {
    notifier: Arc<dyn Notifier>,
}

impl PulseHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl JobHandler for PulseHandler {
    async fn run(&self, ctx: &JobContext) -> Result<HandlerOutcome, CoreError> {
        if ctx.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        self.notifier
            .send(Notice {
                entity_id: ctx.job.entity_id,
                subject: "Dashboard pulse".into(),
                body: format!("Digest generated at {}.", Utc::now().to_rfc3339()),
            })
            .await?;
        Ok(HandlerOutcome {
            rows_processed: 1,
            warnings: 0,
        })
    }
}
