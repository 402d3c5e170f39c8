//! Scheduled report jobs: pull the report's rows and deliver a rendered
//! summary through the notifier.

use std::sync::Arc;

use async_trait::async_trait;
use vantage_core::error::CoreError;
use vantage_core::status::ExecStatus;
use vantage_pipeline::{DataSource, SourceSpec};

use crate::dispatch::{HandlerOutcome, JobContext, JobHandler};
use crate::notify::{Notice, Notifier};

/// Most rows a report body will enumerate before summarizing.
const PREVIEW_ROWS: usize = 10;

pub struct ReportHandler {
    source: Arc<dyn DataSource>,
    notifier: Arc<dyn Notifier>,
}

impl ReportHandler {
    pub fn new(source: Arc<dyn DataSource>, notifier: Arc<dyn Notifier>) -> Self {
        Self { source, notifier }
    }
}

#[async_trait]
impl JobHandler for ReportHandler {
    async fn run(&self, ctx: &JobContext) -> Result<HandlerOutcome, CoreError> {
        let mut stream = self.source.open(&SourceSpec::default()).await?;

        let mut total: u64 = 0;
        let mut preview = Vec::new();
        while let Some(next) = stream.next().await {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let row = next?;
            if preview.len() < PREVIEW_ROWS {
                preview.push(serde_json::Value::Object(row).to_string());
            }
            total += 1;
        }
        ctx.hub.publish(ctx.event(ExecStatus::Running, 50));

        let body = if total == 0 {
            "No data for this period.".to_string()
        } else {
            format!("{total} rows.\n{}", preview.join("\n"))
        };
        self.notifier
            .send(Notice {
                entity_id: ctx.job.entity_id,
                subject: "Scheduled report".into(),
                body,
            })
            .await?;

        Ok(HandlerOutcome {
            rows_processed: total,
            warnings: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use vantage_core::job::{Job, JobKind, PRIORITY_NORMAL};
    use vantage_events::ProgressHub;
    use vantage_pipeline::MemorySource;

    use crate::notify::RecordingNotifier;

    use super::*;

    fn ctx(kind: JobKind) -> JobContext {
        JobContext {
            job: Job::new(kind, uuid::Uuid::now_v7(), PRIORITY_NORMAL),
            execution_id: uuid::Uuid::now_v7(),
            cancel: CancellationToken::new(),
            hub: Arc::new(ProgressHub::default()),
            started: Instant::now(),
        }
    }

    #[tokio::test]
    async fn report_renders_row_count_and_sends() {
        let rows = vec![json!({"a": 1}).as_object().unwrap().clone(); 3];
        let notifier = Arc::new(RecordingNotifier::new());
        let handler = ReportHandler::new(Arc::new(MemorySource::new(rows)), Arc::clone(&notifier) as Arc<dyn Notifier>);

        let outcome = handler.run(&ctx(JobKind::ScheduledReport)).await.unwrap();
        assert_eq!(outcome.rows_processed, 3);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.starts_with("3 rows."));
    }

    #[tokio::test]
    async fn empty_report_still_delivers() {
        let notifier = Arc::new(RecordingNotifier::new());
        let handler = ReportHandler::new(
            Arc::new(MemorySource::new(Vec::new())),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
        );

        let outcome = handler.run(&ctx(JobKind::ScheduledReport)).await.unwrap();
        assert_eq!(outcome.rows_processed, 0);
        assert_eq!(notifier.sent()[0].body, "No data for this period.");
    }

    #[tokio::test]
    async fn delivery_failure_propagates_as_transient() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.fail_next_sends(1);
        let handler = ReportHandler::new(
            Arc::new(MemorySource::new(Vec::new())),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
        );

        let err = handler.run(&ctx(JobKind::ScheduledReport)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
