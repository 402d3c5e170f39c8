//! Alert check jobs: evaluate a threshold condition over the alert's
//! source query and notify when it fires.
//!
//! Never retried (attempt cap 1): the next scheduled evaluation
//! supersedes a failed one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vantage_core::error::CoreError;
use vantage_core::transform::{evaluate, FilterOp};
use vantage_core::types::EntityId;
use vantage_pipeline::{DataSource, SourceSpec};

use crate::dispatch::{HandlerOutcome, JobContext, JobHandler};
use crate::notify::{Notice, Notifier};

/// Condition an alert watches for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSpec {
    pub column: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
    /// Human-readable description used in the notification subject.
    pub message: String,
}

pub struct AlertCheckHandler {
    alerts: RwLock<HashMap<EntityId, AlertSpec>>,
    source: Arc<dyn DataSource>,
    notifier: Arc<dyn Notifier>,
}

impl AlertCheckHandler {
    pub fn new(source: Arc<dyn DataSource>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            alerts: RwLock::new(HashMap::new()),
            source,
            notifier,
        }
    }

    pub fn define(&self, entity_id: EntityId, spec: AlertSpec) {
        self.alerts
            .write()
            .expect("alert lock poisoned")
            .insert(entity_id, spec);
    }
}

#[async_trait]
impl JobHandler for AlertCheckHandler {
    async fn run(&self, ctx: &JobContext) -> Result<HandlerOutcome, CoreError> {
        let spec = self
            .alerts
            .read()
            .expect("alert lock poisoned")
            .get(&ctx.job.entity_id)
            .cloned()
            .ok_or(CoreError::NotFound {
                entity: "alert",
                id: ctx.job.entity_id.to_string(),
            })?;

        let mut stream = self.source.open(&SourceSpec::default()).await?;
        let mut matched: u64 = 0;
        while let Some(next) = stream.next().await {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let row = next?;
            if evaluate(row.get(&spec.column), spec.op, &spec.value) {
                matched += 1;
            }
        }

        if matched > 0 {
            tracing::info!(
                alert_id = %ctx.job.entity_id,
                matched,
                "Alert condition met"
            );
            self.notifier
                .send(Notice {
                    entity_id: ctx.job.entity_id,
                    subject: format!("Alert triggered: {}", spec.message),
                    body: format!("{matched} rows matched the alert condition."),
                })
                .await?;
        }

        Ok(HandlerOutcome {
            rows_processed: matched,
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

    fn rows(v: serde_json::Value) -> Vec<vantage_core::row::Row> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().unwrap().clone())
            .collect()
    }

    fn ctx_for(entity_id: EntityId) -> JobContext {
        JobContext {
            job: Job::new(JobKind::AlertCheck, entity_id, PRIORITY_NORMAL),
            execution_id: uuid::Uuid::now_v7(),
            cancel: CancellationToken::new(),
            hub: Arc::new(ProgressHub::default()),
            started: Instant::now(),
        }
    }

    fn spec() -> AlertSpec {
        AlertSpec {
            column: "errors".into(),
            op: FilterOp::Gt,
            value: json!(100),
            message: "error rate above threshold".into(),
        }
    }

    #[tokio::test]
    async fn breached_threshold_notifies() {
        let notifier = Arc::new(RecordingNotifier::new());
        let handler = AlertCheckHandler::new(
            Arc::new(MemorySource::new(rows(json!([
                {"errors": 150}, {"errors": 20}
            ])))),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
        );
        let entity_id = uuid::Uuid::now_v7();
        handler.define(entity_id, spec());

        let outcome = handler.run(&ctx_for(entity_id)).await.unwrap();
        assert_eq!(outcome.rows_processed, 1);
        assert!(notifier.sent()[0].subject.contains("error rate above threshold"));
    }

    #[tokio::test]
    async fn quiet_threshold_stays_silent() {
        let notifier = Arc::new(RecordingNotifier::new());
        let handler = AlertCheckHandler::new(
            Arc::new(MemorySource::new(rows(json!([{"errors": 5}])))),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
        );
        let entity_id = uuid::Uuid::now_v7();
        handler.define(entity_id, spec());

        let outcome = handler.run(&ctx_for(entity_id)).await.unwrap();
        assert_eq!(outcome.rows_processed, 0);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn unknown_alert_is_not_found() {
        let handler = AlertCheckHandler::new(
            Arc::new(MemorySource::new(Vec::new())),
            Arc::new(RecordingNotifier::new()),
        );
        let err = handler.run(&ctx_for(uuid::Uuid::now_v7())).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "alert", .. }));
        assert!(!err.is_retryable());
    }
}
