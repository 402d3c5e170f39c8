//! Staged pipeline run: Extract -> Transform -> Validate -> Load.
//!
//! The executor publishes progress at fixed stage boundaries and keeps a
//! heartbeat going during long stages, so subscribers see an event at
//! least every [`HEARTBEAT`] even when no boundary is crossed. The
//! terminal event (Completed/Failed/Cancelled) is published by the
//! worker pool, which also owns the retry decision.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use vantage_core::error::CoreError;
use vantage_core::job::Job;
use vantage_core::quality;
use vantage_core::row::Row;
use vantage_core::transform;
use vantage_core::types::ExecutionId;
use vantage_events::{ProgressEvent, ProgressHub};

use crate::definition::{PipelineDefinition, PipelineStore};
use crate::sink::DataSink;
use crate::source::DataSource;

/// Maximum quiet period between published events during a run.
pub const HEARTBEAT: Duration = Duration::from_millis(500);

/// How often the extract loop checks for cancellation.
const CANCEL_CHECK_EVERY: u64 = 256;

// ---------------------------------------------------------------------------
// Stage progress boundaries
// ---------------------------------------------------------------------------

const PROGRESS_SOURCE_OPEN: u8 = 10;
const PROGRESS_EXTRACT_DONE: u8 = 25;
const PROGRESS_TRANSFORM_DONE: u8 = 60;
const PROGRESS_VALIDATE_DONE: u8 = 70;

/// What a finished run reports back to the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    /// Rows written to the destination.
    pub rows_processed: u64,
    /// Rows dropped by skip-row steps or lenient casts.
    pub rows_skipped: u64,
    /// Warn-severity quality violations.
    pub warnings: u64,
}

/// Runs pipeline jobs against the configured source and sink.
pub struct PipelineExecutor {
    store: Arc<dyn PipelineStore>,
    source: Arc<dyn DataSource>,
    sink: Arc<dyn DataSink>,
    hub: Arc<ProgressHub>,
    /// Row cap for definitions that declare none. Overridable via
    /// `PIPELINE_ROW_LIMIT_DEFAULT` through the host configuration.
    default_row_limit: u64,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        source: Arc<dyn DataSource>,
        sink: Arc<dyn DataSink>,
        hub: Arc<ProgressHub>,
    ) -> Self {
        Self {
            store,
            source,
            sink,
            hub,
            default_row_limit: crate::definition::DEFAULT_ROW_LIMIT,
        }
    }

    pub fn with_default_row_limit(mut self, limit: u64) -> Self {
        self.default_row_limit = limit;
        self
    }

    /// Execute one pipeline job to its load stage.
    ///
    /// Cancellation is observed between rows and between stages; a
    /// cancelled run returns [`CoreError::Cancelled`] without touching
    /// the destination.
    pub async fn run(
        &self,
        job: &Job,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome, CoreError> {
        let definition = self.store.get(job.entity_id).await?;
        let started = Instant::now();
        let mut event = ProgressEvent::pending(execution_id, job.job_id, job.entity_id, job.kind);

        let heartbeat = self.spawn_heartbeat(execution_id, started);
        let result = self
            .run_stages(&definition, &mut event, started, &cancel)
            .await;
        heartbeat.abort();
        result
    }

    async fn run_stages(
        &self,
        definition: &PipelineDefinition,
        event: &mut ProgressEvent,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, CoreError> {
        use vantage_core::status::ExecStatus::*;

        // -- Extract --------------------------------------------------------
        self.publish(event, Extracting, 0, started);
        let mut stream = self.source.open(&definition.source).await?;
        self.publish(event, Extracting, PROGRESS_SOURCE_OPEN, started);

        let limit = definition.effective_row_limit(self.default_row_limit);
        let mut rows: Vec<Row> = Vec::new();
        while let Some(next) = stream.next().await {
            rows.push(next?);
            if rows.len() as u64 >= limit {
                tracing::info!(
                    pipeline_id = %definition.pipeline_id,
                    limit,
                    "Row limit reached, truncating extract"
                );
                break;
            }
            if rows.len() as u64 % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
        }
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if rows.is_empty() {
            tracing::warn!(
                code = "no_rows",
                pipeline_id = %definition.pipeline_id,
                "Source produced no rows"
            );
        }
        event.rows_processed = rows.len() as u64;
        self.publish(event, Extracting, PROGRESS_EXTRACT_DONE, started);

        // -- Transform ------------------------------------------------------
        let mut outcome = PipelineOutcome::default();
        let step_count = definition.steps.len();
        for (index, step) in definition.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let stepped =
                transform::apply_steps(rows, std::slice::from_ref(step), definition.lenient_casts)?;
            rows = stepped.rows;
            outcome.rows_skipped += stepped.rows_skipped;
            let span = (PROGRESS_TRANSFORM_DONE - PROGRESS_EXTRACT_DONE) as usize;
            let progress = PROGRESS_EXTRACT_DONE + (span * (index + 1) / step_count) as u8;
            event.rows_processed = rows.len() as u64;
            self.publish(event, Transforming, progress, started);
        }
        if step_count == 0 {
            self.publish(event, Transforming, PROGRESS_TRANSFORM_DONE, started);
        }

        // -- Validate -------------------------------------------------------
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let report = quality::evaluate_rules(&rows, &definition.rules)?;
        for sample in &report.samples {
            tracing::warn!(
                pipeline_id = %definition.pipeline_id,
                column = %sample.column,
                rule = %sample.rule,
                row_index = sample.row_index,
                value = %sample.value,
                "Quality rule violated"
            );
        }
        outcome.warnings = report.warnings;
        event.warnings = report.warnings;
        self.publish(event, Validating, PROGRESS_VALIDATE_DONE, started);

        // -- Load -----------------------------------------------------------
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        self.publish(event, Loading, PROGRESS_VALIDATE_DONE, started);
        if rows.is_empty() {
            outcome.rows_processed = 0;
        } else {
            outcome.rows_processed = self.sink.write(rows, &definition.mode).await?;
        }
        event.rows_processed = outcome.rows_processed;

        tracing::info!(
            pipeline_id = %definition.pipeline_id,
            rows = outcome.rows_processed,
            skipped = outcome.rows_skipped,
            warnings = outcome.warnings,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline run finished"
        );
        Ok(outcome)
    }

    fn publish(
        &self,
        event: &mut ProgressEvent,
        status: vantage_core::status::ExecStatus,
        progress: u8,
        started: Instant,
    ) {
        event.status = status;
        // Progress never moves backwards, whatever a stage reports.
        event.progress = event.progress.max(progress);
        event.elapsed_ms = started.elapsed().as_millis() as u64;
        event.timestamp = Utc::now();
        self.hub.publish(event.clone());
    }

    /// Republish the latest snapshot with a fresh clock until aborted.
    fn spawn_heartbeat(
        &self,
        execution_id: ExecutionId,
        started: Instant,
    ) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // first tick is immediate
            loop {
                tick.tick().await;
                let Some(mut latest) = hub.latest(execution_id) else {
                    break;
                };
                if latest.is_terminal() {
                    break;
                }
                latest.elapsed_ms = started.elapsed().as_millis() as u64;
                latest.timestamp = Utc::now();
                hub.publish(latest);
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;
    use vantage_core::job::{Job, JobKind, PRIORITY_NORMAL};
    use vantage_core::quality::{Predicate, QualityRule, Severity};
    use vantage_core::status::ExecStatus;
    use vantage_core::transform::{FilterOp, OnError, StepKind, TransformStep};

    use crate::definition::MemoryPipelineStore;
    use crate::sink::{MemorySink, WriteMode};
    use crate::source::MemorySource;

    use super::*;

    fn rows(v: serde_json::Value) -> Vec<Row> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().unwrap().clone())
            .collect()
    }

    struct Fixture {
        executor: PipelineExecutor,
        sink: Arc<MemorySink>,
        hub: Arc<ProgressHub>,
        job: Job,
    }

    fn fixture(definition: PipelineDefinition, data: Vec<Row>) -> Fixture {
        let store = Arc::new(MemoryPipelineStore::new());
        let job = Job::new(JobKind::Pipeline, definition.pipeline_id, PRIORITY_NORMAL);
        store.insert(definition);
        let sink = Arc::new(MemorySink::new());
        let hub = Arc::new(ProgressHub::default());
        let executor = PipelineExecutor::new(
            store,
            Arc::new(MemorySource::new(data)),
            Arc::clone(&sink) as Arc<dyn DataSink>,
            Arc::clone(&hub),
        );
        Fixture {
            executor,
            sink,
            hub,
            job,
        }
    }

    fn open_hub(fixture: &Fixture, execution_id: ExecutionId) {
        fixture.hub.open(ProgressEvent::pending(
            execution_id,
            fixture.job.job_id,
            fixture.job.entity_id,
            JobKind::Pipeline,
        ));
    }

    #[tokio::test]
    async fn happy_path_filters_and_writes() {
        let mut definition = PipelineDefinition::new(uuid::Uuid::now_v7(), "sales");
        definition.steps.push(TransformStep {
            kind: StepKind::Filter {
                column: "a".into(),
                op: FilterOp::Gt,
                value: json!(1),
            },
            on_error: OnError::Fail,
        });
        let f = fixture(definition, rows(json!([{"a": 1}, {"a": 2}, {"a": 3}])));

        let execution_id = uuid::Uuid::now_v7();
        open_hub(&f, execution_id);
        let outcome = f
            .executor
            .run(&f.job, execution_id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.rows_processed, 2);
        assert_eq!(outcome.warnings, 0);
        assert_eq!(f.sink.rows().len(), 2);
    }

    #[tokio::test]
    async fn progress_hits_stage_boundaries_in_order() {
        let definition = PipelineDefinition::new(uuid::Uuid::now_v7(), "p");
        let f = fixture(definition, rows(json!([{"a": 1}])));

        let execution_id = uuid::Uuid::now_v7();
        open_hub(&f, execution_id);
        let mut rx = f.hub.subscribe(execution_id).receiver.unwrap();
        f.executor
            .run(&f.job, execution_id, CancellationToken::new())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(e) = rx.try_recv() {
            seen.push((e.status, e.progress));
        }
        assert!(seen.contains(&(ExecStatus::Extracting, 10)));
        assert!(seen.contains(&(ExecStatus::Extracting, 25)));
        assert!(seen.contains(&(ExecStatus::Transforming, 60)));
        assert!(seen.contains(&(ExecStatus::Validating, 70)));
        // Monotone across the whole run.
        assert!(seen.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[tokio::test]
    async fn quality_error_aborts_before_load() {
        let mut definition = PipelineDefinition::new(uuid::Uuid::now_v7(), "p");
        definition.rules.push(QualityRule {
            column: "a".into(),
            predicate: Predicate::NotNull,
            severity: Severity::Error,
        });
        let f = fixture(definition, rows(json!([{"a": null}])));

        let execution_id = uuid::Uuid::now_v7();
        open_hub(&f, execution_id);
        let err = f
            .executor
            .run(&f.job, execution_id, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::QualityViolation { .. }));
        assert!(f.sink.rows().is_empty());
    }

    #[tokio::test]
    async fn warn_violations_survive_and_are_counted() {
        let mut definition = PipelineDefinition::new(uuid::Uuid::now_v7(), "p");
        definition.rules.push(QualityRule {
            column: "a".into(),
            predicate: Predicate::Compare {
                op: FilterOp::Gt,
                value: json!(0),
            },
            severity: Severity::Warn,
        });
        let f = fixture(definition, rows(json!([{"a": -1}, {"a": 2}])));

        let execution_id = uuid::Uuid::now_v7();
        open_hub(&f, execution_id);
        let outcome = f
            .executor
            .run(&f.job, execution_id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.warnings, 1);
        assert_eq!(outcome.rows_processed, 2);
    }

    #[tokio::test]
    async fn empty_source_skips_the_write() {
        let definition = PipelineDefinition::new(uuid::Uuid::now_v7(), "p");
        let f = fixture(definition, Vec::new());

        let execution_id = uuid::Uuid::now_v7();
        open_hub(&f, execution_id);
        let outcome = f
            .executor
            .run(&f.job, execution_id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.rows_processed, 0);
        assert!(f.sink.rows().is_empty());
    }

    #[tokio::test]
    async fn row_limit_truncates_extraction() {
        let mut definition = PipelineDefinition::new(uuid::Uuid::now_v7(), "p");
        definition.row_limit = Some(2);
        let f = fixture(definition, rows(json!([{"a": 1}, {"a": 2}, {"a": 3}])));

        let execution_id = uuid::Uuid::now_v7();
        open_hub(&f, execution_id);
        let outcome = f
            .executor
            .run(&f.job, execution_id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.rows_processed, 2);
    }

    #[tokio::test]
    async fn configured_default_row_limit_caps_extraction() {
        // No per-definition limit: the executor's configured default
        // applies.
        let definition = PipelineDefinition::new(uuid::Uuid::now_v7(), "p");
        let mut f = fixture(definition, rows(json!([{"a": 1}, {"a": 2}, {"a": 3}])));
        f.executor = f.executor.with_default_row_limit(2);

        let execution_id = uuid::Uuid::now_v7();
        open_hub(&f, execution_id);
        let outcome = f
            .executor
            .run(&f.job, execution_id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.rows_processed, 2);
    }

    #[tokio::test]
    async fn pre_cancelled_token_stops_before_load() {
        let definition = PipelineDefinition::new(uuid::Uuid::now_v7(), "p");
        let f = fixture(definition, rows(json!([{"a": 1}])));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let execution_id = uuid::Uuid::now_v7();
        open_hub(&f, execution_id);
        let err = f.executor.run(&f.job, execution_id, cancel).await.unwrap_err();

        assert!(matches!(err, CoreError::Cancelled));
        assert!(f.sink.rows().is_empty());
    }

    #[tokio::test]
    async fn transient_source_failure_surfaces_as_unavailable() {
        let definition = PipelineDefinition::new(uuid::Uuid::now_v7(), "p");
        let pipeline_id = definition.pipeline_id;
        let store = Arc::new(MemoryPipelineStore::new());
        store.insert(definition);
        let source = Arc::new(MemorySource::new(rows(json!([{"a": 1}]))));
        source.fail_next_opens(1);
        let hub = Arc::new(ProgressHub::default());
        let executor = PipelineExecutor::new(
            store,
            Arc::clone(&source) as Arc<dyn DataSource>,
            Arc::new(MemorySink::new()),
            Arc::clone(&hub),
        );

        let job = Job::new(JobKind::Pipeline, pipeline_id, PRIORITY_NORMAL);
        let execution_id = uuid::Uuid::now_v7();
        hub.open(ProgressEvent::pending(
            execution_id,
            job.job_id,
            job.entity_id,
            JobKind::Pipeline,
        ));
        let err = executor
            .run(&job, execution_id, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_republishes_between_boundaries() {
        let definition = PipelineDefinition::new(uuid::Uuid::now_v7(), "p");
        let f = fixture(definition, rows(json!([{"a": 1}])));

        let execution_id = uuid::Uuid::now_v7();
        open_hub(&f, execution_id);
        let heartbeat = f.executor.spawn_heartbeat(execution_id, Instant::now());

        let mut rx = f.hub.subscribe(execution_id).receiver.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        heartbeat.abort();

        let mut ticks = 0;
        while rx.try_recv().is_ok() {
            ticks += 1;
        }
        assert!(ticks >= 2);
    }

    #[tokio::test]
    async fn upsert_mode_flows_through_to_sink() {
        let mut definition = PipelineDefinition::new(uuid::Uuid::now_v7(), "p");
        definition.mode = WriteMode::Upsert { key: "id".into() };
        let f = fixture(definition, rows(json!([{"id": 1, "v": "a"}, {"id": 1, "v": "b"}])));

        let execution_id = uuid::Uuid::now_v7();
        open_hub(&f, execution_id);
        f.executor
            .run(&f.job, execution_id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(f.sink.rows().len(), 1);
        assert_eq!(f.sink.rows()[0]["v"], json!("b"));
    }
}
