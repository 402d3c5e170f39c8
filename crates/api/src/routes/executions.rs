//! Job enqueue, cancellation, and the SSE progress stream.
//!
//! The stream endpoint bridges the in-process broadcast hub to HTTP: a
//! forwarder task subscribes to the hub, renames events for the browser
//! (`progress`, `status`, `complete`, `timeout`), and feeds them through
//! an mpsc channel that backs the response body.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use validator::Validate;
use vantage_core::error::CoreError;
use vantage_core::job::JobKind;
use vantage_core::status::ExecStatus;
use vantage_core::types::{EntityId, ExecutionId};
use vantage_events::ProgressEvent;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Keepalive comment interval for SSE responses.
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Idle deadline: if no event arrives for this long, the stream emits a
/// `timeout` event and closes.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Buffer between the forwarder task and the response body.
const FORWARD_BUFFER: usize = 64;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(enqueue_execution))
        .route("/{id}", axum::routing::delete(cancel_execution))
        .route("/{id}/stream", get(stream_execution))
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub kind: JobKind,
    pub entity_id: EntityId,
    /// Lower fires first. Defaults to 0 (normal).
    #[validate(range(min = -100, max = 100))]
    pub priority: Option<i32>,
    /// Optional delay before the job becomes eligible, capped at 24h.
    #[validate(range(max = 86_400))]
    pub delay_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: vantage_core::types::JobId,
}

/// POST /api/v1/executions -- enqueue a job. Returns 202 with the job id;
/// the execution id is minted when a worker picks the job up and arrives
/// on the progress stream.
async fn enqueue_execution(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> AppResult<(StatusCode, Json<EnqueueResponse>)> {
    req.validate()?;

    let priority = req.priority.unwrap_or(vantage_core::job::PRIORITY_NORMAL);
    let delay = req.delay_seconds.map(Duration::from_secs);
    let job_id = state.engine.enqueue(req.kind, req.entity_id, priority, delay)?;

    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// DELETE /api/v1/executions/{id} -- request cancellation of a live
/// execution. 202 if the request was delivered, 404 if the execution is
/// unknown or already terminal.
async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<ExecutionId>,
) -> AppResult<StatusCode> {
    if state.engine.cancel(id) {
        tracing::info!(execution_id = %id, "Cancellation requested");
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AppError::Core(CoreError::NotFound {
            entity: "execution",
            id: id.to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// SSE stream
// ---------------------------------------------------------------------------

/// Wire payload for stream events.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamPayload {
    pipeline_id: EntityId,
    execution_id: ExecutionId,
    status: ExecStatus,
    progress: u8,
    elapsed_ms: u64,
}

impl From<&ProgressEvent> for StreamPayload {
    fn from(event: &ProgressEvent) -> Self {
        Self {
            pipeline_id: event.entity_id,
            execution_id: event.execution_id,
            status: event.status,
            progress: event.progress,
            elapsed_ms: event.elapsed_ms,
        }
    }
}

/// Event name for the browser: `complete` for successful completion,
/// `status` when the status changed since the previous event, `progress`
/// otherwise.
fn event_name(event: &ProgressEvent, prev_status: Option<ExecStatus>) -> &'static str {
    if event.status == ExecStatus::Completed {
        "complete"
    } else if prev_status != Some(event.status) {
        "status"
    } else {
        "progress"
    }
}

fn sse_event(name: &'static str, event: &ProgressEvent) -> SseEvent {
    let payload = StreamPayload::from(event);
    SseEvent::default()
        .event(name)
        .json_data(&payload)
        .unwrap_or_else(|_| SseEvent::default().event(name).data("{}"))
}

/// GET /api/v1/executions/{id}/stream -- live progress over SSE.
///
/// The first event is the latest snapshot, so late subscribers start
/// from the current state rather than replaying history. Unknown or
/// already-closed executions get an empty stream that closes straight
/// away, so a client reconnecting to a just-finished execution sees a
/// clean end rather than an error. The stream ends when the execution
/// closes or after 30 minutes without events.
async fn stream_execution(
    State(state): State<AppState>,
    Path(id): Path<ExecutionId>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.engine.hub().subscribe(id);
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<SseEvent, Infallible>>(FORWARD_BUFFER);

    let (Some(snapshot), Some(mut hub_rx)) = (subscription.snapshot, subscription.receiver) else {
        // Dropping the sender closes the stream with zero events.
        drop(tx);
        return sse_response(rx);
    };

    tokio::spawn(async move {
        let mut prev_status: Option<ExecStatus> = None;

        // Snapshot first.
        let first = sse_event(event_name(&snapshot, prev_status), &snapshot);
        prev_status = Some(snapshot.status);
        if tx.send(Ok(first)).await.is_err() {
            return;
        }
        if snapshot.is_terminal() {
            return;
        }

        loop {
            match tokio::time::timeout(STREAM_IDLE_TIMEOUT, hub_rx.recv()).await {
                Ok(Ok(event)) => {
                    let sse = sse_event(event_name(&event, prev_status), &event);
                    prev_status = Some(event.status);
                    if tx.send(Ok(sse)).await.is_err() {
                        break;
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
                // Channel closed: the execution finished and was removed
                // from the hub. The terminal event already went out.
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(missed))) => {
                    tracing::warn!(
                        code = "subscriber_slow",
                        execution_id = %id,
                        missed,
                        "Stream subscriber lagged, skipping to newest events"
                    );
                }
                Err(_elapsed) => {
                    let timeout_event = SseEvent::default()
                        .event("timeout")
                        .data(json!({ "executionId": id }).to_string());
                    let _ = tx.send(Ok(timeout_event)).await;
                    break;
                }
            }
        }
    });

    sse_response(rx)
}

fn sse_response(
    rx: tokio::sync::mpsc::Receiver<Result<SseEvent, Infallible>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::response::IntoResponse;
    use vantage_events::ProgressHub;
    use vantage_worker::{EngineConfig, HandlerMap, JobEngine};

    use crate::config::ServerConfig;

    use super::*;

    fn test_state() -> AppState {
        let engine = Arc::new(JobEngine::new(
            EngineConfig::default(),
            HandlerMap::new(),
            Arc::new(ProgressHub::default()),
        ));
        let config = Arc::new(ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            cors_origins: Vec::new(),
            request_timeout_secs: 30,
            shutdown_timeout_secs: 1,
        });
        AppState::new(engine, config)
    }

    #[tokio::test]
    async fn stream_for_unknown_execution_closes_empty() {
        let response = stream_execution(State(test_state()), Path(uuid::Uuid::now_v7()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        // No events, no error: the body ends immediately.
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    fn event(status: ExecStatus, progress: u8) -> ProgressEvent {
        let mut e = ProgressEvent::pending(
            uuid::Uuid::now_v7(),
            uuid::Uuid::now_v7(),
            uuid::Uuid::now_v7(),
            JobKind::Pipeline,
        );
        e.status = status;
        e.progress = progress;
        e
    }

    #[test]
    fn completed_maps_to_complete() {
        let e = event(ExecStatus::Completed, 100);
        assert_eq!(event_name(&e, Some(ExecStatus::Loading)), "complete");
    }

    #[test]
    fn status_change_maps_to_status() {
        let e = event(ExecStatus::Transforming, 30);
        assert_eq!(event_name(&e, Some(ExecStatus::Extracting)), "status");
        assert_eq!(event_name(&e, None), "status");
    }

    #[test]
    fn same_status_maps_to_progress() {
        let e = event(ExecStatus::Transforming, 40);
        assert_eq!(event_name(&e, Some(ExecStatus::Transforming)), "progress");
    }

    #[test]
    fn stream_payload_is_camel_case() {
        let e = event(ExecStatus::Extracting, 10);
        let json = serde_json::to_value(StreamPayload::from(&e)).unwrap();
        assert!(json.get("pipelineId").is_some());
        assert!(json.get("executionId").is_some());
        assert!(json.get("elapsedMs").is_some());
        assert_eq!(json["progress"], 10);
    }

    #[test]
    fn enqueue_request_rejects_out_of_range_delay() {
        let req = EnqueueRequest {
            kind: JobKind::Pipeline,
            entity_id: uuid::Uuid::now_v7(),
            priority: None,
            delay_seconds: Some(100_000),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn enqueue_request_accepts_urgent_priority() {
        let req = EnqueueRequest {
            kind: JobKind::AlertCheck,
            entity_id: uuid::Uuid::now_v7(),
            priority: Some(vantage_core::job::PRIORITY_URGENT),
            delay_seconds: None,
        };
        assert!(req.validate().is_ok());
    }
}
