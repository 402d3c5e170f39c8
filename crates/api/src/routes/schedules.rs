//! Recurring schedule management.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use validator::Validate;
use vantage_core::error::CoreError;
use vantage_core::job::JobKind;
use vantage_core::schedule::{ScheduleGrain, ScheduleSpec};
use vantage_core::types::{EntityId, ScheduleId, Timestamp};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_schedules).post(register_schedule))
        .route("/{id}", get(get_schedule).delete(delete_schedule))
}

// ---------------------------------------------------------------------------
// Register
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterScheduleRequest {
    /// Recurrence shape, tagged by `grain`.
    #[serde(flatten)]
    pub grain: ScheduleGrain,
    /// IANA timezone name, e.g. `America/New_York`.
    pub timezone: String,
    pub kind: JobKind,
    pub entity_id: EntityId,
    #[validate(range(min = -100, max = 100))]
    pub priority: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterScheduleResponse {
    pub schedule_id: ScheduleId,
    pub next_run_at: Option<Timestamp>,
}

/// POST /api/v1/schedules -- register a recurring schedule. Returns 201
/// with the schedule id and its first occurrence.
async fn register_schedule(
    State(state): State<AppState>,
    Json(req): Json<RegisterScheduleRequest>,
) -> AppResult<(StatusCode, Json<RegisterScheduleResponse>)> {
    req.validate()?;

    let timezone: Tz = req
        .timezone
        .parse()
        .map_err(|_| AppError::BadRequest(format!("unknown timezone '{}'", req.timezone)))?;

    let mut spec = ScheduleSpec::new(req.grain, timezone, req.kind, req.entity_id);
    if let Some(priority) = req.priority {
        spec.priority = priority;
    }

    let schedule_id = state.engine.scheduler().register(spec)?;
    let next_run_at = state
        .engine
        .scheduler()
        .get(schedule_id)
        .and_then(|s| s.next_run_at);

    tracing::info!(schedule_id = %schedule_id, kind = %req.kind, "Schedule registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterScheduleResponse {
            schedule_id,
            next_run_at,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Read / delete
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Optional filter by materialized job kind.
    pub kind: Option<JobKind>,
}

/// GET /api/v1/schedules -- list schedules ordered by next occurrence.
async fn list_schedules(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<ScheduleSpec>> {
    Json(state.engine.scheduler().list(query.kind))
}

/// GET /api/v1/schedules/{id}
async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<ScheduleId>,
) -> AppResult<Json<ScheduleSpec>> {
    state
        .engine
        .scheduler()
        .get(id)
        .map(Json)
        .ok_or_else(|| schedule_not_found(id))
}

/// DELETE /api/v1/schedules/{id} -- 204 on success, 404 if unknown.
async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<ScheduleId>,
) -> AppResult<StatusCode> {
    if state.engine.scheduler().delete(id) {
        tracing::info!(schedule_id = %id, "Schedule deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(schedule_not_found(id))
    }
}

fn schedule_not_found(id: ScheduleId) -> AppError {
    AppError::Core(CoreError::NotFound {
        entity: "schedule",
        id: id.to_string(),
    })
}
