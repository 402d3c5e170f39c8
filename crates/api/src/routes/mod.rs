pub mod executions;
pub mod health;
pub mod schedules;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /executions                POST   enqueue a job (202)
/// /executions/{id}           DELETE cancel a live execution (202 / 404)
/// /executions/{id}/stream    GET    SSE progress stream
///
/// /schedules                 GET    list schedules (?kind=)
/// /schedules                 POST   register a schedule (201)
/// /schedules/{id}            GET    get one schedule
/// /schedules/{id}            DELETE delete a schedule (204 / 404)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Job enqueue, cancellation, and live progress streaming.
        .nest("/executions", executions::router())
        // Recurring schedule management.
        .nest("/schedules", schedules::router())
}
