//! HTTP adapter: REST routes for executions and schedules, and the SSE
//! progress stream. The execution engine itself lives in
//! `vantage-worker`; this crate only translates between HTTP and the
//! engine facade.

pub mod config;
pub mod error;
pub mod router;
pub mod routes;
pub mod state;
