//! Pure domain logic for the execution core.
//!
//! This crate has zero internal dependencies so it can be used by the
//! worker engine, the pipeline executor, the HTTP layer, and any future
//! CLI tooling without dragging in the async runtime.

pub mod error;
pub mod job;
pub mod quality;
pub mod retry;
pub mod row;
pub mod schedule;
pub mod status;
pub mod transform;
pub mod types;
