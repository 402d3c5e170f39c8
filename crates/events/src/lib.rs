//! Live progress channel for the execution core.
//!
//! Workers publish [`ProgressEvent`]s into the [`ProgressHub`]; HTTP
//! streams subscribe per execution id. Shared via `Arc<ProgressHub>`.

pub mod hub;
pub mod progress;

pub use hub::{ProgressHub, Subscription};
pub use progress::ProgressEvent;
