//! Job execution: bounded priority queue, worker pool, handler registry,
//! cron scheduler, and the engine facade that wires them together.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod handlers;
pub mod notify;
pub mod pool;
pub mod queue;
pub mod scheduler;

pub use config::EngineConfig;
pub use dispatch::{HandlerMap, HandlerOutcome, JobContext, JobHandler};
pub use engine::JobEngine;
pub use notify::{Notice, Notifier, RecordingNotifier};
pub use pool::{ExecutionRegistry, WorkerPool};
pub use queue::JobQueue;
pub use scheduler::CronScheduler;
