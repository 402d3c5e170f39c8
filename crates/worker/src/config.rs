//! Engine configuration loaded from environment variables.

use std::time::Duration;

use vantage_core::retry::RetryPolicy;

/// Execution engine configuration.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker tasks (default: logical cores x 2).
    pub worker_count: usize,
    /// Job queue capacity (default: `1024`).
    pub queue_capacity: usize,
    /// Row cap for pipelines that declare none (default: `100000`).
    pub pipeline_row_limit_default: u64,
    /// Base retry backoff in seconds (default: `30`).
    pub retry_base_secs: u64,
    /// Default maximum attempts per job (default: `3`).
    pub retry_max_attempts: u32,
    /// Upper bound on the scheduler sleep in seconds (default: `60`).
    pub scheduler_tick_cap_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            worker_count: default_worker_count(),
            queue_capacity: crate::queue::DEFAULT_CAPACITY,
            pipeline_row_limit_default: vantage_pipeline::definition::DEFAULT_ROW_LIMIT,
            retry_base_secs: retry.base.as_secs(),
            retry_max_attempts: retry.max_attempts,
            scheduler_tick_cap_secs: crate::scheduler::DEFAULT_TICK_CAP.as_secs(),
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default       |
    /// |------------------------------|---------------|
    /// | `WORKER_COUNT`               | cores x 2     |
    /// | `QUEUE_CAPACITY`             | `1024`        |
    /// | `PIPELINE_ROW_LIMIT_DEFAULT` | `100000`      |
    /// | `RETRY_BASE_SECONDS`         | `30`          |
    /// | `RETRY_MAX_ATTEMPTS`         | `3`           |
    /// | `SCHEDULER_TICK_CAP_SECONDS` | `60`          |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_parse("WORKER_COUNT", defaults.worker_count),
            queue_capacity: env_parse("QUEUE_CAPACITY", defaults.queue_capacity),
            pipeline_row_limit_default: env_parse(
                "PIPELINE_ROW_LIMIT_DEFAULT",
                defaults.pipeline_row_limit_default,
            ),
            retry_base_secs: env_parse("RETRY_BASE_SECONDS", defaults.retry_base_secs),
            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
            scheduler_tick_cap_secs: env_parse(
                "SCHEDULER_TICK_CAP_SECONDS",
                defaults.scheduler_tick_cap_secs,
            ),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(self.retry_base_secs),
            max_attempts: self.retry_max_attempts,
        }
    }

    pub fn scheduler_tick_cap(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_cap_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            panic!("{name} must be a valid {}", std::any::type_name::<T>())
        }),
        Err(_) => default,
    }
}
