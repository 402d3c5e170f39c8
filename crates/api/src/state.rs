use std::sync::Arc;

use vantage_worker::JobEngine;

use crate::config::ServerConfig;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    /// The execution engine facade: queue, pool, scheduler, hub.
    pub engine: Arc<JobEngine>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(engine: Arc<JobEngine>, config: Arc<ServerConfig>) -> Self {
        Self { engine, config }
    }
}
