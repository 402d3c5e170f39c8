//! Data source adapter seam.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vantage_core::error::CoreError;
use vantage_core::row::Row;
use vantage_core::types::EntityId;

/// Where the extract stage reads from: either a pre-registered
/// connection or an ad-hoc inline configuration, plus the source query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Pre-registered connection; takes precedence over inline options.
    #[serde(default)]
    pub connection_id: Option<EntityId>,
    /// Query or stream selector understood by the concrete source.
    #[serde(default)]
    pub query: Option<String>,
    /// Driver-specific inline configuration (host, credentials, ...).
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Pull-based row stream. Implementations suspend at I/O.
#[async_trait]
pub trait RowStream: Send {
    /// `None` at end of stream; errors are classified by the source
    /// (`SourceUnavailable` transient, `SourceInvalid` permanent).
    async fn next(&mut self) -> Option<Result<Row, CoreError>>;
}

impl std::fmt::Debug for dyn RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn RowStream")
    }
}

/// Opens row streams for the extract stage.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn open(&self, spec: &SourceSpec) -> Result<Box<dyn RowStream>, CoreError>;
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

/// Source backed by a fixed row set.
///
/// `fail_opens` makes the first N `open` calls fail with
/// `SourceUnavailable`, for exercising the retry path.
pub struct MemorySource {
    rows: Mutex<Vec<Row>>,
    fail_opens: AtomicU32,
}

impl MemorySource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: Mutex::new(rows),
            fail_opens: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` open calls with a transient error.
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn open(&self, _spec: &SourceSpec) -> Result<Box<dyn RowStream>, CoreError> {
        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::SourceUnavailable("connection refused".into()));
        }
        let rows = self.rows.lock().expect("source lock poisoned").clone();
        Ok(Box::new(MemoryRowStream {
            rows: rows.into(),
        }))
    }
}

struct MemoryRowStream {
    rows: VecDeque<Row>,
}

#[async_trait]
impl RowStream for MemoryRowStream {
    async fn next(&mut self) -> Option<Result<Row, CoreError>> {
        self.rows.pop_front().map(Ok)
    }
}
