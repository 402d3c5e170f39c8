//! Data sink adapter seam.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vantage_core::error::CoreError;
use vantage_core::row::{self, Row};

/// How the load stage writes to its destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WriteMode {
    Append,
    Overwrite,
    /// Rows whose key matches an existing row replace it; keys compare
    /// by value equality after cast.
    Upsert { key: String },
}

/// Writes processed rows to the declared destination.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Returns the number of rows written. Transient I/O failures are
    /// `DestinationUnavailable`; an overwrite against an incompatible
    /// existing schema is `SchemaMismatch`.
    async fn write(&self, rows: Vec<Row>, mode: &WriteMode) -> Result<u64, CoreError>;
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Destination backed by a Vec, with the same schema rules an external
/// table would enforce.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
    fail_writes: AtomicU32,
}

#[derive(Default)]
struct SinkState {
    rows: Vec<Row>,
    /// Column set fixed by the first write (or by `with_schema`).
    schema: Option<BTreeSet<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-declare the destination schema, as an existing table would.
    pub fn with_schema<I: IntoIterator<Item = S>, S: Into<String>>(columns: I) -> Self {
        let sink = Self::default();
        sink.state.lock().expect("sink lock poisoned").schema =
            Some(columns.into_iter().map(Into::into).collect());
        sink
    }

    /// Fail the next `n` writes with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Snapshot of the destination contents.
    pub fn rows(&self) -> Vec<Row> {
        self.state.lock().expect("sink lock poisoned").rows.clone()
    }
}

fn infer_schema(rows: &[Row]) -> Option<BTreeSet<String>> {
    rows.first().map(|r| r.keys().cloned().collect())
}

#[async_trait]
impl DataSink for MemorySink {
    async fn write(&self, rows: Vec<Row>, mode: &WriteMode) -> Result<u64, CoreError> {
        let remaining = self.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::DestinationUnavailable("connection reset".into()));
        }

        let mut state = self.state.lock().expect("sink lock poisoned");
        let incoming = infer_schema(&rows);
        let written = rows.len() as u64;

        match mode {
            WriteMode::Append => {
                state.rows.extend(rows);
            }
            WriteMode::Overwrite => {
                if let (Some(existing), Some(new)) = (&state.schema, &incoming) {
                    if existing != new {
                        return Err(CoreError::SchemaMismatch(format!(
                            "destination columns {existing:?} != source columns {new:?}"
                        )));
                    }
                }
                state.rows = rows;
            }
            WriteMode::Upsert { key } => {
                for new_row in rows {
                    let new_key = new_row.get(key).cloned().unwrap_or(serde_json::Value::Null);
                    let existing = state.rows.iter_mut().find(|r| {
                        row::values_equal(
                            r.get(key).unwrap_or(&serde_json::Value::Null),
                            &new_key,
                        )
                    });
                    match existing {
                        Some(slot) => *slot = new_row,
                        None => state.rows.push(new_row),
                    }
                }
            }
        }

        if state.schema.is_none() {
            state.schema = incoming;
        }
        Ok(written)
    }
}
