//! Per-execution publish/subscribe registry.
//!
//! Each open execution owns a `tokio::sync::broadcast` channel. Delivery
//! is best-effort per subscriber: a lagging receiver loses the oldest
//! events for itself only. Late subscribers do not replay history; they
//! get the latest snapshot instead.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use tokio::sync::broadcast;
use vantage_core::types::ExecutionId;

use crate::progress::ProgressEvent;

/// Default per-subscriber buffer.
const DEFAULT_CAPACITY: usize = 64;

struct ExecChannel {
    sender: broadcast::Sender<ProgressEvent>,
    /// Copy-on-read snapshot for late subscribers.
    latest: Mutex<ProgressEvent>,
}

/// What a subscriber gets back.
pub struct Subscription {
    /// Latest snapshot at subscription time, if the execution is known.
    pub snapshot: Option<ProgressEvent>,
    /// Live receiver; `None` for unknown or already-closed executions
    /// (an empty, closed stream).
    pub receiver: Option<broadcast::Receiver<ProgressEvent>>,
}

/// Registry of per-execution broadcast channels.
///
/// Lock discipline: `publish`, `subscribe`, and `latest` take the map
/// read lock; `open` and `close` take the write lock.
pub struct ProgressHub {
    channels: RwLock<HashMap<ExecutionId, ExecChannel>>,
    capacity: usize,
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Register an execution with its initial snapshot.
    ///
    /// Idempotent: re-opening an existing execution is a no-op.
    pub fn open(&self, initial: ProgressEvent) {
        let mut channels = self.channels.write().expect("hub lock poisoned");
        channels.entry(initial.execution_id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.capacity);
            ExecChannel {
                sender,
                latest: Mutex::new(initial),
            }
        });
    }

    /// Publish an event to all current subscribers of its execution.
    ///
    /// Events for unknown executions are dropped (the execution already
    /// closed); zero subscribers is not an error. A non-terminal event
    /// whose progress is below the stored snapshot is a stale copy (a
    /// heartbeat republish racing a stage boundary) and is dropped, so
    /// subscribers never see progress regress. The snapshot mutex is
    /// held across the send to keep the stream totally ordered.
    pub fn publish(&self, event: ProgressEvent) {
        let channels = self.channels.read().expect("hub lock poisoned");
        if let Some(channel) = channels.get(&event.execution_id) {
            let mut latest = channel.latest.lock().expect("hub lock poisoned");
            if !event.is_terminal() && event.progress < latest.progress {
                return;
            }
            *latest = event.clone();
            // SendError only means there are zero receivers right now.
            let _ = channel.sender.send(event);
        }
    }

    /// Subscribe to one execution's stream.
    pub fn subscribe(&self, execution_id: ExecutionId) -> Subscription {
        let channels = self.channels.read().expect("hub lock poisoned");
        match channels.get(&execution_id) {
            Some(channel) => Subscription {
                snapshot: Some(channel.latest.lock().expect("hub lock poisoned").clone()),
                receiver: Some(channel.sender.subscribe()),
            },
            None => Subscription {
                snapshot: None,
                receiver: None,
            },
        }
    }

    /// Latest snapshot for an execution, if it is still open.
    pub fn latest(&self, execution_id: ExecutionId) -> Option<ProgressEvent> {
        let channels = self.channels.read().expect("hub lock poisoned");
        channels
            .get(&execution_id)
            .map(|c| c.latest.lock().expect("hub lock poisoned").clone())
    }

    /// Close an execution's channel. Called exactly once, after the
    /// terminal event was published; receivers observe `Closed` after
    /// draining what they already buffered.
    pub fn close(&self, execution_id: ExecutionId) {
        let mut channels = self.channels.write().expect("hub lock poisoned");
        channels.remove(&execution_id);
    }

    /// Number of open executions. Observational only.
    pub fn open_count(&self) -> usize {
        self.channels.read().expect("hub lock poisoned").len()
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
