//! Execution status state machine.
//!
//! Terminal statuses are reached exactly once per execution; the worker
//! pool and pipeline executor both validate transitions through
//! [`ExecStatus::can_transition`].

use serde::{Deserialize, Serialize};

/// Live status of an execution, including the pipeline stage statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecStatus {
    Pending,
    Running,
    Extracting,
    Transforming,
    Validating,
    Loading,
    Completed,
    Failed,
    Cancelled,
}

impl ExecStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecStatus::Completed | ExecStatus::Failed | ExecStatus::Cancelled
        )
    }

    /// The set of statuses reachable from `self`.
    ///
    /// Any non-terminal status may move to `Failed` or `Cancelled`; the
    /// pipeline stages additionally advance in declaration order.
    pub fn valid_transitions(self) -> &'static [ExecStatus] {
        use ExecStatus::*;
        match self {
            Pending => &[Running, Failed, Cancelled],
            Running => &[Extracting, Completed, Failed, Cancelled],
            Extracting => &[Transforming, Failed, Cancelled],
            Transforming => &[Validating, Failed, Cancelled],
            Validating => &[Loading, Failed, Cancelled],
            Loading => &[Completed, Failed, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }

    /// Check whether a transition from `self` to `to` is valid.
    pub fn can_transition(self, to: ExecStatus) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecStatus::Pending => "PENDING",
            ExecStatus::Running => "RUNNING",
            ExecStatus::Extracting => "EXTRACTING",
            ExecStatus::Transforming => "TRANSFORMING",
            ExecStatus::Validating => "VALIDATING",
            ExecStatus::Loading => "LOADING",
            ExecStatus::Completed => "COMPLETED",
            ExecStatus::Failed => "FAILED",
            ExecStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}
