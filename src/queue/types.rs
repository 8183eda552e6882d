//! Public types for the sync queue.

use std::time::Duration;

use crate::conflict::{RemoteSnapshot, Resolution};
use crate::sync_task::SyncTask;

/// Summary of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Send attempts started (including conflict resubmits)
    pub attempted: usize,
    pub synced: usize,
    /// Rescheduled with backoff
    pub failed: usize,
    pub dead_lettered: usize,
    pub conflicts: usize,
    /// Left untouched because the circuit was open or the drain was cancelled
    pub deferred: usize,
    /// Stopped early on an open circuit
    pub circuit_open: bool,
    pub cancelled: bool,
    /// Tasks still queued after the cycle
    pub remaining: usize,
    pub duration: Duration,
}

impl DrainReport {
    /// Whether the cycle made any change to the queue.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.attempted == 0
    }
}

/// Notifications for UI and diagnostics. Nothing here is ever thrown.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    DrainComplete(DrainReport),
    DeadLettered {
        task_id: String,
        tag: String,
        reason: String,
    },
    Conflict {
        task_id: String,
        tag: String,
        resolution: Resolution,
    },
}

/// Result of sending one task.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttemptOutcome {
    Synced,
    Conflict(RemoteSnapshot),
    /// Remote rejected the payload itself. Never retried.
    Invalid(String),
    /// Retryable failure, already counted by the breaker
    Failed(String),
    CircuitOpen,
    Cancelled,
}

impl AttemptOutcome {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Synced => "success",
            Self::Conflict(_) => "conflict",
            Self::Invalid(_) => "invalid",
            Self::Failed(_) => "failure",
            Self::CircuitOpen => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A task claimed for one attempt, paired with its outcome.
pub(crate) type Attempted = (SyncTask, AttemptOutcome);
