//! Sync task data structure.
//!
//! A [`SyncTask`] is a local mutation waiting to reach the remote. Tasks are
//! persisted as a whole-queue JSON snapshot:
//!
//! ```json
//! { "schemaVersion": 1, "tasks": [ { "id": "…", "tag": "/api/notes/7", … } ] }
//! ```
//!
//! The snapshot is versioned so an incompatible queue left behind by another
//! build is discarded instead of being misread.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::storage::traits::StorageError;

/// Current persisted queue schema.
pub const SCHEMA_VERSION: u32 = 1;

/// Drain priority. Higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Lifecycle of a task.
///
/// ```text
/// Pending ──▶ InFlight ──▶ (removed)        success / remote wins
///    ▲           │
///    │           ├──▶ Failed ──▶ (eligible again at next_retry_at)
///    │           │
///    └───────────┤  cancelled / circuit open
///                └──▶ Dead                   retries exhausted / invalid payload
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    InFlight,
    Failed,
    Dead,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InFlight => write!(f, "in-flight"),
            Self::Failed => write!(f, "failed"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// A queued local mutation.
///
/// # Example
///
/// ```
/// use offline_sync::sync_task::{SyncTask, TaskPriority, TaskState};
///
/// let task = SyncTask::new("/api/notes/7", br#"{"text":"hi"}"#.to_vec(), TaskPriority::High, 1_000);
/// assert_eq!(task.state, TaskState::Pending);
/// assert_eq!(task.attempts, 0);
/// assert!(task.is_eligible(1_000));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    /// Stable id, sent as the idempotency key on every attempt
    pub id: String,
    /// Logical resource the mutation targets (request path)
    pub tag: String,
    pub payload: Bytes,
    pub priority: TaskPriority,
    pub attempts: u32,
    /// Enqueue time (epoch millis), also the task's logical timestamp
    pub created_at: i64,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
    #[serde(default)]
    pub next_retry_at: Option<i64>,
    pub state: TaskState,
    /// Enqueue sequence, breaks `created_at` ties for FIFO within a priority
    #[serde(default)]
    pub seq: u64,
    /// Remote `lastModified` this task was reconciled against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncTask {
    pub fn new(tag: impl Into<String>, payload: impl Into<Bytes>, priority: TaskPriority, now: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tag: tag.into(),
            payload: payload.into(),
            priority,
            attempts: 0,
            created_at: now,
            last_attempt_at: None,
            next_retry_at: None,
            state: TaskState::Pending,
            seq: 0,
            base_version: None,
            last_error: None,
        }
    }

    /// Whether a drain at `now` may attempt this task.
    #[must_use]
    pub fn is_eligible(&self, now: i64) -> bool {
        matches!(self.state, TaskState::Pending | TaskState::Failed)
            && self.next_retry_at.map_or(true, |at| now >= at)
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.state == TaskState::Dead
    }

    /// Payload parsed as JSON, if it is JSON.
    #[must_use]
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }

    /// Drain order: priority descending, then oldest first.
    #[must_use]
    pub fn drain_order(a: &Self, b: &Self) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.seq.cmp(&b.seq))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueSnapshot {
    schema_version: u32,
    tasks: Vec<SyncTask>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotHeader {
    schema_version: Option<u32>,
}

/// Serialize a queue snapshot.
pub fn encode_snapshot(tasks: &[SyncTask]) -> Result<Vec<u8>, StorageError> {
    let snapshot = QueueSnapshot {
        schema_version: SCHEMA_VERSION,
        tasks: tasks.to_vec(),
    };
    Ok(serde_json::to_vec(&snapshot)?)
}

/// Parse a queue snapshot.
///
/// Returns `Corruption` when the bytes are not a snapshot at all, and also
/// when the schema version is not one this build understands.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<SyncTask>, StorageError> {
    let header: SnapshotHeader = serde_json::from_slice(bytes).map_err(|e| StorageError::Corruption {
        namespace: "sync-queue".to_string(),
        detail: format!("unreadable snapshot: {}", e),
    })?;

    match header.schema_version {
        Some(SCHEMA_VERSION) => {}
        other => {
            return Err(StorageError::Corruption {
                namespace: "sync-queue".to_string(),
                detail: format!("unsupported schemaVersion {:?} (expected {})", other, SCHEMA_VERSION),
            });
        }
    }

    let snapshot: QueueSnapshot = serde_json::from_slice(bytes).map_err(|e| StorageError::Corruption {
        namespace: "sync-queue".to_string(),
        detail: format!("malformed task records: {}", e),
    })?;
    Ok(snapshot.tasks)
}
