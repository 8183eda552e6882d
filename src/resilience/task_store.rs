//! Durable storage port for the sync queue.
//!
//! The whole queue snapshot is the unit of durability: `save` atomically
//! replaces the previous snapshot, `load` returns the last one saved. This
//! trades write amplification for trivially consistent crash recovery.
//!
//! Backends:
//! - [`SqliteTaskStore`]: single-row SQLite table (WAL journal mode)
//! - [`JsonFileTaskStore`]: JSON file replaced via write-temp-then-rename
//! - [`MemoryTaskStore`]: process-local, for tests and ephemeral clients

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

use crate::resilience::backoff::{retry, BackoffConfig};
use crate::storage::traits::StorageError;
use crate::sync_task::{decode_snapshot, encode_snapshot, SyncTask};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Load the last saved snapshot. An empty store yields an empty queue.
    async fn load(&self) -> Result<Vec<SyncTask>, StorageError>;

    /// Atomically replace the stored snapshot.
    async fn save(&self, tasks: &[SyncTask]) -> Result<(), StorageError>;
}

/// In-memory task store. Keeps the encoded snapshot so that load/save go
/// through the same wire format as the durable backends.
#[derive(Default)]
pub struct MemoryTaskStore {
    snapshot: Mutex<Option<Vec<u8>>>,
    saves: AtomicU64,
}

impl MemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with raw bytes (e.g. a snapshot from another build).
    #[must_use]
    pub fn with_raw(bytes: Vec<u8>) -> Self {
        Self {
            snapshot: Mutex::new(Some(bytes)),
            saves: AtomicU64::new(0),
        }
    }

    /// Number of successful saves since creation.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Acquire)
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load(&self) -> Result<Vec<SyncTask>, StorageError> {
        let snapshot = self.snapshot.lock().clone();
        match snapshot {
            Some(bytes) => decode_snapshot(&bytes),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, tasks: &[SyncTask]) -> Result<(), StorageError> {
        let bytes = encode_snapshot(tasks)?;
        *self.snapshot.lock() = Some(bytes);
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// SQLite-backed task store.
///
/// ```sql
/// CREATE TABLE sync_queue_snapshot (
///     id INTEGER PRIMARY KEY CHECK (id = 1),  -- single row
///     snapshot TEXT NOT NULL,                 -- versioned JSON snapshot
///     task_count INTEGER NOT NULL,
///     saved_at INTEGER NOT NULL               -- epoch millis
/// );
/// ```
pub struct SqliteTaskStore {
    pool: AnyPool,
    path: String,
}

impl SqliteTaskStore {
    /// Open (creating if needed) the SQLite file at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        install_drivers();

        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);

        info!(path = %path_str, "Opening sync queue store");

        let pool = retry("task_store_connect", &BackoffConfig::startup(), 5, || async {
            AnyPoolOptions::new()
                .max_connections(2)
                .acquire_timeout(Duration::from_secs(5))
                .connect(&url)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to open queue store: {}", e)))
        })
        .await?;

        let store = Self { pool, path: path_str };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        Ok(store)
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue_snapshot (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                snapshot TEXT NOT NULL,
                task_count INTEGER NOT NULL,
                saved_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to create sync_queue_snapshot table: {}", e)))?;
        Ok(())
    }

    /// Path to the SQLite file.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the pool, flushing outstanding writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn is_quota_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("database or disk is full") || lower.contains("no space left")
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn load(&self) -> Result<Vec<SyncTask>, StorageError> {
        let _timer = crate::metrics::LatencyTimer::new("sqlite", "load");
        let row = sqlx::query("SELECT snapshot FROM sync_queue_snapshot WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to read queue snapshot: {}", e)))?;

        let Some(row) = row else {
            return Ok(Vec::new());
        };
        let snapshot: String = row
            .try_get("snapshot")
            .map_err(|e| StorageError::Corruption {
                namespace: "sync-queue".to_string(),
                detail: format!("unreadable snapshot column: {}", e),
            })?;

        let tasks = decode_snapshot(snapshot.as_bytes())?;
        debug!(tasks = tasks.len(), path = %self.path, "Loaded queue snapshot");
        Ok(tasks)
    }

    async fn save(&self, tasks: &[SyncTask]) -> Result<(), StorageError> {
        let _timer = crate::metrics::LatencyTimer::new("sqlite", "save");
        let bytes = encode_snapshot(tasks)?;
        let snapshot = String::from_utf8(bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        sqlx::query(
            r#"
            INSERT INTO sync_queue_snapshot (id, snapshot, task_count, saved_at)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                snapshot = excluded.snapshot,
                task_count = excluded.task_count,
                saved_at = excluded.saved_at
            "#,
        )
        .bind(snapshot)
        .bind(tasks.len() as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let message = e.to_string();
            if is_quota_error(&message) {
                StorageError::QuotaExceeded(message)
            } else {
                StorageError::Backend(format!("Failed to save queue snapshot: {}", message))
            }
        })?;

        debug!(tasks = tasks.len(), "Queue snapshot saved");
        Ok(())
    }
}

/// JSON file task store. Writes go to a sibling temp file which is then
/// renamed over the target, so readers never observe a torn snapshot.
pub struct JsonFileTaskStore {
    path: PathBuf,
}

impl JsonFileTaskStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn io_error(err: std::io::Error) -> StorageError {
    if err.kind() == std::io::ErrorKind::StorageFull {
        StorageError::QuotaExceeded(err.to_string())
    } else {
        StorageError::Backend(err.to_string())
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn load(&self) -> Result<Vec<SyncTask>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => decode_snapshot(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn save(&self, tasks: &[SyncTask]) -> Result<(), StorageError> {
        let bytes = encode_snapshot(tasks)?;
        let temp = self.temp_path();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
            }
        }
        tokio::fs::write(&temp, &bytes).await.map_err(io_error)?;
        tokio::fs::rename(&temp, &self.path).await.map_err(io_error)?;
        Ok(())
    }
}
