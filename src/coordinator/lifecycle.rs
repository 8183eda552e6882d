//! Engine lifecycle: start and shutdown.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::QueueStoreKind;
use crate::conflict::ConflictResolver;
use crate::error::SyncError;
use crate::queue::{QueueSettings, SyncQueue};
use crate::resilience::task_store::{JsonFileTaskStore, MemoryTaskStore, SqliteTaskStore, TaskStore};
use crate::storage::traits::cleanup_stale_versions;

use super::{EngineState, OfflineEngine};

const DEFAULT_SQLITE_PATH: &str = "./offline_sync_queue.db";
const DEFAULT_JSON_PATH: &str = "./offline_sync_queue.json";

impl OfflineEngine {
    /// Start the engine.
    ///
    /// Startup flow:
    /// 1. Open the task store (injected, or per `queue_store`)
    /// 2. Load the persisted queue; an unreadable snapshot starts empty
    /// 3. Remove cache namespaces superseded by an active version
    /// 4. Spawn the network debouncer and the auto-drain loop; restored
    ///    tasks are drained once connectivity allows
    #[tracing::instrument(skip(self), fields(store, pending))]
    pub async fn start(&mut self) -> Result<(), SyncError> {
        if self.state() != EngineState::Created {
            return Err(SyncError::Validation(format!("engine cannot start from state {}", self.state())));
        }

        let startup_start = std::time::Instant::now();
        info!("Starting offline engine...");
        self.set_state(EngineState::Starting);

        // ========== PHASE 1: Open task store ==========
        let phase_start = std::time::Instant::now();
        let store = match self.task_store.clone() {
            Some(store) => {
                tracing::Span::current().record("store", "injected");
                store
            }
            None => match self.open_task_store().await {
                Ok(store) => store,
                Err(e) => {
                    self.set_state(EngineState::Created);
                    return Err(e);
                }
            },
        };
        crate::metrics::record_startup_phase("task_store", phase_start.elapsed());

        // ========== PHASE 2: Load queue ==========
        let phase_start = std::time::Instant::now();
        let resolver = ConflictResolver::new(self.config.mergeable_fields.clone(), self.config.tie_break);
        let mut queue = SyncQueue::new(store, self.transport.clone(), self.breaker.clone(), self.clock.clone())
            .with_settings(QueueSettings::from_config(&self.config))
            .with_resolver(resolver)
            .with_cache(self.cache.clone());
        if let Some(jitter) = &self.jitter {
            queue = queue.with_jitter(jitter.clone());
        }
        let queue = Arc::new(queue);

        let pending = match queue.load().await {
            Ok(pending) => pending,
            Err(e) => {
                self.set_state(EngineState::Created);
                return Err(e);
            }
        };
        tracing::Span::current().record("pending", pending);
        crate::metrics::record_startup_phase("queue_load", phase_start.elapsed());

        // ========== PHASE 3: Rotate cache versions ==========
        let phase_start = std::time::Instant::now();
        let active = self.config.active_namespaces();
        match cleanup_stale_versions(self.cache.as_ref(), &active).await {
            Ok(removed) if !removed.is_empty() => {
                info!(removed = ?removed, "Removed superseded cache namespaces");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Cache version rotation failed, stale namespaces kept"),
        }
        crate::metrics::record_startup_phase("cache_rotation", phase_start.elapsed());

        // ========== PHASE 4: Background tasks ==========
        {
            let mut background = self.background.lock();
            background.push(self.monitor.spawn(self.cancel.child_token()));
            background.push(queue.spawn_auto_drain(
                &self.monitor,
                self.config.drain_interval(),
                self.cancel.child_token(),
            ));
        }
        if pending > 0 {
            // Restored work drains as soon as the loop sees we are online.
            queue.request_drain();
        }
        self.queue = Some(queue);

        self.set_state(EngineState::Running);
        crate::metrics::record_startup_total(startup_start.elapsed());
        info!(pending, online = self.monitor.is_online(), "Offline engine running");
        Ok(())
    }

    async fn open_task_store(&self) -> Result<Arc<dyn TaskStore>, SyncError> {
        let store: Arc<dyn TaskStore> = match self.config.queue_store {
            QueueStoreKind::Memory => {
                tracing::Span::current().record("store", "memory");
                warn!("Sync queue is in memory only; queued mutations will not survive a restart");
                Arc::new(MemoryTaskStore::new())
            }
            QueueStoreKind::Sqlite => {
                tracing::Span::current().record("store", "sqlite");
                let path = self.config.queue_path.as_deref().unwrap_or(DEFAULT_SQLITE_PATH);
                Arc::new(SqliteTaskStore::new(path).await?)
            }
            QueueStoreKind::JsonFile => {
                tracing::Span::current().record("store", "json-file");
                let path = self.config.queue_path.as_deref().unwrap_or(DEFAULT_JSON_PATH);
                Arc::new(JsonFileTaskStore::new(path))
            }
        };
        Ok(store)
    }

    /// Initiate graceful shutdown.
    ///
    /// In-flight drain attempts are cancelled and revert to pending without
    /// spending an attempt; the final queue snapshot is persisted.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }

        let shutdown_start = std::time::Instant::now();
        info!("Initiating offline engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        self.cancel.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.background.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.router.wait_for_revalidations().await;

        if let Some(queue) = &self.queue {
            if let Err(e) = queue.persist().await {
                warn!(error = %e, "Final queue snapshot not persisted");
            }
        }

        self.set_state(EngineState::Stopped);
        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Offline engine shutdown complete");
    }
}
