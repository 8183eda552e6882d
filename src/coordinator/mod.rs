// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine coordinator.
//!
//! [`OfflineEngine`] is the explicit context object that owns every
//! component and wires them together:
//! - versioned cache store behind the strategy router
//! - network monitor with its debouncer
//! - circuit breaker guarding the sync transport
//! - durable sync queue with auto-drain
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Running → ShuttingDown → Stopped
//! ```
//!
//! Reads through [`OfflineEngine::handle_request`] work in every state. The
//! sync queue exists from [`OfflineEngine::start`] on.
//!
//! # Example
//!
//! ```rust,no_run
//! use offline_sync::{EngineConfig, EngineState, OfflineEngine};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = EngineConfig::default();
//! let mut engine = OfflineEngine::new(config).expect("HTTP client");
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! // engine.start().await.expect("Start failed");
//! // engine.report_network(false);
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{EngineHealth, EngineState};

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::http::{Request, Response};
use crate::network::{ConnectionQuality, NetworkEvent, NetworkMonitor};
use crate::queue::{DrainReport, SyncEvent, SyncQueue};
use crate::resilience::backoff::JitterSource;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::task_store::TaskStore;
use crate::storage::memory::InMemoryCacheStore;
use crate::storage::traits::CacheStore;
use crate::strategy::{CacheRouter, CacheStrategy};
use crate::sync_task::{SyncTask, TaskPriority};
use crate::transport::http::HttpTransport;
use crate::transport::Transport;

/// Offline-first engine.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`. Everything except `start` takes `&self`, so
/// it can be shared behind an `Arc` once started.
pub struct OfflineEngine {
    pub(super) config: EngineConfig,
    pub(super) clock: Arc<dyn Clock>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) cache: Arc<dyn CacheStore>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) router: CacheRouter,
    pub(super) monitor: Arc<NetworkMonitor>,
    pub(super) breaker: Arc<CircuitBreaker>,

    /// Overrides the store selected by `config.queue_store`
    pub(super) task_store: Option<Arc<dyn TaskStore>>,
    pub(super) jitter: Option<Arc<dyn JitterSource>>,
    /// Set by `start`
    pub(super) queue: Option<Arc<SyncQueue>>,

    /// Parent of every background task and drain
    pub(super) cancel: CancellationToken,
    pub(super) background: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineEngine {
    /// Create an engine with the HTTP transport, an in-memory cache store
    /// and the system clock.
    pub fn new(config: EngineConfig) -> Result<Self, SyncError> {
        let transport = Arc::new(HttpTransport::new(config.sync_base_url.clone())?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mut cache = InMemoryCacheStore::with_clock(config.cache_max_entries, clock.clone());
        if let Some(max_bytes) = config.cache_max_bytes {
            cache = cache.with_quota(max_bytes);
        }
        Ok(Self::with_parts(config, Arc::new(cache), transport, clock))
    }

    /// Create an engine from explicit parts.
    pub fn with_parts(
        config: EngineConfig,
        cache: Arc<dyn CacheStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        crate::metrics::set_engine_state(&EngineState::Created.to_string());

        let cancel = CancellationToken::new();
        let router = CacheRouter::from_config(&config, cache.clone(), transport.clone(), clock.clone())
            .with_cancel(cancel.child_token());
        let monitor = Arc::new(NetworkMonitor::new(config.initially_online, config.network_settle()));
        let breaker = Arc::new(CircuitBreaker::with_clock("sync", config.circuit.clone(), clock.clone()));

        Self {
            config,
            clock,
            state: state_tx,
            state_rx,
            cache,
            transport,
            router,
            monitor,
            breaker,
            task_store: None,
            jitter: None,
            queue: None,
            cancel,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Use this task store instead of opening the configured one.
    #[must_use]
    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    /// Replace the backoff jitter source (deterministic tests).
    #[must_use]
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // State
    // ═══════════════════════════════════════════════════════════════════════════

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn router(&self) -> &CacheRouter {
        &self.router
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    #[must_use]
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The sync queue, once started.
    #[must_use]
    pub fn queue(&self) -> Option<&Arc<SyncQueue>> {
        self.queue.as_ref()
    }

    fn started_queue(&self) -> Result<&Arc<SyncQueue>, SyncError> {
        self.queue
            .as_ref()
            .ok_or_else(|| SyncError::Validation("engine not started: sync queue unavailable".into()))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// Answer a request with the strategy its route selects.
    pub async fn handle_request(&self, request: Request) -> Response {
        self.router.handle_route(request).await
    }

    /// Answer a request with an explicit strategy.
    pub async fn handle_with(&self, request: Request, strategy: CacheStrategy) -> Response {
        self.router.handle(request, strategy).await
    }

    /// Drop every cached copy of a resource.
    pub async fn invalidate(&self, resource: &str) -> Result<usize, SyncError> {
        Ok(self.router.invalidate(resource).await?)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Mutations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Queue a mutation for replay. Returns the task id.
    pub async fn enqueue(
        &self,
        tag: impl Into<String>,
        payload: impl Into<Bytes>,
        priority: TaskPriority,
    ) -> Result<String, SyncError> {
        self.started_queue()?.enqueue(tag, payload, priority).await
    }

    /// Run one drain cycle now, regardless of connectivity.
    pub async fn drain_now(&self) -> Result<DrainReport, SyncError> {
        let queue = self.started_queue()?;
        Ok(queue.drain(&self.cancel).await)
    }

    #[must_use]
    pub fn pending(&self) -> Vec<SyncTask> {
        self.queue.as_ref().map(|q| q.get_pending()).unwrap_or_default()
    }

    #[must_use]
    pub fn dead_letters(&self) -> Vec<SyncTask> {
        self.queue.as_ref().map(|q| q.get_dead_letters()).unwrap_or_default()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.pending_count())
    }

    #[must_use]
    pub fn dead_letter_count(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.dead_letter_count())
    }

    pub async fn retry_dead_letter(&self, id: &str) -> Result<bool, SyncError> {
        self.started_queue()?.retry_dead_letter(id).await
    }

    pub async fn clear_dead_letters(&self) -> Result<usize, SyncError> {
        self.started_queue()?.clear_dead_letters().await
    }

    pub fn subscribe_sync(&self) -> Result<broadcast::Receiver<SyncEvent>, SyncError> {
        Ok(self.started_queue()?.subscribe())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Connectivity
    // ═══════════════════════════════════════════════════════════════════════════

    /// Host-reported connectivity. Takes effect after the settle delay.
    pub fn report_network(&self, online: bool) {
        self.monitor.report(online);
    }

    /// Host-reported link quality hint.
    pub fn set_connection_quality(&self, quality: ConnectionQuality) {
        self.monitor.set_quality(quality);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub fn subscribe_network(&self) -> broadcast::Receiver<NetworkEvent> {
        self.monitor.subscribe()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Health
    // ═══════════════════════════════════════════════════════════════════════════

    /// Collect a health snapshot. No I/O.
    #[must_use]
    pub fn health(&self) -> EngineHealth {
        let state = self.state();
        let online = self.monitor.is_online();
        let circuit = self.breaker.state();
        EngineHealth {
            state,
            online,
            quality: self.monitor.quality(),
            circuit,
            consecutive_failures: self.breaker.consecutive_failures(),
            pending_tasks: self.pending_count(),
            dead_letters: self.dead_letter_count(),
            inflight_fetches: self.router.inflight(),
            healthy: state == EngineState::Running
                && online
                && circuit != crate::resilience::circuit_breaker::CircuitState::Open,
        }
    }
}
