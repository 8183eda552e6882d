//! # Offline Sync
//!
//! An offline-first cache and mutation sync engine: reads are served through
//! per-route cache strategies, and writes made while offline are queued
//! durably and replayed when connectivity returns.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Cache Strategy Router                   │
//! │  • Route table picks a strategy + namespace per request    │
//! │  • Single-flight collapses concurrent fetches of a key     │
//! │  • Always answers: cached copy, 503 or 504 when degraded   │
//! └─────────────────────────────────────────────────────────────┘
//!            │ lookup / put                    │ fetch
//!            ▼                                 ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │  Versioned Cache Store   │   │          Transport           │
//! │  • <name>-v<N> rotation  │   │  • per-call timeout          │
//! │  • TTL, quota, ceiling   │   │  • reqwest in production     │
//! └──────────────────────────┘   └──────────────────────────────┘
//!            ▲ invalidate                      ▲
//!            │                                 │ through the breaker
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Sync Queue                            │
//! │  • Priority + FIFO, exponential backoff with jitter        │
//! │  • Dead-letter log, LWW conflict resolution with merge     │
//! │  • Whole-queue snapshot persisted after every change       │
//! └─────────────────────────────────────────────────────────────┘
//!            ▲ drain once per debounced online transition
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Network Monitor                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offline_sync::{EngineConfig, OfflineEngine, Request, TaskPriority};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::from_json(r#"{
//!         "syncBaseUrl": "https://api.example.com",
//!         "queueStore": "sqlite",
//!         "queuePath": "./queue.db",
//!         "routes": [
//!             {"match": {"prefix": "/static/"}, "strategy": "cache-first", "namespace": "static-v3"}
//!         ]
//!     }"#).expect("valid config");
//!
//!     let mut engine = OfflineEngine::new(config).expect("HTTP client");
//!     engine.start().await.expect("Failed to start");
//!
//!     // Reads always get an answer
//!     let response = engine.handle_request(Request::get("/static/app.js")).await;
//!     println!("{} (from cache: {})", response.status, response.served_from_cache());
//!
//!     // Writes are queued and replayed when online
//!     engine
//!         .enqueue("/api/notes/7", r#"{"text":"hello"}"#, TaskPriority::High)
//!         .await
//!         .expect("Failed to enqueue");
//!
//!     // Feed connectivity changes from the host
//!     engine.report_network(false);
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: [`OfflineEngine`] owning and wiring every component
//! - [`strategy`]: cache strategy router and single-flight
//! - [`storage`]: versioned cache store port and in-memory backend
//! - [`queue`]: sync queue manager
//! - [`conflict`]: last-writer-wins conflict resolver with set-union merge
//! - [`network`]: debounced connectivity monitor
//! - [`resilience`]: circuit breaker, backoff, durable task stores
//! - [`transport`]: network port and `reqwest` transport

pub mod config;
pub mod clock;
pub mod http;
pub mod storage;
pub mod transport;
pub mod strategy;
pub mod network;
pub mod resilience;
pub mod sync_task;
pub mod queue;
pub mod conflict;
pub mod error;
pub mod coordinator;
pub mod metrics;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::{EngineConfig, QueueStoreKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{EngineHealth, EngineState, OfflineEngine};
pub use conflict::{ConflictRecord, ConflictResolver, RemoteSnapshot, Resolution, TieBreak};
pub use error::SyncError;
pub use http::{Method, Request, Response};
pub use network::{ConnectionQuality, NetworkEvent, NetworkMonitor};
pub use queue::{DrainReport, QueueSettings, SyncEvent, SyncQueue};
pub use resilience::backoff::{BackoffConfig, JitterSource, NoJitter, RandomJitter, SeededJitter};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use resilience::task_store::{JsonFileTaskStore, MemoryTaskStore, SqliteTaskStore, TaskStore};
pub use storage::memory::InMemoryCacheStore;
pub use storage::traits::{CacheEntry, CacheStore, NamespaceHandle, StorageError};
pub use strategy::{CacheRouter, CacheStrategy, RouteMatch, RouteRule};
pub use sync_task::{SyncTask, TaskPriority, TaskState};
pub use transport::{SendOptions, Transport, TransportError};
pub use metrics::LatencyTimer;
