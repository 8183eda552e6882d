//! Configuration for the offline engine.
//!
//! # Example
//!
//! ```
//! use offline_sync::EngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.max_retries, 5);
//!
//! // From JSON, overriding a few knobs
//! let config = EngineConfig::from_json(r#"{
//!     "syncBaseUrl": "https://api.example.com",
//!     "maxConcurrentSync": 4,
//!     "circuit": { "failureThreshold": 3 }
//! }"#).unwrap();
//! assert_eq!(config.max_concurrent_sync, 4);
//! assert_eq!(config.circuit.failure_threshold, 3);
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::conflict::TieBreak;
use crate::resilience::backoff::BackoffConfig;
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::strategy::{CacheStrategy, RouteRule};

/// Where the sync queue snapshot lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStoreKind {
    /// Lost on restart. Tests and ephemeral sessions.
    #[default]
    Memory,
    Sqlite,
    JsonFile,
}

/// Configuration for the offline engine.
///
/// All fields have sensible defaults. For production use, set at least
/// `sync_base_url` and a durable `queue_store` with `queue_path`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Entry ceiling per cache namespace (oldest `stored_at` evicted first)
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Total cached body bytes across namespaces (None = unbounded)
    #[serde(default)]
    pub cache_max_bytes: Option<usize>,

    /// Transport timeout for routes without their own
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,

    /// Connectivity must hold this long before a transition fires
    #[serde(default = "default_network_settle_ms")]
    pub network_settle_ms: u64,

    #[serde(default = "default_initially_online")]
    pub initially_online: bool,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Attempts before a task is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Tasks attempted concurrently per drain batch
    #[serde(default = "default_max_concurrent_sync")]
    pub max_concurrent_sync: usize,

    /// Dead-letter log capacity (oldest dropped first)
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    /// Periodic drain while online, in seconds (0 = only on transitions)
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,

    /// Prefix for sync requests (`POST <base><tag>`)
    #[serde(default)]
    pub sync_base_url: String,

    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    #[serde(default)]
    pub queue_store: QueueStoreKind,

    /// SQLite database or JSON file path for a durable queue store
    #[serde(default)]
    pub queue_path: Option<String>,

    /// Ordered route table, first match wins
    #[serde(default)]
    pub routes: Vec<RouteRule>,

    /// Strategy when no route matches
    #[serde(default)]
    pub default_strategy: CacheStrategy,

    /// Namespace when no route matches
    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    /// Payload fields merged by set union during conflict resolution
    #[serde(default)]
    pub mergeable_fields: Vec<String>,

    #[serde(default)]
    pub tie_break: TieBreak,
}

pub fn default_cache_max_entries() -> usize { 200 }
fn default_network_timeout_ms() -> u64 { 10_000 }
fn default_network_settle_ms() -> u64 { 1_500 }
fn default_initially_online() -> bool { true }
fn default_max_retries() -> u32 { 5 }
fn default_max_concurrent_sync() -> usize { 3 }
fn default_dead_letter_capacity() -> usize { 100 }
fn default_drain_interval_secs() -> u64 { 30 }
fn default_sync_timeout_ms() -> u64 { 15_000 }
fn default_namespace() -> String { "runtime-v1".to_string() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_max_entries: default_cache_max_entries(),
            cache_max_bytes: None,
            network_timeout_ms: default_network_timeout_ms(),
            network_settle_ms: default_network_settle_ms(),
            initially_online: default_initially_online(),
            backoff: BackoffConfig::default(),
            circuit: CircuitConfig::default(),
            max_retries: default_max_retries(),
            max_concurrent_sync: default_max_concurrent_sync(),
            dead_letter_capacity: default_dead_letter_capacity(),
            drain_interval_secs: default_drain_interval_secs(),
            sync_base_url: String::new(),
            sync_timeout_ms: default_sync_timeout_ms(),
            queue_store: QueueStoreKind::default(),
            queue_path: None,
            routes: Vec::new(),
            default_strategy: CacheStrategy::default(),
            default_namespace: default_namespace(),
            mergeable_fields: Vec::new(),
            tie_break: TieBreak::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    #[must_use]
    pub fn network_settle(&self) -> Duration {
        Duration::from_millis(self.network_settle_ms)
    }

    #[must_use]
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// None when periodic draining is disabled.
    #[must_use]
    pub fn drain_interval(&self) -> Option<Duration> {
        (self.drain_interval_secs > 0).then(|| Duration::from_secs(self.drain_interval_secs))
    }

    /// Every namespace the route table can write to. Older versions of these
    /// are removed at startup.
    #[must_use]
    pub fn active_namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.iter().map(|r| r.namespace.clone()).collect();
        names.push(self.default_namespace.clone());
        names.sort();
        names.dedup();
        names
    }
}

/// `Duration` as integer milliseconds on the wire.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RouteMatch;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_max_entries, 200);
        assert_eq!(config.network_settle(), Duration::from_millis(1_500));
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.backoff.max_delay, Duration::from_secs(300));
        assert_eq!(config.tie_break, TieBreak::RemoteWins);
        assert_eq!(config.queue_store, QueueStoreKind::Memory);
    }

    #[test]
    fn test_empty_json_matches_default() {
        let parsed = EngineConfig::from_json("{}").unwrap();
        let default = EngineConfig::default();
        assert_eq!(parsed.max_retries, default.max_retries);
        assert_eq!(parsed.dead_letter_capacity, default.dead_letter_capacity);
        assert_eq!(parsed.default_namespace, default.default_namespace);
    }

    #[test]
    fn test_full_json() {
        let config = EngineConfig::from_json(
            r#"{
                "syncBaseUrl": "https://api.example.com",
                "queueStore": "sqlite",
                "queuePath": "/tmp/queue.db",
                "backoff": { "baseDelay": 500, "maxDelay": 60000 },
                "circuit": { "failureThreshold": 3, "recoveryTimeout": 30000 },
                "routes": [
                    { "match": { "prefix": "/api/" }, "strategy": "network-first", "namespace": "api-v3", "timeoutMs": 4000 },
                    { "match": { "extension": ".svg" }, "strategy": "cache-first", "namespace": "static-v2" }
                ],
                "mergeableFields": ["tags"],
                "tieBreak": "local-wins",
                "drainIntervalSecs": 0
            }"#,
        )
        .unwrap();

        assert_eq!(config.queue_store, QueueStoreKind::Sqlite);
        assert_eq!(config.backoff.base_delay, Duration::from_millis(500));
        assert_eq!(config.circuit.recovery_timeout, Duration::from_secs(30));
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].matcher, RouteMatch::Prefix("/api/".into()));
        assert_eq!(config.routes[1].strategy, CacheStrategy::CacheFirst);
        assert_eq!(config.tie_break, TieBreak::LocalWins);
        assert!(config.drain_interval().is_none());
        assert_eq!(
            config.active_namespaces(),
            vec!["api-v3".to_string(), "runtime-v1".to_string(), "static-v2".to_string()]
        );
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = EngineConfig::from_json(r#"{"defaultStrategy": "cache-maybe"}"#);
        assert!(err.is_err());
    }
}
