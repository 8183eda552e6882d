// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache strategy router.
//!
//! Every read goes through [`CacheRouter`], which picks a [`CacheStrategy`]
//! for the request and executes it against the cache store and the
//! transport. The caller always gets a [`Response`]; degradation shows up as
//! a status code and headers, never as an error.
//!
//! | Strategy               | Cache hit            | Cache miss                  | Network down        |
//! |------------------------|----------------------|-----------------------------|---------------------|
//! | `NetworkFirst`         | only as fallback     | fetch + store               | cached, else 503    |
//! | `CacheFirst`           | return, no network   | fetch + store               | 503                 |
//! | `StaleWhileRevalidate` | return + refresh bg  | behaves as `NetworkFirst`   | cached, else 503    |
//! | `NetworkOnly`          | never consulted      | fetch, never stored         | 503                 |
//! | `CacheOnly`            | return               | 504                         | n/a                 |
//!
//! Concurrent fetches of the same key are collapsed by [`InflightRequests`].

pub mod single_flight;

use futures::FutureExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::http::{Request, Response};
use crate::storage::traits::{invalidate_resource, CacheEntry, CacheStore, StorageError};
use crate::transport::{send_with_timeout, SendOptions, Transport, TransportError};

pub use single_flight::InflightRequests;

/// Status returned when neither network nor cache can answer.
pub const OFFLINE_STATUS: u16 = 503;
/// Status returned by `CacheOnly` on a miss.
pub const CACHE_MISS_STATUS: u16 = 504;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    #[default]
    NetworkFirst,
    CacheFirst,
    StaleWhileRevalidate,
    NetworkOnly,
    CacheOnly,
}

impl CacheStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkFirst => "network-first",
            Self::CacheFirst => "cache-first",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
            Self::NetworkOnly => "network-only",
            Self::CacheOnly => "cache-only",
        }
    }

    /// Whether fetched responses are written to the cache.
    #[must_use]
    pub fn stores_responses(self) -> bool {
        matches!(self, Self::NetworkFirst | Self::CacheFirst | Self::StaleWhileRevalidate)
    }
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a rule matches a request path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteMatch {
    Prefix(String),
    Exact(String),
    /// Path suffix such as `.svg`
    Extension(String),
}

impl RouteMatch {
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Self::Exact(exact) => path == exact,
            Self::Extension(ext) => path.ends_with(ext.as_str()),
        }
    }
}

/// One entry in the route table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    #[serde(rename = "match")]
    pub matcher: RouteMatch,
    pub strategy: CacheStrategy,
    /// Versioned namespace, e.g. `static-v2`
    pub namespace: String,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RouteRule {
    #[must_use]
    pub fn new(matcher: RouteMatch, strategy: CacheStrategy, namespace: impl Into<String>) -> Self {
        Self {
            matcher,
            strategy,
            namespace: namespace.into(),
            ttl_ms: None,
            timeout_ms: None,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Resolved handling for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub strategy: CacheStrategy,
    pub namespace: String,
    pub ttl: Option<Duration>,
    pub timeout: Duration,
}

/// Shared by the router and its background refreshes.
#[derive(Clone)]
struct Fetcher {
    store: Arc<dyn CacheStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    inflight: Arc<InflightRequests>,
    cancel: CancellationToken,
}

impl Fetcher {
    /// Fetch through single-flight; successful responses are stored before
    /// any waiter sees them.
    async fn fetch(&self, request: Request, plan: &RoutePlan) -> Result<Response, TransportError> {
        let key = request.cache_key();
        let flight_key = format!("{}|{}", plan.namespace, key);
        let fetcher = self.clone();
        let plan = plan.clone();

        self.inflight
            .run(&flight_key, move || {
                async move {
                    let options = SendOptions::new(plan.timeout).with_cancel(fetcher.cancel.child_token());
                    let response = send_with_timeout(fetcher.transport.as_ref(), request, &options).await?;
                    if response.is_success() && plan.strategy.stores_responses() {
                        fetcher.store_response(&plan, &key, &response).await;
                    }
                    Ok(response)
                }
                .boxed()
            })
            .await
    }

    /// Cache write failures are logged, never surfaced.
    async fn store_response(&self, plan: &RoutePlan, key: &str, response: &Response) {
        let entry = CacheEntry::from_response(key, response, self.clock.now_millis()).with_ttl(plan.ttl);
        let result = match self.store.open(&plan.namespace).await {
            Ok(ns) => self.store.put(&ns, key, entry).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => debug!(namespace = %plan.namespace, key, "Cached network response"),
            Err(StorageError::QuotaExceeded(detail)) => {
                warn!(namespace = %plan.namespace, key, detail = %detail, "Cache quota exceeded, response not stored");
                crate::metrics::record_cache_write_error("quota");
            }
            Err(e) => {
                warn!(namespace = %plan.namespace, key, error = %e, "Cache write failed");
                crate::metrics::record_cache_write_error("backend");
            }
        }
    }

    /// Read-through lookup that never fails. A corrupted namespace is
    /// truncated and reported as a miss.
    async fn lookup(&self, plan: &RoutePlan, key: &str) -> Option<CacheEntry> {
        let ns = match self.store.open(&plan.namespace).await {
            Ok(ns) => ns,
            Err(e) => {
                warn!(namespace = %plan.namespace, error = %e, "Failed to open cache namespace");
                return None;
            }
        };

        let found = match self.store.lookup(&ns, key).await {
            Ok(found) => found,
            Err(StorageError::Corruption { namespace, detail }) => {
                error!(namespace = %namespace, detail = %detail, "Cache namespace corrupted, truncating");
                crate::metrics::record_corruption(&namespace);
                if let Err(e) = self.store.delete_namespace(ns.name()).await {
                    error!(namespace = %ns, error = %e, "Failed to truncate corrupted namespace");
                }
                None
            }
            Err(e) => {
                warn!(namespace = %ns, key, error = %e, "Cache lookup failed");
                None
            }
        };

        crate::metrics::record_cache_lookup(plan.strategy.as_str(), found.is_some());
        found
    }
}

pub struct CacheRouter {
    fetcher: Fetcher,
    rules: Vec<RouteRule>,
    default_strategy: CacheStrategy,
    default_namespace: String,
    default_timeout: Duration,
    revalidations: TaskTracker,
}

impl CacheRouter {
    pub fn new(store: Arc<dyn CacheStore>, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        let defaults = EngineConfig::default();
        Self {
            fetcher: Fetcher {
                store,
                transport,
                clock,
                inflight: Arc::new(InflightRequests::new()),
                cancel: CancellationToken::new(),
            },
            rules: Vec::new(),
            default_strategy: defaults.default_strategy,
            default_timeout: defaults.network_timeout(),
            default_namespace: defaults.default_namespace,
            revalidations: TaskTracker::new(),
        }
    }

    pub fn from_config(
        config: &EngineConfig,
        store: Arc<dyn CacheStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(store, transport, clock)
            .with_routes(config.routes.clone())
            .with_default(config.default_strategy, config.default_namespace.clone())
            .with_timeout(config.network_timeout())
    }

    #[must_use]
    pub fn with_routes(mut self, rules: Vec<RouteRule>) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn with_default(mut self, strategy: CacheStrategy, namespace: impl Into<String>) -> Self {
        self.default_strategy = strategy;
        self.default_namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Abort in-flight fetches when `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.fetcher.cancel = cancel;
        self
    }

    /// Resolve the route table for a request. Non-GET requests are always
    /// `NetworkOnly`.
    #[must_use]
    pub fn route(&self, request: &Request) -> RoutePlan {
        let path = request.path();
        let plan = match self.rules.iter().find(|rule| rule.matcher.matches(path)) {
            Some(rule) => RoutePlan {
                strategy: rule.strategy,
                namespace: rule.namespace.clone(),
                ttl: rule.ttl_ms.map(Duration::from_millis),
                timeout: rule.timeout_ms.map_or(self.default_timeout, Duration::from_millis),
            },
            None => RoutePlan {
                strategy: self.default_strategy,
                namespace: self.default_namespace.clone(),
                ttl: None,
                timeout: self.default_timeout,
            },
        };
        Self::restrict_to_cacheable(request, plan)
    }

    /// Handle a request with the strategy from the route table.
    pub async fn handle_route(&self, request: Request) -> Response {
        let plan = self.route(&request);
        self.execute(request, plan).await
    }

    /// Handle a request with an explicit strategy. The route table still
    /// supplies namespace, TTL, and timeout.
    pub async fn handle(&self, request: Request, strategy: CacheStrategy) -> Response {
        let mut plan = self.route(&request);
        plan.strategy = strategy;
        let plan = Self::restrict_to_cacheable(&request, plan);
        self.execute(request, plan).await
    }

    /// Drop every cached copy of a resource.
    pub async fn invalidate(&self, resource: &str) -> Result<usize, StorageError> {
        invalidate_resource(self.fetcher.store.as_ref(), resource).await
    }

    /// Number of distinct keys currently being fetched.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.fetcher.inflight.len()
    }

    /// Wait for all background refreshes started so far.
    pub async fn wait_for_revalidations(&self) {
        self.revalidations.close();
        self.revalidations.wait().await;
        self.revalidations.reopen();
    }

    fn restrict_to_cacheable(request: &Request, mut plan: RoutePlan) -> RoutePlan {
        if !request.method.is_cacheable() && plan.strategy != CacheStrategy::NetworkOnly {
            debug!(method = %request.method, strategy = %plan.strategy, "Non-cacheable method, using network-only");
            plan.strategy = CacheStrategy::NetworkOnly;
        }
        plan
    }

    async fn execute(&self, request: Request, plan: RoutePlan) -> Response {
        match plan.strategy {
            CacheStrategy::NetworkFirst => self.network_first(request, &plan).await,
            CacheStrategy::CacheFirst => self.cache_first(request, &plan).await,
            CacheStrategy::StaleWhileRevalidate => self.stale_while_revalidate(request, &plan).await,
            CacheStrategy::NetworkOnly => self.network_only(request, &plan).await,
            CacheStrategy::CacheOnly => self.cache_only(request, &plan).await,
        }
    }

    async fn network_first(&self, request: Request, plan: &RoutePlan) -> Response {
        let key = request.cache_key();
        match self.fetcher.fetch(request, plan).await {
            Ok(response) => response,
            Err(e) => {
                debug!(key = %key, error = %e, "Network failed, falling back to cache");
                match self.fetcher.lookup(plan, &key).await {
                    Some(entry) => {
                        crate::metrics::record_strategy_fallback(plan.strategy.as_str(), "cache");
                        entry.to_response()
                    }
                    None => {
                        crate::metrics::record_strategy_fallback(plan.strategy.as_str(), "offline");
                        Response::offline(OFFLINE_STATUS)
                    }
                }
            }
        }
    }

    async fn cache_first(&self, request: Request, plan: &RoutePlan) -> Response {
        let key = request.cache_key();
        if let Some(entry) = self.fetcher.lookup(plan, &key).await {
            return entry.to_response();
        }
        match self.fetcher.fetch(request, plan).await {
            Ok(response) => response,
            Err(e) => {
                debug!(key = %key, error = %e, "Cache miss and network failed");
                crate::metrics::record_strategy_fallback(plan.strategy.as_str(), "offline");
                Response::offline(OFFLINE_STATUS)
            }
        }
    }

    async fn stale_while_revalidate(&self, request: Request, plan: &RoutePlan) -> Response {
        let key = request.cache_key();
        let Some(entry) = self.fetcher.lookup(plan, &key).await else {
            return self.network_first(request, plan).await;
        };

        let fetcher = self.fetcher.clone();
        let plan = plan.clone();
        self.revalidations.spawn(async move {
            match fetcher.fetch(request, &plan).await {
                Ok(response) => {
                    debug!(key = %key, status = response.status, "Revalidated cached entry");
                    crate::metrics::record_revalidation(response.is_success());
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "Background revalidation failed");
                    crate::metrics::record_revalidation(false);
                }
            }
        });

        entry.to_response()
    }

    async fn network_only(&self, request: Request, plan: &RoutePlan) -> Response {
        let options = SendOptions::new(plan.timeout).with_cancel(self.fetcher.cancel.child_token());
        let url = request.url.clone();
        match send_with_timeout(self.fetcher.transport.as_ref(), request, &options).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "Network-only request failed");
                crate::metrics::record_strategy_fallback(plan.strategy.as_str(), "offline");
                Response::offline(OFFLINE_STATUS)
            }
        }
    }

    async fn cache_only(&self, request: Request, plan: &RoutePlan) -> Response {
        match self.fetcher.lookup(plan, &request.cache_key()).await {
            Some(entry) => entry.to_response(),
            None => Response::offline(CACHE_MISS_STATUS),
        }
    }
}
