use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::http::{Response, HEADER_CACHE};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Data corruption detected in '{namespace}': {detail}")]
    Corruption {
        namespace: String,
        detail: String,
    },
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Quota pressure can clear up on its own; corruption and backend faults cannot.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Handle to an opened cache namespace.
///
/// Namespace names encode a version tag as `<logical>-v<N>` (e.g. `pages-v2`).
/// Names without a version suffix are treated as version 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceHandle {
    name: String,
}

impl NamespaceHandle {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn logical_name(&self) -> &str {
        split_version(&self.name).0
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        split_version(&self.name).1
    }
}

impl std::fmt::Display for NamespaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Split `pages-v2` into `("pages", 2)`.
#[must_use]
pub fn split_version(name: &str) -> (&str, u32) {
    if let Some((logical, tag)) = name.rsplit_once("-v") {
        if let Ok(version) = tag.parse::<u32>() {
            if !logical.is_empty() {
                return (logical, version);
            }
        }
    }
    (name, 0)
}

/// A stored request→response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub status: u16,
    pub body: Bytes,
    pub headers: BTreeMap<String, String>,
    /// When the entry was written (epoch millis)
    pub stored_at: i64,
    /// Optional time-to-live from `stored_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    #[must_use]
    pub fn from_response(key: impl Into<String>, response: &Response, stored_at: i64) -> Self {
        Self {
            key: key.into(),
            status: response.status,
            body: response.body.clone(),
            headers: response.headers.clone(),
            stored_at,
            ttl: None,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        match self.ttl {
            Some(ttl) => self.stored_at.saturating_add(ttl.as_millis() as i64) <= now,
            None => false,
        }
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.key.len()
            + self.body.len()
            + self.headers.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
    }

    /// Rebuild the response, tagged as a cache hit.
    #[must_use]
    pub fn to_response(&self) -> Response {
        let mut response = Response {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        };
        response.headers.insert(HEADER_CACHE.to_string(), "hit".to_string());
        response
    }
}

/// The cache port.
///
/// `put` overwrites silently and is not transactional across keys.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a namespace, creating it if absent.
    async fn open(&self, name: &str) -> Result<NamespaceHandle, StorageError>;

    /// Look up a key. Expired entries are reported as absent.
    async fn lookup(&self, ns: &NamespaceHandle, key: &str) -> Result<Option<CacheEntry>, StorageError>;

    async fn put(&self, ns: &NamespaceHandle, key: &str, entry: CacheEntry) -> Result<(), StorageError>;

    /// Returns whether the key existed.
    async fn delete(&self, ns: &NamespaceHandle, key: &str) -> Result<bool, StorageError>;

    async fn keys(&self, ns: &NamespaceHandle) -> Result<Vec<String>, StorageError>;

    /// Names of all existing namespaces.
    async fn namespaces(&self) -> Result<Vec<String>, StorageError>;

    /// Drop a whole namespace. Returns whether it existed.
    async fn delete_namespace(&self, name: &str) -> Result<bool, StorageError>;

    /// Drop every namespace whose name satisfies the predicate; returns the removed names.
    async fn delete_namespaces_matching(
        &self,
        predicate: &(dyn for<'a> Fn(&'a str) -> bool + Send + Sync),
    ) -> Result<Vec<String>, StorageError> {
        let doomed: Vec<String> = self
            .namespaces()
            .await?
            .into_iter()
            .filter(|name| predicate(name.as_str()))
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for name in doomed {
            if self.delete_namespace(name.as_str()).await? {
                removed.push(name);
            }
        }
        Ok(removed)
    }
}

/// Remove namespaces that share a logical name with an active namespace but
/// carry an older version tag.
pub async fn cleanup_stale_versions(
    store: &dyn CacheStore,
    active: &[String],
) -> Result<Vec<String>, StorageError> {
    let active: Vec<(String, u32)> = active
        .iter()
        .map(|name| {
            let (logical, version) = split_version(name);
            (logical.to_string(), version)
        })
        .collect();

    let is_stale = move |name: &str| {
        let (logical, version) = split_version(name);
        active
            .iter()
            .any(|(active_logical, active_version)| active_logical == logical && version < *active_version)
    };

    store.delete_namespaces_matching(&is_stale).await
}

/// Delete every cached entry for a resource across all namespaces.
///
/// `resource` may be a full cache key or a bare path; keys whose path equals
/// it match too, so `/api/notes/7` clears `https://host/api/notes/7?x=1`.
pub async fn invalidate_resource(store: &dyn CacheStore, resource: &str) -> Result<usize, StorageError> {
    let target_path = crate::http::url_path(resource);
    let mut removed = 0;
    for name in store.namespaces().await? {
        let ns = NamespaceHandle::new(name);
        for key in store.keys(&ns).await? {
            if (key == resource || crate::http::url_path(&key) == target_path) && store.delete(&ns, &key).await? {
                removed += 1;
            }
        }
    }
    Ok(removed)
}
