use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::traits::{CacheEntry, CacheStore, NamespaceHandle, StorageError};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: CacheEntry,
    /// Write sequence, breaks `stored_at` ties so eviction order is stable
    seq: u64,
}

/// Local key-value cache store.
///
/// Each namespace holds at most `max_entries_per_namespace` entries; once the
/// ceiling is exceeded the entries with the oldest `stored_at` go first.
/// Access recency is not tracked, so this is insertion/update order, not LRU.
pub struct InMemoryCacheStore {
    namespaces: DashMap<String, HashMap<String, StoredEntry>>,
    max_entries_per_namespace: usize,
    max_total_bytes: Option<usize>,
    total_bytes: AtomicUsize,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl InMemoryCacheStore {
    #[must_use]
    pub fn new(max_entries_per_namespace: usize) -> Self {
        Self::with_clock(max_entries_per_namespace, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(max_entries_per_namespace: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            namespaces: DashMap::new(),
            max_entries_per_namespace: max_entries_per_namespace.max(1),
            max_total_bytes: None,
            total_bytes: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            clock,
        }
    }

    /// Enforce a quota on the summed size of all entries.
    #[must_use]
    pub fn with_quota(mut self, max_total_bytes: usize) -> Self {
        self.max_total_bytes = Some(max_total_bytes);
        self
    }

    /// Number of entries in a namespace (expired entries included until swept).
    #[must_use]
    pub fn len(&self, ns: &NamespaceHandle) -> usize {
        self.namespaces.get(ns.name()).map_or(0, |n| n.len())
    }

    #[must_use]
    pub fn is_empty(&self, ns: &NamespaceHandle) -> bool {
        self.len(ns) == 0
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// Eagerly drop expired entries from a namespace.
    pub fn purge_expired(&self, ns: &NamespaceHandle) -> usize {
        let now = self.clock.now_millis();
        let Some(mut entries) = self.namespaces.get_mut(ns.name()) else {
            return 0;
        };

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, stored)| stored.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut freed = 0;
        for key in &expired {
            if let Some(stored) = entries.remove(key) {
                freed += stored.entry.size_bytes();
            }
        }
        self.total_bytes.fetch_sub(freed, Ordering::AcqRel);

        if !expired.is_empty() {
            debug!(namespace = %ns, purged = expired.len(), "Purged expired cache entries");
            crate::metrics::record_cache_eviction(ns.name(), "ttl", expired.len());
        }
        expired.len()
    }

    fn evict_over_ceiling(&self, ns: &str, entries: &mut HashMap<String, StoredEntry>) {
        let overflow = entries.len().saturating_sub(self.max_entries_per_namespace);
        if overflow == 0 {
            return;
        }

        let mut by_age: Vec<(i64, u64, String)> = entries
            .iter()
            .map(|(key, stored)| (stored.entry.stored_at, stored.seq, key.clone()))
            .collect();
        by_age.sort_unstable();

        let mut freed = 0;
        for (_, _, key) in by_age.into_iter().take(overflow) {
            if let Some(stored) = entries.remove(&key) {
                freed += stored.entry.size_bytes();
            }
        }
        self.total_bytes.fetch_sub(freed, Ordering::AcqRel);

        debug!(namespace = %ns, evicted = overflow, "Evicted oldest cache entries over ceiling");
        crate::metrics::record_cache_eviction(ns, "size", overflow);
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new(crate::config::default_cache_max_entries())
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn open(&self, name: &str) -> Result<NamespaceHandle, StorageError> {
        self.namespaces.entry(name.to_string()).or_default();
        Ok(NamespaceHandle::new(name))
    }

    async fn lookup(&self, ns: &NamespaceHandle, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let now = self.clock.now_millis();
        let Some(mut entries) = self.namespaces.get_mut(ns.name()) else {
            return Ok(None);
        };

        match entries.get(key) {
            Some(stored) if stored.entry.is_expired(now) => {
                if let Some(stored) = entries.remove(key) {
                    self.total_bytes.fetch_sub(stored.entry.size_bytes(), Ordering::AcqRel);
                }
                crate::metrics::record_cache_eviction(ns.name(), "ttl", 1);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.entry.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, ns: &NamespaceHandle, key: &str, entry: CacheEntry) -> Result<(), StorageError> {
        let mut entries = self.namespaces.entry(ns.name().to_string()).or_default();

        let new_size = entry.size_bytes();
        let old_size = entries.get(key).map_or(0, |stored| stored.entry.size_bytes());

        if let Some(quota) = self.max_total_bytes {
            let projected = self
                .total_bytes
                .load(Ordering::Acquire)
                .saturating_sub(old_size)
                + new_size;
            if projected > quota {
                return Err(StorageError::QuotaExceeded(format!(
                    "{} bytes would exceed quota of {} bytes",
                    projected, quota
                )));
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        entries.insert(key.to_string(), StoredEntry { entry, seq });
        self.total_bytes.fetch_add(new_size, Ordering::AcqRel);
        self.total_bytes.fetch_sub(old_size, Ordering::AcqRel);

        self.evict_over_ceiling(ns.name(), &mut entries);
        Ok(())
    }

    async fn delete(&self, ns: &NamespaceHandle, key: &str) -> Result<bool, StorageError> {
        let Some(mut entries) = self.namespaces.get_mut(ns.name()) else {
            return Ok(false);
        };
        match entries.remove(key) {
            Some(stored) => {
                self.total_bytes.fetch_sub(stored.entry.size_bytes(), Ordering::AcqRel);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self, ns: &NamespaceHandle) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .namespaces
            .get(ns.name())
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.namespaces.iter().map(|n| n.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool, StorageError> {
        match self.namespaces.remove(name) {
            Some((_, entries)) => {
                let freed: usize = entries.values().map(|s| s.entry.size_bytes()).sum();
                self.total_bytes.fetch_sub(freed, Ordering::AcqRel);
                debug!(namespace = %name, entries = entries.len(), "Deleted cache namespace");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::http::Response;
    use crate::storage::traits::{cleanup_stale_versions, invalidate_resource};
    use std::time::Duration;

    fn entry(key: &str, stored_at: i64) -> CacheEntry {
        CacheEntry::from_response(key, &Response::ok(format!("body of {}", key)), stored_at)
    }

    fn store_with_clock(max_entries: usize) -> (InMemoryCacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        (InMemoryCacheStore::with_clock(max_entries, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_open_creates_namespace() {
        let store = InMemoryCacheStore::new(10);
        let ns = store.open("pages-v1").await.unwrap();
        assert_eq!(ns.name(), "pages-v1");
        assert_eq!(store.namespaces().await.unwrap(), vec!["pages-v1".to_string()]);
        assert!(store.is_empty(&ns));
    }

    #[tokio::test]
    async fn test_put_lookup_overwrite() {
        let store = InMemoryCacheStore::new(10);
        let ns = store.open("api-v1").await.unwrap();

        store.put(&ns, "/a", entry("/a", 1)).await.unwrap();
        let mut replacement = entry("/a", 2);
        replacement.status = 201;
        store.put(&ns, "/a", replacement).await.unwrap();

        let found = store.lookup(&ns, "/a").await.unwrap().unwrap();
        assert_eq!(found.status, 201);
        assert_eq!(store.len(&ns), 1);
        assert!(store.lookup(&ns, "/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = InMemoryCacheStore::new(10);
        let ns = store.open("api-v1").await.unwrap();
        store.put(&ns, "/a", entry("/a", 1)).await.unwrap();

        assert!(store.delete(&ns, "/a").await.unwrap());
        assert!(!store.delete(&ns, "/a").await.unwrap());
        assert_eq!(store.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_eviction_removes_oldest_stored_at() {
        let store = InMemoryCacheStore::new(2);
        let ns = store.open("pages-v1").await.unwrap();

        store.put(&ns, "/new", entry("/new", 300)).await.unwrap();
        store.put(&ns, "/old", entry("/old", 100)).await.unwrap();
        store.put(&ns, "/mid", entry("/mid", 200)).await.unwrap();

        assert_eq!(store.keys(&ns).await.unwrap(), vec!["/mid".to_string(), "/new".to_string()]);
    }

    #[tokio::test]
    async fn test_eviction_ties_break_by_write_order() {
        let store = InMemoryCacheStore::new(1);
        let ns = store.open("pages-v1").await.unwrap();

        store.put(&ns, "/first", entry("/first", 5)).await.unwrap();
        store.put(&ns, "/second", entry("/second", 5)).await.unwrap();

        assert_eq!(store.keys(&ns).await.unwrap(), vec!["/second".to_string()]);
    }

    #[tokio::test]
    async fn test_ttl_expiry_on_lookup() {
        let (store, clock) = store_with_clock(10);
        let ns = store.open("api-v1").await.unwrap();
        let e = entry("/a", clock.now_millis()).with_ttl(Some(Duration::from_secs(5)));
        store.put(&ns, "/a", e).await.unwrap();

        assert!(store.lookup(&ns, "/a").await.unwrap().is_some());
        clock.advance(Duration::from_secs(5));
        assert!(store.lookup(&ns, "/a").await.unwrap().is_none());
        assert_eq!(store.len(&ns), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock(10);
        let ns = store.open("api-v1").await.unwrap();
        let now = clock.now_millis();
        store.put(&ns, "/short", entry("/short", now).with_ttl(Some(Duration::from_secs(1)))).await.unwrap();
        store.put(&ns, "/long", entry("/long", now).with_ttl(Some(Duration::from_secs(60)))).await.unwrap();
        store.put(&ns, "/forever", entry("/forever", now)).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(&ns), 1);
        assert_eq!(store.len(&ns), 2);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let store = InMemoryCacheStore::new(10).with_quota(40);
        let ns = store.open("api-v1").await.unwrap();

        store.put(&ns, "/a", entry("/a", 1)).await.unwrap();
        let big = CacheEntry::from_response("/b", &Response::ok(vec![0u8; 64]), 2);
        let err = store.put(&ns, "/b", big).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded(_)));
        assert!(store.lookup(&ns, "/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_namespaces_matching() {
        let store = InMemoryCacheStore::new(10);
        store.open("pages-v1").await.unwrap();
        store.open("pages-v2").await.unwrap();
        store.open("api-v1").await.unwrap();

        let removed = store
            .delete_namespaces_matching(&|name: &str| name.starts_with("pages"))
            .await
            .unwrap();
        assert_eq!(removed, vec!["pages-v1".to_string(), "pages-v2".to_string()]);
        assert_eq!(store.namespaces().await.unwrap(), vec!["api-v1".to_string()]);
    }

    #[tokio::test]
    async fn test_cleanup_stale_versions_keeps_active_and_unrelated() {
        let store = InMemoryCacheStore::new(10);
        for name in ["pages-v1", "pages-v2", "pages-v3", "api-v1", "images"] {
            store.open(name).await.unwrap();
        }

        let removed = cleanup_stale_versions(&store, &["pages-v3".to_string(), "api-v1".to_string()])
            .await
            .unwrap();

        assert_eq!(removed, vec!["pages-v1".to_string(), "pages-v2".to_string()]);
        assert_eq!(
            store.namespaces().await.unwrap(),
            vec!["api-v1".to_string(), "images".to_string(), "pages-v3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_invalidate_resource_across_namespaces() {
        let store = InMemoryCacheStore::new(10);
        let api = store.open("api-v1").await.unwrap();
        let pages = store.open("pages-v1").await.unwrap();
        let full = "https://app.example.com/api/notes/7?fields=all";
        store.put(&api, full, entry(full, 1)).await.unwrap();
        store.put(&api, "/api/notes/8", entry("/api/notes/8", 1)).await.unwrap();
        store.put(&pages, "/api/notes/7", entry("/api/notes/7", 1)).await.unwrap();

        let removed = invalidate_resource(&store, "/api/notes/7").await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.keys(&api).await.unwrap(), vec!["/api/notes/8".to_string()]);
        assert!(store.is_empty(&pages));
    }

    #[tokio::test]
    async fn test_concurrent_puts_across_namespaces() {
        let store = Arc::new(InMemoryCacheStore::new(1_000));
        let mut handles = vec![];

        for batch in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let ns = store.open(&format!("ns{}-v1", batch % 2)).await.unwrap();
                for i in 0..10 {
                    let key = format!("/{}/{}", batch, i);
                    store.put(&ns, &key, entry(&key, i)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let total: usize = ["ns0-v1", "ns1-v1"]
            .iter()
            .map(|n| store.len(&NamespaceHandle::new(*n)))
            .sum();
        assert_eq!(total, 100);
    }
}
