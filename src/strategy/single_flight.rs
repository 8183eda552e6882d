//! In-flight request deduplication.
//!
//! Concurrent callers asking for the same key share one fetch. The first
//! caller (the leader) installs a [`Shared`] future; later callers clone and
//! await it. The entry is removed once the leader finishes or is dropped, so
//! the next request after completion starts a fresh fetch.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::http::Response;
use crate::transport::TransportError;

type SharedFetch = Shared<BoxFuture<'static, Result<Response, TransportError>>>;

#[derive(Default)]
pub struct InflightRequests {
    calls: DashMap<String, (u64, SharedFetch)>,
    generation: AtomicU64,
}

impl InflightRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a fetch currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Run `make()` for `key` unless a fetch for `key` is already running, in
    /// which case wait for that one instead.
    pub async fn run<F>(&self, key: &str, make: F) -> Result<Response, TransportError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<Response, TransportError>>,
    {
        let (fetch, leader_generation) = match self.calls.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                trace!(key, "Joining in-flight fetch");
                crate::metrics::record_single_flight_join();
                (existing.get().1.clone(), None)
            }
            Entry::Vacant(slot) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let shared = make().shared();
                slot.insert((generation, shared.clone()));
                (shared, Some(generation))
            }
        };

        match leader_generation {
            Some(generation) => {
                let _cleanup = RemoveOnDrop {
                    calls: &self.calls,
                    key,
                    generation,
                };
                fetch.await
            }
            None => fetch.await,
        }
    }
}

struct RemoveOnDrop<'a> {
    calls: &'a DashMap<String, (u64, SharedFetch)>,
    key: &'a str,
    generation: u64,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.calls.remove_if(self.key, |_, (current, _)| *current == generation);
    }
}
