//! Versioned cache store.
//!
//! - [`traits`]: the [`CacheStore`](traits::CacheStore) port, entries, namespace handles
//! - [`memory`]: local in-process backend with entry-count ceiling, TTL and quota

pub mod traits;
pub mod memory;
