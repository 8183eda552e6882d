//! Resilience: circuit breaking, backoff, and durable queue storage.
//!
//! - [`circuit_breaker`]: guards the sync transport against retry storms
//! - [`backoff`]: exponential backoff with injectable jitter
//! - [`task_store`]: whole-snapshot durability for the sync queue

pub mod backoff;
pub mod circuit_breaker;
pub mod task_store;
