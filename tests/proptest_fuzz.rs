//! Property-based tests (fuzzing) for the offline engine.
//!
//! Uses proptest to generate random/malformed inputs and verify scheduling
//! invariants hold and decoders never panic, only return clean errors.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;

use offline_sync::sync_task::{decode_snapshot, encode_snapshot};
use offline_sync::{
    BackoffConfig, CacheRouter, CacheStrategy, ConflictResolver, InMemoryCacheStore, ManualClock, Method, RemoteSnapshot,
    Request, Resolution, RouteMatch, RouteRule, SeededJitter, SyncTask, TaskPriority, TieBreak,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn priority_strategy() -> impl Strategy<Value = TaskPriority> {
    prop_oneof![
        Just(TaskPriority::Low),
        Just(TaskPriority::Normal),
        Just(TaskPriority::High),
    ]
}

/// Tasks with random priorities and enqueue times, seq assigned in order
fn task_list_strategy() -> impl Strategy<Value = Vec<SyncTask>> {
    prop::collection::vec((priority_strategy(), 0i64..1_000), 0..40).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(seq, (priority, created_at))| {
                let mut task = SyncTask::new(format!("/api/items/{}", seq), "{}", priority, created_at);
                task.seq = seq as u64;
                task
            })
            .collect()
    })
}

/// Distinct tags, as a client would keep them
fn tag_list_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-e]", 0..5).prop_map(|tags| tags.into_iter().collect())
}

// =============================================================================
// Backoff bounds
// =============================================================================

proptest! {
    /// Every delay lies in [capped, capped * (1 + jitter_ratio)] and never
    /// exceeds max_delay plus its jitter
    #[test]
    fn prop_backoff_within_bounds(
        base_ms in 1u64..5_000,
        max_ms in 1u64..600_000,
        factor in 1.0f64..4.0,
        jitter_ratio in 0.0f64..0.5,
        attempts in 0u32..64,
        seed in any::<u64>(),
    ) {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            factor,
            jitter_ratio,
        };
        let capped = config.capped_delay(attempts);
        let delay = config.delay_for(&SeededJitter::new(seed), attempts);

        prop_assert!(capped <= config.max_delay);
        prop_assert!(delay >= capped);
        prop_assert!(delay <= capped + capped.mul_f64(jitter_ratio) + Duration::from_millis(1));
    }

    /// The capped schedule never shrinks as attempts grow
    #[test]
    fn prop_backoff_monotonic(
        base_ms in 1u64..5_000,
        factor in 1.0f64..4.0,
        attempts in 0u32..40,
    ) {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(base_ms),
            factor,
            ..BackoffConfig::default()
        };
        prop_assert!(config.capped_delay(attempts) <= config.capped_delay(attempts + 1));
    }

    /// Same seed, same schedule
    #[test]
    fn prop_backoff_seeded_is_reproducible(seed in any::<u64>(), attempts in 0u32..20) {
        let config = BackoffConfig::default();
        let a = SeededJitter::new(seed);
        let b = SeededJitter::new(seed);
        prop_assert_eq!(config.delay_for(&a, attempts), config.delay_for(&b, attempts));
    }
}

// =============================================================================
// Drain ordering
// =============================================================================

proptest! {
    /// Sorted tasks are grouped by priority (high first) and FIFO within a group
    #[test]
    fn prop_drain_order_priority_then_fifo(mut tasks in task_list_strategy()) {
        tasks.sort_by(SyncTask::drain_order);

        for pair in tasks.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(a.priority >= b.priority);
            if a.priority == b.priority {
                prop_assert!((a.created_at, a.seq) <= (b.created_at, b.seq));
            }
        }
    }

    /// Ordering survives a persist/restore cycle
    #[test]
    fn prop_snapshot_preserves_order(tasks in task_list_strategy()) {
        let restored = decode_snapshot(&encode_snapshot(&tasks).unwrap()).unwrap();

        let mut expected = tasks.clone();
        expected.sort_by(SyncTask::drain_order);
        let mut actual = restored;
        actual.sort_by(SyncTask::drain_order);
        prop_assert_eq!(
            expected.iter().map(|t| &t.id).collect::<Vec<_>>(),
            actual.iter().map(|t| &t.id).collect::<Vec<_>>()
        );
    }
}

// =============================================================================
// Deserialization Fuzz Tests
// =============================================================================

proptest! {
    /// Snapshot decoding should never panic on arbitrary bytes
    #[test]
    fn fuzz_snapshot_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..4096)) {
        let _ = decode_snapshot(&bytes);
    }

    /// A corrupted snapshot either decodes or fails cleanly
    #[test]
    fn fuzz_corrupted_snapshot(
        tasks in task_list_strategy(),
        corruption in prop::collection::vec(any::<u8>(), 1..32),
        position in 0usize..10_000,
    ) {
        let mut corrupted = encode_snapshot(&tasks).unwrap();
        let pos = position % corrupted.len();
        for (i, b) in corruption.iter().enumerate() {
            let idx = (pos + i) % corrupted.len();
            corrupted[idx] ^= b;
        }
        let _ = decode_snapshot(&corrupted);
    }

    /// Remote conflict bodies of any shape never panic the parser
    #[test]
    fn fuzz_remote_snapshot(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = serde_json::from_slice::<RemoteSnapshot>(&bytes);
    }
}

// =============================================================================
// Conflict resolution
// =============================================================================

proptest! {
    /// The later timestamp wins unless a merge applies; ties follow the tie-break
    #[test]
    fn prop_lww_winner(local_ts in 0i64..1_000, remote_ts in 0i64..1_000, local_tie in any::<bool>()) {
        let tie_break = if local_tie { TieBreak::LocalWins } else { TieBreak::RemoteWins };
        let resolver = ConflictResolver::new(Vec::<String>::new(), tie_break);
        let local = SyncTask::new("/api/x", r#"{"v":1}"#, TaskPriority::Normal, local_ts);
        let remote = RemoteSnapshot { last_modified: remote_ts, data: json!({"v": 2}) };

        let record = resolver.resolve(&local, &remote);
        let expected = if local_ts > remote_ts || (local_ts == remote_ts && local_tie) {
            Resolution::LocalWins
        } else {
            Resolution::RemoteWins
        };
        prop_assert_eq!(record.resolution, expected);
        prop_assert!(record.merged.is_none());
    }

    /// Merged arrays are the duplicate-free union with the winner's items first
    #[test]
    fn prop_merge_is_union(
        local_tags in tag_list_strategy(),
        remote_tags in tag_list_strategy(),
        local_ts in 0i64..1_000,
        remote_ts in 0i64..1_000,
    ) {
        let resolver = ConflictResolver::new(["tags"], TieBreak::RemoteWins);
        let payload = serde_json::to_vec(&json!({"tags": local_tags})).unwrap();
        let local = SyncTask::new("/api/x", payload, TaskPriority::Normal, local_ts);
        let remote = RemoteSnapshot { last_modified: remote_ts, data: json!({"tags": remote_tags}) };

        let record = resolver.resolve(&local, &remote);
        if let Some(merged) = record.merged {
            prop_assert_eq!(record.resolution, Resolution::Merged);
            let tags: Vec<String> = match &merged["tags"] {
                Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
                other => return Err(TestCaseError::fail(format!("tags not an array: {}", other))),
            };
            for tag in local_tags.iter().chain(remote_tags.iter()) {
                prop_assert!(tags.contains(tag));
            }
            let mut deduped = tags.clone();
            deduped.sort();
            deduped.dedup();
            let mut sorted = tags.clone();
            sorted.sort();
            prop_assert_eq!(deduped, sorted);
        } else {
            prop_assert_ne!(record.resolution, Resolution::Merged);
        }
    }
}

// =============================================================================
// Routing
// =============================================================================

fn method_strategy() -> impl Strategy<Value = Method> {
    prop_oneof![
        Just(Method::Get),
        Just(Method::Post),
        Just(Method::Put),
        Just(Method::Patch),
        Just(Method::Delete),
    ]
}

proptest! {
    /// Only GET is ever routed to a caching strategy
    #[test]
    fn prop_only_get_is_cached(method in method_strategy(), path in "/[a-z]{1,8}(/[a-z]{1,8}){0,3}") {
        let clock = std::sync::Arc::new(ManualClock::new(0));
        let router = CacheRouter::new(
            std::sync::Arc::new(InMemoryCacheStore::new(10)),
            std::sync::Arc::new(NeverTransport),
            clock,
        )
        .with_routes(vec![RouteRule::new(RouteMatch::Prefix("/".into()), CacheStrategy::CacheFirst, "all-v1")])
        .with_default(CacheStrategy::StaleWhileRevalidate, "runtime-v1");

        let plan = router.route(&Request::new(method, path));
        if method == Method::Get {
            prop_assert_eq!(plan.strategy, CacheStrategy::CacheFirst);
        } else {
            prop_assert_eq!(plan.strategy, CacheStrategy::NetworkOnly);
        }
    }
}

/// Transport that is never called by routing alone.
struct NeverTransport;

#[async_trait::async_trait]
impl offline_sync::Transport for NeverTransport {
    async fn send(
        &self,
        _request: Request,
        _options: &offline_sync::SendOptions,
    ) -> Result<offline_sync::Response, offline_sync::TransportError> {
        Err(offline_sync::TransportError::Aborted)
    }
}
