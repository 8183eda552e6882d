// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync queue manager.
//!
//! Local mutations are queued as [`SyncTask`]s, persisted as a whole-queue
//! snapshot after every change, and replayed through the circuit breaker
//! when connectivity allows.
//!
//! # Drain cycle
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ claim ≤ max_concurrent eligible tasks (priority, FIFO)   │◀─┐
//! └──────────────────────────────────────────────────────────┘  │
//!          │ send concurrently through the breaker              │
//!          ▼                                                    │
//!   success ──▶ remove + invalidate cache                       │
//!   failure ──▶ attempts++, next_retry_at = now + backoff       │
//!               attempts ≥ max_retries ──▶ dead-letter          │
//!   invalid ──▶ dead-letter                                     │
//!   conflict ─▶ resolver: remote-wins drop / local-wins resend  │
//!               / merged replaces task                          │
//!   circuit open / cancelled ──▶ revert, stop cycle             │
//!          │                                                    │
//!          └──── persist snapshot, repeat while eligible ───────┘
//! ```
//!
//! Ordering is per cycle: a task enqueued mid-cycle competes from the next
//! batch on and never preempts an attempt already in flight.

pub(crate) mod request;
pub mod types;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::conflict::{ConflictResolver, RemoteSnapshot, Resolution};
use crate::error::SyncError;
use crate::network::{NetworkEvent, NetworkMonitor};
use crate::resilience::backoff::{BackoffConfig, JitterSource, RandomJitter};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::resilience::task_store::TaskStore;
use crate::storage::traits::{invalidate_resource, CacheStore, StorageError};
use crate::sync_task::{SyncTask, TaskPriority, TaskState};
use crate::transport::{send_with_timeout, SendOptions, Transport};

use request::{build_request, classify, Answer};
pub use types::{DrainReport, SyncEvent};
use types::{AttemptOutcome, Attempted};

/// Tuning for the queue.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub backoff: BackoffConfig,
    pub max_retries: u32,
    pub max_concurrent: usize,
    pub dead_letter_capacity: usize,
    /// Prefix for sync requests
    pub base_url: String,
    pub request_timeout: Duration,
}

impl QueueSettings {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            backoff: config.backoff.clone(),
            max_retries: config.max_retries.max(1),
            max_concurrent: config.max_concurrent_sync.max(1),
            dead_letter_capacity: config.dead_letter_capacity,
            base_url: config.sync_base_url.clone(),
            request_timeout: config.sync_timeout(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Default)]
struct QueueState {
    /// Everything not dead, in no particular order
    tasks: Vec<SyncTask>,
    /// Oldest first
    dead: VecDeque<SyncTask>,
    next_seq: u64,
}

impl QueueState {
    fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    fn snapshot(&self) -> Vec<SyncTask> {
        self.tasks.iter().chain(self.dead.iter()).cloned().collect()
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn publish_counts(&self) {
        crate::metrics::set_pending_tasks(self.tasks.len());
        crate::metrics::set_dead_letters(self.dead.len());
    }
}

pub struct SyncQueue {
    state: Mutex<QueueState>,
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn Transport>,
    breaker: Arc<CircuitBreaker>,
    resolver: ConflictResolver,
    cache: Option<Arc<dyn CacheStore>>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn JitterSource>,
    settings: QueueSettings,
    events: broadcast::Sender<SyncEvent>,
    drain_requested: Notify,
    /// One drain cycle at a time
    drain_lock: tokio::sync::Mutex<()>,
    /// Snapshots reach the store in the order they were taken
    persist_lock: tokio::sync::Mutex<()>,
}

impl SyncQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        transport: Arc<dyn Transport>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(QueueState::default()),
            store,
            transport,
            breaker,
            resolver: ConflictResolver::default(),
            cache: None,
            clock,
            jitter: Arc::new(RandomJitter),
            settings: QueueSettings::default(),
            events,
            drain_requested: Notify::new(),
            drain_lock: tokio::sync::Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Cache to invalidate when a task's resource changes remotely.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════════════

    /// Replace in-memory state with the persisted snapshot.
    ///
    /// An unreadable or incompatible snapshot is discarded and the queue
    /// starts empty. Tasks persisted mid-flight come back as retryable.
    /// Returns the number of live (non-dead) tasks.
    pub async fn load(&self) -> Result<usize, SyncError> {
        let loaded = match self.store.load().await {
            Ok(tasks) => tasks,
            Err(StorageError::Corruption { namespace, detail }) => {
                error!(source = %namespace, detail = %detail, "Discarding unreadable sync queue snapshot");
                crate::metrics::record_corruption(&namespace);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let live = {
            let mut state = self.state.lock();
            *state = QueueState::default();
            for mut task in loaded {
                state.next_seq = state.next_seq.max(task.seq + 1);
                match task.state {
                    TaskState::Dead => state.dead.push_back(task),
                    TaskState::InFlight => {
                        task.state = if task.attempts > 0 { TaskState::Failed } else { TaskState::Pending };
                        state.tasks.push(task);
                    }
                    TaskState::Pending | TaskState::Failed => state.tasks.push(task),
                }
            }
            let overflow = state.dead.len().saturating_sub(self.settings.dead_letter_capacity);
            state.dead.drain(..overflow);
            state.publish_counts();
            state.tasks.len()
        };

        // Overwrite a discarded snapshot so it is not re-read next start.
        self.persist().await?;
        info!(pending = live, dead = self.dead_letter_count(), "Sync queue loaded");
        Ok(live)
    }

    /// Save the current snapshot.
    pub async fn persist(&self) -> Result<(), SyncError> {
        let _ordered = self.persist_lock.lock().await;
        let snapshot = self.state.lock().snapshot();
        match self.store.save(&snapshot).await {
            Ok(()) => {
                crate::metrics::record_queue_persist(true);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, tasks = snapshot.len(), "Failed to persist sync queue");
                crate::metrics::record_queue_persist(false);
                Err(e.into())
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Registration and inspection
    // ═══════════════════════════════════════════════════════════════════════════

    /// Queue a mutation and persist it. Returns the task id, which is also
    /// the idempotency key sent with every attempt.
    ///
    /// If the snapshot cannot be saved the task is not queued.
    pub async fn enqueue(
        &self,
        tag: impl Into<String>,
        payload: impl Into<bytes::Bytes>,
        priority: TaskPriority,
    ) -> Result<String, SyncError> {
        let tag = tag.into();
        if tag.trim().is_empty() {
            return Err(SyncError::Validation("sync task tag must not be empty".into()));
        }

        let mut task = SyncTask::new(tag, payload, priority, self.clock.now_millis());
        let id = task.id.clone();
        {
            let mut state = self.state.lock();
            task.seq = state.take_seq();
            state.tasks.push(task);
            state.publish_counts();
        }

        if let Err(e) = self.persist().await {
            let mut state = self.state.lock();
            state.tasks.retain(|t| t.id != id);
            state.publish_counts();
            return Err(e);
        }

        debug!(task_id = %id, priority = %priority, "Mutation queued");
        self.drain_requested.notify_one();
        Ok(id)
    }

    /// Every task that is not dead, in drain order.
    #[must_use]
    pub fn get_pending(&self) -> Vec<SyncTask> {
        let mut tasks = self.state.lock().tasks.clone();
        tasks.sort_by(SyncTask::drain_order);
        tasks
    }

    /// Dead-lettered tasks, oldest first.
    #[must_use]
    pub fn get_dead_letters(&self) -> Vec<SyncTask> {
        self.state.lock().dead.iter().cloned().collect()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    #[must_use]
    pub fn dead_letter_count(&self) -> usize {
        self.state.lock().dead.len()
    }

    /// Move a dead-lettered task back into the queue with a fresh retry budget.
    pub async fn retry_dead_letter(&self, id: &str) -> Result<bool, SyncError> {
        let revived = {
            let mut state = self.state.lock();
            let position = state.dead.iter().position(|t| t.id == id);
            match position {
                Some(idx) => {
                    let seq = state.take_seq();
                    if let Some(mut task) = state.dead.remove(idx) {
                        task.state = TaskState::Pending;
                        task.attempts = 0;
                        task.next_retry_at = None;
                        task.last_error = None;
                        task.seq = seq;
                        state.tasks.push(task);
                    }
                    state.publish_counts();
                    true
                }
                None => false,
            }
        };

        if revived {
            info!(task_id = %id, "Dead-lettered task re-queued");
            self.persist().await?;
            self.drain_requested.notify_one();
        }
        Ok(revived)
    }

    /// Drop every dead-lettered task. Returns how many were removed.
    pub async fn clear_dead_letters(&self) -> Result<usize, SyncError> {
        let cleared = {
            let mut state = self.state.lock();
            let n = state.dead.len();
            state.dead.clear();
            state.publish_counts();
            n
        };
        if cleared > 0 {
            self.persist().await?;
        }
        Ok(cleared)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Events
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Invoke `callback` after every drain cycle until `cancel` fires.
    pub fn on_drain_complete<F>(&self, cancel: CancellationToken, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(DrainReport) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(SyncEvent::DrainComplete(report)) => callback(report),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Drain listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Ask a running auto-drain loop to drain soon.
    pub fn request_drain(&self) {
        self.drain_requested.notify_one();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Drain
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run one drain cycle: attempt eligible tasks in batches until none are
    /// eligible, the circuit opens, or `cancel` fires.
    ///
    /// Never fails; every outcome is folded into the report.
    #[tracing::instrument(skip(self, cancel), fields(synced, failed))]
    pub async fn drain(&self, cancel: &CancellationToken) -> DrainReport {
        let _exclusive = self.drain_lock.lock().await;
        let started = Instant::now();
        let mut report = DrainReport::default();

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let batch = self.claim_batch();
            if batch.is_empty() {
                break;
            }
            report.attempted += batch.len();
            let _claim = ClaimGuard {
                queue: self,
                ids: batch.iter().map(|task| task.id.clone()).collect(),
            };

            let attempts = batch.into_iter().map(|task| async move {
                let outcome = self.attempt(&task, cancel).await;
                (task, outcome)
            });
            let results: Vec<Attempted> = futures::future::join_all(attempts).await;

            for (task, outcome) in results {
                crate::metrics::record_sync_attempt(outcome.label());
                self.apply(task, outcome, &mut report).await;
            }

            if let Err(e) = self.persist().await {
                warn!(error = %e, "Drain progress not persisted, will retry next change");
            }

            if report.circuit_open || report.cancelled {
                break;
            }
        }

        report.remaining = self.pending_count();
        report.duration = started.elapsed();
        tracing::Span::current().record("synced", report.synced);
        tracing::Span::current().record("failed", report.failed);
        crate::metrics::record_drain(report.duration, report.attempted);

        if !report.is_noop() {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                dead = report.dead_lettered,
                conflicts = report.conflicts,
                remaining = report.remaining,
                circuit_open = report.circuit_open,
                "Drain cycle complete"
            );
        }
        self.emit(SyncEvent::DrainComplete(report.clone()));
        report
    }

    /// Mark up to `max_concurrent` eligible tasks in-flight, highest priority first.
    fn claim_batch(&self) -> Vec<SyncTask> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let mut eligible: Vec<usize> = (0..state.tasks.len())
            .filter(|&i| state.tasks[i].is_eligible(now))
            .collect();
        eligible.sort_by(|&a, &b| SyncTask::drain_order(&state.tasks[a], &state.tasks[b]));
        eligible.truncate(self.settings.max_concurrent);

        eligible
            .into_iter()
            .map(|i| {
                let task = &mut state.tasks[i];
                task.state = TaskState::InFlight;
                task.last_attempt_at = Some(now);
                task.clone()
            })
            .collect()
    }

    async fn attempt(&self, task: &SyncTask, cancel: &CancellationToken) -> AttemptOutcome {
        let request = build_request(&self.settings.base_url, task);
        let options = SendOptions::new(self.settings.request_timeout);
        let transport = self.transport.as_ref();

        let call = self.breaker.call(|| async move {
            match send_with_timeout(transport, request, &options).await {
                Ok(response) => classify(&response),
                Err(e) => Err(SyncError::from(e)),
            }
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => AttemptOutcome::Cancelled,
            result = call => match result {
                Ok(Answer::Applied) => AttemptOutcome::Synced,
                Ok(Answer::Conflict(snapshot)) => AttemptOutcome::Conflict(snapshot),
                Ok(Answer::Rejected(reason)) => AttemptOutcome::Invalid(reason),
                Err(CircuitError::Rejected) => AttemptOutcome::CircuitOpen,
                Err(CircuitError::Inner(e)) => AttemptOutcome::Failed(e.to_string()),
            }
        }
    }

    async fn apply(&self, task: SyncTask, outcome: AttemptOutcome, report: &mut DrainReport) {
        match outcome {
            AttemptOutcome::Synced => {
                self.remove(&task.id);
                report.synced += 1;
                debug!(task_id = %task.id, tag = %task.tag, "Task synced");
                self.invalidate_cached(&task.tag).await;
            }
            AttemptOutcome::Failed(reason) => {
                if self.reschedule(&task.id, reason) {
                    report.dead_lettered += 1;
                } else {
                    report.failed += 1;
                }
            }
            AttemptOutcome::Invalid(reason) => {
                self.dead_letter(&task.id, reason);
                report.dead_lettered += 1;
            }
            AttemptOutcome::Conflict(remote) => {
                report.conflicts += 1;
                if self.reconcile(&task, remote).await {
                    report.dead_lettered += 1;
                }
            }
            AttemptOutcome::CircuitOpen => {
                self.release(&task.id);
                report.deferred += 1;
                report.circuit_open = true;
            }
            AttemptOutcome::Cancelled => {
                self.release(&task.id);
                report.deferred += 1;
                report.cancelled = true;
            }
        }
    }

    /// Put an in-flight task back without spending an attempt.
    fn release(&self, id: &str) {
        let mut state = self.state.lock();
        if let Some(idx) = state.position(id) {
            let task = &mut state.tasks[idx];
            task.state = if task.attempts > 0 { TaskState::Failed } else { TaskState::Pending };
        }
    }

    /// Revert claimed tasks still marked in flight. Runs when a drain future
    /// is dropped between claiming a batch and settling it.
    fn release_stranded(&self, ids: &[String]) {
        let mut state = self.state.lock();
        for id in ids {
            let Some(idx) = state.position(id) else {
                continue;
            };
            let task = &mut state.tasks[idx];
            if task.state == TaskState::InFlight {
                task.state = if task.attempts > 0 { TaskState::Failed } else { TaskState::Pending };
                debug!(task_id = %task.id, "Drain dropped mid-attempt, task released");
            }
        }
    }

    fn remove(&self, id: &str) -> Option<SyncTask> {
        let mut state = self.state.lock();
        let idx = state.position(id)?;
        let task = state.tasks.remove(idx);
        state.publish_counts();
        Some(task)
    }

    /// Spend an attempt and schedule the next one. Returns true when the
    /// task ran out of attempts and was dead-lettered.
    fn reschedule(&self, id: &str, reason: String) -> bool {
        let now = self.clock.now_millis();
        let exhausted = {
            let mut state = self.state.lock();
            let Some(idx) = state.position(id) else {
                return false;
            };
            let task = &mut state.tasks[idx];
            let delay = self.settings.backoff.delay_for(self.jitter.as_ref(), task.attempts);
            task.attempts += 1;
            task.last_error = Some(reason.clone());

            if task.attempts >= self.settings.max_retries {
                true
            } else {
                task.state = TaskState::Failed;
                task.next_retry_at = Some(now.saturating_add(delay.as_millis() as i64));
                crate::metrics::record_backoff_delay(delay);
                debug!(
                    task_id = %task.id,
                    attempts = task.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Sync attempt failed, backing off"
                );
                false
            }
        };

        if exhausted {
            self.dead_letter(id, format!("retries exhausted: {}", reason));
        }
        exhausted
    }

    fn dead_letter(&self, id: &str, reason: String) {
        let task = {
            let mut state = self.state.lock();
            let Some(idx) = state.position(id) else {
                return;
            };
            let mut task = state.tasks.remove(idx);
            task.state = TaskState::Dead;
            task.next_retry_at = None;
            task.last_error = Some(reason.clone());
            state.dead.push_back(task.clone());
            while state.dead.len() > self.settings.dead_letter_capacity {
                if let Some(dropped) = state.dead.pop_front() {
                    warn!(task_id = %dropped.id, "Dead-letter log full, dropping oldest entry");
                }
            }
            state.publish_counts();
            task
        };

        warn!(task_id = %task.id, tag = %task.tag, attempts = task.attempts, reason = %reason, "Task dead-lettered");
        self.emit(SyncEvent::DeadLettered {
            task_id: task.id,
            tag: task.tag,
            reason,
        });
    }

    /// Settle a version conflict. Returns true if the task was dead-lettered.
    async fn reconcile(&self, task: &SyncTask, remote: RemoteSnapshot) -> bool {
        let record = self.resolver.resolve(task, &remote);
        info!(
            task_id = %task.id,
            tag = %task.tag,
            local_ts = task.created_at,
            remote_ts = remote.last_modified,
            resolution = %record.resolution,
            "Conflict resolved"
        );
        crate::metrics::record_conflict(&record.resolution.to_string());
        self.emit(SyncEvent::Conflict {
            task_id: task.id.clone(),
            tag: task.tag.clone(),
            resolution: record.resolution,
        });

        match record.resolution {
            Resolution::RemoteWins => {
                self.remove(&task.id);
                self.invalidate_cached(&task.tag).await;
                false
            }
            Resolution::LocalWins => {
                let exhausted = {
                    let mut state = self.state.lock();
                    let Some(idx) = state.position(&task.id) else {
                        return false;
                    };
                    let queued = &mut state.tasks[idx];
                    queued.attempts += 1;
                    queued.base_version = Some(remote.last_modified);
                    queued.next_retry_at = None;
                    queued.state = TaskState::Pending;
                    queued.attempts >= self.settings.max_retries
                };
                if exhausted {
                    self.dead_letter(&task.id, "conflict persisted after local-wins resubmits".into());
                }
                exhausted
            }
            Resolution::Merged => {
                let payload = match record.merged.as_ref().map(serde_json::to_vec) {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        self.dead_letter(&task.id, format!("merged payload not serializable: {}", e));
                        return true;
                    }
                    None => {
                        self.dead_letter(&task.id, "merge produced no payload".into());
                        return true;
                    }
                };

                // The replacement inherits the spent attempts so a remote that
                // keeps diverging still runs out of budget.
                let mut merged = SyncTask::new(task.tag.clone(), payload, task.priority, self.clock.now_millis());
                merged.base_version = Some(remote.last_modified);
                merged.attempts = task.attempts + 1;
                let merged_id = merged.id.clone();
                let exhausted = merged.attempts >= self.settings.max_retries;
                {
                    let mut state = self.state.lock();
                    merged.seq = state.take_seq();
                    if let Some(idx) = state.position(&task.id) {
                        state.tasks.remove(idx);
                    }
                    debug!(replaced = %task.id, task_id = %merged.id, attempts = merged.attempts, "Merged payload queued");
                    state.tasks.push(merged);
                    state.publish_counts();
                }
                if exhausted {
                    self.dead_letter(&merged_id, "conflict persisted after merged resubmits".into());
                }
                exhausted
            }
        }
    }

    async fn invalidate_cached(&self, tag: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        match invalidate_resource(cache.as_ref(), tag).await {
            Ok(0) => {}
            Ok(removed) => debug!(tag, removed, "Invalidated cached copies of synced resource"),
            Err(e) => warn!(tag, error = %e, "Failed to invalidate cached resource"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Auto-drain
    // ═══════════════════════════════════════════════════════════════════════════

    /// Drain once per committed online transition, on every tick of
    /// `interval` while online, and when new work is queued while online.
    pub fn spawn_auto_drain(
        self: &Arc<Self>,
        monitor: &NetworkMonitor,
        interval: Option<Duration>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut transitions = monitor.subscribe();
        let online = monitor.watch_online();

        tokio::spawn(async move {
            let mut ticker = interval.map(|period| {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            loop {
                let trigger = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = transitions.recv() => match event {
                        Ok(NetworkEvent::Online) => "online",
                        Ok(NetworkEvent::Offline) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            if *online.borrow() { "online" } else { continue }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = next_tick(&mut ticker) => {
                        if !*online.borrow() {
                            continue;
                        }
                        "interval"
                    }
                    _ = queue.drain_requested.notified() => {
                        if !*online.borrow() {
                            continue;
                        }
                        "enqueue"
                    }
                };

                debug!(trigger, "Auto-drain triggered");
                queue.drain(&cancel).await;
            }
            debug!("Auto-drain loop stopped");
        })
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Claimed batch of one drain iteration.
struct ClaimGuard<'a> {
    queue: &'a SyncQueue,
    ids: Vec<String>,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.queue.release_stranded(&self.ids);
    }
}
