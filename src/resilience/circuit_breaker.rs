// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding the remote sync endpoint.
//!
//! Protects the remote from retry storms when it is unhealthy. One breaker
//! is shared by every caller of the guarded transport, so it reacts to the
//! aggregate failure rate rather than to a single queue.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Endpoint unhealthy, requests fail fast without being attempted
//! - HalfOpen: Cooldown elapsed, exactly one probe is in flight
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │ cooldown elapsed
//!     │ probe succeeds                 ▼
//!     └─────────────────────────── HalfOpen ──▶ Open (probe fails)
//! ```

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (open, or a probe is already running)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cooldown measured from the last failure before a probe is allowed
    #[serde(default = "default_recovery_timeout", with = "crate::config::duration_ms")]
    pub recovery_timeout: Duration,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_recovery_timeout() -> Duration { Duration::from_secs(60) }

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl CircuitConfig {
    /// Tolerates more failures and probes sooner
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure_at: Option<i64>,
    probe_in_flight: bool,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        let name = name.into();
        crate::metrics::set_circuit_state(&name, CircuitState::Closed as u8);
        Self {
            name,
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure_at: None,
                probe_in_flight: false,
            }),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open circuit whose cooldown has elapsed still reports
    /// `Open` until a call turns it half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures since the last success
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Epoch millis of the most recent failure
    #[must_use]
    pub fn last_failure_at(&self) -> Option<i64> {
        self.inner.lock().last_failure_at
    }

    /// Decide whether a call may proceed. Returns `Some(is_probe)` when admitted.
    fn admit(&self) -> Option<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let now = self.clock.now_millis();
                let cooled = inner.last_failure_at.map_or(true, |at| {
                    now.saturating_sub(at) >= self.config.recovery_timeout.as_millis() as i64
                });
                if cooled && !inner.probe_in_flight {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    self.publish_state(CircuitState::HalfOpen);
                    info!(circuit = %self.name, "Circuit half-open, allowing probe");
                    Some(true)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(true)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.failures = 0;
        inner.state = CircuitState::Closed;
        inner.probe_in_flight = false;
        if previous != CircuitState::Closed {
            self.publish_state(CircuitState::Closed);
            info!(circuit = %self.name, "Circuit closed after successful probe");
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure_at = Some(self.clock.now_millis());
        let was_probe = inner.state == CircuitState::HalfOpen;
        inner.probe_in_flight = false;

        if was_probe || inner.failures >= self.config.failure_threshold {
            if inner.state != CircuitState::Open {
                warn!(
                    circuit = %self.name,
                    failures = inner.failures,
                    cooldown = ?self.config.recovery_timeout,
                    "Circuit opened"
                );
                self.publish_state(CircuitState::Open);
            }
            inner.state = CircuitState::Open;
        }
    }

    /// A probe future was dropped before it resolved: back to open, and the
    /// next caller may probe immediately since the cooldown already elapsed.
    fn on_probe_abandoned(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.probe_in_flight = false;
            self.publish_state(CircuitState::Open);
            debug!(circuit = %self.name, "Probe abandoned, circuit back to open");
        }
    }

    fn publish_state(&self, state: CircuitState) {
        crate::metrics::set_circuit_state(&self.name, state as u8);
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, so a rejected call never
    /// constructs the operation at all.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let Some(is_probe) = self.admit() else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
            crate::metrics::record_circuit_call(&self.name, "rejected");
            return Err(CircuitError::Rejected);
        };

        let mut probe_guard = ProbeGuard {
            breaker: self,
            armed: is_probe,
        };

        let result = f().await;
        probe_guard.armed = false;

        match result {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.on_success();
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Force the breaker back to closed (operator action)
    pub fn reset(&self) {
        self.on_success();
    }

    /// Get total number of calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.on_probe_abandoned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn breaker(threshold: u32, cooldown: Duration) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = CircuitConfig {
            failure_threshold: threshold,
            recovery_timeout: cooldown,
        };
        (CircuitBreaker::with_clock("test", config, clock.clone()), clock)
    }

    async fn fail(cb: &CircuitBreaker) -> Result<i32, CircuitError<&'static str>> {
        cb.call(|| async { Err("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<i32, CircuitError<&'static str>> {
        cb.call(|| async { Ok(42) }).await
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result = succeed(&cb).await;

        assert_eq!(result, Ok(42));
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result = fail(&cb).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
        assert_eq!(cb.consecutive_failures(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold_and_skips_fn() {
        let (cb, _clock) = breaker(5, Duration::from_secs(60));
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result: Result<i32, CircuitError<&str>> = cb
            .call(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;

        assert_eq!(result, Err(CircuitError::Rejected));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.rejections(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let (cb, _clock) = breaker(3, Duration::from_secs(60));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 2);
    }

    #[tokio::test]
    async fn test_rejects_until_cooldown_then_probe_closes() {
        let (cb, clock) = breaker(2, Duration::from_secs(60));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        clock.advance(Duration::from_secs(59));
        assert_eq!(succeed(&cb).await, Err(CircuitError::Rejected));

        clock.advance(Duration::from_secs(1));
        assert_eq!(succeed(&cb).await, Ok(42));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_with_fresh_cooldown() {
        let (cb, clock) = breaker(2, Duration::from_secs(10));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        clock.advance(Duration::from_secs(10));
        assert!(matches!(fail(&cb).await, Err(CircuitError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(5));
        assert_eq!(succeed(&cb).await, Err(CircuitError::Rejected));
    }

    #[tokio::test]
    async fn test_single_probe_at_a_time() {
        let (cb, clock) = breaker(1, Duration::from_secs(1));
        let cb = Arc::new(cb);
        let _ = fail(&cb).await;
        clock.advance(Duration::from_secs(1));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = cb.clone();
        let probe = tokio::spawn(async move {
            probe_cb
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &str>(7)
                })
                .await
        });

        // Let the probe get admitted and park on the channel.
        while cb.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        assert_eq!(succeed(&cb).await, Err(CircuitError::Rejected));

        release_tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap(), Ok(7));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_abandoned_probe_does_not_wedge_breaker() {
        let (cb, clock) = breaker(1, Duration::from_secs(1));
        let _ = fail(&cb).await;
        clock.advance(Duration::from_secs(1));

        {
            let pending = cb.call(|| futures::future::pending::<Result<i32, &str>>());
            let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(succeed(&cb).await, Ok(42));
    }

    #[tokio::test]
    async fn test_counters_split_by_outcome() {
        let (cb, _clock) = breaker(2, Duration::from_secs(60));

        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;

        assert_eq!(cb.calls_total(), 4);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 2);
        assert_eq!(cb.rejections(), 1);
    }

    #[tokio::test]
    async fn test_reset_closes_circuit() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(succeed(&cb).await, Ok(42));
    }

    #[test]
    fn test_circuit_config_presets() {
        let default = CircuitConfig::default();
        let lenient = CircuitConfig::lenient();

        assert_eq!(default.failure_threshold, 5);
        assert_eq!(default.recovery_timeout, Duration::from_secs(60));
        assert!(lenient.failure_threshold > default.failure_threshold);
        assert!(lenient.recovery_timeout < default.recovery_timeout);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(CircuitState::Open.to_string(), "open");
    }
}
