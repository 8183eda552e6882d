// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff with bounded jitter.
//!
//! `delay(n) = min(max_delay, base_delay * factor^n) + jitter`, where jitter is
//! drawn uniformly from `[0, jitter_ratio * capped_delay]`. The jitter source
//! is injectable so schedules can be reproduced exactly in tests.
//!
//! # Example
//!
//! ```
//! use offline_sync::resilience::backoff::{BackoffConfig, NoJitter};
//! use std::time::Duration;
//!
//! let config = BackoffConfig::default();
//! assert_eq!(config.delay_for(&NoJitter, 0), Duration::from_secs(1));
//! assert_eq!(config.delay_for(&NoJitter, 3), Duration::from_secs(8));
//! assert_eq!(config.delay_for(&NoJitter, 10), Duration::from_secs(300));
//! ```

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Source of the random jitter added to each backoff delay.
pub trait JitterSource: Send + Sync {
    /// Uniform sample in `[0, max]`.
    fn sample(&self, max: Duration) -> Duration;
}

/// Production jitter from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self, max: Duration) -> Duration {
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Seeded jitter, reproducible across runs.
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl JitterSource for SeededJitter {
    fn sample(&self, max: Duration) -> Duration {
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.lock().gen_range(0..=max_ms))
    }
}

/// No jitter at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn sample(&self, _max: Duration) -> Duration {
        Duration::ZERO
    }
}

/// Backoff schedule for rescheduling failed work.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay", with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Upper bound of the jitter as a fraction of the capped delay
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_base_delay() -> Duration { Duration::from_secs(1) }
fn default_max_delay() -> Duration { Duration::from_secs(300) } // Cap at 5 minutes
fn default_factor() -> f64 { 2.0 }
fn default_jitter_ratio() -> f64 { 0.1 }

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            factor: default_factor(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl BackoffConfig {
    /// Quick schedule for connecting to local storage at startup.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter_ratio: 0.0,
        }
    }

    /// Fast schedule for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter_ratio: 0.0,
        }
    }

    /// Delay before jitter: `min(max_delay, base_delay * factor^attempts)`.
    #[must_use]
    pub fn capped_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(i32::MAX as u32) as i32;
        let raw_ms = self.base_delay.as_millis() as f64 * self.factor.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;
        if !raw_ms.is_finite() || raw_ms >= max_ms {
            self.max_delay
        } else {
            Duration::from_millis(raw_ms as u64)
        }
    }

    /// Full delay including jitter for a task that has already been attempted
    /// `attempts` times.
    #[must_use]
    pub fn delay_for(&self, jitter: &dyn JitterSource, attempts: u32) -> Duration {
        let capped = self.capped_delay(attempts);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        capped + jitter.sample(capped.mul_f64(ratio))
    }
}

/// Retry an operation with backoff until it succeeds or `max_retries` is hit.
///
/// Used for establishing local resources (e.g. the task database) where a
/// transient failure should not abort startup.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &BackoffConfig,
    max_retries: u32,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts: u32 = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                let delay = config.capped_delay(attempts);
                attempts += 1;
                if attempts >= max_retries {
                    return Err(err);
                }

                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, max_retries, err, delay
                );
                sleep(delay).await;
            }
        }
    }
}
