// SPDX-License-Identifier: MIT
//! Exponential backoff with jitter for the upload pipelines.
//!
//! Provides [`retry_with_backoff`] — a generic async helper that retries a
//! fallible operation with exponentially increasing, jittered delays — and
//! the bare delay computation for callers that manage their own attempt
//! counters (the event uploader). Backoff activity is reported through the
//! caller's [`DebugSink`], so nothing is emitted unless diagnostics are on.

use std::time::Duration;

use rand::Rng;

use crate::diag::DebugSink;

/// Configuration for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on each subsequent failure.
    pub base_delay: Duration,
    /// Upper bound on the computed delay, before jitter.
    pub max_delay: Duration,
    /// Upper bound on the uniform random jitter added to every delay.
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryConfig {
    /// A config suitable for quick unit tests (no real waiting).
    #[cfg(test)]
    pub fn instant() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: Duration::ZERO,
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based):
    /// `min(max_delay, base_delay * 2^(failures-1)) + jitter`.
    pub fn delay_after_failure(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        backoff + random_jitter(self.jitter)
    }
}

fn random_jitter(bound: Duration) -> Duration {
    if bound.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=bound.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Retry an async operation with exponential backoff.
///
/// Calls `f()` until it succeeds or `config.max_attempts` total attempts
/// (counting `prior_attempts` already spent by the caller) are exhausted.
/// Returns `Ok` on the first success, or the last error.
///
/// `prior_attempts` lets a resumed task keep the budget it already burned
/// in a previous life rather than starting fresh.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    diag: DebugSink,
    prior_attempts: u32,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    debug_assert!(config.max_attempts > 0);

    let mut last_err: Option<E> = None;

    for attempt in (prior_attempts + 1)..=config.max_attempts.max(prior_attempts + 1) {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < config.max_attempts {
                    let delay = config.delay_after_failure(attempt);
                    diag.debug(&format!(
                        "attempt {attempt}/{} failed, backing off {}ms: {e:?}",
                        config.max_attempts,
                        delay.as_millis()
                    ));
                    tokio::time::sleep(delay).await;
                } else {
                    last_err = Some(e);
                }
            }
        }
    }

    // The loop always runs at least once and assigns last_err on exhaustion.
    Err(last_err.expect("retry loop ended without an error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn delay_doubles_and_caps() {
        let cfg = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: Duration::ZERO,
        };
        assert_eq!(cfg.delay_after_failure(1), Duration::from_secs(1));
        assert_eq!(cfg.delay_after_failure(2), Duration::from_secs(2));
        assert_eq!(cfg.delay_after_failure(3), Duration::from_secs(4));
        assert_eq!(cfg.delay_after_failure(4), Duration::from_secs(8));
        assert_eq!(cfg.delay_after_failure(5), Duration::from_secs(10));
        assert_eq!(cfg.delay_after_failure(20), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let cfg = RetryConfig {
            jitter: Duration::from_millis(100),
            ..RetryConfig::default()
        };
        for _ in 0..50 {
            let d = cfg.delay_after_failure(1);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_millis(1100));
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, String> = retry_with_backoff(&RetryConfig::instant(), DebugSink::new(false), 0, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, String> = retry_with_backoff(&RetryConfig::instant(), DebugSink::new(false), 0, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::Relaxed) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), String> = retry_with_backoff(&RetryConfig::instant(), DebugSink::new(false), 0, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err("down".to_string())
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), "down");
        assert_eq!(calls.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn prior_attempts_shrink_the_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), String> = retry_with_backoff(&RetryConfig::instant(), DebugSink::new(false), 3, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err("down".to_string())
            }
        })
        .await;
        assert!(result.is_err());
        // 3 of 5 attempts were already spent by a previous life.
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn exhausted_budget_still_attempts_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), String> = retry_with_backoff(&RetryConfig::instant(), DebugSink::new(false), 9, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err("down".to_string())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
