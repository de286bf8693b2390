//! Backoff policy and an async retry loop.
//!
//! The queue uses the policy to space out redeliveries of nacked items; the
//! heartbeat loop uses [`retry_async`] to ride out short store outages.

use agentmesh_types::config::QueueConfig;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff: `min_delay * 2^n`, capped at `max_delay`, then
/// stretched by a random factor in `[1, 1 + jitter)` (and capped again).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0.0 disables jitter; values above 1.0 are treated as 1.0.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_queue(&QueueConfig::default())
    }
}

impl RetryConfig {
    /// The `[queue]` retry settings.
    pub fn from_queue(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            min_delay_ms: config.retry_min_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
            jitter: config.retry_jitter,
        }
    }

    /// Retries for one heartbeat. All retries fit in a quarter of the
    /// interval, so a struggling beat finishes before the next tick.
    pub fn heartbeat(interval: Duration) -> Self {
        let budget_ms = u64::try_from(interval.as_millis() / 4)
            .unwrap_or(u64::MAX)
            .max(1);
        Self {
            max_attempts: 3,
            min_delay_ms: (budget_ms / 4).max(1),
            max_delay_ms: budget_ms / 2,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (0 is the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_millis(compute_backoff(self, retry))
    }
}

/// Backoff in milliseconds before retry number `retry`.
pub fn compute_backoff(config: &RetryConfig, retry: u32) -> u64 {
    let factor = 1u64 << retry.min(63);
    let capped = config
        .min_delay_ms
        .saturating_mul(factor)
        .min(config.max_delay_ms);

    let jitter = config.jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || capped == 0 {
        return capped;
    }
    let stretch = 1.0 + rand::thread_rng().gen::<f64>() * jitter;
    ((capped as f64 * stretch) as u64).min(config.max_delay_ms)
}

/// How a retried operation ended.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success { result: T, attempts: u32 },
    /// Out of attempts, or the error was not retryable.
    Exhausted { last_error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    /// Attempts made, including the first.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Success { result, .. } => Ok(result),
            Self::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Run `operation` until it succeeds, returns an error `should_retry`
/// rejects, or `config.max_attempts` is used up, sleeping the backoff
/// between attempts.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        let err = match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(attempts, "Operation recovered after retry");
                }
                return RetryOutcome::Success { result, attempts };
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            debug!(attempts, error = %err, "Error is not retryable");
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts,
            };
        }
        if attempts >= max_attempts {
            warn!(attempts, error = %err, "Retry budget exhausted");
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts,
            };
        }

        let delay = config.delay(attempts - 1);
        debug!(attempts, delay_ms = delay.as_millis() as u64, error = %err, "Retrying");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_types::MeshError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_queue_redelivery_schedule() {
        let config = no_jitter();
        let delays: Vec<u64> = (0..8).map(|n| compute_backoff(&config, n)).collect();
        assert_eq!(
            delays,
            vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
        assert_eq!(compute_backoff(&config, u32::MAX), 30_000);
    }

    #[test]
    fn test_jitter_only_stretches() {
        let config = RetryConfig {
            jitter: 0.5,
            ..RetryConfig::default()
        };
        for _ in 0..200 {
            let delay = compute_backoff(&config, 1);
            assert!((1_000..1_500).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_heartbeat_retries_fit_in_interval() {
        let interval = Duration::from_secs(20);
        let config = RetryConfig::heartbeat(interval);
        let total: Duration = (0..config.max_attempts - 1).map(|n| config.delay(n)).sum();
        assert!(total <= interval / 4, "retries take {total:?}");
        assert!(RetryConfig::heartbeat(Duration::ZERO).min_delay_ms >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_store_outage() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let outcome = retry_async(
            &no_jitter(),
            || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(MeshError::BackendUnavailable("connection refused".into()))
                    } else {
                        Ok(true)
                    }
                }
            },
            MeshError::is_retryable,
        )
        .await;

        assert_eq!(outcome.attempts(), 3);
        assert_eq!(outcome.into_result(), Ok(true));
        // 500ms + 1000ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome: RetryOutcome<(), MeshError> = retry_async(
            &RetryConfig::default(),
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(MeshError::InvalidInput("agent id is empty".into()))
                }
            },
            MeshError::is_retryable,
        )
        .await;

        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_keeps_last_error() {
        let outcome: RetryOutcome<(), MeshError> = retry_async(
            &RetryConfig::default(),
            || async { Err(MeshError::Timeout("ping".into())) },
            MeshError::is_retryable,
        )
        .await;
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(outcome.into_result(), Err(MeshError::Timeout("ping".into())));
    }
}
