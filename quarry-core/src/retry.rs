//! Backoff schedules for transient-failure retries and long-running polls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{PollingConfig, RetryConfig};
use crate::error::{ResearchError, Result};

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// `attempt_fn` receives the zero-based attempt number. Only errors for which
/// [`ResearchError::is_retryable`] holds are retried; everything else returns
/// immediately. Cancellation is observed while waiting between attempts.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_retryable() || attempt + 1 >= max_attempts {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(config, attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max = max_attempts,
                    backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                sleep_or_cancel(Duration::from_millis(backoff_ms), cancel, operation).await?;
                attempt += 1;
            }
        }
    }
}

/// Sleep for `delay`, returning early with [`ResearchError::Cancelled`] if the
/// token fires first.
pub async fn sleep_or_cancel(
    delay: Duration,
    cancel: &CancellationToken,
    operation: &str,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ResearchError::Cancelled {
            operation: operation.to_string(),
        }),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Exponential backoff delay for the given zero-based attempt, with optional jitter.
fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter && capped > 0 {
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        capped + jitter
    } else {
        capped
    }
}

/// Growing interval between status polls of a background operation.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    next_ms: f64,
    max_ms: f64,
    multiplier: f64,
}

impl PollSchedule {
    pub fn new(config: &PollingConfig) -> Self {
        Self {
            next_ms: config.initial_interval_ms as f64,
            max_ms: config.max_interval_ms as f64,
            multiplier: config.multiplier,
        }
    }

    /// The delay before the next poll.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next_ms.min(self.max_ms);
        self.next_ms = (current * self.multiplier).min(self.max_ms);
        Duration::from_millis(current as u64)
    }
}

impl Iterator for PollSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_compute_backoff_exponential() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(compute_backoff(&config, 0), 1000);
        assert_eq!(compute_backoff(&config, 1), 2000);
        assert_eq!(compute_backoff(&config, 2), 4000);
    }

    #[test]
    fn test_compute_backoff_respects_cap() {
        let config = RetryConfig {
            max_backoff_ms: 3000,
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(compute_backoff(&config, 2), 3000);
        assert_eq!(compute_backoff(&config, 10), 3000);
    }

    #[test]
    fn test_compute_backoff_jitter_bounded() {
        let config = RetryConfig::default();
        for _ in 0..50 {
            let delay = compute_backoff(&config, 1);
            assert!((2000..=2500).contains(&delay));
        }
    }

    #[test]
    fn test_poll_schedule_grows_to_cap() {
        let schedule = PollSchedule::new(&PollingConfig::default());
        let delays: Vec<u64> = schedule.take(7).map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![2000, 3000, 4500, 6750, 10125, 15000, 15000]);
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_first_try() {
        let cancel = CancellationToken::new();
        let result = with_retry(&fast_retry(3), &cancel, "test", |_| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let result = with_retry(&fast_retry(3), &cancel, "test", move |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(ResearchError::transport("connection reset"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let result: Result<()> = with_retry(&fast_retry(2), &cancel, "test", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ResearchError::transport("down")) }
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let result: Result<()> = with_retry(&fast_retry(5), &cancel, "test", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ResearchError::protocol("bad json")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_observes_cancellation() {
        let config = RetryConfig {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            jitter: false,
            ..RetryConfig::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = with_retry(&config, &cancel, "ask", |_| async {
            Err(ResearchError::transport("down"))
        })
        .await;
        assert!(matches!(result, Err(ResearchError::Cancelled { .. })));
    }
}
