use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// `base * 2^retry`, capped, plus jitter in `0..base`.
    Exponential,
}

/// Bounded retry policy injected through the settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    /// One retry after a fixed minute, enough to ride out a platform rate limit.
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay_secs: 60,
            max_delay_secs: 60,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => Duration::from_secs(self.base_delay_secs.min(self.max_delay_secs)),
            Backoff::Exponential => {
                let exp_delay = self
                    .base_delay_secs
                    .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
                let capped = exp_delay.min(self.max_delay_secs);
                let jitter = if self.base_delay_secs > 0 {
                    rand::thread_rng().gen_range(0..self.base_delay_secs)
                } else {
                    0
                };
                Duration::from_secs(capped + jitter)
            }
        }
    }
}

/// Retry an async operation per `config`.
///
/// Returns the first `Ok`, or the last error once retries run out or the
/// classifier returns `Abort`.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                attempt += 1;
                if classifier(&e) == RetryAction::Abort || attempt >= total_attempts {
                    return Err(e);
                }
                let delay = config.delay_for_retry(attempt - 1);
                tracing::warn!(
                    "Retryable error (attempt {}/{}), retrying in {}s: {}",
                    attempt,
                    total_attempts,
                    delay.as_secs(),
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_secs: 0,
            max_delay_secs: 0,
            backoff: Backoff::Fixed,
        }
    }

    #[test]
    fn test_default_is_one_fixed_retry() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.backoff, Backoff::Fixed);
        assert_eq!(config.delay_for_retry(0), Duration::from_secs(60));
        assert_eq!(config.delay_for_retry(3), Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_delay_capped() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay_secs: 5,
            max_delay_secs: 30,
            backoff: Backoff::Exponential,
        };
        let d = config.delay_for_retry(0);
        assert!(d.as_secs() >= 5 && d.as_secs() < 10);
        let d = config.delay_for_retry(10);
        assert!(d.as_secs() >= 30 && d.as_secs() < 35);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_one_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let cc = calls.clone();
        let result: Result<&str, String> = retry_with_backoff(
            &instant(1),
            |_| RetryAction::Retry,
            || {
                let cc = cc.clone();
                async move {
                    if cc.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("503".to_string())
                    } else {
                        Ok("video-id")
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "video-id");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abort_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let cc = calls.clone();
        let result: Result<i32, String> = retry_with_backoff(
            &instant(3),
            |_| RetryAction::Abort,
            || {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err("unauthorized".to_string())
                }
            },
        )
        .await;
        assert_eq!(result.unwrap_err(), "unauthorized");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let cc = calls.clone();
        let result: Result<i32, String> = retry_with_backoff(
            &instant(1),
            |_| RetryAction::Retry,
            || {
                let cc = cc.clone();
                async move {
                    let n = cc.fetch_add(1, Ordering::SeqCst);
                    Err(format!("failure {n}"))
                }
            },
        )
        .await;
        assert_eq!(result.unwrap_err(), "failure 1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
