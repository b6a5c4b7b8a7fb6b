//! Exponential backoff with jitter for coordinator requests

use std::future::Future;
use std::time::Duration;

use rand::{thread_rng, Rng};
use rulefed_core::{Error, Result, RetryConfig};
use tracing::debug;

/// Delay before retry number `attempt`, jittered by up to a quarter either way
pub fn backoff_delay(retry: &RetryConfig, attempt: u32, error: &Error) -> Duration {
    let mut delay = retry.delay_for(attempt);
    if let Some(hint_ms) = error.retry_delay_hint_ms() {
        delay = delay.max(Duration::from_millis(hint_ms));
    }

    if !retry.jitter {
        return delay;
    }
    let jitter_ms = (delay.as_millis() / 4) as i64;
    if jitter_ms == 0 {
        return delay;
    }
    let offset = thread_rng().gen_range(-jitter_ms..=jitter_ms);
    Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
}

/// Run `op` until it succeeds, fails with an error that is not
/// [`Error::is_retryable`], or the retry budget is spent
pub async fn with_backoff<F, Fut, T>(retry: &RetryConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= retry.max_retries => return Err(e),
            Err(e) => {
                let delay = backoff_delay(retry, attempt, &e);
                debug!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    fn transport() -> Error {
        Error::TransportFailure {
            endpoint: "http://coordinator".to_string(),
            message: "connection refused".to_string(),
        }
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let retry = RetryConfig {
            initial_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(10),
            ..RetryConfig::default()
        };
        for _ in 0..100 {
            let delay = backoff_delay(&retry, 0, &transport());
            assert!(delay >= Duration::from_millis(300));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_rate_limit_hint_raises_delay() {
        let retry = RetryConfig {
            jitter: false,
            ..fast_retry(3)
        };
        let delay = backoff_delay(&retry, 0, &Error::RateLimited { retry_after_ms: 250 });
        assert_eq!(delay, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_retry(3), "pull", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(transport())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_respected() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast_retry(2), "pull", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transport()) }
        })
        .await;

        assert!(matches!(result, Err(Error::TransportFailure { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_outcome_is_not_repeated() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast_retry(5), "submit", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::DeliveryUnknown {
                    endpoint: "http://coordinator/api/submissions".to_string(),
                    message: "connection reset".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(Error::DeliveryUnknown { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast_retry(5), "submit", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::DuplicateSubmission {
                    client_id: "a".to_string(),
                    round_number: 1,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(Error::DuplicateSubmission { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
