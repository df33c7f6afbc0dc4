//! Retry with exponential backoff and jitter for provider calls.
//!
//! Delay schedule: `min(max_delay, base_delay × exponential_base^(attempt-1))`
//! with optional ±25% jitter. Only errors flagged retryable (connection
//! trouble, timeouts, 5xx-equivalents) are retried; validation and
//! authentication failures surface immediately.

use engram_core::config::RetryConfig;
use engram_core::error::ProviderError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Compute the backoff delay for a 1-based attempt number.
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let raw = config.base_delay_ms as f64 * config.exponential_base.powi(exponent);
    let mut delay_ms = raw.min(config.max_delay_ms as f64);

    if config.jitter {
        let jitter_range = delay_ms * 0.25;
        let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        delay_ms = (delay_ms + offset).max(0.0);
    }

    Duration::from_millis(delay_ms as u64)
}

/// Execute an async operation with retries.
///
/// `op_name` labels log lines. Returns the operation's result, the first
/// non-retryable error, or [`ProviderError::RetryExhausted`] once all
/// attempts fail.
pub async fn with_retry<T, F, Fut>(
    op_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut last_error: Option<ProviderError> = None;

    for attempt in 1..=config.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt < config.max_attempts {
                    let delay = backoff_delay(attempt, config);
                    warn!(
                        operation = op_name,
                        attempt,
                        max_attempts = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    let message = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempts made".into());
    Err(ProviderError::RetryExhausted {
        attempts: config.max_attempts,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            exponential_base: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(backoff_delay(1, &config), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, &config), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, &config), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 500,
            max_delay_ms: 1000,
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(backoff_delay(8, &config), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_quarter_band() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
            jitter: true,
        };
        for _ in 0..50 {
            let delay = backoff_delay(1, &config).as_millis() as i64;
            assert!((750..=1250).contains(&delay), "delay {delay} out of band");
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", &fast_config(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ProviderError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", &fast_config(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::Network("conn refused".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("test", &fast_config(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::AuthenticationFailed("bad key".into())) }
        })
        .await;
        assert!(matches!(
            result.unwrap_err(),
            ProviderError::AuthenticationFailed(_)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let result: Result<(), _> = with_retry("test", &fast_config(2), || async {
            Err(ProviderError::Timeout("deadline".into()))
        })
        .await;
        match result.unwrap_err() {
            ProviderError::RetryExhausted { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("deadline"));
            }
            other => panic!("Expected RetryExhausted, got: {other:?}"),
        }
    }
}
