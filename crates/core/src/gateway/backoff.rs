//! Exponential backoff for remote API calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::GatewayError;
use crate::config::RetryConfig;

/// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let raw = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = raw.min(config.max_delay_ms as f64);
    Duration::from_millis(capped as u64)
}

/// Run `op` until it succeeds, fails permanently, or exhausts
/// `max_attempts`. Exhaustion is reported as [`GatewayError::Unavailable`].
pub async fn with_backoff<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt >= max_attempts {
                    return Err(GatewayError::Unavailable {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                let delay = backoff_delay(config, attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Batch API call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(&config, 5), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&config, 60), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_with_backoff_recovers() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_config(5), "status", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GatewayError::Transport("connection reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_backoff_exhausts_to_unavailable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&fast_config(3), "submit", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Transport("timeout".into())) }
        })
        .await;

        assert!(matches!(
            result,
            Err(GatewayError::Unavailable { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_backoff_does_not_retry_rejections() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&fast_config(5), "submit", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Rejected("invalid machine type".into())) }
        })
        .await;

        assert!(matches!(result, Err(GatewayError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
