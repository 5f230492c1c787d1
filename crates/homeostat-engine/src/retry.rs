//! Bounded retry with exponential backoff

use homeostat_core::{RetryConfig, Retryable};
use std::fmt::Display;
use std::future::Future;

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` attempts have been made.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryConfig, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    what,
                    attempt,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "retrying after transient failure"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HomeostatError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_backoff_ms: 10,
            max_backoff_ms: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, HomeostatError> = with_retry(&policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(HomeostatError::TransientInfra("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), HomeostatError> = with_retry(&policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(HomeostatError::TransientInfra("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn domain_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), HomeostatError> = with_retry(&policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(HomeostatError::InvalidAnomaly("empty service".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
