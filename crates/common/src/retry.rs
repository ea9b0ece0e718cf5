//! Retry with exponential backoff and full jitter

use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff configuration: initial 1s, cap 5s, 3 retries by default
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Full-jitter delay for the given attempt (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .initial
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max);
        let jitter_millis = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
        Duration::from_millis(jitter_millis)
    }
}

/// Run `operation` until it succeeds, retries are exhausted, or it fails with
/// a non-retriable error. Classification goes through [`Error::is_retryable`];
/// wrap an error in [`Error::NonRetriable`] to short-circuit.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: BackoffPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("{op_name} (after {attempt} retries)"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(2),
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(fast_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Timeout("transient".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retriable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::Auth("bad key".to_string())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err.root(), Error::Auth(_)));
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::RateLimit("429".to_string())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err.root(), Error::RateLimit(_)));
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            max_retries: 10,
        };
        for attempt in 0..12 {
            assert!(policy.delay(attempt) <= Duration::from_secs(5));
        }
    }
}
