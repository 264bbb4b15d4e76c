//! Retry driver for provider calls.
//!
//! Transient failures (rate limits, timeouts, 5xx, transport errors) are
//! retried with exponential backoff and jitter; permanent failures (auth,
//! bad request) return immediately. Rate-limit `retry-after` hints take
//! precedence over the computed backoff.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use turnloom_core::ProviderError;

/// Backoff and attempt limits for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (1 = no retries).
    pub max_attempts: u32,
    /// Base delay; doubles each retry.
    pub base_backoff: Duration,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &turnloom_config::ProviderConfig) -> Self {
        // Config counts retries after the first attempt.
        Self::new(
            config.max_retries + 1,
            Duration::from_millis(config.base_backoff_ms),
        )
    }

    /// Delay before the given retry (attempt is 0-based: the attempt that
    /// just failed). Exponential, capped, with up to 50% added jitter.
    fn backoff_for(&self, attempt: u32, hint_secs: Option<u64>) -> Duration {
        if let Some(secs) = hint_secs {
            return Duration::from_secs(secs);
        }
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.0..=0.5);
        exp.mul_f64(1.0 + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_millis(500))
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
/// Returns the value together with the number of attempts made.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<(T, u32), ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        match op().await {
            Ok(value) => return Ok((value, attempt + 1)),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let hint = match &e {
                    ProviderError::RateLimited { retry_after_secs } => *retry_after_secs,
                    _ => None,
                };
                let delay = policy.backoff_for(attempt, hint);
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    max = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient provider error"
                );
                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| ProviderError::Unavailable("retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let (value, attempts) = call_with_retry(&fast_policy(3), "test", move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProviderError>(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let (value, attempts) = call_with_retry(&fast_policy(5), "test", move || {
            let c = Arc::clone(&c);
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ProviderError::RateLimited {
                        retry_after_secs: None,
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn permanent_error_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = call_with_retry(&fast_policy(5), "test", move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::Auth("bad key".into()))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ProviderError::Auth(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = call_with_retry(&fast_policy(3), "test", move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::Unavailable("overloaded".into()))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ProviderError::Unavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
        };
        // Jitter adds at most 50%
        let d0 = policy.backoff_for(0, None);
        assert!(d0 >= Duration::from_millis(100) && d0 <= Duration::from_millis(150));
        let d3 = policy.backoff_for(3, None);
        assert!(d3 >= Duration::from_millis(800));
        assert!(d3 <= Duration::from_millis(1200));
    }

    #[test]
    fn rate_limit_hint_overrides_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0, Some(7)), Duration::from_secs(7));
    }

    #[test]
    fn policy_from_config_counts_first_attempt() {
        let config = turnloom_config::ProviderConfig {
            max_retries: 2,
            base_backoff_ms: 250,
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_backoff, Duration::from_millis(250));
    }
}
