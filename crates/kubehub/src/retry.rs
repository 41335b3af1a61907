//! Bounded retry with exponential backoff and jitter for transient store errors.
//!
//! Only [`StoreError::Transient`] is retried. Conflicts are handled by the
//! reconciler's own re-diff loop and everything else is final.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tracing::{error, warn};

use crate::StoreError;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self { max_attempts: attempts, ..Default::default() }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self { Self::with_max_attempts(1) }
}

/// Run `operation`, retrying transient failures per `policy`.
pub async fn retry_transient<F, Fut, T>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt >= max_attempts {
                    error!(operation = %operation_name, attempt, error = %e, "giving up after transient errors");
                    counter!("store_retry_exhausted", 1u64);
                    return Err(e);
                }

                // 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(operation = %operation_name, attempt, error = %e, delay_ms = jittered.as_millis() as u64, "transient error, retrying");
                counter!("store_retry", 1u64);
                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64((delay.as_secs_f64() * policy.backoff_multiplier).min(policy.max_delay.as_secs_f64()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let res = retry_transient(&fast(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Transient("timeout".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(res, Ok(7));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let res: Result<(), _> = retry_transient(&fast(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Transient("down".into()))
            }
        })
        .await;
        assert!(res.unwrap_err().is_transient());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let res: Result<(), _> = retry_transient(&fast(5), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Fatal("forbidden".into()))
            }
        })
        .await;
        assert!(res.unwrap_err().is_fatal());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
