//! # exchange::retry
//!
//! Retry/backoff as a value. Adapters hold one policy for reads and one for
//! submissions and run every venue call through [`RetryPolicy::run`].

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::{env_u32, env_u64};
use crate::exchange::ExchangeError;

/// Which errors a policy is allowed to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryable {
    /// Any transient transport error or rate limit. Idempotent reads only.
    Transient,
    /// Only errors proven to have never reached the venue.
    NotSent,
}

impl Retryable {
    pub fn matches(self, err: &ExchangeError) -> bool {
        match self {
            Retryable::Transient => err.is_transient(),
            Retryable::NotSent   => err.is_not_sent(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub retryable: Retryable,
}

impl RetryPolicy {
    /// Balance / position queries: 2 retries, 500ms doubling.
    pub fn reads() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2,
            retryable: Retryable::Transient,
        }
    }

    pub fn reads_from_env() -> Self {
        Self {
            max_retries: env_u32("EXCHANGE_READ_RETRIES", 2),
            initial_backoff: Duration::from_millis(env_u64("EXCHANGE_BACKOFF_MS", 500)),
            ..Self::reads()
        }
    }

    /// Order submission: one retry, and only if the first attempt never left.
    pub fn submissions() -> Self {
        Self {
            max_retries: 1,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2,
            retryable: Retryable::NotSent,
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            multiplier: 1,
            retryable: Retryable::NotSent,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }

    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if retry < self.max_retries && self.retryable.matches(&err) => {
                    retry += 1;
                    let delay = self.backoff_for(retry);
                    warn!(op, retry, ?delay, error = %err, "🔁 venue call failed — retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(mut policy: RetryPolicy) -> RetryPolicy {
        policy.initial_backoff = Duration::from_millis(1);
        policy
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy::reads();
        assert_eq!(p.backoff_for(1), Duration::from_millis(500));
        assert_eq!(p.backoff_for(2), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn reads_retry_transient_errors_up_to_limit() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast(RetryPolicy::reads())
            .run("balance", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Ambiguous("reset".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn submissions_never_retry_ambiguous_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast(RetryPolicy::submissions())
            .run("order", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Ambiguous("timeout".into()))
            })
            .await;
        assert!(matches!(result, Err(ExchangeError::Ambiguous(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submissions_retry_once_when_not_sent() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast(RetryPolicy::submissions())
            .run("order", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(ExchangeError::NotSent("refused".into()))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let _: Result<(), _> = fast(RetryPolicy::reads())
            .run("position", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Rejected { code: "1".into(), message: "bad".into() })
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
