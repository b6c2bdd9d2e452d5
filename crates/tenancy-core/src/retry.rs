//! Bounded retry with exponential backoff for retryable store errors

use crate::error::{TenancyError, TenancyResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    /// Extra attempts after the first one
    pub retries: u32,
    pub base_delay_ms: u64,
}

impl Backoff {
    pub fn new(retries: u32, base_delay_ms: u64) -> Self {
        Self { retries, base_delay_ms }
    }

    /// Delay before retry `attempt` (0-based), doubling up to 32x
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1 << attempt.min(5)))
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out
///
/// Only errors accepted by `retryable` are retried.
pub(crate) async fn with_backoff<T, F, Fut>(
    what: &str,
    policy: Backoff,
    retryable: impl Fn(&TenancyError) -> bool,
    mut op: F,
) -> TenancyResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TenancyResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if attempt < policy.retries && retryable(&err) => {
                let delay = policy.delay(attempt);
                warn!(op = what, attempt = attempt + 1, ?delay, error = %err, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = Backoff::new(10, 10);
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(40));
        assert_eq!(policy.delay(9), Duration::from_millis(320));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test", Backoff::new(3, 1), TenancyError::is_retryable, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TenancyError::ConcurrencyConflict("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: TenancyResult<()> =
            with_backoff("test", Backoff::new(3, 1), TenancyError::is_retryable, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TenancyError::Validation("bad".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: TenancyResult<()> =
            with_backoff("test", Backoff::new(2, 1), TenancyError::is_retryable, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TenancyError::ConcurrencyConflict("busy".into()))
            })
            .await;

        assert!(matches!(result, Err(TenancyError::ConcurrencyConflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
