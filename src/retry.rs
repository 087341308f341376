//! Retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

/// How many times to try and how long to wait between tries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Delay after the `attempt`-th failure (0-based): `initial * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The last error seen, either non-retryable or after the final attempt.
    #[error(transparent)]
    Failed(E),

    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// Collapse into the operation's own error type.
    pub fn into_inner(self, on_cancel: impl FnOnce(u32) -> E) -> E {
        match self {
            Self::Failed(e) => e,
            Self::Cancelled { attempts } => on_cancel(attempts),
        }
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects,
/// or the policy's attempts run out.
///
/// `cancel` is checked while waiting between attempts. An attempt already in
/// flight is never interrupted. Pass `std::future::pending()` to retry without
/// an external cancellation signal.
pub async fn retry_with_backoff<T, E, Op, Fut, C>(
    policy: &RetryPolicy,
    cancel: C,
    should_retry: impl Fn(&E) -> bool,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Future<Output = ()>,
{
    let mut cancel = std::pin::pin!(cancel);
    let mut attempt = 0;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempt += 1;
        if attempt >= policy.max_attempts || !should_retry(&err) {
            return Err(RetryError::Failed(err));
        }

        let delay = policy.delay_for(attempt - 1);
        tracing::debug!(attempt, ?delay, "Retrying after failure");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut cancel => return Err(RetryError::Cancelled { attempts: attempt }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), Duration::from_millis(250))
    }

    #[test]
    fn test_delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(250));
        assert_eq!(p.delay_for(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let result: Result<u32, RetryError<&str>> = retry_with_backoff(
            &policy(),
            std::future::pending::<()>(),
            |_| true,
            |attempt| {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { if attempt < 2 { Err("busy") } else { Ok(attempt) } }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_non_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &policy(),
            std::future::pending::<()>(),
            |e| *e != "forbidden",
            |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err("forbidden") }
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Failed("forbidden"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &policy(),
            std::future::pending::<()>(),
            |_| true,
            |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err("busy") }
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Failed("busy"))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_attempts() {
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &policy(),
            std::future::ready(()),
            |_| true,
            |_| async { Err("busy") },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
    }
}
