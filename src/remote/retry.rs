//! Bounded exponential backoff.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Attempt and backoff bounds for a retried operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Pause after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for any single pause.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Pause after failed attempt number `attempt` (1-based): the base delay
    /// doubled per previous failure, capped at [`Self::max_delay`].
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Outcome classification of a failed attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attempt<E> {
    /// The operation may succeed if tried again.
    Retryable(E),
    /// Trying again cannot help.
    Fatal(E),
}

/// Terminal failure of [`retry_with_backoff`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
    /// An attempt failed with a non-retryable error.
    #[error("{0}")]
    Fatal(E),
    /// The cancellation token fired.
    #[error("cancelled")]
    Cancelled,
}

/// Runs `operation` until it succeeds, fails fatally, exhausts
/// `policy.max_attempts` or `cancel` fires.
///
/// `operation` receives the 1-based attempt number. `on_retry` is invoked
/// before each pause with the upcoming attempt number, the pause and the
/// error that caused it.
///
/// # Errors
///
/// Returns [`RetryError`] describing why no attempt succeeded.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
    R: FnMut(u32, Duration, &E),
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt = attempt.saturating_add(1);

        let result = tokio::select! {
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = operation(attempt) => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(err)) => return Err(RetryError::Fatal(err)),
            Err(Attempt::Retryable(err)) => err,
        };

        if attempt >= policy.max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.backoff(attempt);
        on_retry(attempt.saturating_add(1), delay, &err);

        tokio::select! {
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            () = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(200),
            Duration::from_secs(2),
        )
    }

    #[rstest]
    #[case(1, Duration::from_millis(200))]
    #[case(2, Duration::from_millis(400))]
    #[case(3, Duration::from_millis(800))]
    #[case(4, Duration::from_millis(1600))]
    #[case(5, Duration::from_secs(2))]
    #[case(64, Duration::from_secs(2))]
    fn backoff_doubles_up_to_ceiling(#[case] attempt: u32, #[case] expected: Duration) {
        assert_eq!(policy(100).backoff(attempt), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_retryable_failures() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let result: Result<u32, RetryError<&str>> = retry_with_backoff(
            &policy(5),
            &CancellationToken::new(),
            |attempt, delay, _: &&str| retries.push((attempt, delay)),
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(Attempt::Retryable("refused"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            retries,
            vec![
                (2, Duration::from_millis(200)),
                (3, Duration::from_millis(400))
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &policy(4),
            &CancellationToken::new(),
            |_, _, _| {},
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Attempt::Retryable("refused")) }
            },
        )
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 4,
                last: "refused"
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &policy(100),
            &CancellationToken::new(),
            |_, _, _| {},
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Attempt::Fatal("no ssh binary")) }
            },
        )
        .await;

        assert_eq!(result, Err(RetryError::Fatal("no ssh binary")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &policy(100),
            &cancel,
            move |_, _, _| trigger.cancel(),
            |_| async { Err(Attempt::Retryable("refused")) },
        )
        .await;

        assert_eq!(result, Err(RetryError::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_token_skips_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &policy(3),
            &cancel,
            |_, _, _| {},
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await;

        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
