//! Bounded retry with exponential back-off and jitter.
//!
//! Each attempt reports a [`StageOutcome`] instead of raising, and
//! [`run_with_retry`] decides whether to sleep and go again. Delay before the
//! retry that follows attempt `a` is `base_delay * 2^(a-1) + jitter`, with
//! jitter drawn uniformly from `[0, 200ms)`.
//!
//! Both the attempt and the back-off sleep race the cancellation token, so a
//! cancelled worker never starts another attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Exclusive upper bound for the random jitter added to every back-off.
pub const JITTER_CEILING: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Deterministic part of the delay that follows a failed `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Back-off for `attempt` plus an explicit jitter, clamped below [`JITTER_CEILING`].
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let jitter = jitter.min(JITTER_CEILING.saturating_sub(Duration::from_millis(1)));
        self.backoff(attempt).saturating_add(jitter)
    }

    /// Back-off for `attempt` with fresh random jitter.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_possible_truncation)]
        let ceiling_ms = JITTER_CEILING.as_millis() as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..ceiling_ms));
        self.delay_with_jitter(attempt, jitter)
    }
}

/// Result of one attempt at a retryable stage.
#[derive(Debug)]
pub enum StageOutcome<T, E> {
    Success(T),
    /// Worth another attempt if the policy allows one.
    Retryable(E),
    /// Retrying won't help; stop immediately.
    Terminal(E),
}

/// Attempts, retries and errors observed by one [`run_with_retry`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryTally {
    pub attempts: u32,
    pub retries: u32,
    pub errors: u32,
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("non-retriable failure: {0}")]
    Terminal(E),
    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying stage error, if the loop stopped because of one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } | Self::Terminal(last) => Some(last),
            Self::Cancelled => None,
        }
    }
}

/// Runs `operation` until it succeeds, reports a terminal failure, the policy
/// is exhausted, or `cancel` fires.
///
/// `operation` receives the 1-based attempt number. Every failed attempt bumps
/// `tally.errors`; every back-off that is actually scheduled bumps
/// `tally.retries`. The last permitted attempt is never followed by a sleep.
///
/// # Errors
///
/// - [`RetryError::Exhausted`] after `max_attempts` retryable failures.
/// - [`RetryError::Terminal`] on the first terminal failure.
/// - [`RetryError::Cancelled`] if `cancel` fires before or between attempts.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    tally: &mut RetryTally,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = StageOutcome<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1u32;
    loop {
        tally.attempts = attempt;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = operation(attempt) => outcome,
        };

        let err = match outcome {
            StageOutcome::Success(value) => return Ok(value),
            StageOutcome::Terminal(err) => {
                tally.errors += 1;
                tracing::error!(attempt, error = %err, "non-retriable failure");
                return Err(RetryError::Terminal(err));
            }
            StageOutcome::Retryable(err) => err,
        };

        tally.errors += 1;
        if attempt >= policy.max_attempts {
            tracing::error!(
                attempt,
                max_attempts = policy.max_attempts,
                error = %err,
                "retry budget exhausted"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.next_delay(attempt);
        tally.retries += 1;
        tracing::warn!(
            attempt,
            max_attempts = policy.max_attempts,
            backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "retry scheduled"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
