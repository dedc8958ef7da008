//! Bounded retry with a fixed delay
//!
//! Used for transient infrastructure errors: registry hiccups, optimistic
//! concurrency conflicts on the order annotation. Every loop has an upper
//! bound, and running out of attempts is reported as its own error kind so
//! callers can tell "still transient" apart from a hard failure.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Outcome of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The operation finished
    Done(T),
    /// The operation hit a transient condition and should run again
    Retry,
}

/// Retry bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Errors returned by [`retry`]
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt asked to be retried
    #[error("still failing after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// An attempt failed with a non-transient error
    #[error(transparent)]
    Failed(E),

    #[error("max_attempts must be greater than 0")]
    InvalidPolicy,
}

impl<E> RetryError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Runs `op` until it returns `Attempt::Done`, an error, or the policy runs out
///
/// The delay is only slept between attempts, never after the last one.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    if policy.max_attempts == 0 {
        return Err(RetryError::InvalidPolicy);
    }

    for attempt in 1..=policy.max_attempts {
        match op(attempt).await.map_err(RetryError::Failed)? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Retry => {
                debug!(
                    "Attempt {}/{} asked for retry",
                    attempt, policy.max_attempts
                );
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    Err(RetryError::Exhausted {
        attempts: policy.max_attempts,
    })
}
