//! Bounded retry executor
//!
//! Wraps an operation that can fail with a retryable error (write contention,
//! transaction abort) or a fatal one. Only retryable failures are absorbed;
//! everything else is handed back on the first occurrence.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::RetryPolicy;

/// Classification used by [`BackoffExecutor::run`]
pub trait Retryable {
    /// `true` when the failure is transient and the whole operation may be
    /// attempted again from scratch.
    fn is_retryable(&self) -> bool;
}

/// Outcome of an operation the executor gave up on
#[derive(Debug, Error)]
pub enum BackoffError<E> {
    /// Non-retryable failure, returned as produced by the operation
    #[error("{0}")]
    Fatal(E),

    /// Every attempt failed with a retryable error
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: E },

    /// The overall deadline expired before an attempt succeeded
    #[error("deadline of {deadline:?} exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: u32, deadline: Duration },
}

impl<E> BackoffError<E> {
    /// Whether the caller may resubmit the operation later
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    /// Number of attempts made, when known
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Fatal(_) => None,
            Self::RetriesExhausted { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => {
                Some(*attempts)
            }
        }
    }
}

/// Runs operations under a [`RetryPolicy`] with an optional overall deadline
///
/// The executor knows nothing about what it retries. Each attempt receives its
/// 1-based attempt number and must start from a fresh read; no state is
/// carried between attempts.
///
/// # Example
///
/// ```ignore
/// let executor = BackoffExecutor::new(RetryPolicy::exponential())
///     .with_deadline(Duration::from_secs(5));
///
/// let position = executor
///     .run(|_attempt| async { store.allocate_in_transaction(id, &decide).await })
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct BackoffExecutor {
    policy: RetryPolicy,
    deadline: Option<Duration>,
}

impl BackoffExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            deadline: None,
        }
    }

    /// Stop retrying once this much time has passed since the first attempt
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Run `operation`, retrying failures whose [`Retryable`] impl says so
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<T, BackoffError<E>>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(operation, |e: &E| e.is_retryable()).await
    }

    /// Run `operation` with an explicit retryable/fatal classifier
    ///
    /// The deadline is checked between attempts and bounds every backoff
    /// sleep. An attempt that has started is never cancelled, so an
    /// operation that commits is reported as committed even when it finishes
    /// past the deadline.
    pub async fn run_with<T, E, F, Fut, C>(
        &self,
        mut operation: F,
        is_retryable: C,
    ) -> Result<T, BackoffError<E>>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if !is_retryable(&error) => {
                    debug!(attempt, %error, "fatal error, not retrying");
                    return Err(BackoffError::Fatal(error));
                }
                Err(error) => {
                    if !self.policy.allows_retry_after(attempt) {
                        warn!(attempts = attempt, %error, "retries exhausted");
                        return Err(BackoffError::RetriesExhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    let mut delay = self.policy.backoff(attempt);
                    if let Some(deadline) = self.deadline {
                        let remaining = deadline.saturating_sub(started.elapsed());
                        if remaining.is_zero() {
                            return Err(self.deadline_exceeded(attempt, deadline, started));
                        }
                        delay = delay.min(remaining);
                    }

                    debug!(attempt, ?delay, %error, "retryable failure, backing off");
                    tokio::time::sleep(delay).await;

                    if let Some(deadline) = self.deadline {
                        if started.elapsed() >= deadline {
                            return Err(self.deadline_exceeded(attempt, deadline, started));
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn deadline_exceeded<E>(
        &self,
        attempts: u32,
        deadline: Duration,
        started: Instant,
    ) -> BackoffError<E> {
        warn!(
            attempts,
            elapsed = ?started.elapsed(),
            "deadline exceeded before operation succeeded"
        );
        BackoffError::DeadlineExceeded { attempts, deadline }
    }
}
