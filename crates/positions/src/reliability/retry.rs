//! Retry schedule for contended store writes
//!
//! Allocations that lose the race for the position counter retry after a
//! doubling delay. Jitter spreads the losers of one race apart so they do not
//! collide again on the next attempt.

use std::time::Duration;

use rand::Rng;

/// How much randomness is applied to each backoff delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Sleep exactly the scheduled delay
    None,

    /// Sleep half the scheduled delay plus a random share of the other half
    ///
    /// Keeps a floor under every retry while still de-synchronizing writers
    /// that aborted on the same commit.
    #[default]
    Equal,
}

/// Backoff schedule used by [`BackoffExecutor`](super::BackoffExecutor)
///
/// # Example
///
/// ```
/// use waitlist_positions::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_millis(20))
///     .with_max_interval(Duration::from_millis(500));
///
/// assert!(policy.backoff(1) <= Duration::from_millis(20));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,

    /// Scheduled delay before the first retry
    pub initial_interval: Duration,

    /// Upper bound on any scheduled delay
    pub max_interval: Duration,

    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Doubling delays tuned for counter contention: 8 attempts, 25ms first
    /// retry, capped at 1s, equal jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 8,
            initial_interval: Duration::from_millis(25),
            max_interval: Duration::from_secs(1),
            jitter: Jitter::Equal,
        }
    }

    /// The same delay before every retry, without jitter
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: interval,
            jitter: Jitter::None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Scheduled delay before retry number `retry` (1 = first retry)
    pub fn scheduled_delay(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(31);
        self.initial_interval
            .saturating_mul(1u32 << doublings)
            .min(self.max_interval)
    }

    /// Delay to sleep before retry number `retry`, with jitter applied
    pub fn backoff(&self, retry: u32) -> Duration {
        let scheduled = self.scheduled_delay(retry);
        match self.jitter {
            Jitter::None => scheduled,
            Jitter::Equal => {
                let half = scheduled / 2;
                half + rand::thread_rng().gen_range(Duration::ZERO..=scheduled - half)
            }
        }
    }

    /// Whether another attempt may follow attempt number `attempt`
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
