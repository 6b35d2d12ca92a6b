//! Reliability patterns for position writes
//!
//! This module provides:
//! - [`RetryPolicy`] - Doubling backoff schedule with [`Jitter`]
//! - [`BackoffExecutor`] - Bounded retry of contended operations

mod backoff;
mod retry;

pub use backoff::{BackoffError, BackoffExecutor, Retryable};
pub use retry::{Jitter, RetryPolicy};
