//! Sequential position allocation
//!
//! Each attempt is one store transaction: read the counter, take
//! `last_position + 1`, write it to both the counter and the signup, commit.
//! Contention aborts are retried from a fresh read by the [`BackoffExecutor`];
//! a failed attempt never advances the counter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{
    PositionAssignment, PositionCounter, SignupRecord, SignupStore, StoreError,
    TransactionRejection,
};
use crate::reliability::{BackoffError, BackoffExecutor};
use crate::tier::FreeTierPolicy;

/// Errors from [`PositionAllocator::allocate`]
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// Signup does not exist
    #[error("signup not found: {0}")]
    NotFound(Uuid),

    /// Signup already holds a position; it is never reallocated
    #[error("signup {signup_id} already holds position {position}")]
    AlreadyAllocated { signup_id: Uuid, position: i64 },

    /// Signup is not a member and takes no position
    #[error("signup {0} is not a member")]
    NotMember(Uuid),

    /// Every attempt lost the race for the counter
    #[error("allocation for signup {signup_id} gave up after {attempts} attempts")]
    RetriesExhausted { signup_id: Uuid, attempts: u32 },

    /// The caller's deadline expired first
    #[error("allocation for signup {signup_id} exceeded deadline of {deadline:?}")]
    DeadlineExceeded { signup_id: Uuid, deadline: Duration },

    /// Non-contention storage failure
    #[error("store error: {0}")]
    Store(StoreError),
}

impl AllocationError {
    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::AlreadyAllocated { .. } => "AlreadyAllocated",
            Self::NotMember(_) => "NotMember",
            // Both mean "try again"
            Self::RetriesExhausted { .. } | Self::DeadlineExceeded { .. } => "RetriesExhausted",
            Self::Store(_) => "StoreError",
        }
    }

    /// The caller may resubmit; no position was consumed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RetriesExhausted { .. } | Self::DeadlineExceeded { .. }
        )
    }

    fn from_backoff(signup_id: Uuid, err: BackoffError<StoreError>) -> Self {
        match err {
            BackoffError::Fatal(StoreError::SignupNotFound(id)) => Self::NotFound(id),
            BackoffError::Fatal(StoreError::Rejected(TransactionRejection::AlreadyAllocated {
                position,
            })) => Self::AlreadyAllocated {
                signup_id,
                position,
            },
            BackoffError::Fatal(StoreError::Rejected(TransactionRejection::NotMember)) => {
                Self::NotMember(signup_id)
            }
            BackoffError::Fatal(other) => Self::Store(other),
            BackoffError::RetriesExhausted { attempts, .. } => Self::RetriesExhausted {
                signup_id,
                attempts,
            },
            BackoffError::DeadlineExceeded { deadline, .. } => Self::DeadlineExceeded {
                signup_id,
                deadline,
            },
        }
    }
}

/// Assigns the next sequential position to new signups
///
/// # Example
///
/// ```ignore
/// let allocator = PositionAllocator::new(store, BackoffExecutor::default(), FreeTierPolicy::default());
/// let position = allocator.allocate(signup.id).await?;
/// ```
#[derive(Clone)]
pub struct PositionAllocator {
    store: Arc<dyn SignupStore>,
    executor: BackoffExecutor,
    tiers: FreeTierPolicy,
}

impl PositionAllocator {
    pub fn new(store: Arc<dyn SignupStore>, executor: BackoffExecutor, tiers: FreeTierPolicy) -> Self {
        Self {
            store,
            executor,
            tiers,
        }
    }

    pub fn executor(&self) -> &BackoffExecutor {
        &self.executor
    }

    /// Allocate a position for `signup_id`
    ///
    /// On success the returned value equals the counter's value before the
    /// committing attempt plus one.
    #[instrument(skip(self))]
    pub async fn allocate(&self, signup_id: Uuid) -> Result<i64, AllocationError> {
        let tiers = self.tiers;
        let decide = move |signup: &SignupRecord,
                           counter: &PositionCounter|
              -> Result<PositionAssignment, TransactionRejection> {
            decide_next_position(signup, counter, tiers)
        };

        let store = &self.store;
        let decide = &decide;
        let result = self
            .executor
            .run(move |attempt| {
                debug!(attempt, "allocation attempt");
                store.allocate_in_transaction(signup_id, decide)
            })
            .await;

        match result {
            Ok(assignment) => {
                info!(position = assignment.position, "allocated position");
                Ok(assignment.position)
            }
            Err(err) => {
                let err = AllocationError::from_backoff(signup_id, err);
                if err.is_transient() {
                    warn!(error = %err, "allocation did not complete, caller may resubmit");
                } else {
                    debug!(error = %err, "allocation rejected");
                }
                Err(err)
            }
        }
    }
}

/// Transaction body: enforce preconditions and take the next position
fn decide_next_position(
    signup: &SignupRecord,
    counter: &PositionCounter,
    tiers: FreeTierPolicy,
) -> Result<PositionAssignment, TransactionRejection> {
    if !signup.role.is_member() {
        return Err(TransactionRejection::NotMember);
    }
    if let Some(position) = signup.position {
        return Err(TransactionRejection::AlreadyAllocated { position });
    }

    let candidate = counter.last_position + 1;
    Ok(PositionAssignment {
        position: candidate,
        last_position: candidate,
        cached_is_free: tiers.is_free(Some(candidate)),
    })
}
