//! # Waitlist Positions
//!
//! Sequential position allocation for beta signups, backed by PostgreSQL or an
//! in-memory store.
//!
//! ## Features
//!
//! - **Atomic allocation**: each signup takes `last_position + 1` in the same
//!   transaction that advances the counter, so positions are unique and gap-free
//! - **Bounded retries**: contention aborts are retried with jittered exponential
//!   backoff and an optional deadline
//! - **Live free-tier classification**: the first N positions ride free, computed
//!   from the current position on every read
//! - **Reconciliation**: re-derives the canonical `1..=n` sequence after deletions
//!   or drift, in bounded batches, without any global lock
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │  PositionAllocator   │      │  PositionReconciler  │
//! │  (one tx per signup) │      │  (walk, batch, fix)  │
//! └──────────────────────┘      └──────────────────────┘
//!            │    BackoffExecutor (retry contention)   │
//!            ▼                                         ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SignupStore                            │
//! │  (PostgreSQL: signups, position_counter / in-memory)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use waitlist_positions::prelude::*;
//!
//! let store: Arc<dyn SignupStore> = Arc::new(InMemorySignupStore::new());
//! let tiers = FreeTierPolicy::new(20);
//! let allocator = PositionAllocator::new(store.clone(), BackoffExecutor::default(), tiers);
//!
//! let signup = store.create_signup(NewSignup::member("ada@example.com")).await?;
//! let position = allocator.allocate(signup.id).await?;
//! assert!(tiers.is_free(Some(position)));
//! ```

pub mod allocation;
pub mod persistence;
pub mod reconcile;
pub mod reliability;
pub mod tier;

/// Prelude for common imports
pub mod prelude {
    pub use crate::allocation::{AllocationError, PositionAllocator};
    pub use crate::persistence::{
        InMemorySignupStore, NewSignup, Page, PositionCounter, PostgresSignupStore,
        SignupFilter, SignupRecord, SignupRole, SignupStore, StoreError,
    };
    pub use crate::reconcile::{
        PositionReconciler, ReconcileError, ReconcilePlan, ReconcileReport, ReconcilerConfig,
    };
    pub use crate::reliability::{BackoffError, BackoffExecutor, Jitter, RetryPolicy, Retryable};
    pub use crate::tier::{is_free, FreeTierPolicy, MembershipTier};
}

// Re-export key types at crate root
pub use allocation::{AllocationError, PositionAllocator};
pub use persistence::{
    InMemorySignupStore, NewSignup, Page, PositionCounter, PostgresSignupStore, SignupCursor,
    SignupFilter, SignupRecord, SignupRole, SignupStore, StoreError, MAX_BATCH_WRITES,
};
pub use reconcile::{
    PositionChange, PositionReconciler, ReconcileError, ReconcilePlan, ReconcileReport,
    ReconcilerConfig,
};
pub use reliability::{BackoffError, BackoffExecutor, Jitter, RetryPolicy, Retryable};
pub use tier::{is_free, FreeTierPolicy, MembershipTier, DEFAULT_FREE_TIER_THRESHOLD};
