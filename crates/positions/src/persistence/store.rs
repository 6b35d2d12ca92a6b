//! SignupStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reliability::Retryable;

/// Upper bound on position writes committed together in one batch
pub const MAX_BATCH_WRITES: usize = 500;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Signup record not found
    #[error("signup not found: {0}")]
    SignupNotFound(Uuid),

    /// Another signup already uses this email
    #[error("email already registered: {0}")]
    EmailTaken(String),

    /// Transaction aborted because a concurrent writer touched the same records
    #[error("write contention: {0}")]
    Contention(String),

    /// The transaction function refused to produce a write
    #[error("transaction rejected: {0}")]
    Rejected(TransactionRejection),

    /// Batch exceeds [`MAX_BATCH_WRITES`]
    #[error("batch of {size} writes exceeds limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    /// Database error
    #[error("database error: {0}")]
    Database(String),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention(_))
    }
}

/// Why an allocation transaction declined to write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRejection {
    /// The record already holds a position
    AlreadyAllocated { position: i64 },

    /// The record is not a member and never takes a position
    NotMember,
}

impl std::fmt::Display for TransactionRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyAllocated { position } => {
                write!(f, "already allocated at position {}", position)
            }
            Self::NotMember => write!(f, "record is not a member"),
        }
    }
}

/// Signup role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum SignupRole {
    /// Regular beta signup, ranked in the position sequence
    #[default]
    Member,

    /// Staff account, excluded from the position sequence
    Administrator,
}

impl SignupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Administrator => "administrator",
        }
    }

    pub fn is_member(&self) -> bool {
        matches!(self, Self::Member)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "member" => Some(Self::Member),
            "administrator" => Some(Self::Administrator),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignupRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted signup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignupRecord {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub role: SignupRole,

    /// `None` until the allocator commits
    pub position: Option<i64>,

    /// Display hint written alongside `position`; may be stale
    pub cached_is_free: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SignupRecord {
    /// Keyset cursor pointing at this record
    pub fn cursor(&self) -> SignupCursor {
        SignupCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Input for creating a signup
#[derive(Debug, Clone)]
pub struct NewSignup {
    pub email: String,
    pub name: Option<String>,
    pub role: SignupRole,
}

impl NewSignup {
    pub fn member(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
            role: SignupRole::Member,
        }
    }

    pub fn administrator(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
            role: SignupRole::Administrator,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Email as stored: trimmed and lowercased
    pub fn normalized_email(&self) -> String {
        self.email.trim().to_lowercase()
    }
}

/// Singleton counter holding the highest allocated position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PositionCounter {
    pub last_position: i64,
    pub updated_at: DateTime<Utc>,
}

/// Writes produced by an allocation transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionAssignment {
    /// New value for the record's position
    pub position: i64,

    /// New value for the counter
    pub last_position: i64,

    /// Refreshed display hint
    pub cached_is_free: bool,
}

/// One record update inside a reconciliation batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionUpdate {
    pub signup_id: Uuid,
    pub position: i64,
    pub cached_is_free: bool,
}

/// Position for keyset pagination over `(created_at, id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

/// Filter for listing signups
#[derive(Debug, Clone, Copy, Default)]
pub struct SignupFilter {
    pub role: Option<SignupRole>,
}

impl SignupFilter {
    pub fn members() -> Self {
        Self {
            role: Some(SignupRole::Member),
        }
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub after: Option<SignupCursor>,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            after: None,
            limit: 100,
        }
    }
}

impl Page {
    pub fn first(limit: u32) -> Self {
        Self { after: None, limit }
    }

    pub fn after(cursor: SignupCursor, limit: u32) -> Self {
        Self {
            after: Some(cursor),
            limit,
        }
    }
}

/// Transaction body for allocation
///
/// Runs against a consistent snapshot of the target record and the counter.
/// Returning `Err` aborts the transaction without writing anything.
///
/// The body may borrow from the caller's stack; the store only holds it for the
/// duration of the call.
pub type AllocationDecision<'a> = dyn for<'r, 'c> Fn(
        &'r SignupRecord,
        &'c PositionCounter,
    ) -> Result<PositionAssignment, TransactionRejection>
    + Send
    + Sync
    + 'a;

/// Transaction body for counter updates: maps the current counter to the new
/// `last_position`.
pub type CounterDecision<'a> = dyn for<'c> Fn(&'c PositionCounter) -> i64 + Send + Sync + 'a;

/// Store for signup records and the position counter
///
/// Implementations provide single-transaction atomicity only; there are no
/// cross-call locks. A transaction that loses a race reports
/// [`StoreError::Contention`] and leaves no partial writes behind.
#[async_trait]
pub trait SignupStore: Send + Sync + 'static {
    // =========================================================================
    // Signup records
    // =========================================================================

    /// Create a signup without a position
    async fn create_signup(&self, signup: NewSignup) -> Result<SignupRecord, StoreError>;

    async fn get_signup(&self, id: Uuid) -> Result<Option<SignupRecord>, StoreError>;

    /// List signups ordered by `(created_at, id)`
    async fn list_signups(
        &self,
        filter: SignupFilter,
        page: Page,
    ) -> Result<Vec<SignupRecord>, StoreError>;

    /// Delete a signup. Survivors keep their positions.
    async fn delete_signup(&self, id: Uuid) -> Result<bool, StoreError>;

    // =========================================================================
    // Position counter
    // =========================================================================

    async fn get_counter(&self) -> Result<PositionCounter, StoreError>;

    /// Read the record and the counter, let `decide` compute the writes, and
    /// commit both documents atomically.
    async fn allocate_in_transaction(
        &self,
        signup_id: Uuid,
        decide: &AllocationDecision<'_>,
    ) -> Result<PositionAssignment, StoreError>;

    /// Read-modify-write of the counter alone
    async fn update_counter(&self, decide: &CounterDecision<'_>)
        -> Result<PositionCounter, StoreError>;

    /// Apply position rewrites atomically as one batch
    ///
    /// Updates naming records that no longer exist are skipped. Returns the
    /// number of records written.
    async fn apply_position_updates(&self, updates: &[PositionUpdate])
        -> Result<usize, StoreError>;
}

pub(crate) fn check_batch_size(updates: &[PositionUpdate]) -> Result<(), StoreError> {
    if updates.len() > MAX_BATCH_WRITES {
        return Err(StoreError::BatchTooLarge {
            size: updates.len(),
            limit: MAX_BATCH_WRITES,
        });
    }
    Ok(())
}
