// Position service - business logic for signups, allocation and reconciliation
//
// Wraps the store, allocator and reconciler behind one handle shared by the
// HTTP layer and the scheduler. Reconciliation runs are serialized in-process
// by `reconcile_guard`; store correctness does not depend on it.

use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;
use waitlist_positions::{
    AllocationError, FreeTierPolicy, NewSignup, Page, PositionAllocator, PositionCounter,
    PositionReconciler, ReconcileError, ReconcilePlan, ReconcileReport, SignupFilter,
    SignupRecord, SignupStore, StoreError,
};

use crate::config::AppConfig;

/// Failure to register a signup
///
/// A registration that fails during allocation leaves no record behind, so the
/// same request can be submitted again.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

pub struct PositionService {
    store: Arc<dyn SignupStore>,
    allocator: PositionAllocator,
    reconciler: PositionReconciler,
    tiers: FreeTierPolicy,
    reconcile_guard: Mutex<()>,
}

impl PositionService {
    pub fn new(store: Arc<dyn SignupStore>, config: &AppConfig) -> Self {
        let tiers = config.tiers();
        Self {
            allocator: PositionAllocator::new(store.clone(), config.allocation_executor(), tiers),
            reconciler: PositionReconciler::new(store.clone(), tiers, config.reconciler_config()),
            store,
            tiers,
            reconcile_guard: Mutex::new(()),
        }
    }

    pub fn tiers(&self) -> FreeTierPolicy {
        self.tiers
    }

    // ============================================
    // Signups
    // ============================================

    pub async fn create_signup(&self, signup: NewSignup) -> Result<SignupRecord, StoreError> {
        let record = self.store.create_signup(signup).await?;
        tracing::info!(signup_id = %record.id, role = %record.role, "signup created");
        Ok(record)
    }

    /// Create a signup and, when `allocate` is set, assign its position
    ///
    /// If allocation fails the new record is deleted again before the error is
    /// returned.
    pub async fn register(
        &self,
        signup: NewSignup,
        allocate: bool,
    ) -> Result<SignupRecord, RegistrationError> {
        let mut record = self.create_signup(signup).await?;
        if !allocate || !record.role.is_member() {
            return Ok(record);
        }

        match self.allocator.allocate(record.id).await {
            Ok(position) => {
                record.position = Some(position);
                Ok(record)
            }
            Err(e) => {
                match self.store.delete_signup(record.id).await {
                    Ok(_) => tracing::warn!(
                        signup_id = %record.id,
                        error = %e,
                        "allocation failed, signup rolled back"
                    ),
                    Err(delete_err) => tracing::error!(
                        signup_id = %record.id,
                        error = %e,
                        delete_error = %delete_err,
                        "allocation failed and signup could not be rolled back"
                    ),
                }
                Err(e.into())
            }
        }
    }

    pub async fn get_signup(&self, id: Uuid) -> Result<Option<SignupRecord>, StoreError> {
        self.store.get_signup(id).await
    }

    /// List signups after the record `after`, if given
    ///
    /// Returns `Ok(None)` when `after` names a record that does not exist.
    pub async fn list_signups(
        &self,
        filter: SignupFilter,
        after: Option<Uuid>,
        limit: u32,
    ) -> Result<Option<Vec<SignupRecord>>, StoreError> {
        let page = match after {
            None => Page::first(limit),
            Some(id) => match self.store.get_signup(id).await? {
                Some(anchor) => Page::after(anchor.cursor(), limit),
                None => return Ok(None),
            },
        };
        self.store.list_signups(filter, page).await.map(Some)
    }

    pub async fn delete_signup(&self, id: Uuid) -> Result<bool, StoreError> {
        let deleted = self.store.delete_signup(id).await?;
        if deleted {
            tracing::info!(signup_id = %id, "signup deleted, positions left unchanged");
        }
        Ok(deleted)
    }

    // ============================================
    // Positions
    // ============================================

    pub async fn allocate(&self, id: Uuid) -> Result<i64, AllocationError> {
        self.allocator.allocate(id).await
    }

    pub async fn counter(&self) -> Result<PositionCounter, StoreError> {
        self.store.get_counter().await
    }

    pub async fn plan_reconcile(&self) -> Result<ReconcilePlan, ReconcileError> {
        self.reconciler.plan().await
    }

    /// Run a reconciliation, waiting for any run already in progress
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let _guard = self.reconcile_guard.lock().await;
        self.reconciler.reconcile().await
    }

    /// Run a reconciliation unless one is already in progress
    pub async fn try_reconcile(&self) -> Option<Result<ReconcileReport, ReconcileError>> {
        let _guard = self.reconcile_guard.try_lock().ok()?;
        Some(self.reconciler.reconcile().await)
    }
}
