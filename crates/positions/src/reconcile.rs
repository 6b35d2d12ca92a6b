//! Position reconciliation
//!
//! Re-derives the gap-free sequence `1..=n` over member records ordered by
//! `(created_at, id)`, rewrites the records whose position drifted, and
//! finalizes the counter. No lock is held across the run; correctness under
//! concurrent allocation comes from idempotence, order preservation and the
//! counter finalization rule in [`PositionReconciler::reconcile`].

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{
    Page, PositionCounter, PositionUpdate, SignupFilter, SignupStore, StoreError,
    MAX_BATCH_WRITES,
};
use crate::reliability::{BackoffError, BackoffExecutor, RetryPolicy};
use crate::tier::FreeTierPolicy;

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Position writes per committed batch, capped at [`MAX_BATCH_WRITES`]
    pub batch_size: usize,

    /// Records read per page during the walk
    pub page_size: u32,

    /// Overall deadline for one run
    pub deadline: Option<Duration>,

    /// Retry policy for each batch and counter transaction
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_WRITES,
            page_size: 1000,
            deadline: Some(Duration::from_secs(300)),
            retry: RetryPolicy::exponential(),
        }
    }
}

impl ReconcilerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_WRITES);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// One record whose position moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PositionChange {
    pub signup_id: Uuid,
    pub old_position: i64,
    pub new_position: i64,
    pub was_free: bool,
    pub is_free: bool,
}

impl PositionChange {
    /// The shift flips the record between free and paid
    pub fn flips_tier(&self) -> bool {
        self.was_free != self.is_free
    }
}

/// What a reconciliation run would write, computed without writing
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ReconcilePlan {
    /// Member records ranked by the walk
    pub records_processed: usize,

    /// Records whose position differs from their rank
    pub changes: Vec<PositionChange>,

    /// Records at the right position whose cached hint is stale
    pub hint_refreshes: Vec<Uuid>,

    /// Counter value after a successful run
    pub new_last_position: i64,

    /// Counter value read before the walk started
    pub observed_last_position: i64,

    /// Members still waiting for their first position
    pub skipped_unallocated: usize,

    /// Number of changes that flip free/paid status
    pub tier_changes: usize,

    #[serde(skip)]
    updates: Vec<PositionUpdate>,
}

impl ReconcilePlan {
    pub fn changed_count(&self) -> usize {
        self.changes.len()
    }

    /// Nothing to write and the counter already matches
    pub fn is_clean(&self) -> bool {
        self.updates.is_empty() && self.observed_last_position == self.new_last_position
    }
}

/// Outcome of a reconciliation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ReconcileReport {
    pub records_processed: usize,
    pub changed_count: usize,
    pub new_last_position: i64,
    pub tier_changes: usize,
    pub hint_refreshes: usize,
    pub skipped_unallocated: usize,

    /// Allocations committed while the run was in progress; the counter was
    /// kept at or above their positions and a gap may remain until the next run
    pub counter_advanced_during_run: bool,

    pub duration_ms: u64,
}

/// Errors from a reconciliation run
///
/// Every variant is safe to recover from by running again: per-record writes
/// are idempotent and the counter is never left below an assigned position.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Reading the records or the counter failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A batch failed after `applied` records were already written
    #[error("batch {failed_batch} failed after {applied} records were written: {source}")]
    PartialBatch {
        applied: usize,
        failed_batch: usize,
        #[source]
        source: BackoffError<StoreError>,
    },

    /// Records were written but the counter could not be finalized
    #[error("counter finalization failed: {0}")]
    Counter(BackoffError<StoreError>),

    /// The run deadline expired
    #[error("reconciliation exceeded deadline of {deadline:?} after {applied} writes")]
    DeadlineExceeded { applied: usize, deadline: Duration },
}

impl ReconcileError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(_) => "StoreError",
            Self::PartialBatch { .. } => "PartialBatch",
            Self::Counter(_) => "CounterNotFinalized",
            Self::DeadlineExceeded { .. } => "DeadlineExceeded",
        }
    }
}

/// Recomputes the canonical position sequence
#[derive(Clone)]
pub struct PositionReconciler {
    store: Arc<dyn SignupStore>,
    tiers: FreeTierPolicy,
    config: ReconcilerConfig,
    executor: BackoffExecutor,
}

impl PositionReconciler {
    pub fn new(store: Arc<dyn SignupStore>, tiers: FreeTierPolicy, config: ReconcilerConfig) -> Self {
        let batch_size = config.batch_size;
        let config = config.with_batch_size(batch_size);
        let executor = BackoffExecutor::new(config.retry.clone());
        Self {
            store,
            tiers,
            config,
            executor,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Walk the members and compute the writes without applying them
    #[instrument(skip(self))]
    pub async fn plan(&self) -> Result<ReconcilePlan, ReconcileError> {
        let started = Instant::now();
        self.build_plan(started).await
    }

    /// Run a full reconciliation
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let started = Instant::now();
        let plan = self.build_plan(started).await?;
        let target = plan.new_last_position;
        let advanced = AtomicBool::new(false);

        // Raise the counter ahead of any rewrite that lands above it, so a
        // concurrent allocation cannot take a position being assigned here
        let mut baseline = plan.observed_last_position;
        if target > baseline {
            let seen = AtomicI64::new(baseline);
            let reserve = |counter: &PositionCounter| {
                seen.store(counter.last_position, Ordering::SeqCst);
                counter.last_position.max(target)
            };
            let reserved = self
                .executor
                .run(|_| self.store.update_counter(&reserve))
                .await
                .map_err(ReconcileError::Counter)?;
            if seen.load(Ordering::SeqCst) != baseline {
                advanced.store(true, Ordering::SeqCst);
            }
            baseline = reserved.last_position;
        }

        let mut applied = 0;
        for (index, batch) in plan.updates.chunks(self.config.batch_size).enumerate() {
            self.check_deadline(started, applied)?;

            let written = self
                .executor
                .run(|_| self.store.apply_position_updates(batch))
                .await
                .map_err(|source| {
                    warn!(batch = index, applied, error = %source, "reconcile batch failed");
                    ReconcileError::PartialBatch {
                        applied,
                        failed_batch: index,
                        source,
                    }
                })?;
            applied += written;
            debug!(batch = index, written, "reconcile batch committed");
        }

        let already_advanced = advanced.load(Ordering::SeqCst);
        let finalize = |counter: &PositionCounter| {
            if !already_advanced && counter.last_position == baseline {
                advanced.store(false, Ordering::SeqCst);
                target
            } else {
                advanced.store(true, Ordering::SeqCst);
                counter.last_position.max(target)
            }
        };
        let counter = self
            .executor
            .run(|_| self.store.update_counter(&finalize))
            .await
            .map_err(ReconcileError::Counter)?;

        let report = ReconcileReport {
            records_processed: plan.records_processed,
            changed_count: plan.changes.len(),
            new_last_position: counter.last_position,
            tier_changes: plan.tier_changes,
            hint_refreshes: plan.hint_refreshes.len(),
            skipped_unallocated: plan.skipped_unallocated,
            counter_advanced_during_run: advanced.load(Ordering::SeqCst),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if report.counter_advanced_during_run {
            warn!(
                target,
                last_position = counter.last_position,
                "allocations committed during reconciliation, counter kept ahead"
            );
        }
        info!(
            records_processed = report.records_processed,
            changed_count = report.changed_count,
            tier_changes = report.tier_changes,
            new_last_position = report.new_last_position,
            "reconciliation complete"
        );
        Ok(report)
    }

    async fn build_plan(&self, started: Instant) -> Result<ReconcilePlan, ReconcileError> {
        let observed = self.store.get_counter().await?;

        let mut plan = ReconcilePlan {
            records_processed: 0,
            changes: Vec::new(),
            hint_refreshes: Vec::new(),
            new_last_position: 0,
            observed_last_position: observed.last_position,
            skipped_unallocated: 0,
            tier_changes: 0,
            updates: Vec::new(),
        };

        let mut page = Page::first(self.config.page_size);
        loop {
            self.check_deadline(started, 0)?;

            let records = self
                .store
                .list_signups(SignupFilter::members(), page)
                .await?;
            let Some(last) = records.last() else {
                break;
            };
            page = Page::after(last.cursor(), self.config.page_size);
            let exhausted = records.len() < self.config.page_size as usize;

            for record in &records {
                let Some(current) = record.position else {
                    plan.skipped_unallocated += 1;
                    continue;
                };

                plan.records_processed += 1;
                let target = plan.records_processed as i64;
                let is_free = self.tiers.is_free(Some(target));

                if current != target {
                    let change = PositionChange {
                        signup_id: record.id,
                        old_position: current,
                        new_position: target,
                        was_free: self.tiers.is_free(Some(current)),
                        is_free,
                    };
                    if change.flips_tier() {
                        plan.tier_changes += 1;
                    }
                    plan.changes.push(change);
                } else if record.cached_is_free != is_free {
                    plan.hint_refreshes.push(record.id);
                } else {
                    continue;
                }

                plan.updates.push(PositionUpdate {
                    signup_id: record.id,
                    position: target,
                    cached_is_free: is_free,
                });
            }

            if exhausted {
                break;
            }
        }

        plan.new_last_position = plan.records_processed as i64;
        debug!(
            records_processed = plan.records_processed,
            changes = plan.changes.len(),
            hint_refreshes = plan.hint_refreshes.len(),
            skipped_unallocated = plan.skipped_unallocated,
            "reconcile plan built"
        );
        Ok(plan)
    }

    fn check_deadline(&self, started: Instant, applied: usize) -> Result<(), ReconcileError> {
        match self.config.deadline {
            Some(deadline) if started.elapsed() >= deadline => {
                Err(ReconcileError::DeadlineExceeded { applied, deadline })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{
        AllocationDecision, CounterDecision, InMemorySignupStore, NewSignup, PositionAssignment,
        SignupRecord,
    };
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::AtomicUsize;

    fn reconciler(store: Arc<InMemorySignupStore>, batch_size: usize) -> PositionReconciler {
        PositionReconciler::new(
            store,
            FreeTierPolicy::new(2),
            ReconcilerConfig::default()
                .with_batch_size(batch_size)
                .with_page_size(2)
                .with_retry(RetryPolicy::fixed(Duration::from_millis(1), 3)),
        )
    }

    fn seed(store: &InMemorySignupStore, positions: &[Option<i64>]) -> Vec<Uuid> {
        let t0 = Utc::now();
        positions
            .iter()
            .enumerate()
            .map(|(i, position)| {
                store
                    .seed_member(t0 + ChronoDuration::seconds(i as i64), *position)
                    .id
            })
            .collect()
    }

    async fn positions(store: &InMemorySignupStore, ids: &[Uuid]) -> Vec<Option<i64>> {
        let mut out = vec![];
        for id in ids {
            out.push(store.get_signup(*id).await.unwrap().unwrap().position);
        }
        out
    }

    #[tokio::test]
    async fn test_closes_gap() {
        let store = Arc::new(InMemorySignupStore::new());
        let ids = seed(&store, &[Some(1), Some(2), Some(4), Some(5)]);
        store.set_last_position(5);

        let report = reconciler(store.clone(), 500).reconcile().await.unwrap();

        assert_eq!(report.records_processed, 4);
        assert_eq!(report.changed_count, 2);
        assert_eq!(report.new_last_position, 4);
        assert!(!report.counter_advanced_during_run);
        assert_eq!(
            positions(&store, &ids).await,
            vec![Some(1), Some(2), Some(3), Some(4)]
        );
        assert_eq!(store.get_counter().await.unwrap().last_position, 4);
    }

    #[tokio::test]
    async fn test_plan_writes_nothing() {
        let store = Arc::new(InMemorySignupStore::new());
        let ids = seed(&store, &[Some(1), Some(3), Some(7)]);
        store.set_last_position(7);

        let plan = reconciler(store.clone(), 500).plan().await.unwrap();

        assert_eq!(plan.changed_count(), 2);
        assert_eq!(plan.new_last_position, 3);
        assert_eq!(plan.observed_last_position, 7);
        // 3 -> 2 crosses the threshold of 2
        assert_eq!(plan.tier_changes, 1);
        assert!(!plan.is_clean());
        assert_eq!(positions(&store, &ids).await, vec![Some(1), Some(3), Some(7)]);
        assert_eq!(store.get_counter().await.unwrap().last_position, 7);
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing() {
        let store = Arc::new(InMemorySignupStore::new());
        seed(&store, &[Some(2), Some(9), Some(4), Some(11), Some(12)]);
        store.set_last_position(12);
        let reconciler = reconciler(store.clone(), 2);

        let first = reconciler.reconcile().await.unwrap();
        assert!(first.changed_count > 0);

        let second = reconciler.reconcile().await.unwrap();
        assert_eq!(second.changed_count, 0);
        assert_eq!(second.hint_refreshes, 0);
        assert_eq!(second.new_last_position, 5);
        assert!(reconciler.plan().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_preserves_creation_order_over_position_order() {
        let store = Arc::new(InMemorySignupStore::new());
        // Created first but holding a higher position
        let ids = seed(&store, &[Some(3), Some(1), Some(2)]);
        store.set_last_position(3);

        reconciler(store.clone(), 500).reconcile().await.unwrap();
        assert_eq!(
            positions(&store, &ids).await,
            vec![Some(1), Some(2), Some(3)]
        );
    }

    #[tokio::test]
    async fn test_skips_unallocated_members() {
        let store = Arc::new(InMemorySignupStore::new());
        let ids = seed(&store, &[Some(1), None, Some(5)]);
        store.set_last_position(5);

        let report = reconciler(store.clone(), 500).reconcile().await.unwrap();
        assert_eq!(report.skipped_unallocated, 1);
        assert_eq!(report.new_last_position, 2);
        assert_eq!(positions(&store, &ids).await, vec![Some(1), None, Some(2)]);
    }

    #[tokio::test]
    async fn test_refreshes_stale_hints() {
        let store = Arc::new(InMemorySignupStore::new());
        let ids = seed(&store, &[Some(1), Some(2), Some(3)]);
        store.set_last_position(3);
        // seed_member writes cached_is_free = false everywhere
        store.set_cached_is_free(ids[2], true);

        let report = reconciler(store.clone(), 500).reconcile().await.unwrap();
        assert_eq!(report.changed_count, 0);
        assert_eq!(report.hint_refreshes, 3);

        let hints: Vec<bool> = {
            let mut out = vec![];
            for id in &ids {
                out.push(store.get_signup(*id).await.unwrap().unwrap().cached_is_free);
            }
            out
        };
        assert_eq!(hints, vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_counter_raised_when_below_records() {
        let store = Arc::new(InMemorySignupStore::new());
        seed(&store, &[Some(1), Some(1), Some(2)]);
        store.set_last_position(1);

        let report = reconciler(store.clone(), 500).reconcile().await.unwrap();
        assert_eq!(report.new_last_position, 3);
        assert!(!report.counter_advanced_during_run);
        assert_eq!(store.get_counter().await.unwrap().last_position, 3);
    }

    #[tokio::test]
    async fn test_batch_failure_is_partial_and_recoverable() {
        let inner = Arc::new(InMemorySignupStore::new());
        let ids = seed(&inner, &[Some(2), Some(3), Some(4), Some(5)]);
        inner.set_last_position(5);

        // Second batch fails on every attempt
        let flaky = Arc::new(BatchHook::new(inner.clone(), |_, call| {
            if call >= 2 {
                Err(StoreError::Contention("batch aborted".into()))
            } else {
                Ok(())
            }
        }));
        let partial = PositionReconciler::new(
            flaky,
            FreeTierPolicy::new(2),
            ReconcilerConfig::default()
                .with_batch_size(2)
                .with_retry(RetryPolicy::fixed(Duration::from_millis(1), 3)),
        );

        match partial.reconcile().await {
            Err(ReconcileError::PartialBatch {
                applied,
                failed_batch,
                source,
            }) => {
                assert_eq!(applied, 2);
                assert_eq!(failed_batch, 1);
                assert!(matches!(
                    source,
                    BackoffError::RetriesExhausted { attempts: 3, .. }
                ));
            }
            other => panic!("expected PartialBatch, got {:?}", other),
        }
        assert_eq!(
            positions(&inner, &ids).await,
            vec![Some(1), Some(2), Some(4), Some(5)]
        );
        // Counter untouched, still above every assigned position
        assert_eq!(inner.get_counter().await.unwrap().last_position, 5);

        // Re-running finishes the job
        let report = reconciler(inner.clone(), 2).reconcile().await.unwrap();
        assert_eq!(report.changed_count, 2);
        assert_eq!(
            positions(&inner, &ids).await,
            vec![Some(1), Some(2), Some(3), Some(4)]
        );
        assert_eq!(inner.get_counter().await.unwrap().last_position, 4);
    }

    #[tokio::test]
    async fn test_counter_kept_ahead_of_concurrent_allocation() {
        let inner = Arc::new(InMemorySignupStore::new());
        seed(&inner, &[Some(1), Some(2), Some(4)]);
        inner.set_last_position(4);

        // An allocation commits position 5 while the batches are applied
        let store = Arc::new(BatchHook::new(inner.clone(), |inner, call| {
            if call == 1 {
                inner.seed_member(Utc::now(), Some(5));
                inner.set_last_position(5);
            }
            Ok(())
        }));
        let reconciler = PositionReconciler::new(
            store,
            FreeTierPolicy::new(2),
            ReconcilerConfig::default().with_retry(RetryPolicy::fixed(Duration::from_millis(1), 3)),
        );

        let report = reconciler.reconcile().await.unwrap();
        assert!(report.counter_advanced_during_run);
        assert_eq!(report.changed_count, 1);
        assert_eq!(report.new_last_position, 5);
        assert_eq!(inner.get_counter().await.unwrap().last_position, 5);
    }

    #[tokio::test]
    async fn test_empty_store() {
        let store = Arc::new(InMemorySignupStore::new());
        let report = reconciler(store, 500).reconcile().await.unwrap();
        assert_eq!(report.records_processed, 0);
        assert_eq!(report.new_last_position, 0);
    }

    #[test]
    fn test_batch_size_is_capped() {
        let config = ReconcilerConfig::default().with_batch_size(10_000);
        assert_eq!(config.batch_size, MAX_BATCH_WRITES);
        assert_eq!(ReconcilerConfig::default().with_batch_size(0).batch_size, 1);
    }

    /// Delegates to the in-memory store, running `hook` with the 1-based call
    /// number before each position batch
    struct BatchHook {
        inner: Arc<InMemorySignupStore>,
        calls: AtomicUsize,
        hook: fn(&InMemorySignupStore, usize) -> Result<(), StoreError>,
    }

    impl BatchHook {
        fn new(
            inner: Arc<InMemorySignupStore>,
            hook: fn(&InMemorySignupStore, usize) -> Result<(), StoreError>,
        ) -> Self {
            Self {
                inner,
                calls: AtomicUsize::new(0),
                hook,
            }
        }
    }

    #[async_trait]
    impl SignupStore for BatchHook {
        async fn create_signup(&self, signup: NewSignup) -> Result<SignupRecord, StoreError> {
            self.inner.create_signup(signup).await
        }

        async fn get_signup(&self, id: Uuid) -> Result<Option<SignupRecord>, StoreError> {
            self.inner.get_signup(id).await
        }

        async fn list_signups(
            &self,
            filter: SignupFilter,
            page: Page,
        ) -> Result<Vec<SignupRecord>, StoreError> {
            self.inner.list_signups(filter, page).await
        }

        async fn delete_signup(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.delete_signup(id).await
        }

        async fn get_counter(&self) -> Result<PositionCounter, StoreError> {
            self.inner.get_counter().await
        }

        async fn allocate_in_transaction(
            &self,
            signup_id: Uuid,
            decide: &AllocationDecision<'_>,
        ) -> Result<PositionAssignment, StoreError> {
            self.inner.allocate_in_transaction(signup_id, decide).await
        }

        async fn update_counter(
            &self,
            decide: &CounterDecision<'_>,
        ) -> Result<PositionCounter, StoreError> {
            self.inner.update_counter(decide).await
        }

        async fn apply_position_updates(
            &self,
            updates: &[PositionUpdate],
        ) -> Result<usize, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.hook)(&self.inner, call)?;
            self.inner.apply_position_updates(updates).await
        }
    }
}
