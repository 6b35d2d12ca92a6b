//! Reconciliation and free-tier classification against the in-memory store

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use uuid::Uuid;

use waitlist_positions::prelude::*;

fn reconciler(store: Arc<InMemorySignupStore>, threshold: i64) -> PositionReconciler {
    PositionReconciler::new(
        store,
        FreeTierPolicy::new(threshold),
        ReconcilerConfig::default()
            .with_batch_size(3)
            .with_page_size(4)
            .with_retry(RetryPolicy::fixed(Duration::from_millis(1), 5)),
    )
}

fn seed(store: &InMemorySignupStore, positions: &[Option<i64>]) -> Vec<Uuid> {
    let t0 = Utc::now() - ChronoDuration::hours(1);
    positions
        .iter()
        .enumerate()
        .map(|(i, position)| {
            store
                .seed_member(t0 + ChronoDuration::milliseconds(i as i64), *position)
                .id
        })
        .collect()
}

async fn all_member_positions(store: &InMemorySignupStore) -> Vec<Option<i64>> {
    store
        .list_signups(SignupFilter::members(), Page::first(10_000))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.position)
        .collect()
}

#[test_log::test(tokio::test)]
async fn test_deleted_record_gap_is_closed() {
    let store = Arc::new(InMemorySignupStore::new());
    let ids = seed(&store, &[Some(1), Some(2), Some(3), Some(4), Some(5)]);
    store.set_last_position(5);

    // Test account at position 3 removed; survivors keep their positions
    assert!(store.delete_signup(ids[2]).await.unwrap());
    assert_eq!(
        all_member_positions(&store).await,
        vec![Some(1), Some(2), Some(4), Some(5)]
    );

    let report = reconciler(store.clone(), 20).reconcile().await.unwrap();

    assert_eq!(report.records_processed, 4);
    assert_eq!(report.changed_count, 2);
    assert_eq!(report.new_last_position, 4);
    assert_eq!(
        all_member_positions(&store).await,
        vec![Some(1), Some(2), Some(3), Some(4)]
    );
    assert_eq!(store.get_counter().await.unwrap().last_position, 4);
}

#[tokio::test]
async fn test_reconcile_twice_is_idempotent() {
    let store = Arc::new(InMemorySignupStore::new());
    seed(
        &store,
        &[Some(5), Some(9), Some(9), Some(14), Some(2), Some(30), Some(31)],
    );
    store.set_last_position(31);
    let reconciler = reconciler(store.clone(), 3);

    let first = reconciler.reconcile().await.unwrap();
    assert!(first.changed_count > 0);

    let second = reconciler.reconcile().await.unwrap();
    assert_eq!(second.changed_count, 0);
    assert_eq!(second.tier_changes, 0);
    assert_eq!(second.new_last_position, first.new_last_position);
    assert_eq!(
        all_member_positions(&store).await,
        (1..=7).map(Some).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_order_preserved_and_tier_flips_reported() {
    let store = Arc::new(InMemorySignupStore::new());
    // Threshold 2: the member at 4 moves to 2 and becomes free
    let ids = seed(&store, &[Some(1), Some(4), Some(6)]);
    store.set_last_position(6);
    let tiers = FreeTierPolicy::new(2);

    let before = store.get_signup(ids[1]).await.unwrap().unwrap();
    assert_eq!(tiers.classify(&before), MembershipTier::Paid);

    let report = reconciler(store.clone(), 2).reconcile().await.unwrap();
    assert_eq!(report.tier_changes, 1);

    let after = store.get_signup(ids[1]).await.unwrap().unwrap();
    assert_eq!(after.position, Some(2));
    assert_eq!(tiers.classify(&after), MembershipTier::Free);
    assert!(after.cached_is_free);

    let positions = all_member_positions(&store).await;
    assert_eq!(positions, vec![Some(1), Some(2), Some(3)]);
}

#[tokio::test]
async fn test_first_twenty_of_twenty_five_are_free() {
    let store = Arc::new(InMemorySignupStore::new());
    let tiers = FreeTierPolicy::new(20);
    let allocator = PositionAllocator::new(store.clone(), BackoffExecutor::default(), tiers);

    for i in 0..25 {
        let signup = store
            .create_signup(NewSignup::member(format!("user{}@example.com", i)))
            .await
            .unwrap();
        allocator.allocate(signup.id).await.unwrap();
    }

    let records = store
        .list_signups(SignupFilter::members(), Page::first(100))
        .await
        .unwrap();
    for record in &records {
        let position = record.position.unwrap();
        assert_eq!(tiers.is_free_record(record), position <= 20, "position {}", position);
    }
    assert_eq!(records.iter().filter(|r| tiers.is_free_record(r)).count(), 20);
}

#[tokio::test]
async fn test_classification_uses_live_position_not_cache() {
    let store = Arc::new(InMemorySignupStore::new());
    let ids = seed(&store, &[Some(1), Some(2), Some(25)]);
    store.set_last_position(25);
    let tiers = FreeTierPolicy::new(2);

    // Stale hint claims the third member is free
    store.set_cached_is_free(ids[2], true);
    let record = store.get_signup(ids[2]).await.unwrap().unwrap();
    assert!(record.cached_is_free);
    assert!(!tiers.is_free_record(&record));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconcile_concurrent_with_allocations() {
    let store = Arc::new(InMemorySignupStore::new());
    let seeded: Vec<Option<i64>> = (1..=40).filter(|p| p % 3 != 0).map(Some).collect();
    let seeded_count = seeded.len();
    seed(&store, &seeded);
    store.set_last_position(40);

    let mut newcomers = vec![];
    for i in 0..24 {
        let signup = store
            .create_signup(NewSignup::member(format!("late{}@example.com", i)))
            .await
            .unwrap();
        newcomers.push(signup.id);
    }

    let allocator = PositionAllocator::new(
        store.clone(),
        BackoffExecutor::new(
            RetryPolicy::exponential()
                .with_max_attempts(1000)
                .with_initial_interval(Duration::from_millis(1))
                .with_max_interval(Duration::from_millis(5)),
        ),
        FreeTierPolicy::new(20),
    );
    let reconciler = PositionReconciler::new(
        store.clone(),
        FreeTierPolicy::new(20),
        ReconcilerConfig::default()
            .with_batch_size(4)
            .with_page_size(8)
            .with_retry(RetryPolicy::fixed(Duration::from_millis(1), 1000)),
    );

    let reconcile = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.reconcile().await }
    });
    let allocations: Vec<_> = newcomers
        .iter()
        .map(|id| {
            let allocator = allocator.clone();
            let id = *id;
            tokio::spawn(async move { allocator.allocate(id).await })
        })
        .collect();

    for joined in join_all(allocations).await {
        joined.unwrap().unwrap();
    }
    reconcile.await.unwrap().unwrap();

    // No duplicates even with the run interleaved
    let positions: Vec<i64> = all_member_positions(&store)
        .await
        .into_iter()
        .map(|p| p.unwrap())
        .collect();
    let unique: HashSet<i64> = positions.iter().copied().collect();
    assert_eq!(unique.len(), positions.len());
    let counter = store.get_counter().await.unwrap().last_position;
    assert!(positions.iter().all(|p| *p <= counter));

    // A quiescent run restores the contiguous sequence
    let total = seeded_count + newcomers.len();
    let report = reconciler.reconcile().await.unwrap();
    assert_eq!(report.records_processed, total);
    assert!(!report.counter_advanced_during_run);
    assert_eq!(
        all_member_positions(&store).await,
        (1..=total as i64).map(Some).collect::<Vec<_>>()
    );
    assert_eq!(store.get_counter().await.unwrap().last_position, total as i64);
}
