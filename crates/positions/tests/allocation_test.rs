//! Allocation under concurrency against the in-memory store
//!
//! The in-memory store aborts any transaction whose snapshot was overtaken by
//! another commit, so these tests exercise the same retry paths as a real
//! document store under contention.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use uuid::Uuid;

use waitlist_positions::persistence::{
    AllocationDecision, CounterDecision, PositionAssignment, PositionUpdate,
};
use waitlist_positions::prelude::*;

fn contended_policy() -> RetryPolicy {
    RetryPolicy::exponential()
        .with_max_attempts(1000)
        .with_initial_interval(Duration::from_millis(1))
        .with_max_interval(Duration::from_millis(5))
}

fn allocator(store: Arc<InMemorySignupStore>) -> PositionAllocator {
    PositionAllocator::new(
        store,
        BackoffExecutor::new(contended_policy()),
        FreeTierPolicy::default(),
    )
}

async fn create_members(store: &InMemorySignupStore, count: usize) -> Vec<Uuid> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let signup = store
            .create_signup(NewSignup::member(format!("member{}@example.com", i)))
            .await
            .unwrap();
        ids.push(signup.id);
    }
    ids
}

async fn allocate_all(allocator: &PositionAllocator, ids: &[Uuid]) -> Vec<i64> {
    let handles: Vec<_> = ids
        .iter()
        .map(|id| {
            let allocator = allocator.clone();
            let id = *id;
            tokio::spawn(async move { allocator.allocate(id).await })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect()
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_two_concurrent_allocations_from_ten() {
    let store = Arc::new(InMemorySignupStore::new());
    store.set_last_position(10);
    let ids = create_members(&store, 2).await;

    let mut positions = allocate_all(&allocator(store.clone()), &ids).await;
    positions.sort();

    assert_eq!(positions, vec![11, 12]);
    assert_eq!(store.get_counter().await.unwrap().last_position, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_allocations_are_unique_and_contiguous() {
    let store = Arc::new(InMemorySignupStore::new());
    let ids = create_members(&store, 64).await;

    let positions = allocate_all(&allocator(store.clone()), &ids).await;

    let unique: HashSet<i64> = positions.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());

    let mut sorted = positions.clone();
    sorted.sort();
    assert_eq!(sorted, (1..=64).collect::<Vec<_>>());
    assert_eq!(store.get_counter().await.unwrap().last_position, 64);

    // Every record holds the position its allocation returned
    for (id, position) in ids.iter().zip(&positions) {
        let record = store.get_signup(*id).await.unwrap().unwrap();
        assert_eq!(record.position, Some(*position));
    }
}

#[tokio::test]
async fn test_retried_allocation_advances_counter_once() {
    let store = Arc::new(InMemorySignupStore::new());
    store.set_last_position(41);
    let ids = create_members(&store, 1).await;

    // Two aborts, success on the third attempt
    store.inject_contention(2);
    let position = allocator(store.clone()).allocate(ids[0]).await.unwrap();

    assert_eq!(position, 42);
    assert_eq!(store.get_counter().await.unwrap().last_position, 42);
    assert_eq!(store.abort_count(), 2);
    assert_eq!(store.commit_count(), 1);
}

#[tokio::test]
async fn test_exhausted_allocations_leave_no_phantom_positions() {
    let store = Arc::new(InMemorySignupStore::new());
    let ids = create_members(&store, 3).await;
    let allocator = PositionAllocator::new(
        store.clone(),
        BackoffExecutor::new(RetryPolicy::fixed(Duration::from_millis(1), 2)),
        FreeTierPolicy::default(),
    );

    assert_eq!(allocator.allocate(ids[0]).await.unwrap(), 1);

    store.inject_contention(2);
    let err = allocator.allocate(ids[1]).await.unwrap_err();
    assert!(matches!(err, AllocationError::RetriesExhausted { attempts: 2, .. }));

    // The next success follows directly after the last one
    assert_eq!(allocator.allocate(ids[2]).await.unwrap(), 2);
    assert_eq!(allocator.allocate(ids[1]).await.unwrap(), 3);
    assert_eq!(store.get_counter().await.unwrap().last_position, 3);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_surfaces_as_transient() {
    let store = Arc::new(InMemorySignupStore::new());
    let ids = create_members(&store, 1).await;
    let allocator = PositionAllocator::new(
        store.clone(),
        BackoffExecutor::new(RetryPolicy::fixed(Duration::from_millis(100), 100))
            .with_deadline(Duration::from_millis(250)),
        FreeTierPolicy::default(),
    );

    store.inject_contention(50);
    let err = allocator.allocate(ids[0]).await.unwrap_err();

    assert!(matches!(err, AllocationError::DeadlineExceeded { .. }));
    assert!(err.is_transient());
    assert_eq!(err.code(), "RetriesExhausted");
    assert_eq!(store.get_counter().await.unwrap().last_position, 0);
}

/// Commits through the in-memory store, then holds the acknowledgement back
struct SlowAckStore {
    inner: Arc<InMemorySignupStore>,
    ack_delay: Duration,
}

#[async_trait]
impl SignupStore for SlowAckStore {
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
        let committed = self.inner.allocate_in_transaction(signup_id, decide).await;
        tokio::time::sleep(self.ack_delay).await;
        committed
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
        self.inner.apply_position_updates(updates).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_commit_acknowledged_after_deadline_is_reported() {
    let inner = Arc::new(InMemorySignupStore::new());
    let ids = create_members(&inner, 1).await;
    let store = Arc::new(SlowAckStore {
        inner: inner.clone(),
        ack_delay: Duration::from_millis(500),
    });
    let allocator = PositionAllocator::new(
        store,
        BackoffExecutor::new(RetryPolicy::fixed(Duration::from_millis(10), 5))
            .with_deadline(Duration::from_millis(100)),
        FreeTierPolicy::default(),
    );

    // The write lands well before the deadline, the ack well after it
    assert_eq!(allocator.allocate(ids[0]).await.unwrap(), 1);

    let record = inner.get_signup(ids[0]).await.unwrap().unwrap();
    assert_eq!(record.position, Some(1));
    assert_eq!(inner.get_counter().await.unwrap().last_position, 1);
    assert_eq!(inner.commit_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_allocation_race_assigns_once() {
    let store = Arc::new(InMemorySignupStore::new());
    let ids = create_members(&store, 1).await;
    let allocator = allocator(store.clone());

    let first = tokio::spawn({
        let allocator = allocator.clone();
        let id = ids[0];
        async move { allocator.allocate(id).await }
    });
    let second = tokio::spawn({
        let allocator = allocator.clone();
        let id = ids[0];
        async move { allocator.allocate(id).await }
    });

    let results = [first.await.unwrap(), second.await.unwrap()];
    let successes: Vec<i64> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(successes, vec![1]);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(AllocationError::AlreadyAllocated { position: 1, .. }))));
    assert_eq!(store.get_counter().await.unwrap().last_position, 1);
}
