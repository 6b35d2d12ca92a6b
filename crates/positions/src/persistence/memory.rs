//! In-memory implementation of SignupStore for dev mode and testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// Stored record plus its optimistic-concurrency version
struct VersionedSignup {
    record: SignupRecord,
    version: u64,
}

struct State {
    signups: HashMap<Uuid, VersionedSignup>,
    counter: PositionCounter,
    counter_version: u64,
}

/// In-memory implementation of SignupStore
///
/// Transactions are optimistic: the snapshot is read under a shared lock, the
/// decision runs without any lock held, and the commit re-checks versions under
/// the write lock. A concurrent commit in between surfaces as
/// [`StoreError::Contention`], the same way a document database aborts a
/// conflicting transaction.
///
/// Aborts can also be injected with [`inject_contention`](Self::inject_contention).
///
/// # Example
///
/// ```
/// use waitlist_positions::InMemorySignupStore;
///
/// let store = InMemorySignupStore::new();
/// store.inject_contention(2); // next two commits abort
/// ```
pub struct InMemorySignupStore {
    state: RwLock<State>,
    injected_aborts: AtomicU32,
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl InMemorySignupStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                signups: HashMap::new(),
                counter: PositionCounter {
                    last_position: 0,
                    updated_at: Utc::now(),
                },
                counter_version: 0,
            }),
            injected_aborts: AtomicU32::new(0),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        }
    }

    /// Make the next `count` transactional commits fail with contention
    pub fn inject_contention(&self, count: u32) {
        self.injected_aborts.fetch_add(count, Ordering::SeqCst);
    }

    /// Number of transactions committed
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of transactions aborted with contention
    pub fn abort_count(&self) -> u64 {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Get the number of signups
    pub fn signup_count(&self) -> usize {
        self.state.read().signups.len()
    }

    /// Insert a record verbatim, bypassing allocation (fixtures and imports)
    pub fn insert_record(&self, record: SignupRecord) {
        self.state.write().signups.insert(
            record.id,
            VersionedSignup {
                record,
                version: 0,
            },
        );
    }

    /// Seed a member record with a fixed creation time and position
    pub fn seed_member(&self, created_at: DateTime<Utc>, position: Option<i64>) -> SignupRecord {
        let id = Uuid::now_v7();
        let record = SignupRecord {
            id,
            email: format!("{}@seed.test", id.simple()),
            name: None,
            role: SignupRole::Member,
            position,
            cached_is_free: false,
            created_at,
            updated_at: created_at,
        };
        self.insert_record(record.clone());
        record
    }

    /// Overwrite the counter, bypassing transactions
    pub fn set_last_position(&self, last_position: i64) {
        let mut state = self.state.write();
        state.counter.last_position = last_position;
        state.counter.updated_at = Utc::now();
        state.counter_version += 1;
    }

    /// Overwrite a record's display hint, bypassing transactions
    pub fn set_cached_is_free(&self, id: Uuid, cached_is_free: bool) -> bool {
        match self.state.write().signups.get_mut(&id) {
            Some(entry) => {
                entry.record.cached_is_free = cached_is_free;
                entry.version += 1;
                true
            }
            None => false,
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.signups.clear();
        state.counter.last_position = 0;
        state.counter_version += 1;
    }

    /// Consume one injected abort, if any is pending
    fn take_injected_abort(&self) -> bool {
        self.injected_aborts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn abort(&self, reason: impl Into<String>) -> StoreError {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        StoreError::Contention(reason.into())
    }
}

impl Default for InMemorySignupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignupStore for InMemorySignupStore {
    async fn create_signup(&self, signup: NewSignup) -> Result<SignupRecord, StoreError> {
        let email = signup.normalized_email();
        let mut state = self.state.write();

        if state.signups.values().any(|s| s.record.email == email) {
            return Err(StoreError::EmailTaken(email));
        }

        let now = Utc::now();
        let record = SignupRecord {
            id: Uuid::now_v7(),
            email,
            name: signup.name,
            role: signup.role,
            position: None,
            cached_is_free: false,
            created_at: now,
            updated_at: now,
        };
        state.signups.insert(
            record.id,
            VersionedSignup {
                record: record.clone(),
                version: 0,
            },
        );
        Ok(record)
    }

    async fn get_signup(&self, id: Uuid) -> Result<Option<SignupRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .signups
            .get(&id)
            .map(|s| s.record.clone()))
    }

    async fn list_signups(
        &self,
        filter: SignupFilter,
        page: Page,
    ) -> Result<Vec<SignupRecord>, StoreError> {
        let state = self.state.read();
        let mut records: Vec<&SignupRecord> = state
            .signups
            .values()
            .map(|s| &s.record)
            .filter(|r| filter.role.map_or(true, |role| r.role == role))
            .filter(|r| {
                page.after
                    .map_or(true, |after| (r.created_at, r.id) > (after.created_at, after.id))
            })
            .collect();
        records.sort_by_key(|r| (r.created_at, r.id));

        Ok(records
            .into_iter()
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn delete_signup(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state.write().signups.remove(&id).is_some())
    }

    async fn get_counter(&self) -> Result<PositionCounter, StoreError> {
        Ok(self.state.read().counter.clone())
    }

    async fn allocate_in_transaction(
        &self,
        signup_id: Uuid,
        decide: &AllocationDecision<'_>,
    ) -> Result<PositionAssignment, StoreError> {
        // Read phase
        let (record, record_version, counter, counter_version) = {
            let state = self.state.read();
            let entry = state
                .signups
                .get(&signup_id)
                .ok_or(StoreError::SignupNotFound(signup_id))?;
            (
                entry.record.clone(),
                entry.version,
                state.counter.clone(),
                state.counter_version,
            )
        };

        let assignment = decide(&record, &counter).map_err(StoreError::Rejected)?;

        // Let competing transactions interleave between read and commit
        tokio::task::yield_now().await;

        // Commit phase
        let mut guard = self.state.write();
        let state = &mut *guard;
        if self.take_injected_abort() {
            return Err(self.abort("injected abort"));
        }
        if state.counter_version != counter_version {
            return Err(self.abort("position counter changed since read"));
        }
        let entry = match state.signups.get_mut(&signup_id) {
            Some(entry) if entry.version == record_version => entry,
            Some(_) => return Err(self.abort(format!("signup {} changed since read", signup_id))),
            None => return Err(StoreError::SignupNotFound(signup_id)),
        };

        let now = Utc::now();
        entry.record.position = Some(assignment.position);
        entry.record.cached_is_free = assignment.cached_is_free;
        entry.record.updated_at = now;
        entry.version += 1;

        state.counter.last_position = assignment.last_position;
        state.counter.updated_at = now;
        state.counter_version += 1;

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(assignment)
    }

    async fn update_counter(
        &self,
        decide: &CounterDecision<'_>,
    ) -> Result<PositionCounter, StoreError> {
        let (counter, counter_version) = {
            let state = self.state.read();
            (state.counter.clone(), state.counter_version)
        };

        let last_position = decide(&counter);

        tokio::task::yield_now().await;

        let mut state = self.state.write();
        if self.take_injected_abort() {
            return Err(self.abort("injected abort"));
        }
        if state.counter_version != counter_version {
            return Err(self.abort("position counter changed since read"));
        }

        state.counter.last_position = last_position;
        state.counter.updated_at = Utc::now();
        state.counter_version += 1;

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(state.counter.clone())
    }

    async fn apply_position_updates(
        &self,
        updates: &[PositionUpdate],
    ) -> Result<usize, StoreError> {
        check_batch_size(updates)?;

        let mut state = self.state.write();
        if self.take_injected_abort() {
            return Err(self.abort("injected abort"));
        }

        let now = Utc::now();
        let mut written = 0;
        for update in updates {
            if let Some(entry) = state.signups.get_mut(&update.signup_id) {
                if !entry.record.role.is_member() {
                    continue;
                }
                entry.record.position = Some(update.position);
                entry.record.cached_is_free = update.cached_is_free;
                entry.record.updated_at = now;
                entry.version += 1;
                written += 1;
            }
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }
}
