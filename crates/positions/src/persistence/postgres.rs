//! PostgreSQL implementation of SignupStore
//!
//! Production persistence using PostgreSQL with:
//! - Row locks (`SELECT ... FOR UPDATE`) on the signup and counter rows
//! - `lock_timeout` so a blocked transaction aborts instead of waiting forever
//! - Serialization failures, deadlocks and lock timeouts reported as contention

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;

/// SQLSTATE codes that mean "another transaction got there first"
const CONTENTION_CODES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
];

const UNIQUE_VIOLATION: &str = "23505";

const SIGNUP_COLUMNS: &str =
    "id, email, name, role, position, cached_is_free, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct SignupRow {
    id: Uuid,
    email: String,
    name: Option<String>,
    role: String,
    position: Option<i64>,
    cached_is_free: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SignupRow> for SignupRecord {
    type Error = StoreError;

    fn try_from(row: SignupRow) -> Result<Self, Self::Error> {
        let role = SignupRole::parse(&row.role)
            .ok_or_else(|| StoreError::Database(format!("unknown signup role: {}", row.role)))?;
        Ok(SignupRecord {
            id: row.id,
            email: row.email,
            name: row.name,
            role,
            position: row.position,
            cached_is_free: row.cached_is_free,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CounterRow {
    last_position: i64,
    updated_at: DateTime<Utc>,
}

impl From<CounterRow> for PositionCounter {
    fn from(row: CounterRow) -> Self {
        PositionCounter {
            last_position: row.last_position,
            updated_at: row.updated_at,
        }
    }
}

/// PostgreSQL implementation of SignupStore
///
/// # Example
///
/// ```ignore
/// use waitlist_positions::PostgresSignupStore;
///
/// let store = PostgresSignupStore::connect("postgres://localhost/waitlist").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresSignupStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresSignupStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: Duration::from_secs(2),
        }
    }

    /// Connect with a default-sized pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::new(pool))
    }

    /// How long a transaction waits on a row lock before aborting
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // SET does not take bind parameters; the value is an integer we format
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(tx)
    }

    async fn lock_counter(
        tx: &mut Transaction<'static, Postgres>,
    ) -> Result<PositionCounter, StoreError> {
        let row = sqlx::query_as::<_, CounterRow>(
            r#"
            SELECT last_position, updated_at
            FROM position_counter
            WHERE id = 1
            FOR UPDATE
            "#,
        )
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| StoreError::Database("position counter row missing".to_string()))?;

        Ok(row.into())
    }

    async fn write_counter(
        tx: &mut Transaction<'static, Postgres>,
        last_position: i64,
    ) -> Result<PositionCounter, StoreError> {
        let row = sqlx::query_as::<_, CounterRow>(
            r#"
            UPDATE position_counter
            SET last_position = $1, updated_at = NOW()
            WHERE id = 1
            RETURNING last_position, updated_at
            "#,
        )
        .bind(last_position)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }
}

#[async_trait]
impl SignupStore for PostgresSignupStore {
    #[instrument(skip(self, signup), fields(role = %signup.role))]
    async fn create_signup(&self, signup: NewSignup) -> Result<SignupRecord, StoreError> {
        let email = signup.normalized_email();

        let row = sqlx::query_as::<_, SignupRow>(&format!(
            r#"
            INSERT INTO signups (id, email, name, role)
            VALUES ($1, $2, $3, $4)
            RETURNING {SIGNUP_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(&email)
        .bind(&signup.name)
        .bind(signup.role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::EmailTaken(email.clone())
            } else {
                error!("Failed to create signup: {}", e);
                map_sqlx_error(e)
            }
        })?;

        let record = SignupRecord::try_from(row)?;
        debug!(signup_id = %record.id, "created signup");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn get_signup(&self, id: Uuid) -> Result<Option<SignupRecord>, StoreError> {
        sqlx::query_as::<_, SignupRow>(&format!(
            "SELECT {SIGNUP_COLUMNS} FROM signups WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .map(SignupRecord::try_from)
        .transpose()
    }

    #[instrument(skip(self))]
    async fn list_signups(
        &self,
        filter: SignupFilter,
        page: Page,
    ) -> Result<Vec<SignupRecord>, StoreError> {
        let rows = sqlx::query_as::<_, SignupRow>(&format!(
            r#"
            SELECT {SIGNUP_COLUMNS}
            FROM signups
            WHERE ($1::text IS NULL OR role = $1)
              AND ($2::timestamptz IS NULL OR (created_at, id) > ($2, $3::uuid))
            ORDER BY created_at, id
            LIMIT $4
            "#
        ))
        .bind(filter.role.map(|r| r.as_str()))
        .bind(page.after.map(|c| c.created_at))
        .bind(page.after.map(|c| c.id))
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list signups: {}", e);
            map_sqlx_error(e)
        })?;

        rows.into_iter().map(SignupRecord::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn delete_signup(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM signups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn get_counter(&self) -> Result<PositionCounter, StoreError> {
        let row = sqlx::query_as::<_, CounterRow>(
            "SELECT last_position, updated_at FROM position_counter WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| StoreError::Database("position counter row missing".to_string()))?;

        Ok(row.into())
    }

    #[instrument(skip(self, decide))]
    async fn allocate_in_transaction(
        &self,
        signup_id: Uuid,
        decide: &AllocationDecision<'_>,
    ) -> Result<PositionAssignment, StoreError> {
        let mut tx = self.begin().await?;

        // Lock order: signup row, then counter row
        let signup = sqlx::query_as::<_, SignupRow>(&format!(
            "SELECT {SIGNUP_COLUMNS} FROM signups WHERE id = $1 FOR UPDATE"
        ))
        .bind(signup_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .ok_or(StoreError::SignupNotFound(signup_id))?;
        let signup = SignupRecord::try_from(signup)?;

        let counter = Self::lock_counter(&mut tx).await?;

        // Dropping `tx` on rejection rolls back
        let assignment = decide(&signup, &counter).map_err(StoreError::Rejected)?;

        Self::write_counter(&mut tx, assignment.last_position).await?;

        sqlx::query(
            r#"
            UPDATE signups
            SET position = $2, cached_is_free = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(signup_id)
        .bind(assignment.position)
        .bind(assignment.cached_is_free)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(%signup_id, position = assignment.position, "committed allocation");
        Ok(assignment)
    }

    #[instrument(skip(self, decide))]
    async fn update_counter(
        &self,
        decide: &CounterDecision<'_>,
    ) -> Result<PositionCounter, StoreError> {
        let mut tx = self.begin().await?;

        let current = Self::lock_counter(&mut tx).await?;
        let updated = Self::write_counter(&mut tx, decide(&current)).await?;

        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(
            from = current.last_position,
            to = updated.last_position,
            "updated position counter"
        );
        Ok(updated)
    }

    #[instrument(skip(self, updates), fields(batch_size = updates.len()))]
    async fn apply_position_updates(
        &self,
        updates: &[PositionUpdate],
    ) -> Result<usize, StoreError> {
        check_batch_size(updates)?;
        if updates.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = updates.iter().map(|u| u.signup_id).collect();
        let positions: Vec<i64> = updates.iter().map(|u| u.position).collect();
        let hints: Vec<bool> = updates.iter().map(|u| u.cached_is_free).collect();

        let mut tx = self.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE signups AS s
            SET position = u.position,
                cached_is_free = u.cached_is_free,
                updated_at = NOW()
            FROM UNNEST($1::uuid[], $2::bigint[], $3::bool[]) AS u(id, position, cached_is_free)
            WHERE s.id = u.id AND s.role = 'member'
            "#,
        )
        .bind(&ids)
        .bind(&positions)
        .bind(&hints)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to apply position batch: {}", e);
            map_sqlx_error(e)
        })?;

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(result.rows_affected() as usize)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

/// Map a sqlx error onto the store taxonomy
fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db)
            if db
                .code()
                .as_deref()
                .is_some_and(|code| CONTENTION_CODES.contains(&code)) =>
        {
            StoreError::Contention(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut => StoreError::Contention("connection pool exhausted".into()),
        _ => StoreError::Database(e.to_string()),
    }
}
