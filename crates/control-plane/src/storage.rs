// Storage backend selection
// Decision: Use enum dispatch to pick the backend once at startup
//
// PostgreSQL when DATABASE_URL is set, in-memory (dev mode) otherwise. Both
// are handed to the position services as `Arc<dyn SignupStore>`.

use std::sync::Arc;

use anyhow::{Context, Result};
use waitlist_positions::{InMemorySignupStore, PostgresSignupStore, SignupStore};

use crate::config::AppConfig;

/// Storage backend that can be either PostgreSQL or in-memory
#[derive(Clone)]
pub enum StorageBackend {
    /// PostgreSQL database (production)
    Postgres(Arc<PostgresSignupStore>),
    /// In-memory store (dev mode)
    InMemory(Arc<InMemorySignupStore>),
}

impl StorageBackend {
    /// Connect to PostgreSQL, optionally applying migrations
    pub async fn postgres(database_url: &str, run_migrations: bool) -> Result<Self> {
        let store = PostgresSignupStore::connect(database_url)
            .await
            .context("Failed to connect to database")?;
        if run_migrations {
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Database migrations applied");
        }
        Ok(Self::Postgres(Arc::new(store)))
    }

    /// Create an in-memory storage backend
    pub fn in_memory() -> Self {
        Self::InMemory(Arc::new(InMemorySignupStore::new()))
    }

    /// Pick the backend described by the configuration
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        match &config.database_url {
            Some(url) => Self::postgres(url, config.run_migrations).await,
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory store (data is not persisted)");
                Ok(Self::in_memory())
            }
        }
    }

    /// Check if this is dev mode (in-memory)
    pub fn is_dev_mode(&self) -> bool {
        matches!(self, Self::InMemory(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::InMemory(_) => "memory",
        }
    }

    pub fn store(&self) -> Arc<dyn SignupStore> {
        match self {
            Self::Postgres(store) => store.clone(),
            Self::InMemory(store) => store.clone(),
        }
    }
}
