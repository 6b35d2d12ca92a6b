// Application configuration
//
// Read once at startup from environment variables (a `.env` file is loaded
// first by main). Invalid values are a startup error rather than a silent
// fallback to the default.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use waitlist_positions::{
    BackoffExecutor, FreeTierPolicy, ReconcilerConfig, RetryPolicy, DEFAULT_FREE_TIER_THRESHOLD,
    MAX_BATCH_WRITES,
};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Server and position-allocation settings
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Postgres connection string; in-memory dev store when unset
    pub database_url: Option<String>,
    pub listen_addr: String,
    /// Route prefix, e.g. "/api" gives /api/v1/signups
    pub api_prefix: String,
    pub cors_allowed_origins: Vec<String>,
    pub run_migrations: bool,

    pub free_tier_threshold: i64,

    pub allocation_retry: RetryPolicy,
    pub allocation_deadline: Option<Duration>,

    pub reconcile_batch_size: usize,
    pub reconcile_interval: Option<Duration>,
    pub reconcile_deadline: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            listen_addr: "0.0.0.0:9000".to_string(),
            api_prefix: String::new(),
            cors_allowed_origins: Vec::new(),
            run_migrations: true,
            free_tier_threshold: DEFAULT_FREE_TIER_THRESHOLD,
            allocation_retry: RetryPolicy::exponential(),
            allocation_deadline: Some(Duration::from_millis(5000)),
            reconcile_batch_size: MAX_BATCH_WRITES,
            reconcile_interval: None,
            reconcile_deadline: Duration::from_secs(300),
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: Postgres connection string (unset: in-memory store)
    /// - `LISTEN_ADDR`: HTTP bind address (default: "0.0.0.0:9000")
    /// - `API_PREFIX`: Route prefix (default: empty)
    /// - `CORS_ALLOWED_ORIGINS`: Comma-separated origins (default: none)
    /// - `RUN_MIGRATIONS`: Apply migrations at startup (default: true)
    /// - `FREE_TIER_THRESHOLD`: Free positions (default: 20)
    /// - `ALLOCATION_MAX_ATTEMPTS`: Attempts per allocation (default: 8)
    /// - `ALLOCATION_INITIAL_BACKOFF_MS`: First retry delay (default: 25)
    /// - `ALLOCATION_MAX_BACKOFF_MS`: Retry delay cap (default: 1000)
    /// - `ALLOCATION_DEADLINE_MS`: Overall allocation deadline, 0 disables (default: 5000)
    /// - `RECONCILE_BATCH_SIZE`: Writes per batch, at most 500 (default: 500)
    /// - `RECONCILE_INTERVAL_SECS`: Periodic reconcile interval (default: disabled)
    /// - `RECONCILE_DEADLINE_SECS`: Overall reconcile deadline (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from a fixed set of variables
    pub fn from_vars(vars: &HashMap<&str, &str>) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let threshold: i64 = parse(&get, "FREE_TIER_THRESHOLD", defaults.free_tier_threshold)?;
        if threshold < 0 {
            return Err(invalid("FREE_TIER_THRESHOLD", threshold, "must not be negative"));
        }

        let max_attempts: u32 = parse(
            &get,
            "ALLOCATION_MAX_ATTEMPTS",
            defaults.allocation_retry.max_attempts,
        )?;
        if max_attempts == 0 {
            return Err(invalid("ALLOCATION_MAX_ATTEMPTS", max_attempts, "must be at least 1"));
        }
        let initial_backoff_ms: u64 = parse(
            &get,
            "ALLOCATION_INITIAL_BACKOFF_MS",
            defaults.allocation_retry.initial_interval.as_millis() as u64,
        )?;
        let max_backoff_ms: u64 = parse(
            &get,
            "ALLOCATION_MAX_BACKOFF_MS",
            defaults.allocation_retry.max_interval.as_millis() as u64,
        )?;
        let deadline_ms: u64 = parse(&get, "ALLOCATION_DEADLINE_MS", 5000)?;

        let batch_size: usize = parse(&get, "RECONCILE_BATCH_SIZE", defaults.reconcile_batch_size)?;
        if batch_size == 0 || batch_size > MAX_BATCH_WRITES {
            return Err(invalid(
                "RECONCILE_BATCH_SIZE",
                batch_size,
                format!("must be between 1 and {}", MAX_BATCH_WRITES),
            ));
        }
        let interval_secs: Option<u64> = parse_optional(&get, "RECONCILE_INTERVAL_SECS")?;
        let reconcile_deadline_secs: u64 = parse(
            &get,
            "RECONCILE_DEADLINE_SECS",
            defaults.reconcile_deadline.as_secs(),
        )?;

        Ok(Self {
            database_url: get("DATABASE_URL"),
            listen_addr: get("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            api_prefix: get("API_PREFIX").unwrap_or_default(),
            cors_allowed_origins: get("CORS_ALLOWED_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            run_migrations: parse(&get, "RUN_MIGRATIONS", defaults.run_migrations)?,
            free_tier_threshold: threshold,
            allocation_retry: RetryPolicy::exponential()
                .with_max_attempts(max_attempts)
                .with_initial_interval(Duration::from_millis(initial_backoff_ms))
                .with_max_interval(Duration::from_millis(max_backoff_ms)),
            allocation_deadline: (deadline_ms > 0).then(|| Duration::from_millis(deadline_ms)),
            reconcile_batch_size: batch_size,
            reconcile_interval: interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            reconcile_deadline: Duration::from_secs(reconcile_deadline_secs),
        })
    }

    pub fn tiers(&self) -> FreeTierPolicy {
        FreeTierPolicy::new(self.free_tier_threshold)
    }

    pub fn allocation_executor(&self) -> BackoffExecutor {
        let executor = BackoffExecutor::new(self.allocation_retry.clone());
        match self.allocation_deadline {
            Some(deadline) => executor.with_deadline(deadline),
            None => executor,
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig::default()
            .with_batch_size(self.reconcile_batch_size)
            .with_deadline(Some(self.reconcile_deadline))
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(parse_optional(get, var)?.unwrap_or(default))
}

fn parse_optional<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(var, value, e.to_string())),
    }
}

fn invalid(var: &'static str, value: impl ToString, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}
